//! Error taxonomy shared by the parent session manager and the child orchestrator.
//!
//! `ErrorCode` is the thing that actually crosses the IPC boundary (as the
//! `code` field of `ErrorResponse`); everything else in the crate uses
//! `anyhow::Result` and attaches one of these codes only at the point where
//! a failure becomes session-fatal.

use thiserror::Error;

/// Fatal/non-fatal error codes surfaced by the child orchestrator, per the
/// error handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorCode {
    /// Uncaught failure in the child orchestrator.
    #[error("WORKER_FAILED")]
    WorkerFailed,
    /// Avatar handshake failed before streaming.
    #[error("ANAM_CONNECT_FAILED")]
    AnamConnectFailed,
    /// Bot could not join or subscribe.
    #[error("AGORA_CONNECT_FAILED")]
    AgoraConnectFailed,
    /// Upstream translator left the conference.
    #[error("TARGET_LEFT")]
    TargetLeft,
    /// No audio forwarded for at least the idle threshold.
    #[error("IDLE_TIMEOUT")]
    IdleTimeout,
}

impl ErrorCode {
    /// The wire string used in `ErrorResponse.code` and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::WorkerFailed => "WORKER_FAILED",
            ErrorCode::AnamConnectFailed => "ANAM_CONNECT_FAILED",
            ErrorCode::AgoraConnectFailed => "AGORA_CONNECT_FAILED",
            ErrorCode::TargetLeft => "TARGET_LEFT",
            ErrorCode::IdleTimeout => "IDLE_TIMEOUT",
        }
    }

    /// Every code in this table is fatal to the session (§7); kept as a
    /// method rather than a constant `true` so call sites read as an
    /// intentional check rather than a tautology.
    pub fn is_fatal(&self) -> bool {
        true
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "WORKER_FAILED" => Some(ErrorCode::WorkerFailed),
            "ANAM_CONNECT_FAILED" => Some(ErrorCode::AnamConnectFailed),
            "AGORA_CONNECT_FAILED" => Some(ErrorCode::AgoraConnectFailed),
            "TARGET_LEFT" => Some(ErrorCode::TargetLeft),
            "IDLE_TIMEOUT" => Some(ErrorCode::IdleTimeout),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for code in [
            ErrorCode::WorkerFailed,
            ErrorCode::AnamConnectFailed,
            ErrorCode::AgoraConnectFailed,
            ErrorCode::TargetLeft,
            ErrorCode::IdleTimeout,
        ] {
            assert_eq!(ErrorCode::from_str(code.as_str()), Some(code));
        }
    }

    #[test]
    fn unknown_code_is_not_recognized() {
        assert_eq!(ErrorCode::from_str("NOT_A_CODE"), None);
    }
}
