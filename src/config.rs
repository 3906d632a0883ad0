//! Configuration management
//!
//! All knobs are env-overridable with typed defaults, mirroring the
//! `from_env()` pattern used throughout the voice/messaging layers this
//! crate descends from. `Config` is loaded once by the parent and passed
//! down to each child via environment variables (inherited by
//! `tokio::process::Command`), so parent and child always agree on values.

use std::time::Duration;

/// Session hard duration cap, idle timeout, and other knobs from the
/// configuration table.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum wall time before the parent forces a stop.
    pub session_hard_cap: Duration,
    /// Silence duration before the child initiates its own stop.
    pub idle_timeout: Duration,
    /// Agora app id shared by the conference SDK join, the translator's
    /// `agoraAppId` field, and the avatar's `agora_settings.app_id`.
    pub agora_app_id: String,
    /// Base URL for the avatar provider's HTTP API.
    pub avatar_base_url: String,
    /// Bearer token used for the avatar provider's initial handshake call.
    pub avatar_api_key: String,
    /// Avatar rendering quality, passed through verbatim.
    pub avatar_quality: String,
    /// Avatar video encoding, passed through verbatim (upper-case, e.g. "H264").
    pub avatar_video_encoding: String,
    /// RMS threshold (mean-square units) above which a frame counts as voiced.
    pub vad_rms_threshold: f64,
    /// Number of upsampled frames retained in the pre-roll ring buffer.
    pub pre_roll_frames: usize,
    /// Consecutive silent frames required before emitting `voice_end`.
    pub silence_tail_frames: usize,
    /// Base URL for the external translation provider's HTTP API.
    pub translator_base_url: String,
    /// Base URL for the opaque conference-token minting service.
    pub token_service_base_url: String,
    /// Grace period the parent waits for a clean child exit before escalating
    /// to a kill signal.
    pub stop_drain_timeout: Duration,
    /// Cadence at which the parent polls a starting child's status.
    pub status_poll_interval: Duration,
    /// Per-request timeout for avatar/translator/token HTTP calls.
    pub handshake_http_timeout: Duration,
    /// Timeout for dialing the avatar WebSocket.
    pub ws_dial_timeout: Duration,
    /// How long `StartSession` waits for the child to reach `CONNECTED`/`STREAMING`.
    pub connect_wait_timeout: Duration,
    /// Avatar WebSocket heartbeat cadence.
    pub heartbeat_interval: Duration,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults from the configuration table.
    pub fn from_env() -> Self {
        Self {
            session_hard_cap: Duration::from_secs(
                env_or::<u64>("SESSION_HARD_CAP_MINUTES", 10) * 60,
            ),
            idle_timeout: Duration::from_secs(env_or::<u64>("IDLE_TIMEOUT_SECONDS", 60)),
            agora_app_id: env_string_or("AGORA_APP_ID", ""),
            avatar_base_url: env_string_or("AVATAR_BASE_URL", ""),
            avatar_api_key: env_string_or("AVATAR_API_KEY", ""),
            avatar_quality: env_string_or("AVATAR_QUALITY", "high"),
            avatar_video_encoding: env_string_or("AVATAR_VIDEO_ENCODING", "H264"),
            vad_rms_threshold: env_or::<f64>("VAD_RMS_THRESHOLD", 100.0),
            pre_roll_frames: env_or::<usize>("PRE_ROLL_FRAMES", 10),
            silence_tail_frames: env_or::<usize>("SILENCE_TAIL_FRAMES", 50),
            translator_base_url: env_string_or("TRANSLATOR_BASE_URL", ""),
            token_service_base_url: env_string_or("TOKEN_SERVICE_BASE_URL", ""),
            stop_drain_timeout: Duration::from_secs(env_or::<u64>("STOP_DRAIN_TIMEOUT_SECONDS", 5)),
            status_poll_interval: Duration::from_millis(env_or::<u64>(
                "STATUS_POLL_INTERVAL_MS",
                100,
            )),
            handshake_http_timeout: Duration::from_secs(env_or::<u64>(
                "HANDSHAKE_HTTP_TIMEOUT_SECONDS",
                10,
            )),
            ws_dial_timeout: Duration::from_secs(env_or::<u64>("WS_DIAL_TIMEOUT_SECONDS", 10)),
            connect_wait_timeout: Duration::from_secs(env_or::<u64>(
                "CONNECT_WAIT_TIMEOUT_SECONDS",
                30,
            )),
            heartbeat_interval: Duration::from_secs(env_or::<u64>("HEARTBEAT_INTERVAL_SECONDS", 5)),
        }
    }

    /// Environment variables the parent must forward to every child it
    /// spawns, so that both sides agree on every knob above.
    pub fn as_env_pairs(&self) -> Vec<(String, String)> {
        vec![
            (
                "IDLE_TIMEOUT_SECONDS".to_string(),
                self.idle_timeout.as_secs().to_string(),
            ),
            ("AGORA_APP_ID".to_string(), self.agora_app_id.clone()),
            ("AVATAR_BASE_URL".to_string(), self.avatar_base_url.clone()),
            ("AVATAR_API_KEY".to_string(), self.avatar_api_key.clone()),
            ("AVATAR_QUALITY".to_string(), self.avatar_quality.clone()),
            (
                "AVATAR_VIDEO_ENCODING".to_string(),
                self.avatar_video_encoding.clone(),
            ),
            (
                "VAD_RMS_THRESHOLD".to_string(),
                self.vad_rms_threshold.to_string(),
            ),
            (
                "PRE_ROLL_FRAMES".to_string(),
                self.pre_roll_frames.to_string(),
            ),
            (
                "SILENCE_TAIL_FRAMES".to_string(),
                self.silence_tail_frames.to_string(),
            ),
            (
                "HANDSHAKE_HTTP_TIMEOUT_SECONDS".to_string(),
                self.handshake_http_timeout.as_secs().to_string(),
            ),
            (
                "WS_DIAL_TIMEOUT_SECONDS".to_string(),
                self.ws_dial_timeout.as_secs().to_string(),
            ),
            (
                "HEARTBEAT_INTERVAL_SECONDS".to_string(),
                self.heartbeat_interval.as_secs().to_string(),
            ),
        ]
    }

    /// Resolve the child binary path: prefer a `bot_worker` next to the
    /// current executable (or in the working directory), else a fixed
    /// installation path.
    pub fn child_binary_path() -> std::path::PathBuf {
        let local = std::path::PathBuf::from("./bot_worker");
        if local.exists() {
            return local;
        }
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let sibling = dir.join("bot_worker");
                if sibling.exists() {
                    return sibling;
                }
            }
        }
        std::path::PathBuf::from("/usr/local/libexec/avatar-session-engine/bot_worker")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
