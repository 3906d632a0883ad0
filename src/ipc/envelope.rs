//! Typed IPC payloads and the self-describing envelope that wraps them.
//!
//! Each payload is a `prost::Message` with explicit field tags, so a reader
//! built against an older schema can still parse an envelope produced by a
//! newer writer: unrecognized fields are simply skipped by prost's wire
//! decoder, and an unrecognized `message_type` decodes to `None` (logged and
//! ignored by the caller) rather than failing the whole frame.

use prost::Message;

/// `parent -> child`: begin a session with the given identities and
/// avatar/bot credentials.
#[derive(Clone, PartialEq, Message)]
pub struct StartSession {
    #[prost(string, tag = "1")]
    pub task_id: String,
    #[prost(uint32, tag = "2")]
    pub palabra_uid: u32,
    #[prost(uint32, tag = "3")]
    pub bot_uid: u32,
    #[prost(uint32, tag = "4")]
    pub anam_uid: u32,
    #[prost(string, tag = "5")]
    pub channel: String,
    #[prost(string, tag = "6")]
    pub target_language: String,
    #[prost(string, tag = "7")]
    pub avatar_api_key: String,
    #[prost(string, tag = "8")]
    pub avatar_base_url: String,
    #[prost(string, tag = "9")]
    pub avatar_id: String,
    #[prost(string, tag = "10")]
    pub avatar_token: String,
    #[prost(string, tag = "11")]
    pub bot_token: String,
}

/// `parent -> child`: stop the session.
#[derive(Clone, PartialEq, Message)]
pub struct StopSession {
    #[prost(string, tag = "1")]
    pub task_id: String,
}

/// `child -> parent`: a state-machine transition or progress note.
#[derive(Clone, PartialEq, Message)]
pub struct StatusUpdate {
    #[prost(string, tag = "1")]
    pub task_id: String,
    #[prost(string, tag = "2")]
    pub status: String,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(uint32, tag = "4")]
    pub avatar_uid: u32,
}

/// `child -> parent`: a free-form log line, independent of stderr.
#[derive(Clone, PartialEq, Message)]
pub struct LogMessage {
    #[prost(string, tag = "1")]
    pub task_id: String,
    #[prost(string, tag = "2")]
    pub level: String,
    #[prost(string, tag = "3")]
    pub message: String,
}

/// `child -> parent`: a structured error, per the §7 error-code table.
#[derive(Clone, PartialEq, Message)]
pub struct ErrorResponse {
    #[prost(string, tag = "1")]
    pub task_id: String,
    #[prost(string, tag = "2")]
    pub code: String,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(bool, tag = "4")]
    pub fatal: bool,
}

/// Discriminant for `Envelope.message_type`. Unknown values on the wire
/// decode to `None` via `MessageType::try_from`, not a parse error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    StartSession = 0,
    StopSession = 1,
    StatusUpdate = 2,
    LogMessage = 3,
    ErrorResponse = 4,
}

/// The self-describing envelope that is actually framed and written to the
/// pipe (§4.A). `payload` is the tag-encoded bytes of one of the structs
/// above, chosen by `message_type`.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub message_type: i32,
    #[prost(bytes, tag = "2")]
    pub payload: Vec<u8>,
}

/// Ergonomic, decoded form of an envelope's payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    StartSession(StartSession),
    StopSession(StopSession),
    StatusUpdate(StatusUpdate),
    LogMessage(LogMessage),
    ErrorResponse(ErrorResponse),
}

impl Payload {
    /// Encode this payload into a self-describing envelope.
    pub fn encode_envelope(&self) -> Envelope {
        let (message_type, payload) = match self {
            Payload::StartSession(m) => (MessageType::StartSession, m.encode_to_vec()),
            Payload::StopSession(m) => (MessageType::StopSession, m.encode_to_vec()),
            Payload::StatusUpdate(m) => (MessageType::StatusUpdate, m.encode_to_vec()),
            Payload::LogMessage(m) => (MessageType::LogMessage, m.encode_to_vec()),
            Payload::ErrorResponse(m) => (MessageType::ErrorResponse, m.encode_to_vec()),
        };
        Envelope {
            message_type: message_type as i32,
            payload,
        }
    }

    /// Decode an envelope's payload. Returns `Ok(None)` for a `message_type`
    /// this reader doesn't recognize (forward compatibility, §4.A/§7) and
    /// `Err` only for a recognized type whose payload bytes don't parse.
    pub fn decode_envelope(envelope: &Envelope) -> Result<Option<Payload>, prost::DecodeError> {
        let Some(message_type) = MessageType::from_i32(envelope.message_type) else {
            return Ok(None);
        };
        let payload = match message_type {
            MessageType::StartSession => {
                Payload::StartSession(StartSession::decode(envelope.payload.as_slice())?)
            }
            MessageType::StopSession => {
                Payload::StopSession(StopSession::decode(envelope.payload.as_slice())?)
            }
            MessageType::StatusUpdate => {
                Payload::StatusUpdate(StatusUpdate::decode(envelope.payload.as_slice())?)
            }
            MessageType::LogMessage => {
                Payload::LogMessage(LogMessage::decode(envelope.payload.as_slice())?)
            }
            MessageType::ErrorResponse => {
                Payload::ErrorResponse(ErrorResponse::decode(envelope.payload.as_slice())?)
            }
        };
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_payload_variant() {
        let variants = vec![
            Payload::StartSession(StartSession {
                task_id: "T".into(),
                palabra_uid: 3000,
                bot_uid: 4500,
                anam_uid: 4000,
                channel: "C".into(),
                target_language: "fr".into(),
                avatar_api_key: "key".into(),
                avatar_base_url: "https://avatar.example".into(),
                avatar_id: "avatar-1".into(),
                avatar_token: "tok".into(),
                bot_token: "bot-tok".into(),
            }),
            Payload::StopSession(StopSession { task_id: "T".into() }),
            Payload::StatusUpdate(StatusUpdate {
                task_id: "T".into(),
                status: "STREAMING".into(),
                message: String::new(),
                avatar_uid: 4000,
            }),
            Payload::LogMessage(LogMessage {
                task_id: "T".into(),
                level: "info".into(),
                message: "hello".into(),
            }),
            Payload::ErrorResponse(ErrorResponse {
                task_id: "T".into(),
                code: "IDLE_TIMEOUT".into(),
                message: "no audio for 60s".into(),
                fatal: true,
            }),
        ];

        for payload in variants {
            let envelope = payload.encode_envelope();
            let decoded = Payload::decode_envelope(&envelope).unwrap().unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn unknown_message_type_decodes_to_none() {
        let envelope = Envelope {
            message_type: 99,
            payload: vec![],
        };
        assert_eq!(Payload::decode_envelope(&envelope).unwrap(), None);
    }

    #[test]
    fn malformed_payload_for_known_type_is_an_error() {
        let envelope = Envelope {
            message_type: MessageType::StartSession as i32,
            payload: vec![0xff, 0xff, 0xff],
        };
        assert!(Payload::decode_envelope(&envelope).is_err());
    }
}
