//! Avatar provider HTTP handshake + WebSocket protocol client (§4.C).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// Credentials and identities needed to open an avatar session, mirroring
/// the fields carried by `StartSession` over IPC.
#[derive(Debug, Clone)]
pub struct AvatarSessionParams {
    pub base_url: String,
    pub api_key: String,
    pub avatar_id: String,
    pub quality: String,
    pub video_encoding: String,
    pub app_id: String,
    pub agora_token: String,
    pub channel: String,
    pub uid: u32,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connected avatar WebSocket client. All writes go through a single mutex
/// so `voice`, `voice_end`, `heartbeat`, and the closing frame can never
/// interleave their JSON framing (§4.C "Concurrency").
pub struct AvatarClient {
    write: Mutex<futures_util::stream::SplitSink<WsStream, WsMessage>>,
    read: Mutex<futures_util::stream::SplitStream<WsStream>>,
    last_event_seq: AtomicI64,
}

impl AvatarClient {
    /// Run the two-step HTTP handshake, dial the WebSocket (following one
    /// redirect if offered) under its own `ws_dial_timeout` budget, send
    /// `init`, and sleep 500 ms before returning so the caller doesn't send
    /// audio before the avatar is ready. The HTTP handshake steps carry
    /// their own timeout via the shared `reqwest::Client`, so only the dial
    /// itself is bounded here.
    pub async fn connect(
        http: &Client,
        params: &AvatarSessionParams,
        ws_dial_timeout: Duration,
    ) -> Result<Self> {
        let session_token = request_session_token(http, params).await?;
        let (session_id, ws_url) = request_engine_session(http, params, &session_token).await?;
        let ws_stream = tokio::time::timeout(ws_dial_timeout, dial(&ws_url))
            .await
            .context("avatar websocket dial timed out")??;

        let (write, read) = ws_stream.split();
        let client = Self {
            write: Mutex::new(write),
            read: Mutex::new(read),
            last_event_seq: AtomicI64::new(0),
        };

        client.send_init(params, &session_id).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;

        Ok(client)
    }

    async fn send_init(&self, params: &AvatarSessionParams, session_id: &str) -> Result<()> {
        let body = json!({
            "command": "init",
            "event_id": self.next_event_id(),
            "session_id": session_id,
            "avatar_id": params.avatar_id,
            "quality": params.quality,
            "version": "1.0",
            "video_encoding": params.video_encoding,
            "activity_idle_timeout": 120,
            "agora_settings": {
                "app_id": params.app_id,
                "token": params.agora_token,
                "channel": params.channel,
                "uid": params.uid,
                "enable_string_uid": false,
            },
        });
        self.send_json(body).await
    }

    /// Send one 24 kHz PCM16 frame as a `voice` command.
    pub async fn send_voice(&self, pcm16: &[i16]) -> Result<()> {
        let bytes: Vec<u8> = pcm16.iter().flat_map(|s| s.to_le_bytes()).collect();
        let audio = base64::engine::general_purpose::STANDARD.encode(bytes);
        let body = json!({
            "command": "voice",
            "event_id": self.next_event_id(),
            "audio": audio,
            "sample_rate": 24000,
            "encoding": "PCM16",
        });
        self.send_json(body).await
    }

    pub async fn send_voice_end(&self) -> Result<()> {
        let body = json!({
            "command": "voice_end",
            "event_id": self.next_event_id(),
        });
        self.send_json(body).await
    }

    pub async fn send_heartbeat(&self) -> Result<()> {
        let body = json!({
            "command": "heartbeat",
            "event_id": self.next_event_id(),
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        self.send_json(body).await
    }

    /// Drain one inbound frame. Inbound payloads are opaque to the core;
    /// only a close/error is actionable (§4.C).
    pub async fn recv(&self) -> Option<Result<WsMessage>> {
        let mut read = self.read.lock().await;
        read.next().await.map(|r| r.map_err(anyhow::Error::from))
    }

    /// Send a normal-closure close frame, then drop the connection.
    pub async fn close(&self) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(WsMessage::Close(Some(
                tokio_tungstenite::tungstenite::protocol::CloseFrame {
                    code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
                    reason: "session ended".into(),
                },
            )))
            .await
            .context("sending avatar WS close frame")
    }

    async fn send_json(&self, body: Value) -> Result<()> {
        let text = serde_json::to_string(&body)?;
        let mut write = self.write.lock().await;
        write
            .send(WsMessage::Text(text.into()))
            .await
            .context("writing avatar WS frame")
    }

    fn next_event_id(&self) -> String {
        self.last_event_seq.fetch_add(1, Ordering::Relaxed);
        uuid::Uuid::new_v4().to_string()
    }
}

async fn request_session_token(http: &Client, params: &AvatarSessionParams) -> Result<String> {
    let body = json!({
        "personaConfig": { "avatarId": params.avatar_id },
        "environment": {
            "agoraSettings": {
                "appId": params.app_id,
                "token": params.agora_token,
                "channel": params.channel,
                "uid": params.uid,
                "quality": params.quality,
                "videoEncoding": params.video_encoding,
                "enableStringUids": false,
                "activityIdleTimeout": 120,
            }
        }
    });

    let response = http
        .post(format!("{}/auth/session-token", params.base_url))
        .bearer_auth(&params.api_key)
        .json(&body)
        .send()
        .await
        .context("avatar session-token request failed")?;

    if !(response.status().is_success()) {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        bail!("avatar session-token handshake failed: {status} {text}");
    }

    let parsed: Value = response.json().await.context("parsing session-token response")?;
    parsed["sessionToken"]
        .as_str()
        .map(str::to_string)
        .context("session-token response missing sessionToken")
}

const WS_FIELD_NAMES: &[&str] = &[
    "websocketAddress",
    "websocketUrl",
    "webSocketAddress",
    "webSocketUrl",
];

async fn request_engine_session(
    http: &Client,
    params: &AvatarSessionParams,
    session_token: &str,
) -> Result<(String, String)> {
    let response = http
        .post(format!("{}/engine/session", params.base_url))
        .bearer_auth(session_token)
        .json(&json!({}))
        .send()
        .await
        .context("avatar engine-session request failed")?;

    if !(response.status().is_success()) {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        bail!("avatar engine-session handshake failed: {status} {text}");
    }

    let parsed: Value = response.json().await.context("parsing engine-session response")?;
    let session_id = parsed["sessionId"]
        .as_str()
        .context("engine-session response missing sessionId")?
        .to_string();

    let ws_url = WS_FIELD_NAMES
        .iter()
        .find_map(|field| parsed[field].as_str())
        .filter(|s| !s.is_empty())
        .context("engine-session response carries no recognized websocket address field")?
        .to_string();

    Ok((session_id, ws_url))
}

/// Dial the avatar WebSocket, following one 301/302/307/308 redirect.
async fn dial(ws_url: &str) -> Result<WsStream> {
    match connect_async(ws_url).await {
        Ok((stream, _response)) => Ok(stream),
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) if is_redirect(response.status().as_u16()) => {
            let location = response
                .headers()
                .get("Location")
                .and_then(|v| v.to_str().ok())
                .context("redirect response missing Location header")?;
            let redirected = resolve_redirect(ws_url, location)?;
            debug!(redirected, "following avatar WS redirect");
            let (stream, _) = connect_async(redirected).await?;
            Ok(stream)
        }
        Err(e) => Err(e.into()),
    }
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 307 | 308)
}

fn resolve_redirect(original: &str, location: &str) -> Result<String> {
    if location.starts_with("ws://") || location.starts_with("wss://") {
        return Ok(location.to_string());
    }
    let base = Url::parse(original).context("parsing original websocket URL")?;
    let joined = base.join(location).context("joining relative redirect location")?;
    let mut joined = joined;
    let _ = joined.set_scheme("wss");
    Ok(joined.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_field_probe_order_matches_spec() {
        assert_eq!(
            WS_FIELD_NAMES,
            &[
                "websocketAddress",
                "websocketUrl",
                "webSocketAddress",
                "webSocketUrl"
            ]
        );
    }

    #[test]
    fn absolute_redirect_location_is_used_verbatim() {
        let resolved = resolve_redirect(
            "wss://old.example.com/ws",
            "wss://new.example.com/ws?session=1",
        )
        .unwrap();
        assert_eq!(resolved, "wss://new.example.com/ws?session=1");
    }

    #[test]
    fn relative_redirect_location_is_reconstructed_against_original_host() {
        let resolved = resolve_redirect("wss://old.example.com/v1/ws", "/v2/ws?session=1").unwrap();
        assert_eq!(resolved, "wss://old.example.com/v2/ws?session=1");
    }
}
