//! Opaque conference-token minting service client (§1, §6).
//!
//! Out of scope beyond this one operation: `MintToken(channel, uid, role,
//! expiry) -> token`. The service itself (auth, signing, storage) is a
//! collaborator this crate only calls, never implements.

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
        }
    }
}

#[derive(Deserialize)]
struct MintTokenResponse {
    token: String,
}

/// Mint a single conference token for `uid` on `channel`, valid for `expiry`.
pub async fn mint_token(
    http: &Client,
    base_url: &str,
    channel: &str,
    uid: u32,
    role: Role,
    expiry: Duration,
) -> Result<String> {
    let response = http
        .post(format!("{base_url}/tokens"))
        .json(&json!({
            "channel": channel,
            "uid": uid,
            "role": role.as_str(),
            "expirySeconds": expiry.as_secs(),
        }))
        .send()
        .await
        .context("token-service mint request failed")?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        bail!("token-service mint failed for uid {uid}: {status} {text}");
    }

    let parsed: MintTokenResponse = response
        .json()
        .await
        .context("parsing token-service response")?;
    Ok(parsed.token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_wire_strings_are_lowercase() {
        assert_eq!(Role::Publisher.as_str(), "publisher");
        assert_eq!(Role::Subscriber.as_str(), "subscriber");
    }
}
