//! The parent spawns each child with `.envs(config.as_env_pairs())` and the
//! child rebuilds its own `Config` via `Config::from_env()` — the two sides
//! only ever agree because every field `as_env_pairs()` forwards is also a
//! field `from_env()` reads back out. This is process-wide env mutation, so
//! it lives in its own test binary rather than `#[cfg(test)]` inside
//! `config.rs`, where it could race other tests over `std::env::set_var`.

use avatar_session_engine::Config;
use std::time::Duration;

fn with_env<F: FnOnce()>(pairs: &[(&str, &str)], f: F) {
    for (k, v) in pairs {
        std::env::set_var(k, v);
    }
    f();
    for (k, _) in pairs {
        std::env::remove_var(k);
    }
}

#[test]
fn as_env_pairs_reproduces_every_value_from_env_reads_back() {
    with_env(
        &[
            ("AGORA_APP_ID", "app-123"),
            ("AVATAR_BASE_URL", "https://avatar.example"),
            ("AVATAR_API_KEY", "key-456"),
            ("AVATAR_QUALITY", "medium"),
            ("AVATAR_VIDEO_ENCODING", "VP8"),
            ("VAD_RMS_THRESHOLD", "250.5"),
            ("PRE_ROLL_FRAMES", "7"),
            ("SILENCE_TAIL_FRAMES", "40"),
            ("HANDSHAKE_HTTP_TIMEOUT_SECONDS", "20"),
            ("WS_DIAL_TIMEOUT_SECONDS", "15"),
            ("HEARTBEAT_INTERVAL_SECONDS", "3"),
            ("IDLE_TIMEOUT_SECONDS", "45"),
        ],
        || {
            let original = Config::from_env();
            let pairs = original.as_env_pairs();

            // Clear, then reapply only what as_env_pairs forwards, to prove
            // the forwarded subset alone reconstructs an equivalent config
            // (fields as_env_pairs omits, like translator_base_url, are not
            // part of this contract and are re-read from the untouched env).
            for (k, _) in &pairs {
                std::env::remove_var(k);
            }
            for (k, v) in &pairs {
                std::env::set_var(k, v);
            }

            let rebuilt = Config::from_env();

            assert_eq!(rebuilt.agora_app_id, original.agora_app_id);
            assert_eq!(rebuilt.avatar_base_url, original.avatar_base_url);
            assert_eq!(rebuilt.avatar_api_key, original.avatar_api_key);
            assert_eq!(rebuilt.avatar_quality, original.avatar_quality);
            assert_eq!(rebuilt.avatar_video_encoding, original.avatar_video_encoding);
            assert_eq!(rebuilt.vad_rms_threshold, original.vad_rms_threshold);
            assert_eq!(rebuilt.pre_roll_frames, original.pre_roll_frames);
            assert_eq!(rebuilt.silence_tail_frames, original.silence_tail_frames);
            assert_eq!(rebuilt.handshake_http_timeout, original.handshake_http_timeout);
            assert_eq!(rebuilt.ws_dial_timeout, original.ws_dial_timeout);
            assert_eq!(rebuilt.heartbeat_interval, original.heartbeat_interval);
            assert_eq!(rebuilt.idle_timeout, original.idle_timeout);
            assert_eq!(original.idle_timeout, Duration::from_secs(45));

            for (k, _) in pairs {
                std::env::remove_var(k);
            }
        },
    );
}
