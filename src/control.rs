//! Control surface consumed by the (out-of-scope) HTTP layer (§4.H).
//!
//! `Start`/`Stop`/`List` are the only three operations this crate exposes
//! upward. Everything below this layer (registry, session manager,
//! translator/token clients) is wired together here and nowhere else.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::registry::{self, TaskInfo, REGISTRY};
use crate::session::{SessionManager, StartParams};
use crate::token::{self, Role};
use crate::translator;
use crate::translator::Stream;

/// One `Start` request: a speaker's audio translated into one or more
/// target languages and (optionally) rendered through an avatar.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub channel: String,
    pub speaker_uid: u32,
    pub source_language: String,
    pub targets: Vec<String>,
    /// Selected avatar persona for this request. Unlike the base
    /// URL/API key/quality/encoding (process-wide config), the character
    /// itself is a per-request choice.
    pub avatar_id: String,
    pub avatar_mode: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    pub task_id: String,
    pub streams: Vec<Stream>,
}

pub struct ControlSurface {
    http: Client,
    config: Config,
    sessions: SessionManager,
}

impl ControlSurface {
    pub fn new(config: Config) -> Self {
        let http = Client::builder()
            .timeout(config.handshake_http_timeout)
            .build()
            .expect("building the shared HTTP client");
        Self {
            sessions: SessionManager::new(config.clone()),
            config,
            http,
        }
    }

    /// §4.H `Start`. Registry lookup per target; on a miss, mints tokens,
    /// calls the external translator, and (in avatar mode) allocates
    /// bot/avatar identities and spawns one child per target via §4.F.
    pub async fn start(&self, req: StartRequest) -> Result<StartResponse> {
        let mut primary_task_id: Option<String> = None;
        let mut streams = Vec::new();

        for (index, target_lang) in req.targets.iter().enumerate() {
            let key = registry::dedup_key(&req.channel, req.speaker_uid, target_lang);
            let http = &self.http;
            let config = &self.config;
            let channel = req.channel.clone();
            let source_language = req.source_language.clone();
            let target_lang_owned = target_lang.clone();
            let speaker_uid = req.speaker_uid;

            let (info, created): (TaskInfo, bool) = REGISTRY
                .get_or_create(key.clone(), move || async move {
                    create_translation_task(
                        http,
                        config,
                        &channel,
                        speaker_uid,
                        &source_language,
                        &target_lang_owned,
                    )
                    .await
                })
                .await?;

            // Every target in one `Start` call shares the first target's
            // task_id as its `primary_task_id`, so `stop()` can later find
            // all of them regardless of each target's own translator id.
            let primary = match &primary_task_id {
                Some(p) => p.clone(),
                None => {
                    let p = info.task_id.clone();
                    primary_task_id = Some(p.clone());
                    p
                }
            };
            if created {
                REGISTRY.set_primary_task_id(&key, primary.clone()).await;
            }

            if req.avatar_mode {
                if let Some(avatar_stream) = info.avatar_stream.clone() {
                    // Dedup hit that already provisioned an avatar identity:
                    // reuse it instead of minting a new uid/tokens and
                    // re-spawning a session with the same child task_id.
                    streams.push(avatar_stream);
                    continue;
                }

                let avatar_uid = REGISTRY.next_avatar_uid(&req.channel).await;
                let bot_uid = registry::bot_uid(index);
                let palabra_uid = info
                    .streams
                    .first()
                    .map(|s| s.uid)
                    .context("translator task has no stream uid assigned")?;

                let avatar_token = token::mint_token(
                    &self.http,
                    &self.config.token_service_base_url,
                    &req.channel,
                    avatar_uid,
                    Role::Publisher,
                    self.config.connect_wait_timeout,
                )
                .await
                .context("minting avatar conference token")?;
                let bot_token = token::mint_token(
                    &self.http,
                    &self.config.token_service_base_url,
                    &req.channel,
                    bot_uid,
                    Role::Subscriber,
                    self.config.connect_wait_timeout,
                )
                .await
                .context("minting bot conference token")?;

                self.sessions
                    .start_session(StartParams {
                        task_id: format!("{primary}-{index}"),
                        palabra_uid,
                        bot_uid,
                        anam_uid: avatar_uid,
                        channel: req.channel.clone(),
                        target_language: target_lang.clone(),
                        avatar_api_key: self.config.avatar_api_key.clone(),
                        avatar_base_url: self.config.avatar_base_url.clone(),
                        avatar_id: req.avatar_id.clone(),
                        avatar_token,
                        bot_token,
                    })
                    .await
                    .with_context(|| format!("starting child session for task {}", info.task_id))?;

                let avatar_stream = Stream { uid: avatar_uid, language: target_lang.clone() };
                REGISTRY.set_avatar_stream(&key, avatar_stream.clone()).await;
                streams.push(avatar_stream);
            } else {
                streams.extend(info.streams.iter().cloned());
            }
        }

        let task_id = primary_task_id.context("Start called with no targets")?;
        info!(task_id, channel = %req.channel, "start request completed");
        Ok(StartResponse { task_id, streams })
    }

    /// §4.H `Stop`. Deletes every target's external translator task, stops
    /// every child session spawned for any of them, and clears the whole
    /// registry group sharing this primary task_id.
    pub async fn stop(&self, task_id: &str) -> Result<()> {
        let group = REGISTRY.entries_for_primary(task_id).await;
        if group.is_empty() {
            translator::delete_translation(&self.http, &self.config.translator_base_url, task_id)
                .await
                .ok();
        }
        for entry in &group {
            translator::delete_translation(&self.http, &self.config.translator_base_url, &entry.task_id)
                .await
                .ok();
        }

        for child_task_id in self.sessions.all_task_ids().await {
            if child_task_id == *task_id || child_task_id.starts_with(&format!("{task_id}-")) {
                self.sessions.stop_session(&child_task_id).await?;
            }
        }

        REGISTRY.remove_by_primary_task_id(task_id).await;
        Ok(())
    }

    /// §4.H `List`.
    pub async fn list(&self) -> Vec<TaskInfo> {
        REGISTRY.snapshot().await
    }
}

async fn create_translation_task(
    http: &Client,
    config: &Config,
    channel: &str,
    speaker_uid: u32,
    source_language: &str,
    target_lang: &str,
) -> Result<TaskInfo> {
    let translator_token = token::mint_token(
        http,
        &config.token_service_base_url,
        channel,
        speaker_uid,
        Role::Subscriber,
        config.connect_wait_timeout,
    )
    .await
    .context("minting translator-source conference token")?;

    let response = translator::create_translation(
        http,
        &config.translator_base_url,
        &translator::CreateTranslationRequest {
            agora_app_id: config.agora_app_id.clone(),
            channel: channel.to_string(),
            remote_uid: speaker_uid,
            local_uid: speaker_uid,
            token: translator_token.clone(),
            speech_recognition: translator::SpeechRecognitionConfig {
                source_language: source_language.to_string(),
            },
            translations: vec![translator::TranslationTarget {
                local_uid: speaker_uid,
                // Same uid as the top-level token above, so it reuses it
                // rather than sending the translator a blank per-uid token.
                token: translator_token.clone(),
                target_language: target_lang.to_string(),
            }],
        },
    )
    .await?;

    Ok(TaskInfo {
        task_id: response.task_id.clone(),
        streams: response.streams,
        speaker_uid,
        channel: channel.to_string(),
        language: target_lang.to_string(),
        primary_task_id: response.task_id,
        avatar_stream: None,
    })
}
