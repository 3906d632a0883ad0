//! bot_worker: the per-session child process (§4.E, §6).
//!
//! Runs entirely in its own process so a native conference-SDK crash can
//! never take down the control plane. Stdin carries commands from the
//! parent (§4.A); stdout is reserved exclusively for the IPC reply channel
//! and must never receive anything else, so all of this binary's own
//! diagnostics go to stderr via `tracing`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use avatar_session_engine::avatar::{AvatarClient, AvatarSessionParams};
use avatar_session_engine::conference::{Bot, ConferenceEvent, ConferenceSdk, JoinParams};
use avatar_session_engine::config::Config;
use avatar_session_engine::error::ErrorCode;
use avatar_session_engine::ipc::envelope::{ErrorResponse, LogMessage, Payload, StartSession, StatusUpdate};
use avatar_session_engine::ipc::{read_loop, FramedReader, FramedWriter};
use avatar_session_engine::orchestrator::{CommandChannels, Orchestrator, State, Trigger};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Placeholder for the vendor's native conference SDK binding. The core
/// never depends on a concrete FFI crate (§4.D); production deployments
/// replace this with a real adapter over that library. It fails fast with
/// a descriptive error rather than pretending to connect.
struct UnimplementedConferenceSdk;

#[async_trait]
impl ConferenceSdk for UnimplementedConferenceSdk {
    async fn initialize(&self, _app_id: &str) -> Result<()> {
        bail!("no conference SDK binding is linked into this build")
    }

    async fn create_connection(&self) -> Result<()> {
        bail!("no conference SDK binding is linked into this build")
    }

    fn register_observer(&self, _events: mpsc::UnboundedSender<ConferenceEvent>) {}

    async fn connect(&self, _params: &JoinParams) -> Result<()> {
        bail!("no conference SDK binding is linked into this build")
    }

    async fn subscribe_audio(&self, _uid: u32) -> Result<()> {
        bail!("no conference SDK binding is linked into this build")
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let config = Config::from_env();
    let writer = Arc::new(FramedWriter::new(tokio::io::stdout()));
    let mut reader = FramedReader::new(tokio::io::stdin());

    let start = read_start_session(&mut reader).await?;
    info!(task_id = %start.task_id, "received StartSession");

    let (channels, stop_rx, target_left_rx) = CommandChannels::new();
    let orchestrator = Arc::new(Orchestrator::new(stop_rx, target_left_rx, config.idle_timeout));
    orchestrator.transition(State::ConnectingAnam).await;

    spawn_command_loop(reader, channels, start.task_id.clone(), writer.clone());

    let exit_code = run_session(&config, &start, orchestrator, writer.clone()).await;
    std::process::exit(exit_code);
}

async fn read_start_session(
    reader: &mut FramedReader<tokio::io::Stdin>,
) -> Result<StartSession> {
    let envelope = reader
        .read_envelope()
        .await
        .context("reading StartSession envelope")?;
    match Payload::decode_envelope(&envelope).context("decoding StartSession envelope")? {
        Some(Payload::StartSession(start)) => Ok(start),
        Some(other) => bail!("expected StartSession as the first IPC message, got {other:?}"),
        None => bail!("first IPC message has an unrecognized message type"),
    }
}

/// Read subsequent IPC frames (only `StopSession` is meaningful once
/// running) and translate them into orchestrator triggers (§4.E "Command
/// loop").
fn spawn_command_loop(
    reader: FramedReader<tokio::io::Stdin>,
    channels: CommandChannels,
    task_id: String,
    writer: Arc<FramedWriter<tokio::io::Stdout>>,
) {
    tokio::spawn(async move {
        let result = read_loop(reader, |payload| match payload {
            Payload::StopSession(_) => {
                info!(task_id = %task_id, "received StopSession");
                channels.apply(avatar_session_engine::orchestrator::Cmd::Stop);
            }
            other => {
                warn!(task_id = %task_id, ?other, "ignoring unexpected IPC message on command loop");
            }
        })
        .await;

        if let Err(e) = result {
            error!(task_id = %task_id, error = %e, "command loop IPC read failed");
            let _ = writer
                .write_payload(&Payload::ErrorResponse(ErrorResponse {
                    task_id,
                    code: ErrorCode::WorkerFailed.as_str().to_string(),
                    message: e.to_string(),
                    fatal: true,
                }))
                .await;
        }
    });
}

/// Sequence C then D (§2 Flow), run the orchestrator's termination select,
/// and report the outcome over IPC. Returns the process exit code (0 clean,
/// 1 on any fatal path), matching §4.E "the child process exits with
/// status 0 after a clean shutdown; any non-zero exit is interpreted by the
/// parent as a crash."
async fn run_session(
    config: &Config,
    start: &StartSession,
    orchestrator: Arc<Orchestrator>,
    writer: Arc<FramedWriter<tokio::io::Stdout>>,
) -> i32 {
    let http = reqwest::Client::builder()
        .timeout(config.handshake_http_timeout)
        .build()
        .expect("building the avatar HTTP client");

    let avatar_params = AvatarSessionParams {
        base_url: start.avatar_base_url.clone(),
        api_key: start.avatar_api_key.clone(),
        avatar_id: start.avatar_id.clone(),
        quality: config.avatar_quality.clone(),
        video_encoding: config.avatar_video_encoding.clone(),
        app_id: config.agora_app_id.clone(),
        agora_token: start.avatar_token.clone(),
        channel: start.channel.clone(),
        uid: start.anam_uid,
    };

    let avatar = match AvatarClient::connect(&http, &avatar_params, config.ws_dial_timeout).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            return fail(&writer, &start.task_id, ErrorCode::AnamConnectFailed, &e.to_string()).await;
        }
    };

    orchestrator.transition(State::ConnectingAgora).await;
    send_status(&writer, &start.task_id, "CONNECTING_AGORA", start.anam_uid).await;

    let sdk: Arc<dyn ConferenceSdk> = Arc::new(UnimplementedConferenceSdk);
    if let Err(e) = sdk.initialize(&config.agora_app_id).await {
        return fail(&writer, &start.task_id, ErrorCode::AgoraConnectFailed, &e.to_string()).await;
    }
    if let Err(e) = sdk.create_connection().await {
        return fail(&writer, &start.task_id, ErrorCode::AgoraConnectFailed, &e.to_string()).await;
    }

    let bot = Arc::new(Bot::new(sdk, start.palabra_uid));
    let join_params = JoinParams {
        app_id: config.agora_app_id.clone(),
        token: start.bot_token.clone(),
        channel: start.channel.clone(),
        uid: start.bot_uid,
    };
    let events = match bot.join(&join_params).await {
        Ok(events) => events,
        Err(e) => {
            return fail(&writer, &start.task_id, ErrorCode::AgoraConnectFailed, &e.to_string()).await;
        }
    };

    orchestrator.transition(State::Connected).await;
    send_status(&writer, &start.task_id, "CONNECTED", start.anam_uid).await;
    orchestrator.transition(State::Streaming).await;
    send_status(&writer, &start.task_id, "STREAMING", start.anam_uid).await;

    spawn_heartbeat(avatar.clone(), config.heartbeat_interval, start.task_id.clone());

    let pipeline = avatar_session_engine::audio::VoicePipeline::new(
        config.vad_rms_threshold,
        config.pre_roll_frames,
        config.silence_tail_frames,
    );

    let bot_run = {
        let bot = bot.clone();
        let avatar = avatar.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { bot.run(events, avatar, pipeline, None, orchestrator).await })
    };
    tokio::pin!(bot_run);

    let (trigger, bot_outcome) = tokio::select! {
        trigger = orchestrator.wait_for_trigger() => (Some(trigger), None),
        result = &mut bot_run => (None, Some(result)),
    };

    orchestrator.transition(State::Disconnecting).await;

    let exit_code = match (trigger, bot_outcome) {
        (Some(trigger), _) => {
            info!(task_id = %start.task_id, ?trigger, "orchestrator trigger fired");
            report_trigger(&writer, &start.task_id, trigger).await
        }
        (None, Some(Ok(Ok(())))) if bot.has_target_left() => {
            report_trigger(&writer, &start.task_id, Trigger::TargetLeft).await
        }
        (None, Some(Ok(Ok(())))) => {
            info!(task_id = %start.task_id, "conference bot loop ended cleanly");
            send_status(&writer, &start.task_id, "DISCONNECTED", start.anam_uid).await;
            0
        }
        (None, Some(Ok(Err(e)))) => {
            fail(&writer, &start.task_id, ErrorCode::AgoraConnectFailed, &e.to_string()).await
        }
        (None, Some(Err(e))) => {
            fail(&writer, &start.task_id, ErrorCode::WorkerFailed, &e.to_string()).await
        }
        (None, None) => unreachable!("select always yields one branch"),
    };

    let _ = bot.leave().await;
    let _ = avatar.close().await;
    orchestrator.transition(State::Disconnected).await;
    send_status(&writer, &start.task_id, "DISCONNECTED", start.anam_uid).await;

    exit_code
}

async fn report_trigger(
    writer: &FramedWriter<tokio::io::Stdout>,
    task_id: &str,
    trigger: Trigger,
) -> i32 {
    match trigger.error_code() {
        None => {
            info!(task_id, "parent-initiated stop: clean shutdown");
            log_line(writer, task_id, "info", "parent-initiated stop: clean shutdown").await;
            0
        }
        Some(code) => fail(writer, task_id, code, "session terminated").await,
    }
}

async fn fail(
    writer: &FramedWriter<tokio::io::Stdout>,
    task_id: &str,
    code: ErrorCode,
    message: &str,
) -> i32 {
    error!(task_id, code = code.as_str(), message, "session failed");
    let _ = writer
        .write_payload(&Payload::ErrorResponse(ErrorResponse {
            task_id: task_id.to_string(),
            code: code.as_str().to_string(),
            message: message.to_string(),
            fatal: true,
        }))
        .await;
    1
}

async fn send_status(
    writer: &FramedWriter<tokio::io::Stdout>,
    task_id: &str,
    status: &str,
    avatar_uid: u32,
) {
    let _ = writer
        .write_payload(&Payload::StatusUpdate(StatusUpdate {
            task_id: task_id.to_string(),
            status: status.to_string(),
            message: String::new(),
            avatar_uid,
        }))
        .await;
}

async fn log_line(writer: &FramedWriter<tokio::io::Stdout>, task_id: &str, level: &str, message: &str) {
    let _ = writer
        .write_payload(&Payload::LogMessage(LogMessage {
            task_id: task_id.to_string(),
            level: level.to_string(),
            message: message.to_string(),
        }))
        .await;
}

/// Avatar WS heartbeat sender (§4.C, §5 per-child goroutine 3).
fn spawn_heartbeat(avatar: Arc<AvatarClient>, interval: Duration, task_id: String) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = avatar.send_heartbeat().await {
                warn!(task_id = %task_id, error = %e, "avatar heartbeat failed");
                break;
            }
        }
    });
}
