//! Conference SDK boundary and the bot that rides on top of it (§4.D).
//!
//! The vendor's native conferencing library is never linked directly. It is
//! modeled as [`ConferenceSdk`], the only surface the rest of the crate
//! depends on; production wiring plugs a real FFI binding in behind it, and
//! tests use [`fake::FakeConferenceSdk`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::audio::{FrameAction, VoicePipeline};
use crate::avatar::AvatarClient;
use crate::orchestrator::Orchestrator;

/// Events the SDK delivers to whoever registered as its observer.
#[derive(Debug, Clone)]
pub enum ConferenceEvent {
    UserJoined { uid: u32 },
    UserLeft { uid: u32 },
    /// Raw audio for `uid`, delivered before the SDK mixes it with anything
    /// else. 16 kHz mono PCM16.
    BeforeMixingAudio { uid: u32, pcm16: Vec<i16> },
    ConnectFailed { reason: String },
    Connected,
    Disconnected,
}

/// Connection parameters for joining a single conference channel.
#[derive(Debug, Clone)]
pub struct JoinParams {
    pub app_id: String,
    pub token: String,
    pub channel: String,
    pub uid: u32,
}

/// The operations the core needs from a conference SDK (§6). A real
/// implementation wraps the vendor's native library; `initialize` and
/// `create_connection` are typically called once per process, the rest
/// once per session.
#[async_trait]
pub trait ConferenceSdk: Send + Sync {
    async fn initialize(&self, app_id: &str) -> Result<()>;
    async fn create_connection(&self) -> Result<()>;
    /// Register the channel that receives `ConferenceEvent`s for this
    /// connection. Implementations must deliver events even from native
    /// callback threads; they are not required to run on a Tokio task.
    fn register_observer(&self, events: mpsc::UnboundedSender<ConferenceEvent>);
    async fn connect(&self, params: &JoinParams) -> Result<()>;
    /// Subscribe to exactly one uid's audio. Called only after that uid's
    /// `UserJoined` event, and only for the configured translator uid.
    async fn subscribe_audio(&self, uid: u32) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn release(&self) -> Result<()>;
}

/// Runs the join → selective-subscribe → audio-forwarding lifecycle for one
/// session on top of a [`ConferenceSdk`].
pub struct Bot {
    sdk: Arc<dyn ConferenceSdk>,
    translator_uid: u32,
    target_left: Arc<AtomicBool>,
}

/// What the event loop in [`Bot::run`] should do with one SDK event,
/// factored out so the routing decision can be unit-tested without a real
/// avatar connection.
#[derive(Debug, PartialEq)]
enum Routing {
    Ignore,
    Subscribe(u32),
    TargetLeft,
    Forward(Vec<i16>),
    ConnectFailed(String),
    Stop,
}

fn route(event: &ConferenceEvent, translator_uid: u32) -> Routing {
    match event {
        ConferenceEvent::UserJoined { uid } if *uid == translator_uid => Routing::Subscribe(*uid),
        ConferenceEvent::UserJoined { .. } => Routing::Ignore,
        ConferenceEvent::UserLeft { uid } if *uid == translator_uid => Routing::TargetLeft,
        ConferenceEvent::UserLeft { .. } => Routing::Ignore,
        ConferenceEvent::BeforeMixingAudio { uid, pcm16 } if *uid == translator_uid => {
            Routing::Forward(pcm16.clone())
        }
        ConferenceEvent::BeforeMixingAudio { .. } => Routing::Ignore,
        ConferenceEvent::ConnectFailed { reason } => Routing::ConnectFailed(reason.clone()),
        ConferenceEvent::Connected => Routing::Ignore,
        ConferenceEvent::Disconnected => Routing::Stop,
    }
}

impl Bot {
    pub fn new(sdk: Arc<dyn ConferenceSdk>, translator_uid: u32) -> Self {
        Self {
            sdk,
            translator_uid,
            target_left: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Join as a subscribe-only participant (`auto_subscribe_audio=false`
    /// is the caller's responsibility when constructing `JoinParams`/the
    /// real SDK binding; this type only ever calls `subscribe_audio`
    /// explicitly for the translator uid).
    pub async fn join(&self, params: &JoinParams) -> Result<mpsc::UnboundedReceiver<ConferenceEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sdk.register_observer(tx);
        self.sdk.connect(params).await?;
        Ok(rx)
    }

    /// Drive the event loop: subscribe to the translator uid on join,
    /// latch `target_left` exactly once on its departure, and forward
    /// voiced frames to the avatar through the VAD/resampler pipeline.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<ConferenceEvent>,
        avatar: Arc<AvatarClient>,
        mut pipeline: VoicePipeline,
        mut debug_sink: Option<tokio::fs::File>,
        orchestrator: Arc<Orchestrator>,
    ) -> Result<()> {
        while let Some(event) = events.recv().await {
            match route(&event, self.translator_uid) {
                Routing::Ignore => {}
                Routing::Subscribe(uid) => {
                    info!(uid, "translator joined, subscribing to audio");
                    self.sdk.subscribe_audio(uid).await?;
                }
                Routing::TargetLeft => {
                    if !self.target_left.swap(true, Ordering::SeqCst) {
                        info!("translator left, latching target_left");
                    }
                    break;
                }
                Routing::Forward(pcm16) => {
                    if let Some(file) = debug_sink.as_mut() {
                        if let Err(e) = write_debug_frame(file, &pcm16).await {
                            warn!(error = %e, "debug PCM sink write failed");
                        }
                    }
                    match pipeline.process(&pcm16) {
                        FrameAction::Dropped => {}
                        FrameAction::Onset { pre_roll, frame } => {
                            for buffered in pre_roll {
                                avatar.send_voice(&buffered).await?;
                            }
                            avatar.send_voice(&frame).await?;
                            orchestrator.note_audio_transmitted(std::time::Instant::now()).await;
                        }
                        FrameAction::Sending { frame } => {
                            avatar.send_voice(&frame).await?;
                            orchestrator.note_audio_transmitted(std::time::Instant::now()).await;
                        }
                        FrameAction::End => {
                            avatar.send_voice_end().await?;
                        }
                    }
                }
                Routing::ConnectFailed(reason) => {
                    anyhow::bail!("conference connect failed: {reason}");
                }
                Routing::Stop => break,
            }
        }
        Ok(())
    }

    pub fn has_target_left(&self) -> bool {
        self.target_left.load(Ordering::SeqCst)
    }

    pub async fn leave(&self) -> Result<()> {
        self.sdk.disconnect().await?;
        self.sdk.release().await
    }
}

/// Append one frame of raw little-endian PCM16 to the optional debug sink.
/// Not part of the correctness contract (§4.D).
async fn write_debug_frame(file: &mut tokio::fs::File, pcm16: &[i16]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let bytes: Vec<u8> = pcm16.iter().flat_map(|s| s.to_le_bytes()).collect();
    file.write_all(&bytes).await
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// In-memory `ConferenceSdk` for tests: records calls and lets the test
    /// push synthetic events through the observer channel.
    #[derive(Default)]
    pub struct FakeConferenceSdk {
        observer: Mutex<Option<mpsc::UnboundedSender<ConferenceEvent>>>,
        pub subscribed_uids: Mutex<Vec<u32>>,
        pub connected: Mutex<bool>,
    }

    impl FakeConferenceSdk {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn emit(&self, event: ConferenceEvent) {
            if let Some(tx) = self.observer.lock().unwrap().as_ref() {
                let _ = tx.send(event);
            }
        }
    }

    #[async_trait]
    impl ConferenceSdk for FakeConferenceSdk {
        async fn initialize(&self, _app_id: &str) -> Result<()> {
            Ok(())
        }

        async fn create_connection(&self) -> Result<()> {
            Ok(())
        }

        fn register_observer(&self, events: mpsc::UnboundedSender<ConferenceEvent>) {
            *self.observer.lock().unwrap() = Some(events);
        }

        async fn connect(&self, _params: &JoinParams) -> Result<()> {
            *self.connected.lock().unwrap() = true;
            Ok(())
        }

        async fn subscribe_audio(&self, uid: u32) -> Result<()> {
            self.subscribed_uids.lock().unwrap().push(uid);
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            *self.connected.lock().unwrap() = false;
            Ok(())
        }

        async fn release(&self) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeConferenceSdk;
    use super::*;

    #[test]
    fn only_the_configured_translator_uid_triggers_a_subscribe() {
        assert_eq!(route(&ConferenceEvent::UserJoined { uid: 3000 }, 3000), Routing::Subscribe(3000));
        assert_eq!(route(&ConferenceEvent::UserJoined { uid: 9999 }, 3000), Routing::Ignore);
    }

    #[test]
    fn only_the_configured_translator_uid_triggers_target_left() {
        assert_eq!(route(&ConferenceEvent::UserLeft { uid: 3000 }, 3000), Routing::TargetLeft);
        assert_eq!(route(&ConferenceEvent::UserLeft { uid: 9999 }, 3000), Routing::Ignore);
    }

    #[test]
    fn only_the_translator_uids_audio_is_forwarded() {
        let frame = vec![1i16, 2, 3];
        assert_eq!(
            route(&ConferenceEvent::BeforeMixingAudio { uid: 3000, pcm16: frame.clone() }, 3000),
            Routing::Forward(frame)
        );
        assert_eq!(
            route(&ConferenceEvent::BeforeMixingAudio { uid: 9999, pcm16: vec![1, 2, 3] }, 3000),
            Routing::Ignore
        );
    }

    #[tokio::test]
    async fn subscribe_audio_is_called_on_the_sdk_when_the_translator_joins() {
        let sdk = Arc::new(FakeConferenceSdk::new());
        let bot = Bot::new(sdk.clone(), 3000);
        match route(&ConferenceEvent::UserJoined { uid: 3000 }, bot.translator_uid) {
            Routing::Subscribe(uid) => sdk.subscribe_audio(uid).await.unwrap(),
            other => panic!("expected Subscribe, got {other:?}"),
        }
        assert_eq!(*sdk.subscribed_uids.lock().unwrap(), vec![3000]);
    }

    #[test]
    fn target_left_latches_exactly_once() {
        let sdk = Arc::new(FakeConferenceSdk::new());
        let bot = Bot::new(sdk, 3000);
        assert!(!bot.has_target_left());
        let first = bot.target_left.swap(true, Ordering::SeqCst);
        let second = bot.target_left.swap(true, Ordering::SeqCst);
        assert!(!first);
        assert!(second);
        assert!(bot.has_target_left());
    }

    #[tokio::test]
    async fn debug_sink_appends_raw_little_endian_pcm16() {
        use tokio::io::AsyncWriteExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.pcm");
        let mut file = tokio::fs::File::create(&path).await.unwrap();

        write_debug_frame(&mut file, &[1i16, -2, 300]).await.unwrap();
        write_debug_frame(&mut file, &[4i16]).await.unwrap();
        file.flush().await.unwrap();

        let bytes = tokio::fs::read(&path).await.unwrap();
        let mut expected = Vec::new();
        for s in [1i16, -2, 300, 4] {
            expected.extend_from_slice(&s.to_le_bytes());
        }
        assert_eq!(bytes, expected);
    }
}
