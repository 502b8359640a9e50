//! Shared orchestrator state.
//!
//! Everything the workers coordinate through lives here: the current
//! session slot, the wake automaton, the TTS playback child, and the two
//! inter-worker queues. Each lock guards one concern; none is held
//! across another.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::process::{Child, ChildStdin};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::music::MusicManager;
use crate::queue::FlushQueue;

/// End-of-turn sentinel on the TTS text queue.
pub const END_OF_TURN: &str = "[[END]]";

/// Bounded sizes for the inter-worker queues. Producers are cloud-bound
/// and slower than the consumers, so hitting the bound is exceptional.
const TTS_TEXT_QUEUE_CAPACITY: usize = 500;
const AUDIO_PCM_QUEUE_CAPACITY: usize = 4000;

/// One conversational turn: an opaque id plus the cancellation handle
/// that every worker spawned for the turn holds a clone of. Rotating the
/// session cancels the old handle; in-flight workers observe it and
/// drain out.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub cancel: CancellationToken,
}

impl Session {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Wake automaton state. `asleep -> awake` only on a wake word;
/// `awake -> asleep` only from the idle monitor.
pub struct WakeState {
    pub awake: bool,
    pub last_active: Option<Instant>,
}

/// The TTS playback child (`aplay`) and its stdin pipe. The sink writes
/// through the slot so the stop primitive can cut playback from any task.
#[derive(Default)]
pub struct PlayerSlot {
    pub proc: Option<Child>,
    pub stdin: Option<ChildStdin>,
}

pub struct SharedState {
    pub config: Config,
    /// Global shutdown flag; cancelled by the exit intent and SIGINT.
    pub shutdown: CancellationToken,
    session: Mutex<Session>,
    wake: Mutex<WakeState>,
    pub player: tokio::sync::Mutex<PlayerSlot>,
    pub tts_text_queue: FlushQueue<String>,
    pub audio_pcm_queue: FlushQueue<Vec<u8>>,
    pub music: Arc<MusicManager>,
}

impl SharedState {
    pub fn new(config: Config) -> Arc<Self> {
        let music = Arc::new(MusicManager::new(config.music_dir.clone()));
        Arc::new(Self {
            config,
            shutdown: CancellationToken::new(),
            session: Mutex::new(Session::new()),
            wake: Mutex::new(WakeState {
                awake: false,
                last_active: None,
            }),
            player: tokio::sync::Mutex::new(PlayerSlot::default()),
            tts_text_queue: FlushQueue::new(TTS_TEXT_QUEUE_CAPACITY),
            audio_pcm_queue: FlushQueue::new(AUDIO_PCM_QUEUE_CAPACITY),
            music,
        })
    }

    /// Clone of the current session slot.
    pub fn session(&self) -> Session {
        self.session.lock().unwrap().clone()
    }

    /// Cancel the current session, install a fresh one, and return it.
    pub fn rotate_session(&self) -> Session {
        let mut slot = self.session.lock().unwrap();
        slot.cancel.cancel();
        *slot = Session::new();
        slot.clone()
    }

    /// Cancel the current session without replacing it.
    pub fn cancel_session(&self) {
        self.session.lock().unwrap().cancel.cancel();
    }

    pub fn is_awake(&self) -> bool {
        self.wake.lock().unwrap().awake
    }

    pub fn set_awake(&self, awake: bool) {
        self.wake.lock().unwrap().awake = awake;
    }

    /// Refresh the idle clock; called whenever the router accepts input.
    pub fn touch_active(&self) {
        self.wake.lock().unwrap().last_active = Some(Instant::now());
    }

    pub fn last_active(&self) -> Option<Instant> {
        self.wake.lock().unwrap().last_active
    }

    /// True while the TTS playback child is alive.
    pub async fn is_tts_busy(&self) -> bool {
        let mut slot = self.player.lock().await;
        match slot.proc.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Environment-independent config fixture for unit tests.
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        api_key: "test-key".into(),
        asr_ws_url: "wss://example.invalid/ws".into(),
        tts_ws_url: "wss://example.invalid/ws".into(),
        llm_url: "https://example.invalid/llm".into(),
        llm_model_fast: "fast".into(),
        llm_model_search: "search".into(),
        tts_model: "tts".into(),
        tts_voice: "voice".into(),
        tts_sample_rate: 22050,
        tts_volume: 50,
        asr_model: "asr".into(),
        asr_sample_rate: 16000,
        music_dir: std::path::PathBuf::from("/tmp"),
        arecord_device: "hw:0,0".into(),
        arecord_channels: 10,
        arecord_rate: 16000,
        arecord_period_size: 256,
        arecord_buffer_size: 16384,
        wake_idle_timeout: std::time::Duration::from_secs(30),
        wake_ack_text: "我在".into(),
        wake_words: vec!["你好小瑞".into()],
        vad_mode: 3,
        speech_trigger_frames: 10,
        silence_close_frames: 10,
        home_dir: None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rotate_session_cancels_previous() {
        let state = SharedState::new(test_config());
        let first = state.session();
        assert!(!first.cancel.is_cancelled());

        let second = state.rotate_session();
        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());
        assert_ne!(first.id, second.id);
        assert_eq!(state.session().id, second.id);
    }

    #[tokio::test]
    async fn test_cancel_session_keeps_identity() {
        let state = SharedState::new(test_config());
        let session = state.session();
        state.cancel_session();
        assert!(session.cancel.is_cancelled());
        assert_eq!(state.session().id, session.id);
    }

    #[tokio::test]
    async fn test_wake_transitions() {
        let state = SharedState::new(test_config());
        assert!(!state.is_awake());
        assert!(state.last_active().is_none());

        state.set_awake(true);
        state.touch_active();
        assert!(state.is_awake());
        assert!(state.last_active().is_some());
    }

    #[tokio::test]
    async fn test_tts_not_busy_without_player() {
        let state = SharedState::new(test_config());
        assert!(!state.is_tts_busy().await);
    }
}

