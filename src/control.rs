//! The global "silence everything" primitive.
//!
//! Fan-out cancellation used by barge-in, exit, quick switch, and any
//! new holder of the speaking floor. Idempotent and callable from any
//! task: every step tolerates finding nothing to do.

use std::sync::Arc;

use tracing::info;

use crate::state::SharedState;

/// Silence every audible source and drop all queued work.
///
/// Ordering matters: the session token goes first so producers stop
/// refilling the queues while they are being drained.
pub async fn perform_stop(state: &Arc<SharedState>) {
    info!("global stop: cutting all audio sources");

    state.cancel_session();

    let dropped_text = state.tts_text_queue.flush();
    let dropped_pcm = state.audio_pcm_queue.flush();
    if dropped_text > 0 || dropped_pcm > 0 {
        info!(dropped_text, dropped_pcm, "queues drained");
    }

    {
        let mut slot = state.player.lock().await;
        slot.stdin = None;
        if let Some(mut child) = slot.proc.take() {
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
    }

    state.music.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{test_config, END_OF_TURN};

    #[tokio::test]
    async fn test_stop_drains_queues_and_cancels_session() {
        let state = SharedState::new(test_config());
        let session = state.session();
        state.tts_text_queue.push("你好".to_string()).await;
        state.tts_text_queue.push(END_OF_TURN.to_string()).await;
        state.audio_pcm_queue.push(vec![0u8; 320]).await;

        perform_stop(&state).await;

        assert!(session.cancel.is_cancelled());
        assert!(state.tts_text_queue.is_empty());
        assert!(state.audio_pcm_queue.is_empty());
        assert!(!state.is_tts_busy().await);
        assert!(!state.music.is_playing());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let state = SharedState::new(test_config());
        perform_stop(&state).await;
        perform_stop(&state).await;
        assert!(state.tts_text_queue.is_empty());
        assert!(state.audio_pcm_queue.is_empty());
    }
}
