//! Transcript routing.
//!
//! Strict order: wake gating, exit, volume, busy gating, then LLM
//! dispatch. Classification itself is a handful of pure keyword
//! predicates; the routing function owns the side effects.

pub mod volume;

use std::sync::Arc;

use tracing::info;

use crate::control;
use crate::llm;
use crate::state::SharedState;
use crate::wake;

/// Commands that shut the whole system down.
const EXIT_WORDS: &[&str] = &["关闭系统", "退出系统", "关机", "再见"];
/// Commands that silence whatever is currently audible.
const INTERRUPT_WORDS: &[&str] = &["闭嘴", "别说了", "安静", "停止", "停一下"];
/// Phrases that express a desire for music playback.
const MUSIC_KEYWORDS: &[&str] = &["播放", "想要听", "要听"];
/// Track-skip phrases, matched on normalized text.
const QUICK_SWITCH_WORDS: &[&str] = &["换首歌", "下一首", "切歌"];
/// Topics that need fresh data, enabling web search for the turn.
const SEARCH_HINT_WORDS: &[&str] = &["天气", "今天", "星期几", "实时", "最新"];

pub fn is_exit(text: &str) -> bool {
    EXIT_WORDS.iter().any(|w| text.contains(w))
}

pub fn is_interrupt(text: &str) -> bool {
    INTERRUPT_WORDS.iter().any(|w| text.contains(w))
}

pub fn has_music_intent(text: &str) -> bool {
    MUSIC_KEYWORDS.iter().any(|w| text.contains(w))
}

pub fn is_quick_switch(text: &str) -> bool {
    let normalized: String = text
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_ascii_punctuation() && !"，。！？、".contains(*c))
        .collect();
    QUICK_SWITCH_WORDS.iter().any(|w| normalized.contains(w))
}

pub fn wants_search(text: &str) -> bool {
    SEARCH_HINT_WORDS.iter().any(|w| text.contains(w))
}

/// Route one final transcript through the command pipeline.
pub async fn route_transcript(state: Arc<SharedState>, raw_text: String) {
    let matched = wake::strip_wake_word(&raw_text, &state.config.wake_words);
    let mut text = raw_text.clone();

    if !state.is_awake() {
        if !matched.hit {
            info!(text = %raw_text, "asleep and no wake word, ignoring");
            state.music.unduck();
            return;
        }
        state.set_awake(true);
        state.touch_active();
        if matched.pure {
            info!("wake word detected, now awake");
            wake::speak_wake_ack(&state).await;
            state.music.unduck();
            return;
        }
        if !matched.tail.trim().is_empty() {
            info!(command = %matched.tail, "woken with an inline command");
            text = matched.tail.clone();
        }
    } else {
        state.touch_active();
        if matched.hit {
            if matched.pure {
                wake::speak_wake_ack(&state).await;
                state.music.unduck();
                return;
            }
            if !matched.tail.trim().is_empty() && matched.tail != text {
                text = matched.tail.clone();
            }
        }
    }

    info!(text = %text, "transcript accepted");

    if is_exit(&text) {
        info!("exit command received, shutting down");
        state.shutdown.cancel();
        control::perform_stop(&state).await;
        return;
    }

    let tts_busy = state.is_tts_busy().await;
    let music_busy = state.music.is_playing();

    if volume::handle_volume_command(&state, &text, tts_busy, music_busy).await {
        return;
    }

    if tts_busy || music_busy {
        let quick_switch = music_busy && is_quick_switch(&text);

        if is_interrupt(&text) || has_music_intent(&text) || quick_switch {
            info!(text = %text, "control command while busy, silencing output");
            control::perform_stop(&state).await;
            if quick_switch {
                state.music.search_and_play("RANDOM").await;
            }
            return;
        }
        info!(text = %text, "busy, ignoring non-control command");
        state.music.unduck();
        return;
    }

    let enable_search = wants_search(&text);
    let session = state.rotate_session();
    tokio::spawn(llm::stream_reply(state.clone(), session, text, enable_search));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{test_config, END_OF_TURN};

    #[test]
    fn test_exit_words() {
        assert!(is_exit("关闭系统"));
        assert!(is_exit("请帮我关机吧"));
        assert!(!is_exit("今天天气怎么样"));
    }

    #[test]
    fn test_interrupt_words() {
        assert!(is_interrupt("闭嘴"));
        assert!(is_interrupt("好了别说了"));
        assert!(!is_interrupt("继续讲"));
    }

    #[test]
    fn test_music_intent() {
        assert!(has_music_intent("播放周杰伦"));
        assert!(has_music_intent("我想要听歌"));
        assert!(!has_music_intent("下一首"));
    }

    #[test]
    fn test_quick_switch_normalized() {
        assert!(is_quick_switch("下一首"));
        assert!(is_quick_switch("下一首。"));
        assert!(is_quick_switch("换 首 歌"));
        assert!(!is_quick_switch("这首歌真好听"));
    }

    #[test]
    fn test_search_hints() {
        assert!(wants_search("今天天气怎么样"));
        assert!(wants_search("最新的新闻"));
        assert!(!wants_search("讲个笑话"));
    }

    #[tokio::test]
    async fn test_cold_wake_speaks_ack_without_new_session() {
        let state = SharedState::new(test_config());
        let before = state.session().id;

        route_transcript(state.clone(), "你好小瑞".to_string()).await;

        assert!(state.is_awake());
        assert!(state.last_active().is_some());
        assert_eq!(state.tts_text_queue.pop().await, "我在");
        assert_eq!(state.tts_text_queue.pop().await, END_OF_TURN);
        assert!(state.tts_text_queue.is_empty());
        // A bare wake word is not a command: no turn was started.
        assert_eq!(state.session().id, before);
    }

    #[tokio::test]
    async fn test_asleep_ignores_text_without_wake_word() {
        let state = SharedState::new(test_config());
        let before = state.session().id;

        route_transcript(state.clone(), "今天天气怎么样".to_string()).await;

        assert!(!state.is_awake());
        assert!(state.tts_text_queue.is_empty());
        assert_eq!(state.session().id, before);
    }

    #[tokio::test]
    async fn test_wake_with_inline_command_starts_a_turn() {
        let state = SharedState::new(test_config());
        let before = state.session().id;

        route_transcript(state.clone(), "你好小瑞，今天天气怎么样".to_string()).await;

        assert!(state.is_awake());
        assert_ne!(state.session().id, before);
    }

    #[tokio::test]
    async fn test_music_request_while_busy_stops_without_new_turn() {
        let state = SharedState::new(test_config());
        state.set_awake(true);
        {
            // Stand-in playback child so the busy check reports true.
            let mut slot = state.player.lock().await;
            slot.proc = tokio::process::Command::new("sleep")
                .arg("5")
                .spawn()
                .ok();
        }
        assert!(state.is_tts_busy().await);
        let before = state.session().id;

        route_transcript(state.clone(), "播放周杰伦".to_string()).await;

        // Stop-and-return: output silenced, no turn started.
        assert_eq!(state.session().id, before);
        assert!(state.tts_text_queue.is_empty());
        assert!(state.audio_pcm_queue.is_empty());
        assert!(!state.is_tts_busy().await);
    }

    #[tokio::test]
    async fn test_exit_command_sets_shutdown_and_silences() {
        let state = SharedState::new(test_config());
        state.set_awake(true);
        state.tts_text_queue.push("残留".to_string()).await;

        route_transcript(state.clone(), "关闭系统".to_string()).await;

        assert!(state.shutdown.is_cancelled());
        assert!(state.tts_text_queue.is_empty());
        assert!(state.audio_pcm_queue.is_empty());
    }
}
