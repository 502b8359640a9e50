//! Wake-word gating and the idle monitor.
//!
//! Matching runs over a normalized copy of the transcript (lowercased,
//! common punctuation removed); the command tail handed back to the
//! router is recovered from the original text so the recognizer's
//! phrasing survives intact.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::state::{SharedState, END_OF_TURN};

/// Punctuation stripped during normalization and from the raw tail.
const STRIP_PUNCT: &[char] = &[
    '，', '。', '！', '？', '、', '；', '：', ',', '.', '!', '?', ';', ':', '~', '～', ' ', '　',
];

/// How often the idle monitor re-evaluates the wake state.
const IDLE_TICK: Duration = Duration::from_secs(2);

/// Outcome of matching a transcript against the wake-word list.
#[derive(Debug, PartialEq, Eq)]
pub struct WakeMatch {
    /// Command text after the wake word, empty when none was recovered.
    pub tail: String,
    /// A wake word occurred somewhere in the transcript.
    pub hit: bool,
    /// The transcript was nothing but the wake word.
    pub pure: bool,
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| !STRIP_PUNCT.contains(c))
        .collect()
}

/// Find the first wake word in `text` and split off the trailing command.
pub fn strip_wake_word(text: &str, wake_words: &[String]) -> WakeMatch {
    let normalized = normalize(text.trim());
    for word in wake_words {
        let norm_word = normalize(word);
        if norm_word.is_empty() {
            continue;
        }
        let Some(idx) = normalized.find(&norm_word) else {
            continue;
        };
        let tail_norm = normalized[idx + norm_word.len()..].trim();
        if tail_norm.is_empty() {
            return WakeMatch {
                tail: String::new(),
                hit: true,
                pure: true,
            };
        }
        // Recover the tail from the un-normalized text when the wake word
        // appears verbatim; otherwise hand the whole transcript on.
        if let Some(pos) = text.find(word.as_str()) {
            let raw_tail: String = text[pos + word.len()..]
                .trim()
                .chars()
                .filter(|c| !STRIP_PUNCT.contains(c))
                .collect();
            if !raw_tail.is_empty() {
                return WakeMatch {
                    tail: raw_tail,
                    hit: true,
                    pure: false,
                };
            }
        }
        return WakeMatch {
            tail: text.to_string(),
            hit: true,
            pure: false,
        };
    }
    WakeMatch {
        tail: String::new(),
        hit: false,
        pure: false,
    }
}

/// Speak the wake acknowledgement: stale chunks are flushed first so the
/// ack is the next thing out of the speaker.
pub async fn speak_wake_ack(state: &Arc<SharedState>) {
    state.tts_text_queue.flush();
    state
        .tts_text_queue
        .push(state.config.wake_ack_text.clone())
        .await;
    state.tts_text_queue.push(END_OF_TURN.to_string()).await;
}

/// Drop back to sleep after a quiet stretch. The audible-floor check
/// keeps the device awake for as long as it is speaking or playing.
pub async fn idle_monitor(state: Arc<SharedState>) {
    let timeout = state.config.wake_idle_timeout;
    let mut ticker = tokio::time::interval(IDLE_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if !state.is_awake() {
            continue;
        }
        if state.is_tts_busy().await || state.music.is_playing() {
            continue;
        }
        let Some(last) = state.last_active() else {
            continue;
        };
        if last.elapsed() <= timeout {
            continue;
        }
        state.set_awake(false);
        info!("no interaction for {timeout:?}, going back to sleep");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words() -> Vec<String> {
        vec!["你好小瑞".to_string()]
    }

    #[test]
    fn test_pure_wake_word() {
        let m = strip_wake_word("你好小瑞", &words());
        assert_eq!(
            m,
            WakeMatch {
                tail: String::new(),
                hit: true,
                pure: true
            }
        );
    }

    #[test]
    fn test_pure_wake_word_with_punctuation() {
        let m = strip_wake_word("你好小瑞。", &words());
        assert!(m.hit);
        assert!(m.pure);
    }

    #[test]
    fn test_wake_word_with_command_tail() {
        let m = strip_wake_word("你好小瑞，今天天气怎么样", &words());
        assert!(m.hit);
        assert!(!m.pure);
        assert_eq!(m.tail, "今天天气怎么样");
    }

    #[test]
    fn test_no_wake_word() {
        let m = strip_wake_word("今天天气怎么样", &words());
        assert!(!m.hit);
        assert!(!m.pure);
        assert!(m.tail.is_empty());
    }

    #[test]
    fn test_ascii_wake_word_case_insensitive() {
        let wake = vec!["Hey Box".to_string()];
        let m = strip_wake_word("hey box play something", &wake);
        assert!(m.hit);
        assert!(!m.pure);
        // The raw text lacks the verbatim wake word, so the whole
        // transcript is passed through for the router to handle.
        assert_eq!(m.tail, "hey box play something");
    }

    #[test]
    fn test_multiple_wake_words_first_match_wins() {
        let wake = vec!["小瑞同学".to_string(), "你好小瑞".to_string()];
        let m = strip_wake_word("你好小瑞放首歌", &wake);
        assert!(m.hit);
        assert_eq!(m.tail, "放首歌");
    }
}
