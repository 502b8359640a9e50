//! Volume command parsing and execution.
//!
//! Deterministic regex matching over the transcript: absolute set
//! ("音量调到30"), relative with an amount in either word order, and
//! keyword-only nudges that fall back to a fixed step. Amounts accept
//! Arabic digits or Chinese numerals up to one hundred.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::mixer;
use crate::state::{SharedState, END_OF_TURN};

const CN_NUM: &str = "[一二三四五六七八九十百两零〇]{1,4}";

static SET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"音量\s*调到\s*([0-9]{1,3})").unwrap());
static SET_CN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"音量\s*调到\s*({CN_NUM})")).unwrap());

static UP_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(音量|声音).*(调大|调高|增大|提高)\s*([0-9]{1,3})").unwrap(),
        Regex::new(r"(调大|调高|增大|提高).*(音量|声音)\s*([0-9]{1,3})").unwrap(),
        Regex::new(&format!(r"(音量|声音).*(调大|调高|增大|提高)\s*({CN_NUM})")).unwrap(),
        Regex::new(&format!(r"(调大|调高|增大|提高).*(音量|声音)\s*({CN_NUM})")).unwrap(),
    ]
});
static DOWN_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(音量|声音).*(调小|调低|降低|减小)\s*([0-9]{1,3})").unwrap(),
        Regex::new(r"(调小|调低|降低|减小).*(音量|声音)\s*([0-9]{1,3})").unwrap(),
        Regex::new(&format!(r"(音量|声音).*(调小|调低|降低|减小)\s*({CN_NUM})")).unwrap(),
        Regex::new(&format!(r"(调小|调低|降低|减小).*(音量|声音)\s*({CN_NUM})")).unwrap(),
    ]
});

const UP_KEYWORDS: &[&str] = &[
    "增大音量", "音量调高", "音量调大", "调大音量", "调高音量", "声音调大", "调大声音",
    "增大声音", "调高", "提高", "调大", "增大", "加大", "大点",
];
const DOWN_KEYWORDS: &[&str] = &[
    "降低音量", "音量调低", "音量调小", "音量减小", "调低音量", "调小音量", "降低声音",
    "声音调小", "调小声音", "声音调低", "调低声音", "减小声音", "降低", "调低", "调小",
    "减小", "小一点", "小点",
];

/// Try the transcript as a volume command. Returns true when it was one,
/// whether or not the mixer call succeeded.
pub async fn handle_volume_command(
    state: &Arc<SharedState>,
    text: &str,
    tts_busy: bool,
    music_busy: bool,
) -> bool {
    let text = text.trim();
    if text.is_empty() {
        return false;
    }

    if let Some(percent) = parse_set_percent(text) {
        match mixer::set_volume_percent(percent).await {
            Ok(()) => info!(percent, "volume set"),
            Err(e) => warn!("volume set failed: {e:#}"),
        }
        speak_ack(state, tts_busy, music_busy, &format!("好的，音量已调到{percent}%")).await;
        state.music.unduck();
        return true;
    }

    if let Some((percent, up)) = parse_adjust_percent(text) {
        match mixer::adjust_volume_by_percent(percent, up).await {
            Ok(()) => info!(percent, up, "volume adjusted"),
            Err(e) => warn!("volume adjust failed: {e:#}"),
        }
        let direction = if up { "大" } else { "小" };
        speak_ack(state, tts_busy, music_busy, &format!("好的，音量已调{direction}{percent}%"))
            .await;
        state.music.unduck();
        return true;
    }

    if let Some(up) = parse_adjust_keyword(text) {
        match mixer::adjust_volume_step(up).await {
            Ok(()) => info!(up, "volume nudged"),
            Err(e) => warn!("volume nudge failed: {e:#}"),
        }
        let direction = if up { "大" } else { "小" };
        let step = mixer::VOLUME_STEP_PERCENT;
        speak_ack(state, tts_busy, music_busy, &format!("好的，音量已调{direction}{step}%")).await;
        state.music.unduck();
        return true;
    }

    false
}

/// Speak a confirmation only when the floor is free.
async fn speak_ack(state: &Arc<SharedState>, tts_busy: bool, music_busy: bool, ack: &str) {
    if tts_busy || music_busy || ack.trim().is_empty() {
        return;
    }
    state.tts_text_queue.push(ack.to_string()).await;
    state.tts_text_queue.push(END_OF_TURN.to_string()).await;
}

/// `音量调到 <N>` — absolute percent, clamped to 0..=100.
pub fn parse_set_percent(text: &str) -> Option<u32> {
    if let Some(caps) = SET_RE.captures(text) {
        return parse_number_token(&caps[1]).map(clamp_percent);
    }
    if let Some(caps) = SET_CN_RE.captures(text) {
        return parse_number_token(&caps[1]).map(clamp_percent);
    }
    None
}

/// Relative adjustment with an explicit amount. Returns `(percent, up)`.
pub fn parse_adjust_percent(text: &str) -> Option<(u32, bool)> {
    for re in UP_RES.iter() {
        if let Some(caps) = re.captures(text) {
            return parse_number_token(&caps[3]).map(|n| (clamp_percent(n), true));
        }
    }
    for re in DOWN_RES.iter() {
        if let Some(caps) = re.captures(text) {
            return parse_number_token(&caps[3]).map(|n| (clamp_percent(n), false));
        }
    }
    None
}

/// Keyword-only adjustment. Returns the direction, or `None` when the
/// transcript is not about volume at all.
pub fn parse_adjust_keyword(text: &str) -> Option<bool> {
    if !text.contains("音量") && !text.contains("声音") {
        return None;
    }
    if UP_KEYWORDS.iter().any(|k| text.contains(k)) {
        return Some(true);
    }
    if DOWN_KEYWORDS.iter().any(|k| text.contains(k)) {
        return Some(false);
    }
    None
}

fn clamp_percent(n: u32) -> u32 {
    n.min(100)
}

/// Parse a digit string or a Chinese numeral token.
fn parse_number_token(token: &str) -> Option<u32> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    if let Ok(n) = token.parse::<u32>() {
        return Some(n);
    }
    parse_chinese_number(token)
}

/// Chinese numerals over {零一二三四五六七八九十百}, with 两/〇 aliases
/// and the usual 十 compositions (十五, 三十, 四十二, 一百).
fn parse_chinese_number(s: &str) -> Option<u32> {
    let s = s.trim().replace('两', "二").replace('〇', "零");
    if s == "百" || s == "一百" || s.starts_with("一百") {
        return Some(100);
    }
    if let Some((tens_part, ones_part)) = s.split_once('十') {
        let tens = if tens_part.is_empty() {
            1
        } else {
            cn_digit(tens_part)?
        };
        let ones = if ones_part.is_empty() {
            0
        } else {
            cn_digit(ones_part)?
        };
        return Some(tens * 10 + ones);
    }
    cn_digit(&s)
}

fn cn_digit(s: &str) -> Option<u32> {
    match s {
        "零" => Some(0),
        "一" => Some(1),
        "二" => Some(2),
        "三" => Some(3),
        "四" => Some(4),
        "五" => Some(5),
        "六" => Some(6),
        "七" => Some(7),
        "八" => Some(8),
        "九" => Some(9),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_config;

    #[test]
    fn test_set_percent_digits() {
        assert_eq!(parse_set_percent("音量调到30"), Some(30));
        assert_eq!(parse_set_percent("把音量调到 85"), Some(85));
        // Three digits clamp rather than reject.
        assert_eq!(parse_set_percent("音量调到150"), Some(100));
        assert_eq!(parse_set_percent("声音大一点"), None);
    }

    #[test]
    fn test_set_percent_chinese() {
        assert_eq!(parse_set_percent("音量调到三十"), Some(30));
        assert_eq!(parse_set_percent("音量调到五十五"), Some(55));
        assert_eq!(parse_set_percent("音量调到十"), Some(10));
        assert_eq!(parse_set_percent("音量调到一百"), Some(100));
        assert_eq!(parse_set_percent("音量调到两"), Some(2));
    }

    #[test]
    fn test_adjust_percent_both_orders() {
        assert_eq!(parse_adjust_percent("音量调大20"), Some((20, true)));
        assert_eq!(parse_adjust_percent("调小音量10"), Some((10, false)));
        assert_eq!(parse_adjust_percent("声音提高十五"), Some((15, true)));
        assert_eq!(parse_adjust_percent("降低音量二十"), Some((20, false)));
        assert_eq!(parse_adjust_percent("音量调大"), None);
    }

    #[test]
    fn test_adjust_keyword_requires_volume_topic() {
        assert_eq!(parse_adjust_keyword("音量大点"), Some(true));
        assert_eq!(parse_adjust_keyword("声音小一点"), Some(false));
        assert_eq!(parse_adjust_keyword("大点声走路"), None);
        assert_eq!(parse_adjust_keyword("音量怎么样"), None);
    }

    #[test]
    fn test_chinese_numbers() {
        assert_eq!(parse_chinese_number("零"), Some(0));
        assert_eq!(parse_chinese_number("九"), Some(9));
        assert_eq!(parse_chinese_number("十"), Some(10));
        assert_eq!(parse_chinese_number("十五"), Some(15));
        assert_eq!(parse_chinese_number("三十"), Some(30));
        assert_eq!(parse_chinese_number("四十二"), Some(42));
        assert_eq!(parse_chinese_number("一百"), Some(100));
        assert_eq!(parse_chinese_number("百"), Some(100));
        assert_eq!(parse_chinese_number("胡说"), None);
    }

    #[tokio::test]
    async fn test_ack_spoken_when_floor_free() {
        let state = SharedState::new(test_config());
        let handled = handle_volume_command(&state, "音量调到30", false, false).await;
        assert!(handled);
        assert_eq!(state.tts_text_queue.pop().await, "好的，音量已调到30%");
        assert_eq!(state.tts_text_queue.pop().await, END_OF_TURN);
    }

    #[tokio::test]
    async fn test_ack_suppressed_while_busy() {
        let state = SharedState::new(test_config());
        let handled = handle_volume_command(&state, "音量调到30", true, false).await;
        assert!(handled);
        assert!(state.tts_text_queue.is_empty());
    }

    #[tokio::test]
    async fn test_non_volume_text_not_handled() {
        let state = SharedState::new(test_config());
        assert!(!handle_volume_command(&state, "讲个笑话", false, false).await);
        assert!(state.tts_text_queue.is_empty());
    }
}
