//! Streaming chat completion and the reply-to-speech pipeline.
//!
//! One request per accepted utterance, served as server-sent events.
//! Incoming deltas are cleaned of emoji, accumulated for control-token
//! parsing, and cut into speakable chunks for the TTS queue. The first
//! chunk is flushed early to keep first-audio latency low; later chunks
//! wait for sentence punctuation or a longer cap.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use crate::state::{Session, SharedState, END_OF_TURN};

/// Chunk cap once the first chunk is out: roughly one sentence.
const LATER_CHUNK_CHARS: usize = 80;
/// First-chunk caps; the search model streams slower, so flush sooner.
const FIRST_CHUNK_CHARS_SEARCH: usize = 15;
const FIRST_CHUNK_CHARS_FAST: usize = 30;
/// Whole-request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const SYSTEM_PROMPT: &str = "你是智能助手。仅在用户【明确要求播放音乐】（如“放首歌”、“听周杰伦”）时，\
                             才在回复末尾添加 [PLAY: 歌名]（随机播放用 [PLAY: RANDOM]）。\
                             如果用户要求停止，加上 [STOP]。\
                             回答天气、新闻、闲聊等普通问题时，【严禁】添加任何播放指令。";

static SENTENCE_PUNCT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[，。！？,.!?\n]").unwrap());
static CONTROL_FRAGMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[.*?\]").unwrap());
static PLAY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\[PLAY:\s*(.*?)\]").unwrap());

/// Worker for one turn: stream the reply into the TTS queue, then act on
/// trailing control tokens.
pub async fn stream_reply(
    state: Arc<SharedState>,
    session: Session,
    prompt: String,
    enable_search: bool,
) {
    // A new turn owns the queue outright.
    state.tts_text_queue.flush();
    let started = Instant::now();

    let full_text = match stream_into_queue(&state, &session, &prompt, enable_search).await {
        Ok(text) => text,
        Err(e) => {
            warn!("chat stream failed: {e:#}");
            state.music.unduck();
            return;
        }
    };
    if session.cancel.is_cancelled() {
        return;
    }
    info!(elapsed = ?started.elapsed(), "chat stream complete");

    if full_text.contains("[STOP]") {
        state.music.stop();
    }
    if let Some(target) = parse_play_directive(&full_text) {
        info!(target = %target, "playback directive from the model");
        state.music.search_and_play(&target).await;
    }
}

async fn stream_into_queue(
    state: &Arc<SharedState>,
    session: &Session,
    prompt: &str,
    enable_search: bool,
) -> anyhow::Result<String> {
    let config = &state.config;
    let model = if enable_search {
        info!("time-sensitive question, enabling web search");
        &config.llm_model_search
    } else {
        &config.llm_model_fast
    };

    let body = json!({
        "model": model,
        "input": {
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
        },
        "parameters": {
            "result_format": "text",
            "incremental_output": true,
            "enable_search": enable_search,
        },
    });

    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("failed to build http client")?;
    let response = client
        .post(&config.llm_url)
        .bearer_auth(&config.api_key)
        .header("X-DashScope-SSE", "enable")
        .json(&body)
        .send()
        .await
        .context("chat request failed")?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("chat endpoint returned {status}: {body}");
    }

    let first_cap = if enable_search {
        FIRST_CHUNK_CHARS_SEARCH
    } else {
        FIRST_CHUNK_CHARS_FAST
    };
    let mut assembler = ChunkAssembler::new(first_cap);
    let mut full_text = String::new();
    let mut pending = String::new();
    let mut stream = response.bytes_stream();

    'outer: while let Some(chunk) = stream.next().await {
        if session.cancel.is_cancelled() {
            return Ok(full_text);
        }
        let chunk = chunk.context("chat stream read failed")?;
        pending.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = pending.find('\n') {
            let line = pending[..pos].trim().to_string();
            pending.drain(..=pos);

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                break 'outer;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                continue;
            };
            let Some(delta) = value["output"]["text"].as_str() else {
                continue;
            };
            let delta = strip_emoji(delta);
            let delta = delta.trim();
            if delta.is_empty() {
                continue;
            }

            full_text.push_str(delta);
            if let Some(chunk) = assembler.push(delta) {
                enqueue_chunk(state, session, &chunk).await;
            }
        }
    }

    if let Some(chunk) = assembler.finish() {
        enqueue_chunk(state, session, &chunk).await;
    }
    if !session.cancel.is_cancelled() {
        state.tts_text_queue.push(END_OF_TURN.to_string()).await;
    }
    Ok(full_text)
}

/// Strip control fragments and push the remainder, unless the session
/// died while the chunk was forming.
async fn enqueue_chunk(state: &Arc<SharedState>, session: &Session, chunk: &str) {
    if session.cancel.is_cancelled() {
        return;
    }
    if let Some(spoken) = sanitize_chunk(chunk) {
        state.tts_text_queue.push(spoken).await;
    }
}

/// Accumulates streamed deltas and decides when a speakable chunk is
/// ready. Kept free of I/O so the flush rules are testable.
pub struct ChunkAssembler {
    buffer: String,
    first_sent: bool,
    first_cap: usize,
}

impl ChunkAssembler {
    pub fn new(first_cap: usize) -> Self {
        Self {
            buffer: String::new(),
            first_sent: false,
            first_cap,
        }
    }

    /// Add a delta; returns a chunk when one should be flushed.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        self.buffer.push_str(delta);
        let cap = if self.first_sent {
            LATER_CHUNK_CHARS
        } else {
            self.first_cap
        };
        if SENTENCE_PUNCT_RE.is_match(delta) || self.buffer.chars().count() > cap {
            self.first_sent = true;
            return Some(std::mem::take(&mut self.buffer));
        }
        None
    }

    /// Whatever is left at end of stream.
    pub fn finish(self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer)
        }
    }
}

/// Remove `[...]` control fragments; returns `None` when nothing
/// speakable remains.
pub fn sanitize_chunk(chunk: &str) -> Option<String> {
    let cleaned = CONTROL_FRAGMENT_RE.replace_all(chunk, "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Extract the `[PLAY: target]` directive, case-insensitively.
pub fn parse_play_directive(text: &str) -> Option<String> {
    PLAY_RE
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Drop emoji from a delta. Fixed codepoint ranges — the synthesis
/// endpoint reads them aloud otherwise.
pub fn strip_emoji(text: &str) -> String {
    text.chars().filter(|c| !is_emoji(*c)).collect()
}

fn is_emoji(c: char) -> bool {
    matches!(
        u32::from(c),
        0x1F300..=0x1F5FF  // symbols & pictographs
        | 0x1F600..=0x1F64F // emoticons
        | 0x1F680..=0x1F6FF // transport & map
        | 0x1F900..=0x1FAFF // supplemental symbols
        | 0x2600..=0x27BF   // misc symbols + dingbats
        | 0x1F1E6..=0x1F1FF // regional indicators
        | 0xFE0F            // variation selector
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_chunk_flushes_on_punctuation() {
        let mut a = ChunkAssembler::new(30);
        assert_eq!(a.push("你好"), None);
        assert_eq!(a.push("，世界").as_deref(), Some("你好，世界"));
    }

    #[test]
    fn test_first_chunk_flushes_on_cap() {
        let mut a = ChunkAssembler::new(5);
        assert_eq!(a.push("四个字呢"), None); // 4 chars, not over cap
        assert_eq!(a.push("再来").as_deref(), Some("四个字呢再来"));
    }

    #[test]
    fn test_search_cap_is_shorter_than_fast_cap() {
        let delta = "这是一段没有标点的十六个字的流式输出";
        let mut search = ChunkAssembler::new(15);
        assert!(search.push(delta).is_some());
        let mut fast = ChunkAssembler::new(30);
        assert!(fast.push(delta).is_none());
    }

    #[test]
    fn test_later_chunks_use_long_cap() {
        let mut a = ChunkAssembler::new(5);
        assert!(a.push("第一句。").is_some());
        // 20 chars without punctuation: under the 80-char later cap.
        assert!(a.push("后续内容后续内容后续内容后续内容后续内容").is_none());
        assert!(a.push("。").is_some());
    }

    #[test]
    fn test_finish_returns_residual() {
        let mut a = ChunkAssembler::new(30);
        a.push("残留");
        assert_eq!(a.finish().as_deref(), Some("残留"));
        assert_eq!(ChunkAssembler::new(30).finish(), None);
    }

    #[test]
    fn test_sanitize_strips_control_fragments() {
        assert_eq!(sanitize_chunk("好的[PLAY: 周杰伦]").as_deref(), Some("好的"));
        assert_eq!(sanitize_chunk("[STOP]"), None);
        assert_eq!(sanitize_chunk("  没有指令  ").as_deref(), Some("没有指令"));
    }

    #[test]
    fn test_parse_play_directive() {
        assert_eq!(
            parse_play_directive("好的，这就放。[PLAY: 周杰伦]").as_deref(),
            Some("周杰伦")
        );
        assert_eq!(parse_play_directive("[play:RANDOM]").as_deref(), Some("RANDOM"));
        assert_eq!(parse_play_directive("[PLAY: ]"), None);
        assert_eq!(parse_play_directive("没有指令"), None);
    }

    #[test]
    fn test_strip_emoji() {
        assert_eq!(strip_emoji("今天天气不错😀☀️"), "今天天气不错");
        assert_eq!(strip_emoji("纯文本"), "纯文本");
    }
}
