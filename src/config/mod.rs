//! Runtime configuration.
//!
//! Values come from the process environment first, then an optional
//! `ai_box.env` key=value file under `AI_BOX_HOME`, then built-in
//! defaults. Only the DashScope API key is mandatory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

/// Default DashScope duplex inference endpoint (ASR + TTS).
const DEFAULT_WS_URL: &str = "wss://dashscope.aliyuncs.com/api-ws/v1/inference";
/// Default DashScope text-generation endpoint (SSE).
const DEFAULT_LLM_URL: &str =
    "https://dashscope.aliyuncs.com/api/v1/services/aigc/text-generation/generation";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub asr_ws_url: String,
    pub tts_ws_url: String,
    pub llm_url: String,

    pub llm_model_fast: String,
    pub llm_model_search: String,

    pub tts_model: String,
    pub tts_voice: String,
    pub tts_sample_rate: u32,
    pub tts_volume: u32,

    pub asr_model: String,
    pub asr_sample_rate: u32,

    pub music_dir: PathBuf,

    pub arecord_device: String,
    pub arecord_channels: u32,
    pub arecord_rate: u32,
    pub arecord_period_size: u32,
    pub arecord_buffer_size: u32,

    pub wake_idle_timeout: Duration,
    pub wake_ack_text: String,
    pub wake_words: Vec<String>,

    pub vad_mode: i32,
    /// Consecutive VAD-speech frames before an utterance opens.
    pub speech_trigger_frames: u32,
    /// Consecutive VAD-silence frames before an utterance closes.
    pub silence_close_frames: u32,

    /// Base directory for native libraries, the env file and the log file.
    pub home_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the environment and the optional env file.
    ///
    /// Fails with a human-readable message when the API key is absent —
    /// nothing downstream can work without it.
    pub fn load() -> anyhow::Result<Config> {
        let home_dir = std::env::var("AI_BOX_HOME")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let mut file_vars = HashMap::new();
        if let Some(home) = &home_dir {
            let env_path = home.join("ai_box.env");
            if let Ok(contents) = std::fs::read_to_string(&env_path) {
                file_vars = parse_env_lines(&contents);
            }
        }

        let get = |key: &str| -> Option<String> {
            std::env::var(key)
                .ok()
                .or_else(|| file_vars.get(key).cloned())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = match get("AI_BOX_DASH_API_KEY").or_else(|| get("DASHSCOPE_API_KEY")) {
            Some(key) => key,
            None => bail!(
                "missing DashScope API key: set AI_BOX_DASH_API_KEY (or DASHSCOPE_API_KEY) \
                 in the environment or in $AI_BOX_HOME/ai_box.env"
            ),
        };

        let music_dir = get("AI_BOX_MUSIC_DIR").map(PathBuf::from).unwrap_or_else(|| {
            home_dir
                .as_ref()
                .map(|h| h.join("music"))
                .unwrap_or_else(|| PathBuf::from("./music"))
        });

        let wake_idle_timeout = match get("AI_BOX_WAKE_IDLE_TIMEOUT") {
            Some(raw) => parse_duration(&raw)
                .with_context(|| format!("invalid AI_BOX_WAKE_IDLE_TIMEOUT: {raw:?}"))?,
            None => Duration::from_secs(30),
        };

        let wake_words = get("AI_BOX_WAKE_WORDS")
            .map(|raw| parse_wake_words(&raw))
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| vec!["你好小瑞".to_string()]);

        Ok(Config {
            api_key,
            asr_ws_url: get("AI_BOX_ASR_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.into()),
            tts_ws_url: get("AI_BOX_TTS_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.into()),
            llm_url: get("AI_BOX_LLM_URL").unwrap_or_else(|| DEFAULT_LLM_URL.into()),

            llm_model_fast: get("AI_BOX_LLM_MODEL_FAST").unwrap_or_else(|| "qwen-turbo".into()),
            llm_model_search: get("AI_BOX_LLM_MODEL_SEARCH").unwrap_or_else(|| "qwen-plus".into()),

            tts_model: get("AI_BOX_TTS_MODEL").unwrap_or_else(|| "cosyvoice-v1".into()),
            tts_voice: get("AI_BOX_TTS_VOICE").unwrap_or_else(|| "longxiaochun".into()),
            tts_sample_rate: parse_u32(get("AI_BOX_TTS_SAMPLE_RATE"), 22050),
            tts_volume: parse_u32(get("AI_BOX_TTS_VOLUME"), 50),

            asr_model: get("AI_BOX_ASR_MODEL")
                .unwrap_or_else(|| "paraformer-realtime-v2".into()),
            asr_sample_rate: parse_u32(get("AI_BOX_ASR_SAMPLE_RATE"), 16000),

            music_dir,

            arecord_device: get("AI_BOX_ARECORD_DEVICE").unwrap_or_else(|| "hw:0,0".into()),
            arecord_channels: parse_u32(get("AI_BOX_ARECORD_CHANNELS"), 10),
            arecord_rate: parse_u32(get("AI_BOX_ARECORD_RATE"), 16000),
            arecord_period_size: parse_u32(get("AI_BOX_ARECORD_PERIOD_SIZE"), 256),
            arecord_buffer_size: parse_u32(get("AI_BOX_ARECORD_BUFFER_SIZE"), 16384),

            wake_idle_timeout,
            wake_ack_text: get("AI_BOX_WAKE_ACK_TEXT").unwrap_or_else(|| "我在".into()),
            wake_words,

            vad_mode: parse_vad_mode(get("AI_BOX_VAD_MODE")),
            speech_trigger_frames: parse_u32(get("AI_BOX_SPEECH_TRIGGER_FRAMES"), 10),
            silence_close_frames: parse_u32(get("AI_BOX_SILENCE_CLOSE_FRAMES"), 10),

            home_dir,
        })
    }
}

/// Parse `KEY=VALUE` lines. `#` comments and blank lines are skipped;
/// whitespace around keys and values is trimmed.
fn parse_env_lines(contents: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                vars.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
    vars
}

/// Parse a duration with an optional `ms`/`s`/`m`/`h` suffix.
/// A bare number means seconds.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (digits, scale) = if let Some(d) = raw.strip_suffix("ms") {
        (d, Duration::from_millis(1))
    } else if let Some(d) = raw.strip_suffix('s') {
        (d, Duration::from_secs(1))
    } else if let Some(d) = raw.strip_suffix('m') {
        (d, Duration::from_secs(60))
    } else if let Some(d) = raw.strip_suffix('h') {
        (d, Duration::from_secs(3600))
    } else {
        (raw, Duration::from_secs(1))
    };
    let n: u64 = digits.trim().parse().ok()?;
    Some(scale * n as u32)
}

/// Split wake words on half- or full-width commas.
fn parse_wake_words(raw: &str) -> Vec<String> {
    raw.split([',', '，'])
        .map(|w| w.trim().to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

fn parse_u32(raw: Option<String>, default: u32) -> u32 {
    raw.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// WebRTC VAD aggressiveness, clamped to the library's 0..=3 range.
fn parse_vad_mode(raw: Option<String>) -> i32 {
    raw.and_then(|v| v.parse::<i32>().ok())
        .map(|n| n.clamp(0, 3))
        .unwrap_or(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_lines() {
        let vars = parse_env_lines(
            "# comment\n\
             AI_BOX_TTS_VOICE = longxiaochun\n\
             \n\
             AI_BOX_TTS_VOLUME=80\n\
             not_a_pair\n",
        );
        assert_eq!(vars.get("AI_BOX_TTS_VOICE").map(String::as_str), Some("longxiaochun"));
        assert_eq!(vars.get("AI_BOX_TTS_VOLUME").map(String::as_str), Some("80"));
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn test_parse_duration_suffixes() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("45s"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("abc"), None);
    }

    #[test]
    fn test_parse_wake_words_both_commas() {
        assert_eq!(
            parse_wake_words("你好小瑞，小瑞同学, hey box"),
            vec!["你好小瑞", "小瑞同学", "hey box"]
        );
        assert!(parse_wake_words(" ,，").is_empty());
    }

    #[test]
    fn test_vad_mode_clamped() {
        assert_eq!(parse_vad_mode(Some("2".into())), 2);
        assert_eq!(parse_vad_mode(Some("9".into())), 3);
        assert_eq!(parse_vad_mode(Some("-1".into())), 0);
        assert_eq!(parse_vad_mode(None), 3);
    }
}
