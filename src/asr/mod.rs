//! Streaming speech recognition over the DashScope duplex WebSocket.
//!
//! One task per utterance: open the socket, announce the task, stream
//! the PCM in paced binary frames, close the task, and keep the last
//! non-empty sentence the service produced. Any failure collapses to an
//! empty transcript — the user simply speaks again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use http::header::AUTHORIZATION;
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::intent;
use crate::state::SharedState;

/// Utterances below this length (0.5 s at 16 kHz) are discarded before
/// recognition.
const MIN_RECOGNIZE_SAMPLES: usize = 8000;
/// Binary frame size sent upstream.
const PCM_FRAME_BYTES: usize = 3200;
/// Pause between binary frames.
const PCM_FRAME_PACING: Duration = Duration::from_millis(5);
/// Socket connect deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-utterance worker: recognize, then hand the transcript to the
/// intent router.
pub async fn recognize_and_route(state: Arc<SharedState>, pcm: Vec<i16>) {
    if state.shutdown.is_cancelled() {
        return;
    }
    if pcm.len() < MIN_RECOGNIZE_SAMPLES {
        return;
    }

    let mut bytes = Vec::with_capacity(pcm.len() * 2);
    for sample in &pcm {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }

    let text = match recognize(&state.config, &bytes).await {
        Ok(text) => text,
        Err(e) => {
            warn!("recognition failed: {e:#}");
            String::new()
        }
    };
    if text.is_empty() {
        state.music.unduck();
        return;
    }

    intent::route_transcript(state, text).await;
}

/// Run one PCM blob through the recognition endpoint and return the last
/// non-empty sentence, or an empty string when nothing was recognized.
pub async fn recognize(config: &Config, pcm: &[u8]) -> anyhow::Result<String> {
    let mut request = config
        .asr_ws_url
        .as_str()
        .into_client_request()
        .context("invalid recognition endpoint")?;
    request.headers_mut().insert(
        AUTHORIZATION,
        format!("Bearer {}", config.api_key)
            .parse()
            .context("api key is not a valid header value")?,
    );

    let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
        .await
        .context("recognition connect timed out")?
        .context("recognition connect failed")?;
    let (mut writer, mut reader) = ws.split();

    let task_id = Uuid::new_v4().simple().to_string();
    let run_task = json!({
        "header": {"task_id": task_id, "action": "run-task", "streaming": "duplex"},
        "payload": {
            "task_group": "audio",
            "task": "asr",
            "function": "recognition",
            "model": config.asr_model,
            "parameters": {"format": "pcm", "sample_rate": config.asr_sample_rate},
            "input": {},
        },
    });
    writer.send(Message::Text(run_task.to_string())).await?;

    for frame in pcm.chunks(PCM_FRAME_BYTES) {
        writer.send(Message::Binary(frame.to_vec())).await?;
        tokio::time::sleep(PCM_FRAME_PACING).await;
    }

    let finish_task = json!({
        "header": {"task_id": task_id, "action": "finish-task"},
        "payload": {"input": {}},
    });
    writer.send(Message::Text(finish_task.to_string())).await?;

    let mut sentence = String::new();
    while let Some(msg) = reader.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!("recognition socket closed: {e}");
                break;
            }
        };
        let payload = match msg {
            Message::Text(payload) => payload,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<serde_json::Value>(&payload) else {
            continue;
        };
        match frame["header"]["event"].as_str() {
            Some("result-generated") => {
                if let Some(text) = frame["payload"]["output"]["sentence"]["text"].as_str() {
                    if !text.is_empty() {
                        sentence = text.to_string();
                    }
                }
            }
            Some("task-finished") => break,
            Some("task-failed") => {
                warn!(
                    "recognition task failed: {}",
                    frame["header"]["error_message"].as_str().unwrap_or("unknown")
                );
                break;
            }
            _ => {}
        }
    }
    let _ = writer.close().await;

    Ok(sentence)
}
