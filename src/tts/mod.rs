//! Speech synthesis over the DashScope duplex WebSocket.
//!
//! Single consumer of the text-chunk queue. At most one upstream stream
//! exists at a time, bound to the session that opened it: a session
//! change or cancellation tears the stream down before anything else is
//! sent. Binary frames from the receiver land on the PCM queue for the
//! audio sink; the empty-blob sentinel that releases the floor is pushed
//! when the receiver winds down uncancelled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::header::AUTHORIZATION;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state::{Session, SharedState, END_OF_TURN};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// How long to wait for the service to acknowledge a new task.
const TASK_STARTED_TIMEOUT: Duration = Duration::from_secs(5);
/// Pacing between outgoing text frames.
const SEND_PACING: Duration = Duration::from_millis(50);

pub async fn tts_manager_loop(state: Arc<SharedState>) {
    let mut stream: Option<SynthStream> = None;
    let mut bound_session: Option<String> = None;

    loop {
        let msg = tokio::select! {
            _ = state.shutdown.cancelled() => {
                if let Some(s) = stream.take() {
                    s.close().await;
                }
                return;
            }
            msg = state.tts_text_queue.pop() => msg,
        };

        let session = state.session();

        // Rebind on session change: the old stream belongs to a
        // cancelled turn and must not receive another frame.
        if bound_session.as_deref() != Some(session.id.as_str()) {
            if let Some(s) = stream.take() {
                s.close().await;
            }
            bound_session = Some(session.id.clone());
        }

        if session.cancel.is_cancelled() {
            if let Some(s) = stream.take() {
                s.close().await;
            }
            continue;
        }

        if msg == END_OF_TURN {
            if let Some(s) = stream.take() {
                s.finish().await;
            }
            continue;
        }
        if msg.trim().is_empty() {
            continue;
        }

        if stream.is_none() {
            match SynthStream::open(&state, &session).await {
                Ok(s) => stream = Some(s),
                Err(e) => {
                    warn!("failed to open synthesis stream: {e:#}");
                    continue;
                }
            }
        }
        if let Some(s) = stream.as_mut() {
            if let Err(e) = s.send_text(&msg).await {
                warn!("synthesis send failed: {e:#}");
                if let Some(s) = stream.take() {
                    s.close().await;
                }
                continue;
            }
            tokio::time::sleep(SEND_PACING).await;
        }
    }
}

/// One upstream synthesis task: the writer half plus the receiver task
/// pumping audio into the PCM queue.
struct SynthStream {
    writer: WsWriter,
    task_id: String,
    receiver: JoinHandle<()>,
}

impl SynthStream {
    /// Connect, announce the task and wait for `task-started`.
    async fn open(state: &Arc<SharedState>, session: &Session) -> anyhow::Result<Self> {
        let config = &state.config;
        let mut request = config
            .tts_ws_url
            .as_str()
            .into_client_request()
            .context("invalid synthesis endpoint")?;
        request.headers_mut().insert(
            AUTHORIZATION,
            format!("Bearer {}", config.api_key)
                .parse()
                .context("api key is not a valid header value")?,
        );
        let (ws, _) = connect_async(request)
            .await
            .context("synthesis connect failed")?;
        let (mut writer, reader) = ws.split();

        let task_id = Uuid::new_v4().simple().to_string();
        let (started_tx, started_rx) = oneshot::channel();
        let receiver = tokio::spawn(receive_loop(
            reader,
            state.clone(),
            session.cancel.clone(),
            started_tx,
            Instant::now(),
        ));

        let run_task = json!({
            "header": {"task_id": task_id, "action": "run-task", "streaming": "duplex"},
            "payload": {
                "task_group": "audio",
                "task": "tts",
                "function": "SpeechSynthesizer",
                "model": config.tts_model,
                "parameters": {
                    "text_type": "PlainText",
                    "voice": config.tts_voice,
                    "format": "pcm",
                    "sample_rate": config.tts_sample_rate,
                    "volume": config.tts_volume,
                    "enable_ssml": false,
                },
                "input": {},
            },
        });
        writer.send(Message::Text(run_task.to_string())).await?;

        let mut stream = Self {
            writer,
            task_id,
            receiver,
        };
        match tokio::time::timeout(TASK_STARTED_TIMEOUT, started_rx).await {
            Ok(Ok(())) => {}
            _ => {
                stream.close().await;
                anyhow::bail!("synthesis task was not acknowledged in time");
            }
        }
        tokio::time::sleep(SEND_PACING).await;
        Ok(stream)
    }

    /// Feed one text chunk into the open task.
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        let frame = json!({
            "header": {"task_id": self.task_id, "action": "continue-task", "streaming": "duplex"},
            "payload": {"input": {"text": text}},
        });
        self.writer.send(Message::Text(frame.to_string())).await?;
        Ok(())
    }

    /// End of turn: tell the service no more text is coming, then let
    /// the receiver drain the remaining audio.
    async fn finish(mut self) {
        let frame = json!({
            "header": {"task_id": self.task_id, "action": "finish-task", "streaming": "duplex"},
            "payload": {"input": {}},
        });
        if let Err(e) = self.writer.send(Message::Text(frame.to_string())).await {
            debug!("finish-task send failed: {e}");
        }
        if tokio::time::timeout(TASK_STARTED_TIMEOUT, &mut self.receiver)
            .await
            .is_err()
        {
            self.receiver.abort();
        }
        let _ = self.writer.close().await;
    }

    /// Immediate teardown on rebind or cancellation.
    async fn close(mut self) {
        let _ = self.writer.close().await;
        if tokio::time::timeout(Duration::from_millis(500), &mut self.receiver)
            .await
            .is_err()
        {
            self.receiver.abort();
        }
    }
}

/// Pump incoming frames: binary audio to the PCM queue, text frames for
/// task lifecycle. Pushes the end-of-stream sentinel on the way out so
/// the sink releases the floor — unless the session was cancelled, in
/// which case the stop primitive already cleared the pipeline.
async fn receive_loop(
    mut reader: WsReader,
    state: Arc<SharedState>,
    cancel: CancellationToken,
    started_tx: oneshot::Sender<()>,
    synth_start: Instant,
) {
    let mut started_tx = Some(started_tx);
    let mut first_audio = false;
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = reader.next() => msg,
        };
        let Some(Ok(msg)) = msg else {
            break;
        };
        match msg {
            Message::Binary(audio) => {
                if !first_audio {
                    first_audio = true;
                    info!(latency = ?synth_start.elapsed(), "first synthesized audio packet");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = state.audio_pcm_queue.push(audio) => {}
                }
            }
            Message::Text(payload) => {
                let Ok(frame) = serde_json::from_str::<serde_json::Value>(&payload) else {
                    continue;
                };
                match frame["header"]["event"].as_str() {
                    Some("task-started") => {
                        if let Some(tx) = started_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    Some("task-finished") => break,
                    Some("task-failed") => {
                        warn!(
                            "synthesis task failed: {}",
                            frame["header"]["error_message"].as_str().unwrap_or("unknown")
                        );
                        break;
                    }
                    _ => {}
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    if !cancel.is_cancelled() {
        state.audio_pcm_queue.push(Vec::new()).await;
    }
}
