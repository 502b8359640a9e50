//! Microphone capture and the per-frame processing loop.
//!
//! Drives an `arecord` child producing raw interleaved S16_LE frames,
//! pushes each frame through the echo canceller (or the first-mic
//! fallback), repacks the cleaned stream into 20 ms VAD frames and feeds
//! the segmenter. Dispatched utterances each get their own recognition
//! task so the loop never blocks on the network.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::segment::{SegmentEvent, Segmenter, VAD_FRAME_SAMPLES};
use crate::aec::{AecProcessor, FRAME_SIZE, INPUT_CHANNELS, INPUT_SAMPLES};
use crate::asr;
use crate::state::SharedState;
use crate::vad::WebRtcVad;

/// Run the capture loop until the capture child exits or shutdown is
/// requested. A dead capture pipeline is terminal for this loop only;
/// the rest of the orchestrator stays up.
pub async fn capture_loop(
    state: Arc<SharedState>,
    mut aec: AecProcessor,
    mut vad: WebRtcVad,
) -> anyhow::Result<()> {
    let cfg = &state.config;
    let mut child = Command::new("arecord")
        .args([
            "-D",
            &cfg.arecord_device,
            "-c",
            &cfg.arecord_channels.to_string(),
            "-r",
            &cfg.arecord_rate.to_string(),
            "-f",
            "S16_LE",
            "-t",
            "raw",
            &format!("--period-size={}", cfg.arecord_period_size),
            &format!("--buffer-size={}", cfg.arecord_buffer_size),
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to launch arecord")?;
    let mut stdout = child
        .stdout
        .take()
        .context("arecord stdout not captured")?;
    info!("microphone capture started");

    let frame_bytes = INPUT_SAMPLES * 2;
    let mut raw_bytes = vec![0u8; frame_bytes];
    let mut raw = vec![0i16; INPUT_SAMPLES];
    let mut vad_acc: Vec<i16> = Vec::new();
    let mut segmenter = Segmenter::new(cfg.speech_trigger_frames, cfg.silence_close_frames);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            read = stdout.read_exact(&mut raw_bytes) => {
                if read.is_err() {
                    warn!("capture stream ended");
                    break;
                }
            }
        }

        for (sample, bytes) in raw.iter_mut().zip(raw_bytes.chunks_exact(2)) {
            *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
        }

        match aec.process(&raw) {
            Some((clean, _doa)) => vad_acc.extend_from_slice(&clean),
            None => {
                // Degraded mode: take the first mic channel as-is.
                vad_acc.extend((0..FRAME_SIZE).map(|i| raw[i * INPUT_CHANNELS]));
            }
        }

        while vad_acc.len() >= VAD_FRAME_SAMPLES {
            let frame: Vec<i16> = vad_acc.drain(..VAD_FRAME_SAMPLES).collect();
            let is_speech = vad.is_speech(&frame);
            for event in segmenter.push(&frame, is_speech) {
                match event {
                    SegmentEvent::Duck => state.music.duck(),
                    SegmentEvent::TooShort => state.music.unduck(),
                    SegmentEvent::Dispatch(pcm) => {
                        debug!(samples = pcm.len(), "utterance closed, dispatching");
                        tokio::spawn(asr::recognize_and_route(state.clone(), pcm));
                    }
                }
            }
        }
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
    Ok(())
}
