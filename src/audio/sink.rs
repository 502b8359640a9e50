//! Local playback of synthesized speech.
//!
//! Sole consumer of the PCM queue. Keeps one `aplay` child alive for the
//! duration of a reply and writes every blob into its stdin. An empty
//! blob marks end-of-stream: after a settling delay the pipe is closed
//! and a reaper clears the player slot once the child has drained, so
//! the speaking floor is only released when the last samples have
//! actually left the speaker.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{info, warn};

use crate::state::SharedState;

/// Settle time between the end-of-stream marker and closing the pipe.
const DRAIN_SETTLE: Duration = Duration::from_millis(500);

pub async fn audio_sink_loop(state: Arc<SharedState>) {
    loop {
        let pcm = tokio::select! {
            _ = state.shutdown.cancelled() => return,
            blob = state.audio_pcm_queue.pop() => blob,
        };

        if pcm.is_empty() {
            finish_playback(&state).await;
            continue;
        }

        let mut slot = state.player.lock().await;
        if slot.stdin.is_none() {
            match spawn_player(&state) {
                Ok((child, stdin)) => {
                    slot.proc = Some(child);
                    slot.stdin = Some(stdin);
                }
                Err(e) => {
                    warn!("failed to launch playback child: {e:#}");
                    continue;
                }
            }
        }
        if let Some(stdin) = slot.stdin.as_mut() {
            if let Err(e) = stdin.write_all(&pcm).await {
                warn!("playback pipe write failed: {e}");
                slot.stdin = None;
                slot.proc = None;
            }
        }
    }
}

fn spawn_player(state: &SharedState) -> anyhow::Result<(Child, ChildStdin)> {
    info!("launching tts playback child");
    let mut child = Command::new("aplay")
        .args([
            "-D",
            "default",
            "-t",
            "raw",
            "-r",
            &state.config.tts_sample_rate.to_string(),
            "-f",
            "S16_LE",
            "-c",
            "1",
            "-B",
            "20000",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to launch aplay")?;
    let stdin = child.stdin.take().context("aplay stdin not captured")?;
    Ok((child, stdin))
}

/// Close the pipe and release the floor once the child finishes playing
/// out its buffer. The child stays in the slot while it drains so busy
/// checks keep reporting true until the audio is really gone.
async fn finish_playback(state: &Arc<SharedState>) {
    tokio::time::sleep(DRAIN_SETTLE).await;
    {
        let mut slot = state.player.lock().await;
        if slot.proc.is_none() {
            slot.stdin = None;
            return;
        }
        slot.stdin = None;
    }

    let state = state.clone();
    tokio::spawn(async move {
        loop {
            {
                let mut slot = state.player.lock().await;
                match slot.proc.as_mut() {
                    None => break,
                    Some(child) => match child.try_wait() {
                        Ok(Some(_)) | Err(_) => {
                            slot.proc = None;
                            slot.stdin = None;
                            info!("tts playback drained, floor released");
                            break;
                        }
                        Ok(None) => {}
                    },
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });
}
