//! Local music playback with a smooth ducking envelope.
//!
//! Plays 16 kHz mono PCM WAV files from the configured directory through
//! an `aplay` child. A dedicated streaming thread feeds the child in
//! 40 ms chunks, applying a one-pole gain envelope and keeping the
//! kernel pipe shallow so duck and stop stay audibly responsive.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::{info, warn};

/// Playback sample rate of the library files.
const SAMPLE_RATE: usize = 16000;
/// Streaming chunk: 40 ms of audio.
const CHUNK_SAMPLES: usize = 640;
/// Resume writing when buffered audio falls to this far ahead of the
/// wall clock.
const TARGET_AHEAD: f64 = 0.12;
/// Stop writing once buffered audio runs this far ahead; bounds the
/// pipe depth so gain changes reach the speaker quickly.
const MAX_AHEAD: f64 = 0.18;
/// Gain target while the user is speaking.
const DUCK_TARGET: f32 = 0.2;
/// Ceiling forced onto the current gain at duck time, so the drop is
/// immediately perceptible before the envelope takes over.
const DUCK_SNAP: f32 = 0.35;
/// Envelope time constants: fast attack when ducking, slow release.
const TAU_DOWN: f64 = 0.12;
const TAU_UP: f64 = 0.9;

struct Slot {
    playing: bool,
    child: Option<Child>,
    stop: Arc<AtomicBool>,
    /// Increments per playback so a finishing thread can tell whether
    /// the slot still belongs to it.
    epoch: u64,
}

struct Envelope {
    target: f32,
    current: f32,
}

pub struct MusicManager {
    music_dir: PathBuf,
    slot: Arc<Mutex<Slot>>,
    vol: Arc<Mutex<Envelope>>,
}

impl MusicManager {
    pub fn new(music_dir: PathBuf) -> Self {
        Self {
            music_dir,
            slot: Arc::new(Mutex::new(Slot {
                playing: false,
                child: None,
                stop: Arc::new(AtomicBool::new(false)),
                epoch: 0,
            })),
            vol: Arc::new(Mutex::new(Envelope {
                target: 1.0,
                current: 1.0,
            })),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.slot.lock().unwrap().playing
    }

    /// Pull the gain down for barge-in.
    pub fn duck(&self) {
        if !self.is_playing() {
            return;
        }
        let mut vol = self.vol.lock().unwrap();
        vol.target = DUCK_TARGET;
        if vol.current > DUCK_SNAP {
            vol.current = DUCK_SNAP;
        }
    }

    /// Let the gain ramp back to full.
    pub fn unduck(&self) {
        if !self.is_playing() {
            return;
        }
        self.vol.lock().unwrap().target = 1.0;
    }

    /// Kill the current playback, if any. Safe to call repeatedly.
    pub fn stop(&self) {
        let mut slot = self.slot.lock().unwrap();
        if !slot.playing {
            return;
        }
        info!("stopping music playback");
        slot.stop.store(true, Ordering::SeqCst);
        if let Some(mut child) = slot.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        slot.playing = false;
    }

    /// Pick a track and play it. `"RANDOM"` selects uniformly from the
    /// library; anything else is a case-insensitive filename substring
    /// match. Returns false when nothing matches.
    pub async fn search_and_play(&self, query: &str) -> bool {
        let candidates = match self.list_tracks() {
            Ok(c) if !c.is_empty() => c,
            Ok(_) => {
                warn!("no wav files in {}", self.music_dir.display());
                return false;
            }
            Err(e) => {
                warn!("cannot list {}: {e}", self.music_dir.display());
                return false;
            }
        };

        let target = if query == "RANDOM" {
            candidates.choose(&mut rand::thread_rng()).cloned()
        } else {
            let q = query.to_lowercase();
            candidates
                .iter()
                .find(|p| file_name_lower(p).contains(&q))
                .cloned()
        };
        let Some(target) = target else {
            info!(query, "no matching track");
            return false;
        };

        self.stop();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // A matched query counts as handled even if the launch fails;
        // play_file logs its own failures.
        self.play_file(&target);
        true
    }

    fn list_tracks(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut tracks = Vec::new();
        for entry in std::fs::read_dir(&self.music_dir)? {
            let path = entry?.path();
            if file_name_lower(&path).ends_with(".wav") {
                tracks.push(path);
            }
        }
        Ok(tracks)
    }

    /// Launch playback of one file. The 44-byte WAV header is skipped;
    /// the rest streams as raw S16_LE. Launch failures are logged and
    /// leave the manager idle.
    fn play_file(&self, path: &Path) {
        let mut slot = self.slot.lock().unwrap();

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!("cannot open {}: {e}", path.display());
                return;
            }
        };

        let mut child = match Command::new("aplay")
            .args([
                "-D", "default", "-q", "-t", "raw", "-r", "16000", "-c", "1", "-f", "S16_LE",
                "-B", "80000",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to launch music playback child: {e}");
                return;
            }
        };
        let Some(stdin) = child.stdin.take() else {
            let _ = child.kill();
            warn!("music playback child has no stdin");
            return;
        };

        let stop = Arc::new(AtomicBool::new(false));
        slot.child = Some(child);
        slot.stop = stop.clone();
        slot.playing = true;
        slot.epoch += 1;
        let epoch = slot.epoch;
        {
            let mut vol = self.vol.lock().unwrap();
            vol.target = 1.0;
            vol.current = 1.0;
        }
        info!("playing {}", path.display());

        let thread_slot = self.slot.clone();
        let thread_vol = self.vol.clone();
        std::thread::spawn(move || stream_file(thread_slot, thread_vol, file, stdin, stop, epoch));
    }
}

/// Streaming thread body: gain envelope + wall-clock pacing.
fn stream_file(
    slot: Arc<Mutex<Slot>>,
    vol: Arc<Mutex<Envelope>>,
    mut file: File,
    mut stdin: ChildStdin,
    stop: Arc<AtomicBool>,
    epoch: u64,
) {
    let _ = file.seek(SeekFrom::Start(44));

    let mut buf = vec![0u8; CHUNK_SAMPLES * 2];
    let mut start_wall: Option<Instant> = None;
    let mut last_step: Option<Instant> = None;
    let mut wrote_samples: u64 = 0;

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let n = match file.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n & !1, // whole samples only
        };
        if n == 0 {
            break;
        }

        let now = Instant::now();
        if start_wall.is_none() {
            start_wall = Some(now);
        }
        let dt = last_step
            .map(|t| now.duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        last_step = Some(now);

        let gain = step_envelope(&vol, dt);
        let mut chunk = Vec::with_capacity(n);
        for bytes in buf[..n].chunks_exact(2) {
            let sample = i16::from_le_bytes([bytes[0], bytes[1]]);
            let scaled =
                (f32::from(sample) * gain).clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
            chunk.extend_from_slice(&scaled.to_le_bytes());
        }
        if stdin.write_all(&chunk).is_err() {
            break;
        }
        let _ = stdin.flush();

        wrote_samples += (n / 2) as u64;
        let audio_dur = wrote_samples as f64 / SAMPLE_RATE as f64;
        if let Some(start) = start_wall {
            let ahead = audio_dur - start.elapsed().as_secs_f64();
            if ahead > MAX_AHEAD {
                std::thread::sleep(Duration::from_secs_f64(ahead - TARGET_AHEAD));
            }
        }
    }
    drop(stdin);

    // Natural end of file: release the slot unless a newer playback
    // already took it over.
    let mut slot = slot.lock().unwrap();
    if slot.playing && slot.epoch == epoch {
        slot.playing = false;
        if let Some(mut child) = slot.child.take() {
            let _ = child.wait();
        }
    }
}

/// One-pole envelope update; returns the gain to apply to the next
/// chunk. `dt == 0` (first chunk) snaps straight to the target.
fn step_envelope(vol: &Mutex<Envelope>, dt: f64) -> f32 {
    let mut vol = vol.lock().unwrap();
    let target = vol.target.clamp(0.0, 1.0);
    let mut current = vol.current.clamp(0.0, 1.0);
    if dt == 0.0 {
        current = target;
    } else if (current - target).abs() > f32::EPSILON {
        let tau = if target < current { TAU_DOWN } else { TAU_UP };
        let alpha = 1.0 - (-dt / tau).exp();
        current += (target - current) * alpha as f32;
    }
    vol.current = current;
    current
}

fn file_name_lower(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}
