//! Acoustic echo cancellation via the vendor `libluxaudio.so` blob.
//!
//! The library beamforms the 8-mic array against the loopback reference
//! channel and emits one cleaned 256-sample frame plus a direction of
//! arrival. It exposes a global `adsp_srv` descriptor whose internal
//! float buffer doubles as the exchange area: we de-interleave the raw
//! int16 capture into it planar, run the algorithm in place, and read
//! the cleaned channel back out of plane 0.
//!
//! When the library is absent the processor reports unavailable and the
//! capture loop falls back to the first raw mic channel.

use std::os::raw::{c_int, c_uint, c_void};
use std::path::PathBuf;

use libloading::Library;
use tracing::{info, warn};

/// Samples per channel per frame.
pub const FRAME_SIZE: usize = 256;
/// Microphone channels in the capture stream.
pub const MIC_CHANNELS: usize = 8;
/// Loopback reference channels.
pub const REF_CHANNELS: usize = 1;
/// Total interleaved channels delivered by the capture device
/// (8 mic + 1 reference + 1 padding).
pub const INPUT_CHANNELS: usize = 10;
/// Interleaved int16 samples per raw frame.
pub const INPUT_SAMPLES: usize = FRAME_SIZE * INPUT_CHANNELS;

/// Mirror of the vendor library's `adsp_srv` descriptor.
#[repr(C)]
struct ObjDiosSsp {
    ptr_algo: *mut c_void,
    ptr_mic_buf: *mut f32,
    cfg_mic_num: f32,
    cfg_ref_num: f32,
    frame_size: c_int,
    frame_counter: c_uint,
    frame_time_age: f64,
}

type AlgoInitFn = unsafe extern "C" fn(c_int, c_int, c_int) -> *mut c_void;
type AlgoProcessFn = unsafe extern "C" fn(*mut c_void, *mut f32, *mut c_int) -> c_int;

pub struct AecProcessor {
    lib: Option<Library>,
}

// The capture loop is the only caller; the raw pointers inside the
// vendor library are never touched from another thread.
unsafe impl Send for AecProcessor {}

impl AecProcessor {
    /// Try to load and initialize the vendor library. Absence is not an
    /// error — the processor comes up in pass-through mode.
    pub fn load(home_dir: Option<&PathBuf>) -> Self {
        let Some(path) = find_library(home_dir, "libluxaudio.so") else {
            warn!("libluxaudio.so not found; echo cancellation disabled, passing mic 0 through");
            return Self { lib: None };
        };

        // Safety: we trust the vendor blob's documented ABI.
        let lib = match unsafe { Library::new(&path) } {
            Ok(lib) => lib,
            Err(e) => {
                warn!("failed to load {}: {e}; echo cancellation disabled", path.display());
                return Self { lib: None };
            }
        };

        let init_ok = unsafe {
            match lib.get::<AlgoInitFn>(b"luxnj_algo_init") {
                Ok(init) => {
                    init(MIC_CHANNELS as c_int, REF_CHANNELS as c_int, FRAME_SIZE as c_int);
                    true
                }
                Err(e) => {
                    warn!("luxnj_algo_init missing in {}: {e}", path.display());
                    false
                }
            }
        };
        if !init_ok {
            return Self { lib: None };
        }

        info!("echo cancellation initialized from {}", path.display());
        Self { lib: Some(lib) }
    }

    /// Run one interleaved raw frame through the canceller.
    ///
    /// Returns the cleaned mono frame and the direction-of-arrival
    /// estimate, or `None` when the library is unavailable, the frame is
    /// malformed, or the algorithm rejects it.
    pub fn process(&mut self, raw: &[i16]) -> Option<(Vec<i16>, i32)> {
        let lib = self.lib.as_ref()?;
        if raw.len() != INPUT_SAMPLES {
            return None;
        }

        // Safety: symbol signatures and the descriptor layout follow the
        // vendor header; all pointers are null-checked before use.
        unsafe {
            // `adsp_srv` is the descriptor struct itself, so the symbol
            // address is the struct address.
            let adsp = match lib.get::<*mut ObjDiosSsp>(b"adsp_srv") {
                Ok(sym) => *sym,
                Err(_) => return None,
            };
            if adsp.is_null() {
                return None;
            }
            let frame_size = (*adsp).frame_size as usize;
            let mic_buf = (*adsp).ptr_mic_buf;
            if mic_buf.is_null() || frame_size != FRAME_SIZE {
                return None;
            }

            // Interleaved int16 -> planar float, mic channels then reference.
            for i in 0..frame_size {
                let base = i * INPUT_CHANNELS;
                for ch in 0..(MIC_CHANNELS + REF_CHANNELS) {
                    *mic_buf.add(ch * frame_size + i) = f32::from(raw[base + ch]);
                }
            }

            let process = lib.get::<AlgoProcessFn>(b"luxnj_algo_process").ok()?;
            let mut doa: c_int = 0;
            if process((*adsp).ptr_algo, mic_buf, &mut doa) == -1 {
                return None;
            }

            let mut clean = Vec::with_capacity(frame_size);
            for i in 0..frame_size {
                let v = (*mic_buf.add(i)).clamp(-32768.0, 32767.0);
                clean.push(v as i16);
            }
            Some((clean, doa))
        }
    }
}

/// Search `AI_BOX_HOME` then the working directory for a native library.
pub fn find_library(home_dir: Option<&PathBuf>, name: &str) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = home_dir {
        candidates.push(home.join(name));
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join(name));
    }
    candidates.into_iter().find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_processor_passes_nothing() {
        let mut aec = AecProcessor { lib: None };
        let raw = vec![0i16; INPUT_SAMPLES];
        assert!(aec.process(&raw).is_none());
    }

    #[test]
    fn test_frame_geometry() {
        assert_eq!(INPUT_SAMPLES, 2560);
        assert_eq!(INPUT_SAMPLES * 2, 5120);
    }
}
