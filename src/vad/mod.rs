//! Voice activity detection via `libwebrtcvad.so`.
//!
//! Binary speech classifier over 20 ms frames (320 samples at 16 kHz).
//! Unlike the echo canceller, the segmenter cannot function without it,
//! so a missing library is a startup error.

use std::os::raw::{c_int, c_void};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use libloading::Library;
use tracing::info;

use crate::aec::find_library;

/// Sample rate the detector is initialized for.
const SAMPLE_RATE: c_int = 16000;

type CreateFn = unsafe extern "C" fn(*mut *mut c_void) -> c_int;
type InitFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type SetModeFn = unsafe extern "C" fn(*mut c_void, c_int) -> c_int;
type ProcessFn = unsafe extern "C" fn(*mut c_void, c_int, *const i16, c_int) -> c_int;

pub struct WebRtcVad {
    lib: Library,
    inst: *mut c_void,
}

// The capture loop is the sole user; the detector instance never crosses
// threads after construction.
unsafe impl Send for WebRtcVad {}

impl WebRtcVad {
    /// Load the library, create a detector instance and set its
    /// aggressiveness mode (0..=3).
    pub fn load(home_dir: Option<&PathBuf>, mode: i32) -> anyhow::Result<Self> {
        let path = find_library(home_dir, "libwebrtcvad.so").ok_or_else(|| {
            anyhow!("libwebrtcvad.so not found in AI_BOX_HOME or the working directory")
        })?;

        // Safety: symbol signatures follow the WebRTC VAD C API.
        unsafe {
            let lib = Library::new(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;

            let mut inst: *mut c_void = std::ptr::null_mut();
            {
                let create = lib.get::<CreateFn>(b"WebRtcVad_Create")?;
                if create(&mut inst) != 0 || inst.is_null() {
                    bail!("WebRtcVad_Create failed");
                }
                let init = lib.get::<InitFn>(b"WebRtcVad_Init")?;
                if init(inst) != 0 {
                    bail!("WebRtcVad_Init failed");
                }
                let set_mode = lib.get::<SetModeFn>(b"WebRtcVad_set_mode")?;
                set_mode(inst, mode.clamp(0, 3) as c_int);
            }

            info!(mode, "WebRTC VAD initialized from {}", path.display());
            Ok(Self { lib, inst })
        }
    }

    /// Classify one 20 ms frame. Returns `false` for empty input or on
    /// library error.
    pub fn is_speech(&mut self, frame: &[i16]) -> bool {
        if frame.is_empty() {
            return false;
        }
        // Safety: `inst` stays valid for the lifetime of `lib`.
        unsafe {
            match self.lib.get::<ProcessFn>(b"WebRtcVad_Process") {
                Ok(process) => {
                    process(self.inst, SAMPLE_RATE, frame.as_ptr(), frame.len() as c_int) == 1
                }
                Err(_) => false,
            }
        }
    }
}
