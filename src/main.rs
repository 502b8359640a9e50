//! aibox — voice assistant control core for the RK3308 smart speaker.
//!
//! Wires the capture pipeline, the cloud ASR/LLM/TTS streams, local
//! music playback and the wake automaton together, then waits for an
//! exit command or SIGINT.

mod aec;
mod asr;
mod audio;
mod config;
mod control;
mod intent;
mod llm;
mod mixer;
mod music;
mod queue;
mod state;
mod tts;
mod vad;
mod wake;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::Config;
use state::SharedState;

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    // Log to a file under AI_BOX_HOME when it is writable, stderr
    // otherwise. The non-blocking guard must outlive the program.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _guard: Option<tracing_appender::non_blocking::WorkerGuard>;
    let file_dir = config
        .home_dir
        .clone()
        .filter(|dir| std::fs::create_dir_all(dir).is_ok());
    if let Some(dir) = file_dir {
        let file_appender = tracing_appender::rolling::never(&dir, "aibox.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _guard = Some(guard);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .init();
    } else {
        _guard = None;
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("aibox voice core starting");

    // The segmenter cannot run without the speech detector.
    let vad_engine = match vad::WebRtcVad::load(config.home_dir.as_ref(), config.vad_mode) {
        Ok(vad) => vad,
        Err(e) => {
            error!("voice activity detection unavailable: {e:#}");
            std::process::exit(1);
        }
    };
    // Echo cancellation degrades to mic pass-through when absent.
    let aec_engine = aec::AecProcessor::load(config.home_dir.as_ref());

    let state = SharedState::new(config);
    info!("starting asleep; say the wake word to begin");

    tokio::spawn(audio::sink::audio_sink_loop(state.clone()));
    tokio::spawn(tts::tts_manager_loop(state.clone()));
    tokio::spawn(wake::idle_monitor(state.clone()));

    let capture_state = state.clone();
    tokio::spawn(async move {
        // A capture child that dies mid-run only ends this loop; failing
        // to launch it at all means the device cannot hear and is fatal.
        if let Err(e) = audio::capture::capture_loop(capture_state, aec_engine, vad_engine).await {
            error!("capture pipeline failed to start: {e:#}");
            std::process::exit(1);
        }
    });

    tokio::select! {
        _ = state.shutdown.cancelled() => {
            info!("exit command received, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, cleaning up");
            control::perform_stop(&state).await;
        }
    }
}
