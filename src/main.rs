use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;
use std::io::{Cursor, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use voxturn::audio::capture::{CpalAudioSource, list_devices};
use voxturn::audio::lifecycle::DeviceManager;
use voxturn::audio::source::AudioSource;
use voxturn::audio::wav::{WavAudioSource, encode_wav, probe_duration_secs};
use voxturn::capture::{CaptureEvent, CaptureNotice, CapturedClip};
use voxturn::cli::{Cli, Commands, ConfigAction};
use voxturn::config::Config;
use voxturn::playback::PlaybackEvent;
use voxturn::playback::renderer::RodioRenderer;
use voxturn::session::{
    DuplexSession, SessionHandle, SessionOutput, SessionParts, SessionRunner, SessionSnapshot,
};
use voxturn::timer::TokioScheduler;
use voxturn::transport::{ChannelRecognitionSink, CollectorSink, Outbound, TransportEvent};
use voxturn::{VoxturnError, version_string};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose);

    match cli.command {
        Commands::Listen {
            device,
            wav,
            output,
            silence,
            once,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(device) = device {
                config.capture.device = Some(device);
            }
            if let Some(silence) = silence {
                config.capture.silence_threshold_ms = silence.as_millis() as u64;
            }
            config.validate()?;
            run_listen(config, wav, output, once, cli.quiet, cli.verbose).await?;
        }
        Commands::Play { files, reverse } => {
            let config = load_config(cli.config.as_deref())?;
            config.validate()?;
            run_play(config, files, reverse, cli.quiet).await?;
        }
        Commands::Devices => {
            list_audio_devices()?;
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
    }

    Ok(())
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` wins; otherwise `-q` and `-v` pick the level for this crate.
fn init_tracing(quiet: bool, verbose: u8) {
    let default_directive = match (quiet, verbose) {
        (true, _) => "voxturn=warn",
        (false, 0) => "voxturn=info",
        (false, 1) => "voxturn=debug",
        (false, _) => "voxturn=trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/voxturn/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path)?
    } else {
        Config::load_or_default(&Config::default_path())?
    };

    Ok(config.with_env_overrides())
}

/// Arm the microphone (or a WAV file) and write each utterance to `output`.
async fn run_listen(
    config: Config,
    wav: Option<PathBuf>,
    output: PathBuf,
    once: bool,
    quiet: bool,
    verbose: u8,
) -> Result<()> {
    std::fs::create_dir_all(&output)
        .with_context(|| format!("Failed to create output directory {}", output.display()))?;

    let rate = config.capture.sample_rate;
    let (devices, input_length) = match wav {
        Some(path) => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let length = probe_duration_secs(&bytes).map(Duration::from_secs_f64);
            let devices = DeviceManager::new(Box::new(move || {
                let reader = Box::new(Cursor::new(bytes.clone()));
                Ok(Box::new(WavAudioSource::from_reader(reader, rate)?) as Box<dyn AudioSource>)
            }));
            (devices, length)
        }
        None => {
            let device = config.capture.device.clone();
            let devices = DeviceManager::new(Box::new(move || {
                Ok(Box::new(CpalAudioSource::new(device.as_deref()).with_sample_rate(rate))
                    as Box<dyn AudioSource>)
            }));
            (devices, None)
        }
    };
    let devices = devices.with_analyzer(
        config.capture.analyzer_bands,
        config.capture.analyzer_fft_size,
    );

    let (sink, outbound) = ChannelRecognitionSink::new(config.recognition.streaming);
    let writer = tokio::spawn(write_clips(outbound, output.clone(), rate, quiet));

    let (handle, mut outputs) = start_session(&config, devices, Box::new(sink)).await?;

    if let Err(e) = handle.arm().await {
        eprintln!("{}", format!("Error: {}", e).red());
        handle.shutdown().await?;
        std::process::exit(1);
    }
    if !quiet {
        eprintln!(
            "{} silence {}ms, clips go to {}",
            "Listening:".green(),
            config.capture.silence_threshold_ms,
            output.display()
        );
    }

    // A WAV input ends: give the last utterance time to reach its endpoint.
    let input_done = async {
        match input_length {
            Some(length) => {
                let grace = Duration::from_millis(config.capture.silence_threshold_ms)
                    + Duration::from_secs(1);
                tokio::time::sleep(length + grace).await
            }
            None => std::future::pending().await,
        }
    };
    tokio::pin!(input_done);

    let mut snapshots = handle.subscribe();
    let show_meter = verbose > 0 && !quiet && std::io::stderr().is_terminal();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut input_done => break,
            changed = snapshots.changed(), if show_meter => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                draw_meter(&snapshot);
            }
            output = outputs.recv() => {
                let Some(output) = output else { break };
                let finished = report_output(&output, quiet);
                if finished && once {
                    break;
                }
            }
        }
    }

    if show_meter {
        eprintln!();
    }
    handle.shutdown().await?;
    // The sink is dropped with the session; the writer drains and exits.
    let written = writer.await.context("clip writer failed")??;
    if !quiet {
        eprintln!("{} {} clip(s)", "Done:".green(), written);
    }
    Ok(())
}

/// Play `files` as fragments 1..=n of one stream.
async fn run_play(config: Config, files: Vec<PathBuf>, reverse: bool, quiet: bool) -> Result<()> {
    let mut payloads = Vec::with_capacity(files.len());
    for path in &files {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        payloads.push(bytes);
    }

    // Nothing is captured while playing files.
    let devices = DeviceManager::new(Box::new(|| {
        Err(VoxturnError::DeviceUnavailable {
            message: "capture is not used by play".to_string(),
        })
    }));
    let (handle, mut outputs) =
        start_session(&config, devices, Box::new(CollectorSink::new())).await?;

    let stream_id = "play".to_string();
    handle.transport(TransportEvent::StreamStart {
        stream_id: stream_id.clone(),
    })?;

    let mut order: Vec<(u64, Vec<u8>)> = payloads
        .into_iter()
        .enumerate()
        .map(|(i, payload)| (i as u64 + 1, payload))
        .collect();
    if reverse {
        order.reverse();
    }
    let count = order.len() as u64;
    for (sequence, payload) in order {
        handle.transport(TransportEvent::Fragment {
            stream_id: stream_id.clone(),
            sequence,
            payload,
            duration_hint: None,
            total_fragments: None,
        })?;
    }
    handle.transport(TransportEvent::TotalFragmentCount {
        stream_id: stream_id.clone(),
        count,
    })?;

    let mut failed = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                handle.stop_playback()?;
                break;
            }
            output = outputs.recv() => {
                let Some(output) = output else { break };
                match output {
                    SessionOutput::Playback(PlaybackEvent::FragmentStarted { sequence, .. }) => {
                        if !quiet {
                            eprintln!("{} fragment {}/{}", "Playing:".dimmed(), sequence, count);
                        }
                    }
                    SessionOutput::Playback(PlaybackEvent::StreamComplete { .. }) => break,
                    SessionOutput::Playback(PlaybackEvent::StreamFailed { error, .. }) => {
                        eprintln!("{}", format!("Error: {}", error).red());
                        failed = true;
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    handle.shutdown().await?;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Builds the session with rodio output and spawns its event loop.
async fn start_session(
    config: &Config,
    devices: DeviceManager,
    sink: Box<dyn voxturn::RecognitionSink>,
) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionOutput>)> {
    let (scheduler, timers) = TokioScheduler::new();
    let (outcomes_tx, outcomes) = mpsc::unbounded_channel();
    let bands = config.capture.analyzer_bands;
    let fft_size = config.capture.analyzer_fft_size;
    let stream_renderer = RodioRenderer::spawn_with_analyzer(outcomes_tx.clone(), bands, fft_size)
        .context("Failed to open audio output")?;
    let channel_renderer = RodioRenderer::spawn_with_analyzer(outcomes_tx, bands, fft_size)
        .context("Failed to open audio output")?;

    let parts = SessionParts::new(
        devices,
        Arc::new(scheduler),
        Box::new(stream_renderer),
        Box::new(channel_renderer),
        sink,
    );
    let session = DuplexSession::new(config, parts).context("Invalid configuration")?;
    let (handle, outputs) = SessionRunner::new(session, timers, outcomes).spawn();

    // Running the command is the user gesture that unlocks output.
    handle.unlock_output()?;
    tracing::debug!(version = %version_string(), "session started");
    Ok((handle, outputs))
}

/// Prints a session output. Returns true when a clip was produced.
fn report_output(output: &SessionOutput, quiet: bool) -> bool {
    let SessionOutput::Capture(event) = output else {
        return false;
    };
    match event {
        CaptureEvent::StateChanged { from, to } => {
            tracing::debug!(%from, %to, "capture");
            false
        }
        CaptureEvent::ClipReady(clip) => {
            if !quiet {
                eprintln!(
                    "{} {:.1}s utterance ({:?})",
                    "Clip:".green(),
                    clip.duration.as_secs_f64(),
                    clip.reason
                );
            }
            true
        }
        CaptureEvent::Notice(CaptureNotice::ClipTooShort { recorded }) => {
            if !quiet {
                eprintln!(
                    "{} {}ms, discarded",
                    "Too short:".yellow(),
                    recorded.as_millis()
                );
            }
            false
        }
        CaptureEvent::Notice(CaptureNotice::RecordingDiscarded) => {
            if !quiet {
                eprintln!("{}", "Recording discarded: output started".yellow());
            }
            false
        }
        CaptureEvent::RawSamples(_) => false,
    }
}

fn draw_meter(snapshot: &SessionSnapshot) {
    const WIDTH: usize = 30;
    // While a reply sounds, the bar follows the output.
    let rms = snapshot
        .output_levels
        .as_ref()
        .or(snapshot.input_levels.as_ref())
        .map_or(0.0, |l| l.rms);
    // RMS of speech rarely exceeds 0.3; scale so it fills the bar.
    let filled = ((rms * 3.0).min(1.0) * WIDTH as f32) as usize;
    let bar = format!("{}{}", "#".repeat(filled), " ".repeat(WIDTH - filled));
    let countdown = snapshot
        .remaining
        .map(|r| format!(" {:>5}ms", r.as_millis()))
        .unwrap_or_default();
    let mut stderr = std::io::stderr();
    let _ = write!(
        stderr,
        "\r{:<18} [{}]{:<9}",
        snapshot.capture_state.to_string().dimmed(),
        bar,
        countdown
    );
    let _ = stderr.flush();
}

/// Writes what the recognition sink forwards into numbered WAV files.
///
/// Batch mode receives encoded clips; streaming mode receives PCM that is
/// collected until the utterance is finalized.
async fn write_clips(
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    dir: PathBuf,
    sample_rate: u32,
    quiet: bool,
) -> Result<usize> {
    let mut written = 0usize;
    let mut pcm: Vec<u8> = Vec::new();

    while let Some(item) = outbound.recv().await {
        let bytes = match item {
            Outbound::Clip(CapturedClip { bytes, .. }) => bytes,
            Outbound::Pcm(chunk) => {
                pcm.extend_from_slice(&chunk);
                continue;
            }
            Outbound::Discard => {
                pcm.clear();
                continue;
            }
            Outbound::Finalize => {
                let samples: Vec<i16> = pcm
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect();
                pcm.clear();
                encode_wav(&samples, sample_rate)?
            }
        };

        written += 1;
        let path = dir.join(format!("utterance-{:03}.wav", written));
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if !quiet {
            eprintln!("{} {}", "Wrote:".dimmed(), path.display());
        }
    }

    Ok(written)
}

/// List available audio input devices.
fn list_audio_devices() -> Result<()> {
    let devices = list_devices()?;

    if devices.is_empty() {
        eprintln!("No audio input devices found");
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in devices.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Path => {
            let path = custom_path
                .map(Path::to_path_buf)
                .unwrap_or_else(Config::default_path);
            println!("{}", path.display());
        }
    }
    Ok(())
}
