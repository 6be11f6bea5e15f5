use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_wake::session::ActivationGate;
use beacon_wake::voice::{FrameAssembler, SAMPLE_RATE, resample, samples_duration};
use beacon_wake::{ApiServerBuilder, Config, StreamingPipelineDispatcher, WakeWordDetector};

/// Beacon Wake - wake word activation front end for voice assistants
#[derive(Parser)]
#[command(name = "beacon-wake", version, about)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, env = "BEACON_WAKE_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Wake word model to load (repeatable; pretrained name or file path)
    #[arg(short, long = "model")]
    models: Vec<String>,

    /// Default detection threshold in (0, 1]
    #[arg(short, long)]
    threshold: Option<f32>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket server (default)
    Serve,
    /// Load the configured models and list them
    Models,
    /// Run detection offline over a WAV file
    Detect {
        /// WAV file (16-bit PCM; resampled to 16 kHz mono)
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,beacon_wake=info",
        1 => "info,beacon_wake=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Models => list_models(config),
        Command::Detect { path } => detect_file(config, &path),
    }
}

/// Config file and environment first, then command line overrides
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(host) = &cli.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if !cli.models.is_empty() {
        config.detector.models.clone_from(&cli.models);
    }
    if let Some(threshold) = cli.threshold {
        config.detector.threshold = threshold;
    }

    config.validate()?;
    Ok(config)
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        models = ?config.detector.models,
        "starting beacon wake"
    );

    let detector = Arc::new(WakeWordDetector::new(config.detector.clone()));
    if config.detector.preload {
        let preload = Arc::clone(&detector);
        // Failure is reported per connection; keep serving
        if let Err(e) = tokio::task::spawn_blocking(move || preload.load().map(|_| ())).await? {
            tracing::warn!(error = %e, "wake word models failed to preload");
        }
    }

    let dispatcher = Arc::new(StreamingPipelineDispatcher::from_config(&config));
    if !dispatcher.is_configured() {
        tracing::warn!("no provider API keys set; utterances will fail at dispatch");
    }

    let server = ApiServerBuilder::from_config(&config, detector, dispatcher).build();

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }

    Ok(())
}

fn list_models(config: Config) -> anyhow::Result<()> {
    let detector = WakeWordDetector::new(config.detector);
    let models = detector.load()?;

    println!("{:<16} {:>9}  backend", "label", "threshold");
    for model in models {
        println!("{:<16} {:>9.2}  {}", model.label(), model.threshold(), model.backend());
    }

    Ok(())
}

/// Replay a recording through detector and gate
///
/// The gate clock follows audio time, so debouncing matches a live stream.
fn detect_file(config: Config, path: &Path) -> anyhow::Result<()> {
    let samples = read_wav(path)?;
    let frame_samples = config.detector.frame_samples;
    let detector = WakeWordDetector::new(config.detector);
    let mut gate = ActivationGate::new(config.session.debounce);
    let mut assembler = FrameAssembler::new(frame_samples);

    let start = Instant::now();
    let mut activations = 0_usize;

    for frame in assembler.push(&samples) {
        let result = detector.detect(&frame)?;
        let offset = frame_offset(frame.seq(), frame_samples);
        if let Some(activation) = gate.evaluate(&result, start + offset) {
            activations += 1;
            println!(
                "{:>8.2}s  {:<16} {:.3}",
                offset.as_secs_f32(),
                activation.label,
                activation.confidence
            );
        }
    }

    println!(
        "{activations} activation(s) in {:.2}s of audio",
        samples_duration(samples.len(), SAMPLE_RATE).as_secs_f32()
    );

    Ok(())
}

fn frame_offset(seq: u64, frame_samples: usize) -> std::time::Duration {
    let frame = samples_duration(frame_samples, SAMPLE_RATE);
    frame * u32::try_from(seq).unwrap_or(u32::MAX)
}

/// Read a 16-bit WAV file as mono samples at the detector rate
fn read_wav(path: &Path) -> anyhow::Result<Vec<i16>> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        anyhow::bail!(
            "{}: expected 16-bit integer PCM, got {}-bit {:?}",
            path.display(),
            spec.bits_per_sample,
            spec.sample_format
        );
    }

    let interleaved = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
    let channels = usize::from(spec.channels.max(1));
    let mono: Vec<i16> = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|c| {
                let sum: i32 = c.iter().map(|&s| i32::from(s)).sum();
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                let avg = (sum / channels as i32) as i16;
                avg
            })
            .collect()
    };

    Ok(resample(&mono, spec.sample_rate, SAMPLE_RATE)?)
}
