use std::{
    path::{
        Path,
        PathBuf,
    },
    process::Stdio,
    sync::atomic::Ordering,
};

use clap::Parser;
use color_eyre::eyre::{
    Error,
    bail,
};
use slowscan::{
    modes,
    session::{
        ProgressEvent,
        ProgressSink,
        Session,
        SessionConfig,
        SessionStatus,
    },
    sink::DirectorySink,
    source::{
        PcmStream,
        read_wav,
    },
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::debug!(?args);

    match args {
        Args::Decode {
            input,
            output,
            frequency,
        } => decode(&input, &output, frequency),
        Args::Live {
            command,
            rate,
            output,
            frequency,
        } => live(command, rate, &output, frequency).await,
        Args::Modes => {
            list_modes();
            Ok(())
        }
    }
}

/// Decodes SSTV images out of demodulated audio.
#[derive(Debug, Parser)]
enum Args {
    /// Decode every image in a WAV recording.
    Decode {
        /// Mono 16 bit PCM WAV file.
        input: PathBuf,

        /// Directory the decoded PNGs are written to.
        #[clap(short, long, default_value = ".")]
        output: PathBuf,

        /// Receiver frequency recorded with the images, in Hz.
        #[clap(short, long, default_value = "145800000")]
        frequency: f64,
    },
    /// Decode a live stream of signed 16 bit little endian PCM, either
    /// from a command's stdout or from stdin.
    Live {
        /// Command producing PCM on stdout, run through `sh -c`, e.g.
        /// `rtl_fm -M fm -f 145.8M -s 48000 -`.
        #[clap(short, long)]
        command: Option<String>,

        /// Sample rate of the PCM stream.
        #[clap(short, long, default_value = "48000")]
        rate: u32,

        /// Directory the decoded PNGs are written to.
        #[clap(short, long, default_value = ".")]
        output: PathBuf,

        /// Receiver frequency recorded with the images, in Hz.
        #[clap(short, long, default_value = "145800000")]
        frequency: f64,
    },
    /// List the supported modes.
    Modes,
}

fn decode(input: &Path, output: &Path, frequency: f64) -> Result<(), Error> {
    let (samples, sample_rate) = read_wav(input)?;
    tracing::info!(
        sample_rate,
        seconds = samples.len() as f32 / sample_rate as f32,
        "loaded recording"
    );

    let config = SessionConfig {
        frequency_hz: frequency,
        ..SessionConfig::default()
    };
    let sink = DirectorySink::new(output)?;
    let mut session = Session::new(sample_rate as f32, config, EventLog, sink);

    let images = session.decode_buffer(&samples)?;
    if images.is_empty() {
        println!("no images found");
    }
    for image in images {
        println!(
            "{}  {}x{}  {} bytes  {}",
            image.file_name(),
            image.image.width(),
            image.image.height(),
            image.byte_size(),
            image.mode.name,
        );
    }
    Ok(())
}

async fn live(
    command: Option<String>,
    rate: u32,
    output: &Path,
    frequency: f64,
) -> Result<(), Error> {
    let config = SessionConfig {
        frequency_hz: frequency,
        ..SessionConfig::default()
    };
    let sink = DirectorySink::new(output)?;
    let mut session = Session::new(rate as f32, config, EventLog, sink);

    let stop = session.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("stopping after ctrl-c");
            stop.store(true, Ordering::Relaxed);
        }
    });

    let result = match command {
        Some(command) => {
            tracing::info!(command, "spawning tuner");
            let mut child = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            let Some(stdout) = child.stdout.take()
            else {
                bail!("tuner process has no stdout");
            };
            let mut source = PcmStream::new(stdout, rate);
            session.run(&mut source).await
        }
        None => {
            tracing::info!("reading PCM from stdin");
            let mut source = PcmStream::new(tokio::io::stdin(), rate);
            session.run(&mut source).await
        }
    };

    for image in session.images() {
        println!(
            "{}  {}x{}  {} bytes  {}",
            image.file_name(),
            image.image.width(),
            image.image.height(),
            image.byte_size(),
            image.mode.name,
        );
    }

    result?;
    Ok(())
}

fn list_modes() {
    for mode in modes::all() {
        println!(
            "{:<12} code {:>3}  {:>3}x{:<3}  {:>7.2} ms/line  {:>6.1} s total",
            mode.name,
            mode.vis_code,
            mode.width,
            mode.height,
            mode.line_time * 1000.0,
            mode.line_time * mode.audio_lines() as f32,
        );
    }
}

/// Forwards session progress into the log.
#[derive(Clone, Copy, Debug)]
struct EventLog;

impl ProgressSink for EventLog {
    fn emit(&mut self, event: ProgressEvent) {
        if let Some(message) = &event.message {
            match event.status {
                SessionStatus::Error => tracing::error!("{message}"),
                _ => tracing::warn!("{message}"),
            }
            return;
        }

        match event.status {
            SessionStatus::Listening | SessionStatus::Framing => {
                if let Some(signal) = &event.signal {
                    tracing::debug!(
                        level_dbfs = signal.level_dbfs,
                        peak_hz = signal.peak_hz,
                        tone = ?signal.tone,
                        "signal"
                    );
                }
                else {
                    tracing::info!(status = ?event.status, "session");
                }
            }
            SessionStatus::Decoding => {
                if let Some(mode) = event.mode {
                    if event.percent > 0.0 {
                        tracing::info!(mode, percent = event.percent, "decoding");
                    }
                    else {
                        tracing::info!(mode, "image started");
                    }
                }
            }
            SessionStatus::Complete => {
                if let Some(mode) = event.mode {
                    tracing::info!(mode, "image complete");
                }
            }
            SessionStatus::Error => {}
        }
    }
}
