//! Radiosource CLI: stream an internet radio URL and dump clean audio

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use radiosource::config::SourceConfig;
use radiosource::stream::{
    HttpSource, NodeState, Pull, Recorder, SourceEvent, StationInfo, StreamFormat,
};

#[derive(Parser)]
#[command(
    name = "radiosource",
    about = "Fetch an internet radio stream, strip ICY metadata and dump the audio",
    version
)]
struct Cli {
    /// Stream or playlist URL
    url: String,

    /// JSON file with source settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ring buffer capacity in bytes
    #[arg(long)]
    capacity: Option<usize>,

    /// Bytes to buffer before audio is handed out
    #[arg(long)]
    prefill: Option<usize>,

    /// Write the clean audio stream to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write the raw network stream, metadata included, to this file
    #[arg(long)]
    record: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,
}

const PULL_TIMEOUT: Duration = Duration::from_millis(500);
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Saves the raw stream and logs track changes
struct FileRecorder {
    out: BufWriter<File>,
    failed: bool,
}

impl FileRecorder {
    fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("creating recording {}", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
            failed: false,
        })
    }
}

impl Recorder for FileRecorder {
    fn on_data(&mut self, raw: &[u8]) {
        if self.failed {
            return;
        }
        if let Err(e) = self.out.write_all(raw) {
            warn!(error = %e, "Recording failed, disabling");
            self.failed = true;
        }
    }

    fn on_new_track(&mut self, title: &str, format: &StreamFormat) {
        info!(title, codec = %format.codec, "Recording new track");
        let _ = self.out.flush();
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(
        capacity = config.buffer_capacity,
        prefill = config.prefill(),
        "Starting source"
    );

    let source = HttpSource::new(config).context("creating HTTP source")?;
    if let Some(path) = &cli.record {
        source.set_recorder(Box::new(FileRecorder::create(path)?));
    }
    let events = source.subscribe();
    source.set_url(&cli.url);
    source.start()?;

    let mut output = match &cli.output {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => None,
    };

    let started = Instant::now();
    let deadline = cli.duration.map(|secs| started + Duration::from_secs(secs));
    let mut last_report = Instant::now();
    let mut delivered: u64 = 0;
    let mut exhausted = false;
    let mut buf = vec![0u8; 4096];

    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Duration reached");
            break;
        }

        for event in events.try_iter() {
            log_event(&event);
            if event == SourceEvent::NoMoreTracks {
                exhausted = true;
            }
        }

        match source.pull(&mut buf, PULL_TIMEOUT) {
            Pull::Data { filled, .. } => {
                if let Some(out) = output.as_mut() {
                    out.write_all(&buf[..filled]).context("writing audio")?;
                }
                source.confirm_read(filled);
                delivered += filled as u64;
            }
            Pull::Flush => info!("Stream switched, flushing"),
            Pull::Timeout => {
                debug!(buffered = source.buffered(), "Waiting for data");
                if stream_finished(exhausted, source.state(), source.buffered()) {
                    info!("Stream ended");
                    break;
                }
            }
            Pull::Stopped => break,
        }

        if last_report.elapsed() >= REPORT_INTERVAL {
            last_report = Instant::now();
            info!(
                received = %format_bytes(source.bytes_received()),
                delivered = %format_bytes(delivered),
                buffered = source.buffered(),
                uptime = %format_uptime(started),
                "Progress"
            );
        }
    }

    source.stop();
    if let Some(out) = output.as_mut() {
        out.flush().context("flushing audio output")?;
    }

    print_summary(&source.station_info(), source.bytes_received(), delivered);
    Ok(())
}

/// Settings from `--config`, with command-line overrides applied
fn load_config(cli: &Cli) -> Result<SourceConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            parse_config(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => SourceConfig::default(),
    };
    if let Some(capacity) = cli.capacity {
        config.buffer_capacity = capacity;
    }
    if let Some(prefill) = cli.prefill {
        config.prefill_amount = Some(prefill);
    }
    Ok(config.validated())
}

fn parse_config(text: &str) -> Result<SourceConfig> {
    Ok(serde_json::from_str(text)?)
}

/// Nothing left to pull: the playlist ran out, or the source paused after a
/// failed connect, and the buffer is empty
fn stream_finished(exhausted: bool, state: NodeState, buffered: usize) -> bool {
    (exhausted || state == NodeState::Paused) && buffered == 0
}

fn log_event(event: &SourceEvent) {
    match event {
        SourceEvent::Connecting { reconnect } => info!(reconnect, "Connecting"),
        SourceEvent::Connected { url, reconnect } => info!(url = %url, reconnect, "Connected"),
        SourceEvent::NextTrack(url) => info!(url = %url, "Next track"),
        SourceEvent::TrackInfo(title) => info!(title = %title, "Now playing"),
        SourceEvent::NoMoreTracks => warn!("No more tracks"),
    }
}

fn print_summary(info: &StationInfo, received: u64, delivered: u64) {
    let field = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    println!("Station:     {}", field(&info.name));
    println!("Description: {}", field(&info.description));
    println!("Genre:       {}", field(&info.genre));
    println!("URL:         {}", field(&info.url));
    println!("Last title:  {}", field(&info.title));
    println!("Received:    {}", format_bytes(received));
    println!("Delivered:   {}", format_bytes(delivered));
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn format_uptime(started: Instant) -> String {
    let secs = started.elapsed().as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}
