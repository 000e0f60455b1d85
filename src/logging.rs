use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::LoggerOptions;

const SINK_QUEUE_DEPTH: usize = 1024;

const ANSI_RESET: &str = "\x1b[0m";
const ANSI_PALETTE: [&str; 6] = [
    "\x1b[36m", "\x1b[32m", "\x1b[33m", "\x1b[35m", "\x1b[34m", "\x1b[31m",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    fn label(&self) -> &'static str {
        match self {
            LogStream::Stdout => "out",
            LogStream::Stderr => "err",
        }
    }
}

/// One captured line from a child, tagged with the instant it was read.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub process: String,
    pub stream: LogStream,
    pub at: DateTime<Utc>,
    pub line: String,
}

impl LogEvent {
    pub fn line(process: &str, stream: LogStream, at: DateTime<Utc>, line: String) -> Self {
        Self {
            process: process.to_string(),
            stream,
            at,
            line,
        }
    }

    /// Marker emitted once per overflow episode when a slow sink forced the
    /// reader to drop buffered lines.
    pub fn overflow(process: &str, stream: LogStream, dropped: usize) -> Self {
        Self {
            process: process.to_string(),
            stream,
            at: Utc::now(),
            line: format!("log-overflow: dropped {dropped} buffered line(s)"),
        }
    }
}

/// Handle to the single writer task. Cloned into every stream reader; line
/// atomicity holds because all writes funnel through one task.
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::Sender<LogEvent>,
}

impl LogSink {
    pub fn sender(&self) -> mpsc::Sender<LogEvent> {
        self.tx.clone()
    }

    /// Spawn the writer task. The task drains the queue until every sender is
    /// dropped, so shutdown never loses already-captured lines.
    pub async fn spawn(options: &LoggerOptions) -> Result<(Self, JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel(SINK_QUEUE_DEPTH);
        let decorate = options.decorate.unwrap_or(true);
        let colors = options.colors.unwrap_or(false);

        let writer: Box<dyn AsyncWrite + Send + Unpin> = match &options.stdout {
            Some(path) => Box::new(open_sink_file(path).await?),
            None => Box::new(tokio::io::stdout()),
        };

        let join = tokio::spawn(run_writer(rx, writer, decorate, colors));
        Ok((Self { tx }, join))
    }
}

async fn open_sink_file(path: &Path) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed opening {}", path.display()))
}

async fn run_writer(
    mut rx: mpsc::Receiver<LogEvent>,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    decorate: bool,
    colors: bool,
) {
    while let Some(event) = rx.recv().await {
        let rendered = render_line(&event, decorate, colors);
        if let Err(err) = writer.write_all(rendered.as_bytes()).await {
            warn!("log sink write failed: {err}");
        }
    }
    let _ = writer.flush().await;
}

fn render_line(event: &LogEvent, decorate: bool, colors: bool) -> String {
    if !decorate {
        return format!("{}\n", event.line);
    }

    let stamp = event.at.format("%Y-%m-%dT%H:%M:%S%.3fZ");
    if colors {
        let color = ANSI_PALETTE[(fnv_hash(event.process.as_bytes()) as usize) % ANSI_PALETTE.len()];
        format!(
            "{stamp} {color}[{}:{}]{ANSI_RESET} {}\n",
            event.process,
            event.stream.label(),
            event.line
        )
    } else {
        format!(
            "{stamp} [{}:{}] {}\n",
            event.process,
            event.stream.label(),
            event.line
        )
    }
}

fn fnv_hash(bytes: &[u8]) -> u64 {
    let mut hash = 1469598103934665603_u64;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash
}
