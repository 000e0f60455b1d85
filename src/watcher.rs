use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::PupError;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A coalesced filesystem change over the watched path set.
#[derive(Debug, Clone, Copy)]
pub struct ChangeEvent {
    pub at: DateTime<Utc>,
}

/// Polling watcher over a set of paths. Changes observed within the debounce
/// window coalesce into a single [`ChangeEvent`]; debouncing is per watcher,
/// not per path.
pub struct Watcher {
    pub events: mpsc::Receiver<ChangeEvent>,
    pub task: JoinHandle<()>,
}

impl Watcher {
    /// Start watching. Fails with a watch error when the initial fingerprint
    /// cannot be taken (for example an unreadable directory); callers treat
    /// that as "watch trigger disabled", not as a fatal condition.
    pub fn spawn(
        paths: Vec<PathBuf>,
        debounce: Duration,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let baseline =
            fingerprint_paths(&paths).map_err(|err| PupError::Watch(err.to_string()))?;
        let (tx, events) = mpsc::channel(8);

        let task = tokio::spawn(poll_loop(
            paths,
            baseline,
            debounce,
            poll_interval,
            tx,
            cancel,
        ));
        Ok(Self { events, task })
    }
}

async fn poll_loop(
    paths: Vec<PathBuf>,
    mut baseline: u64,
    debounce: Duration,
    poll_interval: Duration,
    tx: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
) {
    let mut dirty_since: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = cancel.cancelled() => return,
        }

        match fingerprint_paths(&paths) {
            Ok(current) => {
                if current != baseline {
                    baseline = current;
                    // Keep absorbing changes; the window restarts on each one.
                    dirty_since = Some(tokio::time::Instant::now());
                }
            }
            Err(err) => {
                // Transient scan failures (a path mid-replace) skip the cycle.
                debug!("watch scan failed: {err}");
                continue;
            }
        }

        if let Some(since) = dirty_since {
            if since.elapsed() >= debounce {
                dirty_since = None;
                if tx.send(ChangeEvent { at: Utc::now() }).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Combined fingerprint over the whole path set. Missing paths hash to a
/// marker so creation and deletion register as changes.
fn fingerprint_paths(paths: &[PathBuf]) -> Result<u64> {
    let mut sorted: Vec<&PathBuf> = paths.iter().collect();
    sorted.sort();

    let mut hash = 1469598103934665603_u64;
    for path in sorted {
        hash_bytes(&mut hash, path.to_string_lossy().as_bytes());
        if !path.exists() {
            hash_u64(&mut hash, u64::MAX);
            continue;
        }
        if path.is_dir() {
            hash_dir(&mut hash, path)?;
        } else {
            hash_metadata(&mut hash, path)?;
        }
    }
    Ok(hash)
}

fn hash_dir(hash: &mut u64, root: &Path) -> Result<()> {
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut children: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .collect();
        children.sort();

        for child in children {
            let relative = child
                .strip_prefix(root)
                .unwrap_or(child.as_path())
                .to_string_lossy();
            hash_bytes(hash, relative.as_bytes());

            let metadata = fs::symlink_metadata(&child)?;
            let file_type_tag = if metadata.file_type().is_dir() {
                1_u64
            } else if metadata.file_type().is_symlink() {
                2_u64
            } else {
                3_u64
            };
            hash_u64(hash, file_type_tag);
            hash_u64(hash, metadata.len());
            hash_u64(
                hash,
                metadata
                    .modified()
                    .ok()
                    .and_then(|value| value.duration_since(UNIX_EPOCH).ok())
                    .map(|value| value.as_nanos() as u64)
                    .unwrap_or(0),
            );

            if metadata.file_type().is_dir() {
                stack.push(child);
            }
        }
    }

    Ok(())
}

fn hash_metadata(hash: &mut u64, path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    hash_u64(hash, metadata.len());
    hash_u64(
        hash,
        metadata
            .modified()
            .ok()
            .and_then(|value| value.duration_since(UNIX_EPOCH).ok())
            .map(|value| value.as_nanos() as u64)
            .unwrap_or(0),
    );
    Ok(())
}

fn hash_bytes(hash: &mut u64, bytes: &[u8]) {
    for byte in bytes {
        *hash ^= *byte as u64;
        *hash = hash.wrapping_mul(1099511628211);
    }
}

fn hash_u64(hash: &mut u64, value: u64) {
    hash_bytes(hash, &value.to_le_bytes());
}
