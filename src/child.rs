use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::errors::PupError;
use crate::logging::{LogEvent, LogSink, LogStream};

/// Lines longer than this are split without loss.
const MAX_LINE_BYTES: usize = 64 * 1024;
/// Per-stream backlog while the sink is slow; oldest lines drop beyond it.
const STREAM_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// How one child run ended.
#[derive(Debug, Clone, Copy)]
pub struct ChildExit {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub success: bool,
    pub wait_error: bool,
    pub at: DateTime<Utc>,
}

/// Handle to a live child. Owns no OS resources itself: the wait task holds
/// the `Child` and reports the exit over the channel handed to [`spawn`].
#[derive(Debug, Clone, Copy)]
pub struct RunningChild {
    pid: u32,
}

impl RunningChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Ask the child (and its process group) to stop. Best-effort; a no-op
    /// once the child has exited.
    pub fn signal_stop(&self) {
        signal_pid(self.pid, StopKind::Graceful);
    }

    pub fn force_kill(&self) {
        signal_pid(self.pid, StopKind::Kill);
    }
}

/// Launch one OS process. Stdout and stderr are pumped line-wise into the
/// sink; the exit lands on `exit_tx` exactly once.
pub fn spawn(
    process_id: &str,
    cmd: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    extra_env: &[(String, String)],
    sink: &LogSink,
    exit_tx: mpsc::UnboundedSender<ChildExit>,
) -> Result<RunningChild> {
    let mut command = Command::new(&cmd[0]);
    #[cfg(unix)]
    {
        // Children get their own process group so stop/kill can target the tree.
        unsafe {
            command.pre_exec(|| {
                if nix::libc::setpgid(0, 0) == 0 {
                    Ok(())
                } else {
                    Err(std::io::Error::last_os_error())
                }
            });
        }
    }
    command
        .args(&cmd[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if !env.is_empty() {
        command.envs(env);
    }
    for (key, value) in extra_env {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|err| PupError::Spawn {
        command: cmd[0].clone(),
        reason: err.to_string(),
    })?;
    let pid = child.id().ok_or_else(|| PupError::Spawn {
        command: cmd[0].clone(),
        reason: "spawned child has no pid".to_string(),
    })?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_stream(
            process_id.to_string(),
            LogStream::Stdout,
            stdout,
            sink.sender(),
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_stream(
            process_id.to_string(),
            LogStream::Stderr,
            stderr,
            sink.sender(),
        ));
    }

    tokio::spawn(async move {
        let exit = match child.wait().await {
            Ok(status) => ChildExit {
                pid,
                code: status.code(),
                signal: exit_signal(&status),
                success: status.success(),
                wait_error: false,
                at: Utc::now(),
            },
            Err(err) => {
                error!("child wait failed: {err}");
                ChildExit {
                    pid,
                    code: None,
                    signal: None,
                    success: false,
                    wait_error: true,
                    at: Utc::now(),
                }
            }
        };
        let _ = exit_tx.send(exit);
    });

    Ok(RunningChild { pid })
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

enum StopKind {
    Graceful,
    Kill,
}

#[cfg(unix)]
fn signal_pid(pid: u32, kind: StopKind) {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match kind {
        StopKind::Graceful => Signal::SIGTERM,
        StopKind::Kill => Signal::SIGKILL,
    };
    let pgid = Pid::from_raw(-(pid as i32));
    let os_pid = Pid::from_raw(pid as i32);

    match kill(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            warn!("failed to signal process group of pid {pid}: {err}");
            if let Err(err) = kill(os_pid, signal) {
                if err != Errno::ESRCH {
                    warn!("failed to signal pid {pid}: {err}");
                }
            }
        }
    }
}

#[cfg(windows)]
fn signal_pid(pid: u32, kind: StopKind) {
    let mut args = vec!["/PID".to_string(), pid.to_string(), "/T".to_string()];
    if matches!(kind, StopKind::Kill) {
        args.push("/F".to_string());
    }
    tokio::spawn(async move {
        let _ = Command::new("taskkill").args(&args).output().await;
    });
}

/// Read one stream line-wise and forward into the sink without ever blocking
/// the child: lines queue locally up to [`STREAM_BUFFER_BYTES`], then the
/// oldest are dropped and a single overflow marker is emitted.
async fn pump_stream<R>(
    process: String,
    stream: LogStream,
    mut reader: R,
    sink: mpsc::Sender<LogEvent>,
) where
    R: AsyncReadExt + Unpin,
{
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
    let mut pending: Vec<u8> = Vec::new();
    let mut backlog = Backlog::new(process, stream);
    let mut eof = false;

    while !eof || !backlog.is_empty() {
        tokio::select! {
            read = reader.read(&mut chunk), if !eof => {
                match read {
                    Ok(0) | Err(_) => {
                        eof = true;
                        if !pending.is_empty() {
                            let len = pending.len();
                            let line = take_line(&mut pending, len);
                            backlog.push(line);
                        }
                    }
                    Ok(n) => {
                        pending.extend_from_slice(&chunk[..n]);
                        loop {
                            if let Some(pos) = pending.iter().position(|byte| *byte == b'\n') {
                                if pos <= MAX_LINE_BYTES {
                                    let mut line = take_line(&mut pending, pos + 1);
                                    line.truncate(line.len() - 1);
                                    backlog.push(line);
                                    continue;
                                }
                            }
                            if pending.len() >= MAX_LINE_BYTES {
                                let line = take_line(&mut pending, MAX_LINE_BYTES);
                                backlog.push(line);
                                continue;
                            }
                            break;
                        }
                    }
                }
            }
            permit = sink.reserve(), if !backlog.is_empty() => {
                match permit {
                    Ok(permit) => {
                        if let Some(event) = backlog.pop() {
                            permit.send(event);
                        }
                    }
                    Err(_) => return,
                }
            }
        }
    }
}

fn take_line(pending: &mut Vec<u8>, len: usize) -> Vec<u8> {
    let rest = pending.split_off(len);
    std::mem::replace(pending, rest)
}

/// Bounded line backlog between a stream reader and the sink. The overflow
/// marker lives outside the byte-accounted queue so it cannot itself be
/// dropped, and it is forwarded ahead of the surviving lines.
struct Backlog {
    process: String,
    stream: LogStream,
    lines: VecDeque<LogEvent>,
    bytes: usize,
    overflow: Option<LogEvent>,
    dropped: usize,
}

impl Backlog {
    fn new(process: String, stream: LogStream) -> Self {
        Self {
            process,
            stream,
            lines: VecDeque::new(),
            bytes: 0,
            overflow: None,
            dropped: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.overflow.is_none()
    }

    fn push(&mut self, raw: Vec<u8>) {
        let line = String::from_utf8_lossy(&raw).into_owned();
        let len = line.len();

        while self.bytes + len > STREAM_BUFFER_BYTES {
            let Some(oldest) = self.lines.pop_front() else {
                break;
            };
            self.bytes = self.bytes.saturating_sub(oldest.line.len());
            self.dropped += 1;
            self.overflow = Some(LogEvent::overflow(
                &self.process,
                self.stream,
                self.dropped,
            ));
        }

        self.bytes += len;
        self.lines
            .push_back(LogEvent::line(&self.process, self.stream, Utc::now(), line));
    }

    fn pop(&mut self) -> Option<LogEvent> {
        if let Some(event) = self.overflow.take() {
            return Some(event);
        }
        let event = self.lines.pop_front()?;
        self.bytes = self.bytes.saturating_sub(event.line.len());
        if self.lines.is_empty() {
            // Episode over; the next overflow gets its own marker.
            self.dropped = 0;
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    use super::{pump_stream, take_line, Backlog, MAX_LINE_BYTES};
    use crate::logging::LogStream;

    #[test]
    fn take_line_splits_off_the_prefix() {
        let mut pending = b"abc\ndef".to_vec();
        let line = take_line(&mut pending, 4);
        assert_eq!(line, b"abc\n");
        assert_eq!(pending, b"def");
    }

    #[test]
    fn backlog_drops_oldest_and_emits_a_single_overflow_marker() {
        let mut backlog = Backlog::new("p".to_string(), LogStream::Stdout);

        let big = "x".repeat(super::STREAM_BUFFER_BYTES / 2 + 1);
        for _ in 0..3 {
            backlog.push(big.clone().into_bytes());
        }

        let first = backlog.pop().expect("expected the overflow marker first");
        assert!(first.line.contains("log-overflow"), "got: {}", first.line);
        assert!(first.line.contains("2"), "two lines were dropped: {}", first.line);

        let survivor = backlog.pop().expect("expected the surviving line");
        assert_eq!(survivor.line.len(), big.len());
        assert!(backlog.pop().is_none(), "only one line should survive");
    }

    #[tokio::test]
    async fn pump_stream_splits_long_lines_without_loss() {
        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        let (tx, mut rx) = mpsc::channel(64);

        let pump = tokio::spawn(pump_stream(
            "p".to_string(),
            LogStream::Stdout,
            reader,
            tx,
        ));

        let long = vec![b'a'; MAX_LINE_BYTES + 10];
        writer.write_all(&long).await.expect("failed to write long line");
        writer.write_all(b"\n").await.expect("failed to write newline");
        writer.write_all(b"tail\n").await.expect("failed to write tail line");
        drop(writer);
        pump.await.expect("pump task panicked");

        let mut lines = Vec::new();
        while let Some(event) = rx.recv().await {
            lines.push(event.line);
        }

        assert_eq!(lines.len(), 3, "expected split line plus tail, got {lines:?}");
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert_eq!(lines[1], "a".repeat(10));
        assert_eq!(lines[2], "tail");
    }

    #[tokio::test]
    async fn pump_stream_flushes_trailing_bytes_without_newline() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::channel(8);

        let pump = tokio::spawn(pump_stream(
            "p".to_string(),
            LogStream::Stderr,
            reader,
            tx,
        ));

        writer
            .write_all(b"no newline at end")
            .await
            .expect("failed to write bytes");
        drop(writer);
        pump.await.expect("pump task panicked");

        let event = rx.recv().await.expect("expected the trailing line");
        assert_eq!(event.line, "no newline at end");
        assert!(rx.recv().await.is_none());
    }
}
