use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::errors::PupError;
use crate::supervisor::SupervisorStatus;

/// Frames larger than this are rejected rather than buffered.
const MAX_FRAME_BYTES: u32 = 1024 * 1024;

const CONNECTION_QUEUE_DEPTH: usize = 32;

/// Commands and relay traffic accepted on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BusRequest {
    Start { id: String },
    Stop { id: String },
    Restart { id: String },
    Block { id: String },
    Unblock { id: String },
    Status,
    Terminate,
    Subscribe { id: String },
    Send { to: String, payload: Value },
}

impl BusRequest {
    pub fn name(&self) -> &'static str {
        match self {
            BusRequest::Start { .. } => "start",
            BusRequest::Stop { .. } => "stop",
            BusRequest::Restart { .. } => "restart",
            BusRequest::Block { .. } => "block",
            BusRequest::Unblock { .. } => "unblock",
            BusRequest::Status => "status",
            BusRequest::Terminate => "terminate",
            BusRequest::Subscribe { .. } => "subscribe",
            BusRequest::Send { .. } => "send",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusResponse {
    pub ok: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<Vec<SupervisorStatus>>,
}

impl BusResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            processes: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            processes: None,
        }
    }
}

/// Frames the core pushes to subscribed children.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BusEvent {
    Message { from: String, payload: Value },
}

/// One operator command in flight from a connection to the core's queue.
pub struct CoreCommand {
    pub request: BusRequest,
    pub resp: oneshot::Sender<BusResponse>,
}

// ---- wire codec: 4-byte big-endian length, then UTF-8 JSON ----

/// Read one frame. `Ok(None)` means the peer closed before the next frame.
pub async fn read_frame<T, S>(stream: &mut S) -> Result<Option<T>>
where
    T: DeserializeOwned,
    S: AsyncRead + Unpin,
{
    let mut header = [0_u8; 4];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("failed to read frame header"),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit");
    }

    let mut payload = vec![0_u8; len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .context("failed to read frame payload")?;

    serde_json::from_slice(&payload)
        .context("failed to decode frame payload")
        .map(Some)
}

pub async fn write_frame<T, S>(stream: &mut S, value: &T) -> Result<()>
where
    T: Serialize,
    S: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(value)?;
    if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
        anyhow::bail!("refusing to write an oversized frame");
    }

    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .context("failed to write frame header")?;
    stream
        .write_all(&payload)
        .await
        .context("failed to write frame payload")?;
    stream.flush().await.context("failed to flush frame")?;
    Ok(())
}

// ---- inter-child relay ----

/// Registry of subscribed child connections. A child subscribes under its
/// own process id; `send` frames are forwarded to the target's connection.
#[derive(Clone, Default)]
pub struct Relay {
    inner: Arc<Mutex<HashMap<String, mpsc::Sender<Value>>>>,
}

impl Relay {
    pub fn register(&self, id: String, tx: mpsc::Sender<Value>) {
        self.inner
            .lock()
            .expect("relay registry poisoned")
            .insert(id, tx);
    }

    pub fn unregister(&self, id: &str) {
        self.inner
            .lock()
            .expect("relay registry poisoned")
            .remove(id);
    }

    pub fn forward(&self, to: &str, from: &str, payload: Value) -> bool {
        let target = self
            .inner
            .lock()
            .expect("relay registry poisoned")
            .get(to)
            .cloned();
        let Some(target) = target else {
            return false;
        };
        let event = BusEvent::Message {
            from: from.to_string(),
            payload,
        };
        match serde_json::to_value(&event) {
            Ok(frame) => target.try_send(frame).is_ok(),
            Err(_) => false,
        }
    }
}

// ---- endpoint ----

#[cfg(unix)]
pub use unix_endpoint::{bind, connect, serve};

#[cfg(windows)]
pub use windows_endpoint::{bind, connect, serve};

#[cfg(unix)]
mod unix_endpoint {
    use std::path::Path;

    use anyhow::{Context, Result};
    use tokio::net::{UnixListener, UnixStream};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::warn;

    use super::{handle_connection, CoreCommand, Relay};
    use crate::errors::PupError;

    /// Bind the bus socket. An answering socket at the path means another
    /// core already owns this directory; a dead one is swept and replaced.
    pub async fn bind(path: &Path) -> Result<UnixListener> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                return Err(PupError::BusConflict(path.display().to_string()).into());
            }
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
        }

        UnixListener::bind(path)
            .with_context(|| format!("failed to bind bus socket at {}", path.display()))
    }

    pub async fn connect(path: &Path) -> Result<UnixStream> {
        UnixStream::connect(path)
            .await
            .with_context(|| format!("failed to connect to pup core at {}", path.display()))
    }

    pub async fn serve(
        listener: UnixListener,
        commands: mpsc::Sender<CoreCommand>,
        relay: Relay,
        cancel: CancellationToken,
    ) {
        loop {
            let incoming = tokio::select! {
                incoming = listener.accept() => incoming,
                _ = cancel.cancelled() => return,
            };
            match incoming {
                Ok((stream, _)) => {
                    tokio::spawn(handle_connection(stream, commands.clone(), relay.clone()));
                }
                Err(err) => warn!("bus accept failed: {err}"),
            }
        }
    }
}

#[cfg(windows)]
mod windows_endpoint {
    use std::path::Path;

    use anyhow::{Context, Result};
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, ServerOptions};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::warn;

    use super::{handle_connection, CoreCommand, Relay};
    use crate::errors::PupError;

    fn pipe_name(path: &Path) -> String {
        let mut hash = 1469598103934665603_u64;
        for byte in path.to_string_lossy().as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        format!(r"\\.\pipe\pup-{hash:016x}")
    }

    pub async fn bind(path: &Path) -> Result<String> {
        let name = pipe_name(path);
        if ClientOptions::new().open(&name).is_ok() {
            return Err(PupError::BusConflict(name).into());
        }
        Ok(name)
    }

    pub async fn connect(path: &Path) -> Result<NamedPipeClient> {
        let name = pipe_name(path);
        ClientOptions::new()
            .open(&name)
            .with_context(|| format!("failed to connect to pup core at {name}"))
    }

    pub async fn serve(
        name: String,
        commands: mpsc::Sender<CoreCommand>,
        relay: Relay,
        cancel: CancellationToken,
    ) {
        let mut first = true;
        loop {
            let server = match ServerOptions::new()
                .first_pipe_instance(first)
                .create(&name)
            {
                Ok(server) => server,
                Err(err) => {
                    warn!("failed to create bus pipe {name}: {err}");
                    return;
                }
            };
            first = false;

            let connected = tokio::select! {
                connected = server.connect() => connected,
                _ = cancel.cancelled() => return,
            };
            match connected {
                Ok(()) => {
                    tokio::spawn(handle_connection(server, commands.clone(), relay.clone()));
                }
                Err(err) => warn!("bus connect failed: {err}"),
            }
        }
    }
}

/// Per-connection loop. All outbound frames (responses and relayed messages)
/// funnel through one writer task so they never interleave.
async fn handle_connection<S>(stream: S, commands: mpsc::Sender<CoreCommand>, relay: Relay)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::channel::<Value>(CONNECTION_QUEUE_DEPTH);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    let mut subscribed: Option<String> = None;
    loop {
        let request = match read_frame::<BusRequest, _>(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                // Bad frames close this connection only; the core keeps running.
                warn!("{}", PupError::Ipc(format!("{err:#}")));
                break;
            }
        };
        debug!("bus request: {}", request.name());

        let response = match request {
            BusRequest::Subscribe { id } => {
                relay.register(id.clone(), out_tx.clone());
                subscribed = Some(id.clone());
                BusResponse::ok(format!("subscribed {id}"))
            }
            BusRequest::Send { to, payload } => {
                let from = subscribed.clone().unwrap_or_default();
                if relay.forward(&to, &from, payload) {
                    BusResponse::ok(format!("delivered to {to}"))
                } else {
                    BusResponse::error(format!("no subscriber for {to}"))
                }
            }
            request => {
                let (resp_tx, resp_rx) = oneshot::channel();
                let command = CoreCommand {
                    request,
                    resp: resp_tx,
                };
                if commands.send(command).await.is_err() {
                    break;
                }
                match resp_rx.await {
                    Ok(response) => response,
                    Err(_) => BusResponse::error("core did not answer"),
                }
            }
        };

        let Ok(frame) = serde_json::to_value(&response) else {
            break;
        };
        if out_tx.send(frame).await.is_err() {
            break;
        }
    }

    if let Some(id) = subscribed {
        relay.unregister(&id);
    }
    drop(out_tx);
    let _ = writer_task.await;
}

/// One-shot client call used by the CLI: connect, send, read the answer.
pub async fn request(path: &Path, request: &BusRequest) -> Result<BusResponse> {
    let mut stream = connect(path).await?;
    write_frame(&mut stream, request).await?;
    read_frame(&mut stream)
        .await?
        .ok_or_else(|| anyhow!("core closed the bus connection unexpectedly"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::{read_frame, write_frame, BusRequest, BusResponse, Relay};

    #[tokio::test]
    async fn frame_roundtrip_preserves_the_request() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        let request = BusRequest::Start {
            id: "web".to_string(),
        };

        write_frame(&mut writer, &request)
            .await
            .expect("failed writing request frame");
        let decoded: BusRequest = read_frame(&mut reader)
            .await
            .expect("failed reading request frame")
            .expect("expected a frame before EOF");

        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn wire_format_is_length_prefixed_json() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        write_frame(&mut writer, &BusRequest::Status)
            .await
            .expect("failed writing frame");

        use tokio::io::AsyncReadExt;
        let mut header = [0_u8; 4];
        reader
            .read_exact(&mut header)
            .await
            .expect("failed to read header");
        let len = u32::from_be_bytes(header) as usize;
        let mut payload = vec![0_u8; len];
        reader
            .read_exact(&mut payload)
            .await
            .expect("failed to read payload");

        let value: serde_json::Value =
            serde_json::from_slice(&payload).expect("payload should be JSON");
        assert_eq!(value, json!({"type": "status"}));
    }

    #[tokio::test]
    async fn eof_before_a_frame_reads_as_none() {
        let (writer, mut reader) = tokio::io::duplex(64);
        drop(writer);

        let frame = read_frame::<BusResponse, _>(&mut reader)
            .await
            .expect("clean EOF should not be an error");
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        writer
            .write_all(&100_u32.to_be_bytes())
            .await
            .expect("failed to write header");
        writer
            .write_all(b"short")
            .await
            .expect("failed to write partial payload");
        drop(writer);

        let err = read_frame::<BusResponse, _>(&mut reader)
            .await
            .expect_err("truncated payload should fail");
        assert!(
            err.to_string().contains("failed to read frame payload"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        writer
            .write_all(&(super::MAX_FRAME_BYTES + 1).to_be_bytes())
            .await
            .expect("failed to write header");

        let err = read_frame::<BusResponse, _>(&mut reader)
            .await
            .expect_err("oversized frame should fail");
        assert!(err.to_string().contains("exceeds"), "unexpected error: {err}");
    }

    #[test]
    fn relay_forwards_only_to_subscribed_ids() {
        let relay = Relay::default();
        let (tx, mut rx) = mpsc::channel(4);
        relay.register("worker-1".to_string(), tx);

        assert!(relay.forward("worker-1", "worker-0", json!({"task": 7})));
        assert!(!relay.forward("worker-2", "worker-0", json!({})));

        let frame = rx.try_recv().expect("expected a relayed frame");
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["from"], "worker-0");
        assert_eq!(frame["payload"]["task"], 7);

        relay.unregister("worker-1");
        assert!(!relay.forward("worker-1", "worker-0", json!({})));
    }

    #[test]
    fn unknown_request_types_fail_to_decode() {
        let decoded = serde_json::from_str::<BusRequest>(r#"{"type":"upgrade"}"#);
        assert!(decoded.is_err());
    }
}
