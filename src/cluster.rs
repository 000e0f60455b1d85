use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProcessSpec;
use crate::logging::LogSink;
use crate::supervisor::{self, SupervisorContext, SupervisorHandle, SupervisorState};

const REFUSAL_RESPONSE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

/// Dispatch strategy for the balancer front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    LeastConnections,
}

impl Strategy {
    fn from_env() -> Self {
        match std::env::var("PUP_BALANCE_STRATEGY").ok().as_deref() {
            Some("least-connections") => Strategy::LeastConnections,
            _ => Strategy::RoundRobin,
        }
    }
}

/// N supervisors presenting one logical process.
pub struct ClusterHandle {
    pub id: String,
    pub members: Vec<SupervisorHandle>,
}

/// Fan one spec out to `instances` supervisors and, when a path prefix is
/// declared, front them with a balancer. Instance ids are `{id}-0 …
/// {id}-(N-1)`; each replica learns its slot through the cluster env vars.
pub fn spawn(
    spec: &ProcessSpec,
    ipc_path: &PathBuf,
    sink: &LogSink,
    shutdown: CancellationToken,
    kill: CancellationToken,
) -> (ClusterHandle, Vec<JoinHandle<()>>) {
    let count = spec.instances;
    let balanced = spec.path.is_some();
    let front_port = balancer_port(&spec.id);

    let mut members = Vec::with_capacity(count as usize);
    let mut joins = Vec::new();

    for index in 0..count {
        let instance_id = format!("{}-{index}", spec.id);
        let mut extra_env = Vec::new();
        if balanced {
            extra_env.push((
                "PUP_CLUSTER_PORT".to_string(),
                backend_port(front_port, index).to_string(),
            ));
        }
        let (handle, join) = supervisor::spawn(SupervisorContext {
            id: instance_id,
            spec: spec.clone(),
            instance_index: index,
            instance_count: count,
            extra_env,
            ipc_path: ipc_path.clone(),
            sink: sink.clone(),
            shutdown: shutdown.clone(),
            kill: kill.clone(),
        });
        members.push(handle);
        joins.push(join);
    }

    if let Some(prefix) = &spec.path {
        let balancer = Balancer {
            id: spec.id.clone(),
            prefix: prefix.clone(),
            port: front_port,
            backends: members
                .iter()
                .enumerate()
                .map(|(index, handle)| Backend {
                    status: handle.status_rx(),
                    port: backend_port(front_port, index as u32),
                    active: Arc::new(AtomicUsize::new(0)),
                })
                .collect(),
            strategy: Strategy::from_env(),
        };
        joins.push(tokio::spawn(balancer.run(shutdown)));
    }

    (
        ClusterHandle {
            id: spec.id.clone(),
            members,
        },
        joins,
    )
}

/// Deterministic front-end port in the non-privileged range, derived from the
/// logical process id so operators and tests can compute it without asking.
pub fn balancer_port(id: &str) -> u16 {
    let mut hash = 2166136261_u32;
    for byte in id.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }

    let range = 20000_u16;
    40000 + (hash % range as u32) as u16
}

pub fn backend_port(front_port: u16, index: u32) -> u16 {
    front_port.wrapping_add(1).wrapping_add(index as u16)
}

struct Backend {
    status: tokio::sync::watch::Receiver<supervisor::SupervisorStatus>,
    port: u16,
    active: Arc<AtomicUsize>,
}

struct Balancer {
    id: String,
    prefix: String,
    port: u16,
    backends: Vec<Backend>,
    strategy: Strategy,
}

impl Balancer {
    async fn run(self, shutdown: CancellationToken) {
        let listener = match bind_front(self.port).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!("cluster {}: balancer disabled: {err}", self.id);
                return;
            }
        };
        info!(
            "cluster {}: balancing {} on 127.0.0.1:{}",
            self.id, self.prefix, self.port
        );

        let mut cursor = 0_usize;
        loop {
            let incoming = tokio::select! {
                incoming = listener.accept() => incoming,
                _ = shutdown.cancelled() => return,
            };
            let (mut downstream, _) = match incoming {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("cluster {}: accept failed: {err}", self.id);
                    continue;
                }
            };

            let states: Vec<SupervisorState> = self
                .backends
                .iter()
                .map(|backend| backend.status.borrow().state)
                .collect();
            let active: Vec<usize> = self
                .backends
                .iter()
                .map(|backend| backend.active.load(Ordering::Relaxed))
                .collect();

            let Some(choice) = pick_backend(&states, &active, &mut cursor, self.strategy) else {
                debug!("cluster {}: no running replica, refusing", self.id);
                tokio::spawn(async move {
                    let _ = downstream.write_all(REFUSAL_RESPONSE).await;
                    let _ = downstream.shutdown().await;
                });
                continue;
            };

            let port = self.backends[choice].port;
            let active = Arc::clone(&self.backends[choice].active);
            let id = self.id.clone();
            active.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                match TcpStream::connect(("127.0.0.1", port)).await {
                    Ok(mut upstream) => {
                        let _ = tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await;
                    }
                    Err(err) => {
                        debug!("cluster {id}: replica on port {port} refused: {err}");
                        let _ = downstream.write_all(REFUSAL_RESPONSE).await;
                        let _ = downstream.shutdown().await;
                    }
                }
                active.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

async fn bind_front(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to bind balancer endpoint on 127.0.0.1:{port}"))
}

/// Pick the replica a new connection lands on. Only replicas whose
/// supervisor reports Running at dispatch time are eligible.
fn pick_backend(
    states: &[SupervisorState],
    active: &[usize],
    cursor: &mut usize,
    strategy: Strategy,
) -> Option<usize> {
    match strategy {
        Strategy::RoundRobin => {
            for offset in 0..states.len() {
                let index = (*cursor + offset) % states.len();
                if states[index] == SupervisorState::Running {
                    *cursor = index + 1;
                    return Some(index);
                }
            }
            None
        }
        Strategy::LeastConnections => states
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == SupervisorState::Running)
            .min_by_key(|(index, _)| active[*index])
            .map(|(index, _)| index),
    }
}
