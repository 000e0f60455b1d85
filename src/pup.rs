use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::{self, ClusterHandle};
use crate::config::Plan;
use crate::ipc::{self, BusRequest, BusResponse, CoreCommand, Relay};
use crate::logging::LogSink;
use crate::supervisor::{self, SupervisorContext, SupervisorHandle, SupervisorMsg};

const COMMAND_QUEUE_DEPTH: usize = 64;
/// Slack on top of the largest per-process stop deadline before the core
/// force-kills whatever is left.
const FORCE_KILL_GRACE: Duration = Duration::from_millis(250);

enum Unit {
    Single(SupervisorHandle),
    Cluster(ClusterHandle),
}

impl Unit {
    fn logical_id(&self) -> &str {
        match self {
            Unit::Single(handle) => &handle.id,
            Unit::Cluster(cluster) => &cluster.id,
        }
    }

    fn members(&self) -> Vec<&SupervisorHandle> {
        match self {
            Unit::Single(handle) => vec![handle],
            Unit::Cluster(cluster) => cluster.members.iter().collect(),
        }
    }
}

/// Build every supervisor from the plan, serve the bus, and run until a
/// terminate command (or CTRL-C) finishes the shutdown sequence.
pub async fn run(plan: Plan) -> Result<()> {
    let (sink, sink_join) = LogSink::spawn(&plan.logger).await?;
    let shutdown = CancellationToken::new();
    let kill = CancellationToken::new();

    // Bind before spawning children so a second core in the same directory
    // refuses without side effects.
    let endpoint = ipc::bind(&plan.ipc_path).await?;

    let mut units = Vec::with_capacity(plan.processes.len());
    let mut joins: Vec<JoinHandle<()>> = Vec::new();
    for spec in &plan.processes {
        if spec.instances > 1 {
            let (cluster, cluster_joins) =
                cluster::spawn(spec, &plan.ipc_path, &sink, shutdown.clone(), kill.clone());
            units.push(Unit::Cluster(cluster));
            joins.extend(cluster_joins);
        } else {
            let (handle, join) = supervisor::spawn(SupervisorContext {
                id: spec.id.clone(),
                spec: spec.clone(),
                instance_index: 0,
                instance_count: 1,
                extra_env: Vec::new(),
                ipc_path: plan.ipc_path.clone(),
                sink: sink.clone(),
                shutdown: shutdown.clone(),
                kill: kill.clone(),
            });
            units.push(Unit::Single(handle));
            joins.push(join);
        }
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let relay = Relay::default();
    let bus_cancel = CancellationToken::new();
    let bus_task = tokio::spawn(ipc::serve(
        endpoint,
        cmd_tx,
        relay,
        bus_cancel.clone(),
    ));

    info!(
        "pup core started: {} process(es), bus at {}",
        units.len(),
        plan.ipc_path.display()
    );

    let core = Core {
        units,
        shutdown,
        kill,
        max_stop_ms: plan.max_terminate_timeout_ms(),
    };
    let outcome = core.run(cmd_rx, joins).await;

    bus_cancel.cancel();
    let _ = bus_task.await;
    #[cfg(unix)]
    let _ = std::fs::remove_file(&plan.ipc_path);
    drop(sink);
    let _ = sink_join.await;

    info!("pup core stopped");
    outcome
}

struct Core {
    units: Vec<Unit>,
    shutdown: CancellationToken,
    kill: CancellationToken,
    max_stop_ms: u64,
}

impl Core {
    async fn run(
        self,
        mut commands: mpsc::Receiver<CoreCommand>,
        joins: Vec<JoinHandle<()>>,
    ) -> Result<()> {
        let mut supervisors_done = tokio::spawn(async move {
            let mut failures = 0_u32;
            for join in joins {
                if join.await.is_err() {
                    failures += 1;
                }
            }
            failures
        });

        let mut terminating = false;
        let mut killed = false;
        let mut force_at = Instant::now();

        let failures = loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    let response = self
                        .execute(command.request, &mut terminating, &mut killed, &mut force_at)
                        .await;
                    let _ = command.resp.send(response);
                }
                ctrl = tokio::signal::ctrl_c() => {
                    if let Err(err) = ctrl {
                        warn!("failed to wait for CTRL-C signal: {err}");
                    }
                    info!("received shutdown signal; stopping supervised processes");
                    self.enter_terminate(&mut terminating, &mut killed, &mut force_at);
                }
                _ = tokio::time::sleep_until(force_at), if terminating && !killed => {
                    warn!("stop deadline passed; force-killing remaining children");
                    killed = true;
                    self.kill.cancel();
                }
                outcome = &mut supervisors_done, if terminating => {
                    break outcome.unwrap_or(1);
                }
            }
        };

        if failures > 0 {
            error!("{failures} supervisor task(s) ended abnormally");
            return Err(crate::errors::PupError::Internal(format!(
                "{failures} supervisor task(s) panicked"
            ))
            .into());
        }
        Ok(())
    }

    async fn execute(
        &self,
        request: BusRequest,
        terminating: &mut bool,
        killed: &mut bool,
        force_at: &mut Instant,
    ) -> BusResponse {
        match request {
            BusRequest::Status => {
                let mut response = BusResponse::ok("ok");
                response.processes = Some(
                    self.units
                        .iter()
                        .flat_map(Unit::members)
                        .map(SupervisorHandle::status)
                        .collect(),
                );
                response
            }
            BusRequest::Terminate => {
                if *terminating {
                    // A second terminate skips straight to the kill.
                    if !*killed {
                        *killed = true;
                        self.kill.cancel();
                    }
                    BusResponse::ok("force-killing")
                } else {
                    self.enter_terminate(terminating, killed, force_at);
                    BusResponse::ok("terminating")
                }
            }
            BusRequest::Start { id } => self.dispatch(&id, SupervisorMsg::Start, "start").await,
            BusRequest::Stop { id } => self.dispatch(&id, SupervisorMsg::Stop, "stop").await,
            BusRequest::Restart { id } => {
                self.dispatch(&id, SupervisorMsg::Restart, "restart").await
            }
            BusRequest::Block { id } => self.dispatch(&id, SupervisorMsg::Block, "block").await,
            BusRequest::Unblock { id } => {
                self.dispatch(&id, SupervisorMsg::Unblock, "unblock").await
            }
            // Subscribe/send never reach the core queue; they are handled on
            // the connection itself.
            other => BusResponse::error(format!(
                "unexpected {} request on the command queue",
                other.name()
            )),
        }
    }

    fn enter_terminate(
        &self,
        terminating: &mut bool,
        killed: &mut bool,
        force_at: &mut Instant,
    ) {
        if *terminating {
            if !*killed {
                *killed = true;
                self.kill.cancel();
            }
            return;
        }
        *terminating = true;
        *force_at = Instant::now() + Duration::from_millis(self.max_stop_ms) + FORCE_KILL_GRACE;
        self.shutdown.cancel();
    }

    async fn dispatch(&self, id: &str, msg: SupervisorMsg, verb: &str) -> BusResponse {
        let targets = self.resolve(id);
        if targets.is_empty() {
            return BusResponse::error(
                crate::errors::PupError::UnknownProcess(id.to_string()).to_string(),
            );
        }
        for handle in &targets {
            if !handle.send(msg).await {
                return BusResponse::error(format!("{} is shutting down", handle.id));
            }
        }
        if targets.len() == 1 {
            BusResponse::ok(format!("{verb} {}", targets[0].id))
        } else {
            BusResponse::ok(format!("{verb} {id} ({} instances)", targets.len()))
        }
    }

    /// A logical id addresses every member of its cluster; an instance id
    /// (`{id}-k`) addresses just that replica.
    fn resolve(&self, id: &str) -> Vec<&SupervisorHandle> {
        for unit in &self.units {
            if unit.logical_id() == id {
                return unit.members();
            }
        }
        for unit in &self.units {
            if let Unit::Cluster(cluster) = unit {
                if let Some(member) = cluster.members.iter().find(|member| member.id == id) {
                    return vec![member];
                }
            }
        }
        Vec::new()
    }
}
