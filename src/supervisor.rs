use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::child::{self, ChildExit, RunningChild};
use crate::config::ProcessSpec;
use crate::cron::CronExpr;
use crate::logging::LogSink;
use crate::watcher::{ChangeEvent, Watcher, DEFAULT_DEBOUNCE, DEFAULT_POLL_INTERVAL};

const INBOX_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Blocked,
    Failed,
    Finished,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            SupervisorState::Created => "created",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Stopped => "stopped",
            SupervisorState::Blocked => "blocked",
            SupervisorState::Failed => "failed",
            SupervisorState::Finished => "finished",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub at: DateTime<Utc>,
}

/// Snapshot published through the status channel after every transition, so
/// the core and cluster front-ends always dispatch against current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub id: String,
    pub state: SupervisorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<LastExit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cron_fire: Option<DateTime<Utc>>,
    pub blocked: bool,
}

/// Operator-facing triggers. Cron ticks, watch events, child exits and the
/// shutdown tokens are folded into the same serial loop, so every trigger is
/// applied in arrival order with no locking on supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorMsg {
    Start,
    Stop,
    Restart,
    Block,
    Unblock,
}

/// Why a spawn happens; decides what the restart counter does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartReason {
    /// Operator start/restart: resets the counter.
    External,
    /// Autostart, cron fire, or a watch start from idle: counter unchanged.
    Scheduled,
    /// Policy- or watch-driven respawn of a child that was alive: counts.
    Bounce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Remain,
    Start(StartReason),
}

/// What a child exit under RUNNING leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitDecision {
    Finish,
    Fail,
    Retry,
}

fn decide_exit(spec: &ProcessSpec, restarts: u32, success: bool) -> ExitDecision {
    if !spec.restart.should_restart(success) {
        return if success {
            ExitDecision::Finish
        } else {
            ExitDecision::Fail
        };
    }
    match spec.restart_limit {
        Some(limit) if restarts >= limit => ExitDecision::Fail,
        _ => ExitDecision::Retry,
    }
}

pub struct SupervisorContext {
    pub id: String,
    pub spec: ProcessSpec,
    pub instance_index: u32,
    pub instance_count: u32,
    pub extra_env: Vec<(String, String)>,
    pub ipc_path: PathBuf,
    pub sink: LogSink,
    pub shutdown: CancellationToken,
    pub kill: CancellationToken,
}

#[derive(Clone)]
pub struct SupervisorHandle {
    pub id: String,
    tx: mpsc::Sender<SupervisorMsg>,
    status_rx: watch::Receiver<SupervisorStatus>,
}

impl SupervisorHandle {
    pub async fn send(&self, msg: SupervisorMsg) -> bool {
        self.tx.send(msg).await.is_ok()
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status_rx.borrow().clone()
    }

    pub fn status_rx(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_rx.clone()
    }
}

pub fn spawn(ctx: SupervisorContext) -> (SupervisorHandle, JoinHandle<()>) {
    let (tx, inbox) = mpsc::channel(INBOX_DEPTH);
    let (exit_tx, exit_rx) = mpsc::unbounded_channel();
    let initial = SupervisorStatus {
        id: ctx.id.clone(),
        state: SupervisorState::Created,
        pid: None,
        restarts: 0,
        last_exit: None,
        next_cron_fire: None,
        blocked: false,
    };
    let (status_tx, status_rx) = watch::channel(initial);

    let handle = SupervisorHandle {
        id: ctx.id.clone(),
        tx,
        status_rx,
    };

    let actor = Supervisor {
        ctx,
        cron: None,
        state: SupervisorState::Created,
        child: None,
        restarts: 0,
        last_exit: None,
        next_cron: None,
        restart_due: None,
        stop_deadline: None,
        pending: Pending::Remain,
        terminating: false,
        killed: false,
        done: false,
        status_tx,
        exit_tx,
    };
    let join = tokio::spawn(actor.run(inbox, exit_rx));
    (handle, join)
}

struct Supervisor {
    ctx: SupervisorContext,
    cron: Option<CronExpr>,
    state: SupervisorState,
    child: Option<RunningChild>,
    restarts: u32,
    last_exit: Option<LastExit>,
    next_cron: Option<DateTime<Utc>>,
    restart_due: Option<Instant>,
    stop_deadline: Option<Instant>,
    pending: Pending,
    terminating: bool,
    killed: bool,
    done: bool,
    status_tx: watch::Sender<SupervisorStatus>,
    exit_tx: mpsc::UnboundedSender<ChildExit>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<SupervisorMsg>,
        mut exit_rx: mpsc::UnboundedReceiver<ChildExit>,
    ) {
        self.cron = self
            .ctx
            .spec
            .cron
            .as_deref()
            .and_then(|expr| CronExpr::parse(expr).ok());
        if let Some(cron) = &self.cron {
            self.next_cron = cron.next_after(Utc::now());
        }

        let mut watch_rx = self.start_watcher();
        let shutdown = self.ctx.shutdown.clone();
        let kill = self.ctx.kill.clone();

        if self.ctx.spec.autostart {
            self.start_child(StartReason::Scheduled);
        }
        self.publish();

        loop {
            let stop_at = self.stop_deadline.unwrap_or_else(far_future);
            let restart_at = self.restart_due.unwrap_or_else(far_future);
            let cron_at = self
                .next_cron
                .map(instant_for)
                .unwrap_or_else(far_future);

            tokio::select! {
                biased;
                Some(exit) = exit_rx.recv() => self.on_child_exit(exit),
                _ = kill.cancelled(), if !self.killed => self.on_kill(),
                _ = shutdown.cancelled(), if !self.terminating => self.on_shutdown(),
                maybe = inbox.recv() => match maybe {
                    Some(msg) => self.on_msg(msg),
                    None => break,
                },
                change = next_change(&mut watch_rx) => self.on_watch(change),
                _ = tokio::time::sleep_until(stop_at), if self.stop_deadline.is_some() =>
                    self.on_stop_deadline(),
                _ = tokio::time::sleep_until(restart_at), if self.restart_due.is_some() =>
                    self.on_restart_due(),
                _ = tokio::time::sleep_until(cron_at), if self.next_cron.is_some() =>
                    self.on_cron_fire(),
            }

            self.publish();
            if self.done {
                break;
            }
        }
    }

    fn start_watcher(&self) -> Option<mpsc::Receiver<ChangeEvent>> {
        if self.ctx.spec.watch.is_empty() {
            return None;
        }
        match Watcher::spawn(
            self.ctx.spec.watch.clone(),
            DEFAULT_DEBOUNCE,
            DEFAULT_POLL_INTERVAL,
            self.ctx.shutdown.child_token(),
        ) {
            Ok(watcher) => Some(watcher.events),
            Err(err) => {
                // The watch trigger is disabled for this supervisor only.
                warn!("process {}: {err}", self.ctx.id);
                None
            }
        }
    }

    fn on_msg(&mut self, msg: SupervisorMsg) {
        if self.state == SupervisorState::Blocked
            && !matches!(msg, SupervisorMsg::Unblock | SupervisorMsg::Block)
        {
            debug!("process {}: dropping {msg:?} while blocked", self.ctx.id);
            return;
        }

        match msg {
            SupervisorMsg::Start => {
                if self.child.is_some() {
                    if self.state == SupervisorState::Stopping {
                        self.pending = Pending::Start(StartReason::External);
                    }
                    return;
                }
                self.restart_due = None;
                self.start_child(StartReason::External);
            }
            SupervisorMsg::Stop => {
                self.restart_due = None;
                match self.state {
                    SupervisorState::Stopping => self.pending = Pending::Remain,
                    SupervisorState::Starting | SupervisorState::Running => {
                        self.begin_stop(Pending::Remain);
                    }
                    // A stop during the restart delay lands here: the delay is
                    // already cancelled and the state stays Stopped.
                    _ => {}
                }
            }
            SupervisorMsg::Restart => {
                self.restart_due = None;
                if self.child.is_some() {
                    self.begin_stop(Pending::Start(StartReason::External));
                } else {
                    self.start_child(StartReason::External);
                }
            }
            SupervisorMsg::Block => {
                if self.state == SupervisorState::Blocked {
                    return;
                }
                self.restart_due = None;
                self.pending = Pending::Remain;
                self.state = SupervisorState::Blocked;
                info!("process {} blocked", self.ctx.id);
            }
            SupervisorMsg::Unblock => {
                if self.state != SupervisorState::Blocked {
                    return;
                }
                self.state = match (&self.child, self.stop_deadline) {
                    (Some(_), Some(_)) => SupervisorState::Stopping,
                    (Some(_), None) => SupervisorState::Running,
                    (None, _) => SupervisorState::Created,
                };
                info!("process {} unblocked", self.ctx.id);
            }
        }
    }

    fn on_watch(&mut self, _change: ChangeEvent) {
        if self.state == SupervisorState::Blocked {
            debug!("process {}: dropping watch event while blocked", self.ctx.id);
            return;
        }
        if self.restart_due.is_some() {
            return;
        }

        match self.state {
            SupervisorState::Starting | SupervisorState::Running => {
                info!("process {}: filesystem change, restarting", self.ctx.id);
                self.begin_stop(Pending::Start(StartReason::Bounce));
            }
            SupervisorState::Stopping => {
                if self.pending == Pending::Remain {
                    self.pending = Pending::Start(StartReason::Bounce);
                }
            }
            SupervisorState::Created | SupervisorState::Stopped | SupervisorState::Finished => {
                info!("process {}: filesystem change, starting", self.ctx.id);
                self.start_child(StartReason::Scheduled);
            }
            SupervisorState::Failed | SupervisorState::Blocked => {}
        }
    }

    fn on_cron_fire(&mut self) {
        let now = Utc::now();
        self.next_cron = self
            .cron
            .as_ref()
            .and_then(|cron| cron.next_after(now));

        if self.state == SupervisorState::Blocked {
            debug!("process {}: dropping cron fire while blocked", self.ctx.id);
            return;
        }
        if self.child.is_some() {
            debug!(
                "process {}: cron fired while child is running, skipping",
                self.ctx.id
            );
            return;
        }
        if self.restart_due.is_some() || self.state == SupervisorState::Stopping {
            debug!("process {}: cron fired mid-transition, dropped", self.ctx.id);
            return;
        }

        match self.state {
            SupervisorState::Created | SupervisorState::Stopped | SupervisorState::Finished => {
                self.start_child(StartReason::Scheduled);
            }
            _ => {}
        }
    }

    fn on_child_exit(&mut self, exit: ChildExit) {
        // Stale exits (a force-killed predecessor) must not touch the
        // current child's bookkeeping.
        match &self.child {
            Some(child) if child.pid() == exit.pid => {}
            _ => return,
        }
        self.child = None;
        self.stop_deadline = None;
        self.last_exit = Some(LastExit {
            code: exit.code,
            signal: exit.signal,
            at: exit.at,
        });

        if self.terminating {
            self.state = SupervisorState::Stopped;
            self.done = true;
            return;
        }

        match self.state {
            SupervisorState::Blocked => {}
            SupervisorState::Stopping => {
                self.state = SupervisorState::Stopped;
                match std::mem::replace(&mut self.pending, Pending::Remain) {
                    Pending::Remain => {}
                    Pending::Start(reason) => self.start_child(reason),
                }
            }
            SupervisorState::Starting | SupervisorState::Running => {
                let success = exit.success && !exit.wait_error;
                match decide_exit(&self.ctx.spec, self.restarts, success) {
                    ExitDecision::Finish => {
                        info!("process {} finished", self.ctx.id);
                        self.state = SupervisorState::Finished;
                    }
                    ExitDecision::Fail => {
                        warn!(
                            "process {} failed (exit code {:?}, signal {:?})",
                            self.ctx.id, exit.code, exit.signal
                        );
                        self.state = SupervisorState::Failed;
                    }
                    ExitDecision::Retry => {
                        self.state = SupervisorState::Stopped;
                        self.restart_due = Some(
                            Instant::now()
                                + Duration::from_millis(self.ctx.spec.restart_delay_ms),
                        );
                    }
                }
            }
            _ => {}
        }
    }

    fn on_restart_due(&mut self) {
        self.restart_due = None;
        if self.state == SupervisorState::Stopped && self.child.is_none() {
            self.start_child(StartReason::Bounce);
        }
    }

    fn on_stop_deadline(&mut self) {
        self.stop_deadline = None;
        if let Some(child) = &self.child {
            warn!(
                "process {}: stop timed out, force-killing pid {}",
                self.ctx.id,
                child.pid()
            );
            child.force_kill();
        }
    }

    fn on_shutdown(&mut self) {
        self.terminating = true;
        self.restart_due = None;
        self.next_cron = None;
        if self.child.is_some() {
            self.begin_stop(Pending::Remain);
        } else {
            self.state = SupervisorState::Stopped;
            self.done = true;
        }
    }

    fn on_kill(&mut self) {
        self.killed = true;
        if let Some(child) = &self.child {
            warn!("process {}: force-killing pid {}", self.ctx.id, child.pid());
            child.force_kill();
        }
    }

    fn begin_stop(&mut self, pending: Pending) {
        if let Some(child) = &self.child {
            child.signal_stop();
        }
        self.state = SupervisorState::Stopping;
        self.stop_deadline = Some(
            Instant::now() + Duration::from_millis(self.ctx.spec.terminate_timeout_ms),
        );
        self.pending = pending;
    }

    fn start_child(&mut self, reason: StartReason) {
        if self.child.is_some() {
            return;
        }
        match reason {
            StartReason::External => self.restarts = 0,
            StartReason::Bounce => self.restarts = self.restarts.saturating_add(1),
            StartReason::Scheduled => {}
        }

        self.state = SupervisorState::Starting;
        self.publish();

        let spec = &self.ctx.spec;
        let cwd = spec
            .cwd
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let mut extra_env = vec![
            ("PUP_PROCESS_ID".to_string(), self.ctx.id.clone()),
            (
                "PUP_CLUSTER_INSTANCE".to_string(),
                self.ctx.instance_index.to_string(),
            ),
            (
                "PUP_CLUSTER_SIZE".to_string(),
                self.ctx.instance_count.to_string(),
            ),
            (
                "PUP_IPC".to_string(),
                self.ctx.ipc_path.display().to_string(),
            ),
        ];
        extra_env.extend(self.ctx.extra_env.iter().cloned());

        match child::spawn(
            &self.ctx.id,
            &spec.cmd,
            &cwd,
            &spec.env,
            &extra_env,
            &self.ctx.sink,
            self.exit_tx.clone(),
        ) {
            Ok(running) => {
                info!("started process {} with pid {}", self.ctx.id, running.pid());
                self.child = Some(running);
                self.state = SupervisorState::Running;
            }
            Err(err) => {
                warn!("process {}: {err}", self.ctx.id);
                // A failed spawn is a failed start; it retries on the same
                // delay and counts toward the restart limit.
                match decide_exit(spec, self.restarts, false) {
                    ExitDecision::Retry => {
                        self.state = SupervisorState::Stopped;
                        self.restart_due =
                            Some(Instant::now() + Duration::from_millis(spec.restart_delay_ms));
                    }
                    _ => {
                        self.state = SupervisorState::Failed;
                    }
                }
            }
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(SupervisorStatus {
            id: self.ctx.id.clone(),
            state: self.state,
            pid: self.child.as_ref().map(RunningChild::pid),
            restarts: self.restarts,
            last_exit: self.last_exit,
            next_cron_fire: self.next_cron,
            blocked: self.state == SupervisorState::Blocked,
        });
    }
}

async fn next_change(rx: &mut Option<mpsc::Receiver<ChangeEvent>>) -> ChangeEvent {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(change) => change,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

fn instant_for(at: DateTime<Utc>) -> Instant {
    let wait = (at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    Instant::now() + wait
}


#[cfg(all(test, unix))]
mod actor_tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{spawn, SupervisorContext, SupervisorHandle, SupervisorMsg, SupervisorState};
    use crate::config::{LoggerOptions, ProcessSpec, RestartPolicy};
    use crate::logging::LogSink;

    struct Fixture {
        handle: SupervisorHandle,
        join: tokio::task::JoinHandle<()>,
        shutdown: CancellationToken,
        _kill: CancellationToken,
        dir: PathBuf,
    }

    impl Fixture {
        async fn new(prefix: &str, spec: ProcessSpec) -> Self {
            let nonce = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock failure")
                .as_nanos();
            let dir = std::env::temp_dir().join(format!("pup-sup-{prefix}-{nonce}"));
            std::fs::create_dir_all(&dir).expect("failed to create temp directory");

            let options = LoggerOptions {
                stdout: Some(dir.join("sink.log")),
                decorate: Some(false),
                colors: None,
            };
            let (sink, _) = LogSink::spawn(&options).await.expect("failed to spawn sink");
            let shutdown = CancellationToken::new();
            let kill = CancellationToken::new();
            let id = spec.id.clone();
            let (handle, join) = spawn(SupervisorContext {
                id,
                spec,
                instance_index: 0,
                instance_count: 1,
                extra_env: Vec::new(),
                ipc_path: dir.join("pup.sock"),
                sink,
                shutdown: shutdown.clone(),
                kill: kill.clone(),
            });

            Self {
                handle,
                join,
                shutdown,
                _kill: kill,
                dir,
            }
        }

        async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> bool
        where
            F: FnMut(&super::SupervisorStatus) -> bool,
        {
            let mut rx = self.handle.status_rx();
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if predicate(&rx.borrow().clone()) {
                    return true;
                }
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return false;
                }
                if tokio::time::timeout(remaining, rx.changed()).await.is_err() {
                    return predicate(&rx.borrow().clone());
                }
            }
        }

        async fn finish(self) {
            self.shutdown.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(5), self.join).await;
            let _ = std::fs::remove_dir_all(self.dir);
        }
    }

    fn base_spec(id: &str, cmd: &[&str]) -> ProcessSpec {
        ProcessSpec {
            id: id.to_string(),
            cmd: cmd.iter().map(|value| value.to_string()).collect(),
            cwd: Some(std::env::temp_dir()),
            env: HashMap::new(),
            autostart: false,
            cron: None,
            watch: Vec::new(),
            restart: RestartPolicy::Never,
            restart_delay_ms: 20,
            restart_limit: None,
            terminate_timeout_ms: 1000,
            instances: 1,
            path: None,
        }
    }

    #[tokio::test]
    async fn autostart_with_restart_always_keeps_respawning() {
        let mut spec = base_spec("always", &["true"]);
        spec.autostart = true;
        spec.restart = RestartPolicy::Always;
        let fixture = Fixture::new("always", spec).await;

        let reached = fixture
            .wait_for(Duration::from_secs(10), |status| {
                assert_ne!(status.state, SupervisorState::Failed);
                status.restarts >= 3
            })
            .await;
        assert!(reached, "expected at least three policy restarts");

        fixture.finish().await;
    }

    #[tokio::test]
    async fn restart_limit_parks_the_supervisor_in_failed() {
        let mut spec = base_spec("limited", &["false"]);
        spec.autostart = true;
        spec.restart = RestartPolicy::Always;
        spec.restart_limit = Some(2);
        let fixture = Fixture::new("limited", spec).await;

        let reached = fixture
            .wait_for(Duration::from_secs(10), |status| {
                status.state == SupervisorState::Failed
            })
            .await;
        assert!(reached, "expected the supervisor to fail");
        assert_eq!(fixture.handle.status().restarts, 2);

        fixture.finish().await;
    }

    #[tokio::test]
    async fn clean_exit_with_restart_never_finishes_for_good() {
        let mut spec = base_spec("oneshot", &["true"]);
        spec.autostart = true;
        let fixture = Fixture::new("oneshot", spec).await;

        let reached = fixture
            .wait_for(Duration::from_secs(10), |status| {
                status.state == SupervisorState::Finished
            })
            .await;
        assert!(reached, "expected the supervisor to finish");
        let status = fixture.handle.status();
        assert_eq!(status.restarts, 0);
        assert!(status.last_exit.is_some(), "last exit should be recorded");
        assert_eq!(status.last_exit.expect("checked").code, Some(0));

        fixture.finish().await;
    }

    #[tokio::test]
    async fn manual_stop_cancels_a_pending_restart_delay() {
        let mut spec = base_spec("delay", &["true"]);
        spec.autostart = true;
        spec.restart = RestartPolicy::Always;
        spec.restart_delay_ms = 10_000;
        let fixture = Fixture::new("delay", spec).await;

        let reached = fixture
            .wait_for(Duration::from_secs(10), |status| {
                status.state == SupervisorState::Stopped && status.last_exit.is_some()
            })
            .await;
        assert!(reached, "expected the first run to exit into the delay");

        assert!(fixture.handle.send(SupervisorMsg::Stop).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = fixture.handle.status();
        assert_eq!(status.state, SupervisorState::Stopped);
        assert_eq!(status.restarts, 0, "the delayed respawn must not happen");

        fixture.finish().await;
    }

    #[tokio::test]
    async fn blocked_supervisor_ignores_start_until_unblocked() {
        let spec = base_spec("blocked", &["true"]);
        let fixture = Fixture::new("blocked", spec).await;

        assert!(fixture.handle.send(SupervisorMsg::Block).await);
        assert!(fixture.handle.send(SupervisorMsg::Start).await);
        let blocked = fixture
            .wait_for(Duration::from_secs(5), |status| {
                status.state == SupervisorState::Blocked
            })
            .await;
        assert!(blocked, "expected the supervisor to report blocked");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = fixture.handle.status();
        assert!(status.last_exit.is_none(), "no child should have run");
        assert!(status.pid.is_none());

        assert!(fixture.handle.send(SupervisorMsg::Unblock).await);
        let created = fixture
            .wait_for(Duration::from_secs(5), |status| {
                status.state == SupervisorState::Created && !status.blocked
            })
            .await;
        assert!(created, "unblock without a child should land in created");

        assert!(fixture.handle.send(SupervisorMsg::Start).await);
        let finished = fixture
            .wait_for(Duration::from_secs(10), |status| {
                status.state == SupervisorState::Finished
            })
            .await;
        assert!(finished, "start after unblock should run the child");

        fixture.finish().await;
    }

    #[tokio::test]
    async fn spawn_failure_without_restart_fails_immediately() {
        let mut spec = base_spec("nospawn", &["/definitely/not/a/binary"]);
        spec.autostart = true;
        let fixture = Fixture::new("nospawn", spec).await;

        let failed = fixture
            .wait_for(Duration::from_secs(5), |status| {
                status.state == SupervisorState::Failed
            })
            .await;
        assert!(failed, "unspawnable command should fail the supervisor");

        fixture.finish().await;
    }

    #[tokio::test]
    async fn spawn_failures_count_toward_the_restart_limit() {
        let mut spec = base_spec("nospawn-retry", &["/definitely/not/a/binary"]);
        spec.autostart = true;
        spec.restart = RestartPolicy::Always;
        spec.restart_limit = Some(2);
        spec.restart_delay_ms = 10;
        let fixture = Fixture::new("nospawn-retry", spec).await;

        let failed = fixture
            .wait_for(Duration::from_secs(10), |status| {
                status.state == SupervisorState::Failed
            })
            .await;
        assert!(failed, "expected retries to exhaust the limit");
        assert_eq!(fixture.handle.status().restarts, 2);

        fixture.finish().await;
    }

    #[tokio::test]
    async fn watch_change_bounces_a_running_child() {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("pup-watch-trigger-{nonce}"));
        std::fs::create_dir_all(&dir).expect("failed to create watch directory");
        let target = dir.join("t");
        std::fs::write(&target, "seed").expect("failed to seed watch file");

        let mut spec = base_spec("watched", &["sleep", "60"]);
        spec.autostart = true;
        spec.watch = vec![target.clone()];
        spec.terminate_timeout_ms = 500;
        let fixture = Fixture::new("watched", spec).await;

        let running = fixture
            .wait_for(Duration::from_secs(10), |status| {
                status.state == SupervisorState::Running
            })
            .await;
        assert!(running, "expected the watched child to start");
        let first_pid = fixture.handle.status().pid.expect("running child has a pid");

        std::fs::write(&target, "changed contents").expect("failed to touch watch file");

        let bounced = fixture
            .wait_for(Duration::from_secs(15), |status| {
                status.state == SupervisorState::Running && status.pid != Some(first_pid)
            })
            .await;
        assert!(bounced, "expected a replacement child after the change");
        assert_eq!(fixture.handle.status().restarts, 1);

        fixture.finish().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn shutdown_stops_a_running_child() {
        let mut spec = base_spec("shutdown", &["sleep", "60"]);
        spec.autostart = true;
        spec.terminate_timeout_ms = 2000;
        let fixture = Fixture::new("shutdown", spec).await;

        let running = fixture
            .wait_for(Duration::from_secs(10), |status| {
                status.state == SupervisorState::Running
            })
            .await;
        assert!(running, "expected the child to start before shutdown");

        fixture.shutdown.cancel();
        let mut rx = fixture.handle.status_rx();
        let stopped = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow().state == SupervisorState::Stopped {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(stopped.is_ok(), "expected a stopped status after shutdown");
        assert_eq!(rx.borrow().state, SupervisorState::Stopped);

        fixture.finish().await;
    }
}
