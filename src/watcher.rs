//! Node watcher.
//!
//! One watcher owns the connection to one container runtime host and keeps
//! three independent loops going:
//!
//! * **Health probe** every `ping_interval`.  The first successful probe
//!   after start or after a disconnect (re-)opens the event subscription
//!   and asks for an immediate sweep.
//! * **Event subscription**: `start`/`die` (or the configured statuses) on
//!   containers trigger an inspect of that container.
//! * **Sweep** every `poll_interval`: every running container is inspected
//!   and reported as `poll`.  This is what converges the sinks when events
//!   were missed.
//!
//! Probes and sweeps are guarded so a stalled run makes the next tick a
//! no-op instead of queueing behind it.  Everything the watcher finds is
//! sent to the orchestrator as a [`WorkerMessage`].

use std::any::Any;
use std::fmt;
use std::future::{pending, Future};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::Node;
use crate::error::Result;
use crate::runtime::{ContainerRuntime, RuntimeConnector, RuntimeEvent};
use crate::types::{ContainerChangeRecord, EventKind, WorkerMessage, WorkerState};

/// Containers inspected in parallel during one sweep.
const SWEEP_CONCURRENCY: usize = 8;

/// Non-blocking single-flight flag: a second caller finding it held skips.
#[derive(Debug, Default)]
pub struct InFlight(AtomicBool);

pub struct InFlightPermit<'a>(&'a AtomicBool);

impl InFlight {
    pub fn try_acquire(&self) -> Option<InFlightPermit<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightPermit(&self.0))
    }
}

impl Drop for InFlightPermit<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Connection history of a node.  Outlives individual workers so a node
/// that stays down across respawns still warns only once.
#[derive(Debug, Default)]
pub struct Episode {
    warned: AtomicBool,
    connected_once: AtomicBool,
    warnings: AtomicUsize,
}

impl Episode {
    /// Record a failed connection; returns `true` for the first failure of
    /// an episode, which is also the only one that logs a warning.
    fn fail(&self, node: &str) -> bool {
        if self.warned.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.warnings.fetch_add(1, Ordering::Relaxed);
        if self.connected_once.load(Ordering::Acquire) {
            warn!("connection to node [{}] lost!", node);
        } else {
            warn!("connection to node [{}] failed!", node);
        }
        true
    }

    fn connect(&self, node: &str) {
        self.connected_once.store(true, Ordering::Release);
        if self.warned.swap(false, Ordering::AcqRel) {
            info!("connection to node [{}] restored", node);
        } else {
            info!("connected to node [{}]", node);
        }
    }

    /// Disconnect warnings logged so far.
    #[cfg(test)]
    pub fn warnings(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }
}

pub struct NodeWatcher {
    node: Node,
    runtime: Arc<dyn ContainerRuntime>,
    tx: mpsc::Sender<WorkerMessage>,
    state: watch::Sender<WorkerState>,
    episode: Arc<Episode>,
    probing: InFlight,
    sweeping: InFlight,
    /// Asks the sweep loop for an extra sweep after a (re)connect.
    resweep: Notify,
    events: Mutex<Option<JoinHandle<()>>>,
}

impl NodeWatcher {
    pub fn new(
        node: Node,
        runtime: Arc<dyn ContainerRuntime>,
        tx: mpsc::Sender<WorkerMessage>,
        state: watch::Sender<WorkerState>,
        episode: Arc<Episode>,
    ) -> Self {
        Self {
            node,
            runtime,
            tx,
            state,
            episode,
            probing: InFlight::default(),
            sweeping: InFlight::default(),
            resweep: Notify::new(),
            events: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Run the probe and sweep loops forever.  Both tick immediately and
    /// neither waits on the other; a successful (re)connect triggers an
    /// extra sweep.
    pub async fn run(self: Arc<Self>) {
        let _events = CloseEvents(&self);

        let probes = {
            let watcher = Arc::clone(&self);
            every(self.node.ping_interval, None, move || {
                let watcher = Arc::clone(&watcher);
                async move {
                    watcher.probe().await;
                }
            })
        };
        let sweeps = {
            let watcher = Arc::clone(&self);
            every(self.node.poll_interval, Some(&self.resweep), move || {
                let watcher = Arc::clone(&watcher);
                async move {
                    watcher.sweep().await;
                }
            })
        };
        tokio::join!(probes, sweeps);
    }

    /// One health probe.  Returns `false` if a probe was already running.
    pub async fn probe(self: &Arc<Self>) -> bool {
        let Some(_permit) = self.probing.try_acquire() else {
            debug!("[{}] probe still in flight, skipping", self.node.id);
            return false;
        };

        match self.runtime.ping().await {
            Ok(()) => {
                let previous = self.state.send_replace(WorkerState::Running);
                if previous != WorkerState::Running {
                    self.episode.connect(&self.node.id);
                    self.open_events();
                    self.resweep.notify_one();
                }
            }
            Err(e) => self.disconnect(format!("ping: {}", e)).await,
        }
        true
    }

    /// One full sweep.  Returns `false` if skipped, either because a sweep
    /// is already running or because the node is not connected.
    pub async fn sweep(&self) -> bool {
        let Some(_permit) = self.sweeping.try_acquire() else {
            debug!("[{}] sweep still in flight, skipping", self.node.id);
            return false;
        };
        if self.state() != WorkerState::Running {
            return false;
        }

        match self.runtime.list_running().await {
            Ok(ids) => {
                debug!("[{}] sweeping {} containers", self.node.id, ids.len());
                stream::iter(ids)
                    .for_each_concurrent(SWEEP_CONCURRENCY, |id| async move {
                        self.inspect_and_emit(&id, EventKind::Poll).await;
                    })
                    .await;
            }
            Err(e) => self.report(format!("listContainers: {}", e)).await,
        }
        true
    }

    /// Inspect one container and hand the result to the orchestrator.
    /// Failures are reported, not retried; the next sweep covers them.
    pub async fn inspect_and_emit(&self, id: &str, event: EventKind) {
        match self.runtime.inspect(id).await {
            Ok(details) => {
                let record =
                    ContainerChangeRecord::new(&self.node.id, details.name, event, details.labels);
                self.send(WorkerMessage::Change(record)).await;
            }
            Err(e) => self.report(format!("inspect [{}]: {}", id, e)).await,
        }
    }

    fn open_events(self: &Arc<Self>) {
        let stream = self.runtime.events(&self.node.events);
        let watcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let reader = AssertUnwindSafe(Arc::clone(&watcher).read_events(stream));
            if let Err(panic) = reader.catch_unwind().await {
                watcher
                    .disconnect(format!("event reader fault: {}", panic_message(&*panic)))
                    .await;
            }
        });
        let previous = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn close_events(&self) {
        let handle = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    async fn read_events(self: Arc<Self>, mut stream: BoxStream<'static, Result<RuntimeEvent>>) {
        info!("[{}] listening for container events", self.node.id);
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    if !event.kind.eq_ignore_ascii_case("container") || !self.node.accepts(&event.status) {
                        continue;
                    }
                    if let Some(kind) = EventKind::from_status(&event.status) {
                        self.inspect_and_emit(&event.id, kind).await;
                    }
                }
                Err(e) => {
                    self.disconnect(format!("getEvents: {}", e)).await;
                    return;
                }
            }
        }
        self.disconnect("event stream closed").await;
    }

    /// Enter the disconnected state.  Only the first failure of an episode
    /// warns and is reported; the event subscription is dropped so the next
    /// successful probe opens a fresh one.
    async fn disconnect(&self, reason: impl fmt::Display) {
        let previous = self.state.send_replace(WorkerState::Disconnected);
        if previous != WorkerState::Disconnected && self.episode.fail(&self.node.id) {
            self.report(reason).await;
        } else {
            debug!("[{}] still disconnected: {}", self.node.id, reason);
        }
        self.close_events();
    }

    async fn report(&self, error: impl fmt::Display) {
        self.send(WorkerMessage::fault(&self.node.id, error)).await;
    }

    async fn send(&self, message: WorkerMessage) {
        if self.tx.send(message).await.is_err() {
            debug!("[{}] orchestrator channel closed, dropping message", self.node.id);
        }
    }
}

/// Aborts the event reader when the worker's run future goes away.
struct CloseEvents<'a>(&'a NodeWatcher);

impl Drop for CloseEvents<'_> {
    fn drop(&mut self) {
        self.0.close_events();
    }
}

/// Spawn `task` now and then every `period`, plus once per `kick`.  Runs
/// are independent tasks; they are aborted when this future is dropped and
/// a panic in one of them resurfaces here.
async fn every<F, Fut>(period: Duration, kick: Option<&Notify>, mut task: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut ticker = time::interval_at(Instant::now(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut inflight = JoinSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                inflight.spawn(task());
            }
            _ = kicked(kick) => {
                inflight.spawn(task());
            }
            Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = done {
                    if e.is_panic() {
                        std::panic::resume_unwind(e.into_panic());
                    }
                }
            }
        }
    }
}

async fn kicked(kick: Option<&Notify>) {
    match kick {
        Some(kick) => kick.notified().await,
        None => pending().await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a spawned worker.  Dropping it stops the worker.
pub struct WorkerHandle {
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        if self.task.is_finished() {
            WorkerState::Terminated
        } else {
            *self.state.borrow()
        }
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start a worker for `node`.  The runtime client is created inside the
/// worker; a connect failure or a panic ends the worker as `Terminated`
/// after reporting the fault.
pub fn spawn_worker(
    node: Node,
    connector: Arc<dyn RuntimeConnector>,
    tx: mpsc::Sender<WorkerMessage>,
    episode: Arc<Episode>,
    initial: WorkerState,
) -> WorkerHandle {
    let (state_tx, state_rx) = watch::channel(initial);

    let task = tokio::spawn(async move {
        let id = node.id.clone();
        let runtime = match connector.connect(&node) {
            Ok(runtime) => runtime,
            Err(e) => {
                state_tx.send_replace(WorkerState::Terminated);
                error!("[{}] cannot create runtime client: {}", id, e);
                let _ = tx.send(WorkerMessage::fault(&id, format!("connect: {}", e))).await;
                return;
            }
        };

        let watcher = Arc::new(NodeWatcher::new(node, runtime, tx.clone(), state_tx, episode));
        let run = AssertUnwindSafe(Arc::clone(&watcher).run());
        if let Err(panic) = run.catch_unwind().await {
            watcher.state.send_replace(WorkerState::Terminated);
            watcher.close_events();
            let _ = tx
                .send(WorkerMessage::fault(
                    &id,
                    format!("worker fault: {}", panic_message(&*panic)),
                ))
                .await;
        }
    });

    WorkerHandle {
        state: state_rx,
        task,
    }
}
