//! Orchestrator.
//!
//! Keeps one worker per configured node alive and funnels everything the
//! workers report through a single channel into the [`Pipeline`], which
//! handles one record at a time: classify the labels, then drive the DNS,
//! cache and webhook sinks and wait for all three to settle before taking
//! the next record.  That single consumer is the only serialisation point
//! in the daemon; it keeps a `start` and a following `die` of the same
//! container from reaching the sinks in reverse order.

use std::collections::{HashMap, HashSet};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::config::{Node, NodeSource};
use crate::labels::classify;
use crate::runtime::RuntimeConnector;
use crate::sinks::{CacheSync, DnsBatcher, Webhook};
use crate::types::{ContainerChangeRecord, WorkerMessage, WorkerState};
use crate::watcher::{spawn_worker, Episode, WorkerHandle};

/// Capacity of the worker → orchestrator channel.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Record-by-record sink driver.
pub struct Pipeline {
    dns: DnsBatcher,
    cache: CacheSync,
    webhook: Option<Webhook>,
}

impl Pipeline {
    pub fn new(dns: DnsBatcher, cache: CacheSync, webhook: Option<Webhook>) -> Self {
        Self { dns, cache, webhook }
    }

    /// Drain the worker channel until every sender is gone.
    pub async fn consume(self, mut rx: mpsc::Receiver<WorkerMessage>) {
        while let Some(message) = rx.recv().await {
            self.handle(message).await;
        }
        info!("worker channel closed");
    }

    pub async fn handle(&self, message: WorkerMessage) {
        match message {
            WorkerMessage::Fault { node, error } => error!("[{}] {}", node, error),
            WorkerMessage::Change(record) => self.reconcile(&record).await,
        }
    }

    /// Bring every sink in line with one container record.
    pub async fn reconcile(&self, record: &ContainerChangeRecord) {
        let active = record.is_active();
        let labels = classify(&record.labels, active);
        info!(
            "[{}] container [{}] event [{}]",
            record.node, record.name, record.event
        );

        let webhook = async {
            if let Some(webhook) = &self.webhook {
                webhook.notify(record, labels.matched()).await;
            }
        };
        tokio::join!(
            self.dns.submit_all(&labels),
            self.cache.sync(&labels.routing, active),
            webhook
        );
    }
}

struct NodeSlot {
    node: Node,
    worker: WorkerHandle,
    episode: Arc<Episode>,
    respawn_logged: bool,
}

pub struct Orchestrator {
    connector: Arc<dyn RuntimeConnector>,
    source: Box<dyn NodeSource>,
    tx: mpsc::Sender<WorkerMessage>,
    slots: HashMap<String, NodeSlot>,
    supervisor_interval: Duration,
    reload_interval: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        connector: Arc<dyn RuntimeConnector>,
        source: Box<dyn NodeSource>,
        tx: mpsc::Sender<WorkerMessage>,
        supervisor_interval: Duration,
        reload_interval: Option<Duration>,
    ) -> Self {
        Self {
            connector,
            source,
            tx,
            slots: HashMap::new(),
            supervisor_interval,
            reload_interval,
        }
    }

    /// Start a worker for every node not yet watched and stop the workers
    /// of nodes that are no longer configured.  Settings of a node that is
    /// already watched take effect at its next respawn.
    pub fn apply_nodes(&mut self, nodes: Vec<Node>) {
        let wanted: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let removed: Vec<String> = self
            .slots
            .keys()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();
        for id in removed {
            info!(
                "node [{}] removed from configuration, stopping its {} worker",
                id,
                self.worker_state(&id)
            );
            self.slots.remove(&id);
        }

        for node in nodes {
            if let Some(slot) = self.slots.get_mut(&node.id) {
                slot.node = node;
                continue;
            }
            info!("starting worker for node [{}]", node.id);
            let episode = Arc::new(Episode::default());
            let worker = spawn_worker(
                node.clone(),
                Arc::clone(&self.connector),
                self.tx.clone(),
                Arc::clone(&episode),
                WorkerState::Starting,
            );
            self.slots.insert(
                node.id.clone(),
                NodeSlot {
                    node,
                    worker,
                    episode,
                    respawn_logged: false,
                },
            );
        }
    }

    /// Re-read the node list; a broken configuration keeps the current set.
    pub fn reload(&mut self) {
        match self.source.nodes() {
            Ok(nodes) => self.apply_nodes(nodes),
            Err(e) => error!("configuration reload failed: {}", e),
        }
    }

    /// One supervisor tick: replace every disconnected or dead worker.
    pub fn supervise(&mut self) {
        for slot in self.slots.values_mut() {
            let state = slot.worker.state();
            if state == WorkerState::Running {
                slot.respawn_logged = false;
                continue;
            }
            if !state.needs_respawn() {
                continue;
            }
            if !slot.respawn_logged {
                info!(
                    "node [{}] {}, attempting respawn after disconnect",
                    slot.node.id, state
                );
                slot.respawn_logged = true;
            }
            // Replacing the handle aborts the previous worker.
            slot.worker = spawn_worker(
                slot.node.clone(),
                Arc::clone(&self.connector),
                self.tx.clone(),
                Arc::clone(&slot.episode),
                WorkerState::Respawning,
            );
        }
    }

    pub fn worker_state(&self, node: &str) -> WorkerState {
        self.slots
            .get(node)
            .map(|slot| slot.worker.state())
            .unwrap_or(WorkerState::NotStarted)
    }

    /// Supervise workers and feed the pipeline until the consumer stops.
    pub async fn run(
        mut self,
        pipeline: Pipeline,
        rx: mpsc::Receiver<WorkerMessage>,
    ) -> anyhow::Result<()> {
        let mut consumer = tokio::spawn(pipeline.consume(rx));
        let mut supervisor = ticker(self.supervisor_interval);
        let mut reload = self.reload_interval.map(ticker);

        loop {
            tokio::select! {
                _ = supervisor.tick() => self.supervise(),
                _ = next_tick(&mut reload) => self.reload(),
                done = &mut consumer => {
                    return match done {
                        Ok(()) => Ok(()),
                        Err(e) => Err(anyhow::anyhow!("record pipeline failed: {}", e)),
                    };
                }
            }
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use super::*;
    use crate::labels::ClassifiedLabels;
    use crate::runtime::fake::FakeConnector;
    use crate::sinks::cache::memory::MemoryStore;
    use crate::sinks::dns::fake::{RecordingUpdater, StaticResolver};
    use crate::sinks::nsupdate::script;
    use crate::types::{EventKind, Labels};
    use crate::watcher::tests::test_node;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn dns_labels() -> Labels {
        labels(&[
            ("rfc2136/LAN/server", "10.0.0.1"),
            ("rfc2136/LAN/key", "abc"),
            ("rfc2136/LAN/host-a", "update add host.lan 300 A 10.0.0.2"),
        ])
    }

    struct Harness {
        pipeline: Pipeline,
        store: Arc<MemoryStore>,
        updater: Arc<RecordingUpdater>,
    }

    fn harness(resolver: StaticResolver, verify: bool) -> Harness {
        let store = Arc::new(MemoryStore::default());
        let updater = Arc::new(RecordingUpdater::default());
        let dns = DnsBatcher::new(Arc::new(resolver), updater.clone(), verify);
        // poll interval 300s + 30s buffer
        let cache = CacheSync::new(store.clone(), Duration::from_secs(330));
        Harness {
            pipeline: Pipeline::new(dns, cache, None),
            store,
            updater,
        }
    }

    fn record(name: &str, event: EventKind, labels: Labels) -> ContainerChangeRecord {
        ContainerChangeRecord::new("10.0.0.5", name, event, labels)
    }

    #[tokio::test]
    async fn routing_labels_follow_container_lifecycle() {
        let h = harness(StaticResolver::default(), false);
        let web = labels(&[("traefik/router/web", "Host(`a.com`)")]);

        h.pipeline.reconcile(&record("web1", EventKind::Start, web.clone())).await;
        assert_eq!(
            h.store.get("traefik/router/web"),
            Some(("Host(`a.com`)".to_string(), Duration::from_secs(330)))
        );

        h.pipeline.reconcile(&record("web1", EventKind::Die, web)).await;
        assert!(h.store.get("traefik/router/web").is_none());
    }

    #[tokio::test]
    async fn dns_labels_publish_on_start_and_revoke_on_stop() {
        let h = harness(StaticResolver::default(), false);

        h.pipeline.reconcile(&record("dns1", EventKind::Start, dns_labels())).await;
        let (server, key, statements) = h.updater.transactions().remove(0);
        assert_eq!(key, "abc");
        assert_eq!(
            script(&server, &statements),
            "server 10.0.0.1\nupdate add host.lan 300 A 10.0.0.2\nsend\nquit\n"
        );

        h.pipeline.reconcile(&record("dns1", EventKind::Die, dns_labels())).await;
        let transactions = h.updater.transactions();
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[1].2, vec!["update delete host.lan 300 A 10.0.0.2"]);
    }

    #[tokio::test]
    async fn verify_mode_skips_records_already_published() {
        let resolver = StaticResolver::with("host.lan", "A", &["10.0.0.2"]);
        let h = harness(resolver, true);

        h.pipeline.reconcile(&record("dns1", EventKind::Start, dns_labels())).await;
        assert!(h.updater.transactions().is_empty());
    }

    #[tokio::test]
    async fn repeated_poll_converges_to_the_same_state() {
        let h = harness(StaticResolver::with("host.lan", "A", &["10.0.0.2"]), true);
        let mut both = dns_labels();
        both.insert("traefik/router/web".into(), "Host(`a.com`)".into());
        let poll = record("web1", EventKind::Poll, both);

        h.pipeline.reconcile(&poll).await;
        let once = h.store.snapshot();
        h.pipeline.reconcile(&poll).await;
        assert_eq!(h.store.snapshot(), once);
        assert!(h.updater.transactions().is_empty());
    }

    #[tokio::test]
    async fn faults_are_logged_and_do_not_touch_sinks() {
        let h = harness(StaticResolver::default(), false);
        h.pipeline
            .handle(WorkerMessage::fault("10.0.0.5", "listContainers: refused"))
            .await;
        assert!(h.store.snapshot().is_empty());
        assert!(h.updater.transactions().is_empty());
    }

    #[tokio::test]
    async fn consumer_processes_records_in_arrival_order() {
        let h = harness(StaticResolver::default(), false);
        let (tx, rx) = mpsc::channel(8);
        let web = labels(&[("traefik/router/web", "Host(`a.com`)")]);
        tx.send(WorkerMessage::Change(record("web1", EventKind::Start, web.clone())))
            .await
            .unwrap();
        tx.send(WorkerMessage::Change(record("web1", EventKind::Die, web)))
            .await
            .unwrap();
        drop(tx);

        let store = h.store.clone();
        h.pipeline.consume(rx).await;
        assert!(store.get("traefik/router/web").is_none());
    }

    #[test]
    fn classification_feeds_the_webhook_with_every_matched_label() {
        let mut raw = dns_labels();
        raw.insert("traefik/router/web".into(), "x".into());
        raw.insert("maintainer".into(), "me".into());
        let classified: ClassifiedLabels = classify(&raw, true);
        let matched = classified.matched();
        assert_eq!(matched.len(), 4);
        assert!(!matched.contains_key("maintainer"));
    }

    struct StaticNodes(Mutex<Vec<Node>>);

    impl NodeSource for StaticNodes {
        fn nodes(&self) -> anyhow::Result<Vec<Node>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn orchestrator(connector: Arc<FakeConnector>, nodes: Vec<Node>) -> (Orchestrator, mpsc::Receiver<WorkerMessage>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let orchestrator = Orchestrator::new(
            connector,
            Box::new(StaticNodes(Mutex::new(nodes))),
            tx,
            Duration::from_secs(5),
            None,
        );
        (orchestrator, rx)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        time::timeout(Duration::from_secs(5), async {
            while !check() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    #[tokio::test]
    async fn one_worker_per_node() {
        let connector = Arc::new(FakeConnector::new());
        let (mut orch, _rx) = orchestrator(connector.clone(), vec![test_node("a"), test_node("b")]);

        orch.reload();
        eventually(|| {
            orch.worker_state("a") == WorkerState::Running && orch.worker_state("b") == WorkerState::Running
        })
        .await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        orch.reload();
        orch.supervise();
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        orch.apply_nodes(vec![test_node("a")]);
        assert_eq!(orch.worker_state("b"), WorkerState::NotStarted);
        assert_eq!(orch.worker_state("a"), WorkerState::Running);
    }

    #[tokio::test]
    async fn dead_worker_is_respawned_on_the_next_tick() {
        let connector = Arc::new(FakeConnector::new());
        connector.failures.store(1, Ordering::SeqCst);
        let (mut orch, mut rx) = orchestrator(connector.clone(), vec![test_node("a")]);

        orch.reload();
        assert!(matches!(rx.recv().await, Some(WorkerMessage::Fault { .. })));
        eventually(|| orch.worker_state("a") == WorkerState::Terminated).await;

        orch.supervise();
        eventually(|| orch.worker_state("a") == WorkerState::Running).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disconnected_node_is_respawned_without_repeating_the_warning() {
        let connector = Arc::new(FakeConnector::new());
        connector.runtime("a").script_pings(&[false, false]);
        let (mut orch, mut rx) = orchestrator(connector.clone(), vec![test_node("a")]);

        orch.reload();
        eventually(|| orch.worker_state("a") == WorkerState::Disconnected).await;
        assert!(matches!(rx.recv().await, Some(WorkerMessage::Fault { .. })));

        orch.supervise();
        eventually(|| orch.worker_state("a") == WorkerState::Disconnected).await;
        orch.supervise();
        eventually(|| orch.worker_state("a") == WorkerState::Running).await;

        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
        assert_eq!(orch.slots["a"].episode.warnings(), 1);
        // Only the first failure of the episode is reported.
        assert!(rx.try_recv().is_err());
    }
}
