//! The asynchronous state store.
//!
//! `StateStore` is a cheap `Clone` handle. All mutation happens on a single
//! background worker task that consumes a bounded update queue:
//!
//! 1. under the shared tree lock, translate the update into a transition
//!    and evaluate watchers against it;
//! 2. queue whatever the watchers appended as a new update;
//! 3. under the exclusive tree lock, commit the transition;
//! 4. reschedule the expiry sweep from the root's earliest expiry.
//!
//! Sweeps run on the same worker and go through the same steps, so no two
//! transitions ever commit concurrently. Readers (`visit`, `get`) only take
//! the shared lock and see a consistent snapshot for the whole call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use infotree_state::{
    build_expiry_transition, BuildContext, Component, Composite, LiveView, MetadataRegistry, Path,
    StateError, StateExhibitor, StateUpdate, StateVisitor, StateWatcher, Transition, WatcherRegistry,
};

use crate::config::MaintainerConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{MaintainerError, MaintainerResult};

enum Command {
    Update(StateUpdate),
    /// Answered once every command queued before it has been handled.
    Barrier(oneshot::Sender<()>),
}

/// State shared between the handles and the worker.
struct Shared {
    root: RwLock<Composite>,
    watchers: RwLock<WatcherRegistry>,
    metadata: MetadataRegistry,
    branch_lifetime: Duration,
    closed: AtomicBool,
    pending: AtomicU64,
    processed: AtomicU64,
    sweeps: AtomicU64,
    next_sweep: watch::Sender<Option<Instant>>,
}

struct Inner {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Command>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

/// Handle to a running state store.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

impl StateStore {
    /// Create an empty tree and spawn its worker on the current tokio
    /// runtime.
    pub fn start(config: &MaintainerConfig) -> MaintainerResult<Self> {
        config.validate()?;
        let metadata = config.metadata_registry()?;

        let mut root = Composite::immortal();
        root.set_metadata(metadata.lookup(&Path::root()));

        let (next_sweep, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            root: RwLock::new(root),
            watchers: RwLock::new(WatcherRegistry::new()),
            metadata,
            branch_lifetime: config.branch_lifetime()?,
            closed: AtomicBool::new(false),
            pending: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
            next_sweep,
        });

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            shared: shared.clone(),
            rx,
            follow_ups: tx.downgrade(),
            backlog: VecDeque::new(),
            sweep_at: None,
        };
        let handle = tokio::spawn(worker.run(shutdown_rx));

        info!(
            queue_capacity = config.queue_capacity,
            branch_lifetime = %config.branch_lifetime,
            "state store started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                tx,
                shutdown_tx,
                worker: Mutex::new(Some(handle)),
                shutdown_timeout: config.shutdown_timeout()?,
            }),
        })
    }

    /// Queue an update without waiting for it to be applied.
    pub fn enqueue(&self, update: StateUpdate) -> MaintainerResult<()> {
        let shared = &self.inner.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(MaintainerError::ShutDown);
        }

        shared.pending.fetch_add(1, Ordering::Relaxed);
        match self.inner.tx.try_send(Command::Update(update)) {
            Ok(()) => Ok(()),
            Err(e) => {
                shared.pending.fetch_sub(1, Ordering::Relaxed);
                match e {
                    TrySendError::Full(_) => Err(MaintainerError::QueueFull),
                    TrySendError::Closed(_) => Err(MaintainerError::ShutDown),
                }
            }
        }
    }

    /// Parse `path` and queue a single upsert of `component` there.
    ///
    /// Malformed paths and the root path are rejected here rather than
    /// skipped by the worker.
    pub fn upsert(&self, path: &str, component: Component) -> MaintainerResult<()> {
        let path = Path::parse(path)?;
        if path.is_root() {
            return Err(StateError::BadPath("the root cannot be replaced".to_string()).into());
        }
        self.enqueue(StateUpdate::new().with_update(path, component))
    }

    /// Parse `path` and queue removal of everything at and below it.
    pub fn purge(&self, path: &str) -> MaintainerResult<()> {
        let path = Path::parse(path)?;
        self.enqueue(StateUpdate::new().with_purge(path))
    }

    /// Wait until every update queued before this call has been applied.
    ///
    /// Follow-up updates produced by watchers while applying them are
    /// queued behind this barrier; flush again to wait for those too.
    pub async fn flush(&self) -> MaintainerResult<()> {
        if self.inner.shared.closed.load(Ordering::SeqCst) {
            return Err(MaintainerError::ShutDown);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.inner
            .tx
            .send(Command::Barrier(done_tx))
            .await
            .map_err(|_| MaintainerError::ShutDown)?;
        done_rx.await.map_err(|_| MaintainerError::ShutDown)
    }

    /// Walk the live tree. The tree cannot change during the walk.
    pub async fn visit<V: StateVisitor>(&self, visitor: &mut V) {
        let root = self.inner.shared.root.read().await;
        LiveView::new(&root).visit(visitor);
    }

    /// A copy of the node at `path`, if there is one.
    pub async fn get(&self, path: &Path) -> Option<Component> {
        let root = self.inner.shared.root.read().await;
        root.lookup(path).cloned()
    }

    /// Replace every registered watcher.
    pub async fn set_watchers(&self, watchers: Vec<Arc<dyn StateWatcher>>) {
        let count = watchers.len();
        self.inner.shared.watchers.write().await.set_watchers(watchers);
        info!(watchers = count, "watcher set replaced");
    }

    /// Register one more watcher, replacing any with the same name.
    pub async fn register_watcher(&self, watcher: Arc<dyn StateWatcher>) {
        let name = watcher.name().to_string();
        self.inner.shared.watchers.write().await.register(watcher);
        info!(watcher = %name, "watcher registered");
    }

    /// Remove a watcher. Returns false if no watcher has that name.
    pub async fn unregister_watcher(&self, name: &str) -> bool {
        self.inner.shared.watchers.write().await.unregister(name)
    }

    /// Returns false if no watcher has that name.
    pub async fn enable_watcher(&self, name: &str) -> bool {
        self.inner.shared.watchers.write().await.enable(name)
    }

    /// Returns false if no watcher has that name.
    pub async fn disable_watcher(&self, name: &str) -> bool {
        self.inner.shared.watchers.write().await.disable(name)
    }

    /// Names of all registered watchers, in registration order.
    pub async fn list_watchers(&self) -> Vec<String> {
        self.inner.shared.watchers.read().await.list()
    }

    /// Counters, watcher state and the next sweep, for operational tooling.
    pub async fn diagnostics(&self) -> Diagnostics {
        let shared = &self.inner.shared;
        let watchers = shared.watchers.read().await;
        let next_sweep = *shared.next_sweep.borrow();

        Diagnostics {
            pending_updates: shared.pending.load(Ordering::Relaxed),
            processed_updates: shared.processed.load(Ordering::Relaxed),
            sweeps_run: shared.sweeps.load(Ordering::Relaxed),
            watchers: watchers.len(),
            enabled_watchers: watchers.enabled_count(),
            watcher_triggers: watchers.info(),
            next_sweep_in_ms: next_sweep.map(|at| {
                at.saturating_duration_since(Instant::now()).as_millis() as u64
            }),
            shut_down: shared.closed.load(Ordering::SeqCst),
        }
    }

    /// Whether shutdown has begun.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shared.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting updates, apply those already queued and stop the
    /// worker. Waits at most the configured shutdown timeout.
    pub async fn shutdown(&self) {
        if self.inner.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("state store shutting down");
        let _ = self.inner.shutdown_tx.send(true);

        let Some(handle) = self.inner.worker.lock().await.take() else {
            return;
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.inner.shutdown_timeout, handle).await {
            Ok(_) => info!("state store shut down"),
            Err(_) => {
                warn!(
                    timeout = ?self.inner.shutdown_timeout,
                    pending = self.inner.shared.pending.load(Ordering::Relaxed),
                    "shutdown timed out, abandoning queued updates"
                );
                abort.abort();
            }
        }
    }
}

enum Step {
    Update(StateUpdate),
    Barrier(oneshot::Sender<()>),
    Sweep,
    Stop,
}

/// The single consumer of the update queue.
struct Worker {
    shared: Arc<Shared>,
    rx: mpsc::Receiver<Command>,
    follow_ups: mpsc::WeakSender<Command>,
    /// Follow-ups that did not fit in the queue.
    backlog: VecDeque<StateUpdate>,
    sweep_at: Option<Instant>,
}

impl Worker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!("state worker starting");
        loop {
            let step = if self.sweep_at.is_some_and(|at| at <= Instant::now()) {
                Step::Sweep
            } else if let Some(update) = self.backlog.pop_front() {
                Step::Update(update)
            } else {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => Step::Stop,
                    _ = sweep_timer(self.sweep_at) => Step::Sweep,
                    cmd = self.rx.recv() => match cmd {
                        Some(Command::Update(update)) => Step::Update(update),
                        Some(Command::Barrier(done)) => Step::Barrier(done),
                        None => Step::Stop,
                    },
                }
            };

            match step {
                Step::Update(update) => self.apply_update(update).await,
                Step::Barrier(done) => {
                    let _ = done.send(());
                }
                Step::Sweep => self.sweep().await,
                Step::Stop => break,
            }
        }
        self.drain().await;
        debug!("state worker stopped");
    }

    /// Apply everything still queued, without sweeping.
    async fn drain(&mut self) {
        self.rx.close();
        while let Some(update) = self.backlog.pop_front() {
            self.apply_update(update).await;
        }
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Update(update) => self.apply_update(update).await,
                Command::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
        self.sweep_at = None;
        self.shared.next_sweep.send_replace(None);
    }

    async fn apply_update(&mut self, update: StateUpdate) {
        let entries = update.count();
        let shared = self.shared.clone();
        let changes = self
            .run_cycle(|root, now| {
                let ctx = BuildContext::new(now, &shared.metadata)
                    .with_branch_lifetime(shared.branch_lifetime);
                update.build_transition(root, &ctx)
            })
            .await;
        self.shared.pending.fetch_sub(1, Ordering::Relaxed);
        self.shared.processed.fetch_add(1, Ordering::Relaxed);
        debug!(entries, changes, "update applied");
    }

    async fn sweep(&mut self) {
        let changes = self.run_cycle(build_expiry_transition).await;
        self.shared.sweeps.fetch_add(1, Ordering::Relaxed);
        debug!(removed = changes, "expiry sweep finished");
    }

    /// Build a transition, run watchers, commit, reschedule. Returns the
    /// number of children the transition changed.
    async fn run_cycle<F>(&mut self, build: F) -> usize
    where
        F: FnOnce(&Composite, std::time::Instant) -> Transition,
    {
        let now = Instant::now().into_std();
        let (transition, follow_up) = {
            let root = self.shared.root.read().await;
            let transition = build(&*root, now);
            let follow_up = if transition.is_empty() {
                None
            } else {
                self.shared
                    .watchers
                    .read()
                    .await
                    .check_watchers(&root, &transition)
            };
            (transition, follow_up)
        };

        if let Some(update) = follow_up {
            self.requeue(update);
        }

        let changes = transition.change_count();
        let earliest = if transition.is_empty() {
            self.shared.root.read().await.earliest_descendant_expiry()
        } else {
            let mut root = self.shared.root.write().await;
            root.commit(transition);
            root.earliest_descendant_expiry()
        };
        self.reschedule(earliest.map(Instant::from_std));
        changes
    }

    fn requeue(&mut self, update: StateUpdate) {
        let entries = update.count();
        if self.shared.closed.load(Ordering::SeqCst) {
            warn!(entries, "dropping watcher follow-up during shutdown");
            return;
        }
        let Some(tx) = self.follow_ups.upgrade() else {
            warn!(entries, "dropping watcher follow-up, store handle gone");
            return;
        };

        self.shared.pending.fetch_add(1, Ordering::Relaxed);
        match tx.try_send(Command::Update(update)) {
            Ok(()) => debug!(entries, "watcher follow-up queued"),
            Err(TrySendError::Full(Command::Update(update))) => {
                debug!(entries, backlog = self.backlog.len() + 1, "queue full, holding follow-up");
                self.backlog.push_back(update);
            }
            Err(_) => {
                self.shared.pending.fetch_sub(1, Ordering::Relaxed);
                warn!(entries, "dropping watcher follow-up, queue closed");
            }
        }
    }

    fn reschedule(&mut self, next: Option<Instant>) {
        if next == self.sweep_at {
            return;
        }
        match next {
            Some(at) => debug!(
                in_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64,
                "sweep rescheduled"
            ),
            None => debug!("sweep cancelled, nothing can expire"),
        }
        self.sweep_at = next;
        self.shared.next_sweep.send_replace(next);
    }
}

async fn sweep_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infotree_state::{Mortality, ValueCollector};

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn leaf(v: i64) -> Component {
        Component::value(v, Mortality::Ephemeral)
    }

    fn small_config() -> MaintainerConfig {
        MaintainerConfig {
            queue_capacity: 4,
            ..MaintainerConfig::default()
        }
    }

    #[tokio::test]
    async fn enqueue_flush_get() {
        let store = StateStore::start(&MaintainerConfig::default()).unwrap();
        store
            .enqueue(StateUpdate::new().with_update(p("a.b"), leaf(1)))
            .unwrap();
        store.flush().await.unwrap();

        assert_eq!(store.get(&p("a.b")).await, Some(leaf(1)));
        assert!(store.get(&p("a.c")).await.is_none());

        let mut collector = ValueCollector::new();
        store.visit(&mut collector).await;
        assert_eq!(collector.values().len(), 1);

        let diag = store.diagnostics().await;
        assert_eq!(diag.processed_updates, 1);
        assert_eq!(diag.pending_updates, 0);
    }

    #[tokio::test]
    async fn upsert_and_purge_by_path_string() {
        let store = StateStore::start(&MaintainerConfig::default()).unwrap();
        store.upsert("pools.p1.free", leaf(5)).unwrap();
        store.upsert("pools.p2.free", leaf(6)).unwrap();
        store.flush().await.unwrap();
        assert_eq!(store.get(&p("pools.p1.free")).await, Some(leaf(5)));

        store.purge("pools.p1").unwrap();
        store.flush().await.unwrap();
        assert!(store.get(&p("pools.p1")).await.is_none());
        assert!(store.get(&p("pools.p2.free")).await.is_some());
    }

    #[tokio::test]
    async fn bad_paths_are_rejected_before_queueing() {
        let store = StateStore::start(&MaintainerConfig::default()).unwrap();

        for bad in ["pools..p1", ".x", "x."] {
            assert!(matches!(
                store.upsert(bad, leaf(1)),
                Err(MaintainerError::State(StateError::BadPath(_)))
            ));
        }
        assert!(matches!(
            store.upsert("", leaf(1)),
            Err(MaintainerError::State(StateError::BadPath(_)))
        ));
        assert!(matches!(
            store.purge("a..b"),
            Err(MaintainerError::State(StateError::BadPath(_)))
        ));
        assert_eq!(store.diagnostics().await.pending_updates, 0);
    }

    #[tokio::test]
    async fn root_metadata_from_empty_rule() {
        let mut config = MaintainerConfig::default();
        config.metadata.push(crate::config::MetadataRule {
            path: String::new(),
            attributes: [("role".to_string(), "root".to_string())].into(),
        });
        let store = StateStore::start(&config).unwrap();

        struct RootMeta(Option<String>);
        impl StateVisitor for RootMeta {
            fn visit_composite_pre_descend(
                &mut self,
                path: &Path,
                metadata: Option<&infotree_state::BranchMetadata>,
            ) {
                if path.is_root() {
                    self.0 = metadata.and_then(|m| m.get("role").cloned());
                }
            }
        }

        let mut visitor = RootMeta(None);
        store.visit(&mut visitor).await;
        assert_eq!(visitor.0.as_deref(), Some("root"));
    }

    #[tokio::test]
    async fn queue_full_is_reported() {
        let store = StateStore::start(&small_config()).unwrap();
        // Hold the tree so the worker blocks on its first update.
        let guard = store.inner.shared.root.write().await;

        let mut results = Vec::new();
        for i in 0..10 {
            results.push(store.enqueue(StateUpdate::new().with_update(p("x"), leaf(i))));
        }
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(MaintainerError::QueueFull))));

        drop(guard);
        store.flush().await.unwrap();
        assert_eq!(store.diagnostics().await.pending_updates, 0);
    }

    #[tokio::test]
    async fn shutdown_applies_queued_updates() {
        let store = StateStore::start(&MaintainerConfig::default()).unwrap();
        for i in 0..20 {
            store
                .enqueue(StateUpdate::new().with_update(p(&format!("n{i}")), leaf(i)))
                .unwrap();
        }
        store.shutdown().await;

        assert!(store.is_shut_down());
        assert_eq!(store.get(&p("n19")).await, Some(leaf(19)));
        assert!(matches!(
            store.enqueue(StateUpdate::new()),
            Err(MaintainerError::ShutDown)
        ));
        assert!(matches!(store.flush().await, Err(MaintainerError::ShutDown)));

        // A second shutdown is a no-op.
        store.shutdown().await;
        assert!(store.diagnostics().await.shut_down);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = MaintainerConfig {
            branch_lifetime: "forever".to_string(),
            ..MaintainerConfig::default()
        };
        assert!(matches!(
            StateStore::start(&config),
            Err(MaintainerError::Config(_))
        ));
    }
}
