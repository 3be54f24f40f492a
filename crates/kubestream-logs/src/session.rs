use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubestream_k8s::{LogSource, PodDirectory};
use kubestream_types::{LineEvent, PodIdentity, PodKey, Scope, WatchOptions};

use crate::resolver::{PodSetChange, PodSetResolver};
use crate::tailer::{LogTailer, TailerConfig, TailerExit};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Settings shared by every session of a server
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub tailer: TailerConfig,
    /// Capacity of the merged outbound line channel
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tailer: TailerConfig::default(),
            outbound_capacity: 1024,
        }
    }
}

type TailerMap = Arc<Mutex<HashMap<PodKey, LogTailer>>>;

/// One client's live view of a scope
///
/// Owns the pod watch and one tailer per live container. Everything is
/// torn down when the outbound receiver is dropped, on `close`, or when
/// the session is dropped.
pub struct StreamSession {
    id: u64,
    scope: Scope,
    cancel: CancellationToken,
    tailers: TailerMap,
    watching: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
}

impl StreamSession {
    /// Resolve the scope and start tailing; lines arrive on the returned receiver
    pub fn start(
        scope: Scope,
        options: WatchOptions,
        directory: Arc<dyn PodDirectory>,
        source: Arc<dyn LogSource>,
        config: &SessionConfig,
    ) -> (Self, mpsc::Receiver<LineEvent>) {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(config.outbound_capacity.max(1));
        let cancel = CancellationToken::new();
        let tailers: TailerMap = Arc::new(Mutex::new(HashMap::new()));
        let watching = Arc::new(AtomicBool::new(false));

        let tailer_config = TailerConfig {
            timestamps: options.timestamp,
            previous: options.previous,
            ..config.tailer.clone()
        };

        let (exits_tx, exits) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            id,
            resolver: PodSetResolver::new(directory, scope.clone()),
            source,
            config: Arc::new(tailer_config),
            outbound: tx,
            cancel: cancel.clone(),
            tailers: tailers.clone(),
            watching: watching.clone(),
            next_serial: 0,
            exits_tx,
            exits,
        };

        info!(session = id, scope = %scope, "Starting stream session");
        let handle = tokio::spawn(supervisor.run());

        let session = Self {
            id,
            scope,
            cancel,
            tailers,
            watching,
            supervisor: Some(handle),
        };
        (session, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Number of containers currently being tailed
    pub fn active_tailers(&self) -> usize {
        self.tailers.lock().values().filter(|t| t.is_tailing()).count()
    }

    /// Keys of the containers currently being tailed, sorted
    pub fn tailed(&self) -> Vec<PodKey> {
        let mut keys: Vec<PodKey> = self
            .tailers
            .lock()
            .iter()
            .filter(|(_, t)| t.is_tailing())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Whether the pod watch subscription is open
    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.supervisor.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Request teardown without waiting for it
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait until the session has ended on its own (or been closed)
    pub async fn wait(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.await;
        }
    }

    /// Close and wait until every tailer and the watch are gone
    pub async fn shutdown(&mut self) {
        self.close();
        self.wait().await;
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Supervisor {
    id: u64,
    resolver: PodSetResolver,
    source: Arc<dyn LogSource>,
    config: Arc<TailerConfig>,
    outbound: mpsc::Sender<LineEvent>,
    cancel: CancellationToken,
    tailers: TailerMap,
    watching: Arc<AtomicBool>,
    next_serial: u64,
    exits_tx: mpsc::UnboundedSender<TailerExit>,
    exits: mpsc::UnboundedReceiver<TailerExit>,
}

impl Supervisor {
    async fn run(mut self) {
        self.supervise().await;
        self.teardown().await;
        info!(session = self.id, "Stream session closed");
    }

    async fn supervise(&mut self) {
        let initial = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            initial = self.resolver.snapshot() => initial,
        };

        if initial.is_empty() {
            let scope = self.resolver.scope().clone();
            info!(session = self.id, scope = %scope, "No pods matched");
            let source = PodIdentity::new(scope.namespace().unwrap_or_default(), "", "");
            let notice = LineEvent::diagnostic(source, format!("no pods matched {}", scope));
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = self.outbound.send(notice) => {}
            }
        }

        for pod in &initial {
            self.add(pod.clone());
        }

        let mut changes = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            changes = self.resolver.subscribe(initial) => changes,
        };
        self.watching.store(true, Ordering::Release);
        let mut watch_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.outbound.closed() => {
                    debug!(session = self.id, "Outbound channel closed");
                    break;
                }
                Some(exit) = self.exits.recv() => self.reap(exit),
                change = changes.next(), if watch_open => match change {
                    Some(PodSetChange::Added(pod)) => self.add(pod),
                    Some(PodSetChange::Removed(key)) => self.remove(&key),
                    // A finished previous-instance read is not repeated
                    Some(PodSetChange::Seen(pod)) if !self.config.previous => self.add(pod),
                    Some(PodSetChange::Seen(_)) => {}
                    None => {
                        warn!(session = self.id, "Pod watch ended; keeping current tailers");
                        watch_open = false;
                        self.watching.store(false, Ordering::Release);
                    }
                },
            }
        }

        drop(changes);
        self.watching.store(false, Ordering::Release);
    }

    fn add(&mut self, pod: PodIdentity) {
        let key = pod.key();
        let mut tailers = self.tailers.lock();
        if tailers.get(&key).is_some_and(|t| t.is_tailing()) {
            debug!(session = self.id, pod = %key, "Already tailing");
            return;
        }

        debug!(session = self.id, pod = %key, "Tailing container");
        self.next_serial += 1;
        let tailer = LogTailer::spawn_reporting(
            pod,
            self.source.clone(),
            self.config.clone(),
            self.outbound.clone(),
            self.cancel.child_token(),
            self.next_serial,
            self.exits_tx.clone(),
        );
        tailers.insert(key, tailer);
    }

    /// Forget a tailer that stopped on its own so the pod can be tailed again
    ///
    /// The tailer is not cancelled; its forwarder still delivers what is queued.
    fn reap(&self, exit: TailerExit) {
        let mut tailers = self.tailers.lock();
        if tailers.get(&exit.key).is_some_and(|t| t.serial() == exit.serial) {
            debug!(session = self.id, pod = %exit.key, "Tailer stopped on its own");
            tailers.remove(&exit.key);
        }
    }

    fn remove(&self, key: &PodKey) {
        if let Some(tailer) = self.tailers.lock().remove(key) {
            debug!(session = self.id, pod = %key, "Stopped tailing container");
            tailer.cancel();
        }
    }

    async fn teardown(&mut self) {
        self.watching.store(false, Ordering::Release);
        let tailers: Vec<LogTailer> = self.tailers.lock().drain().map(|(_, t)| t).collect();
        for tailer in &tailers {
            tailer.cancel();
        }
        for tailer in tailers {
            let dropped = tailer.dropped();
            if dropped > 0 {
                debug!(session = self.id, pod = %tailer.identity().key(), dropped, "Tailer dropped lines");
            }
            tailer.join().await;
        }
    }
}
