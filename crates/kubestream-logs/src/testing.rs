//! In-memory pod directory and log source for tests

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use kubestream_k8s::{
    ByteStream, K8sError, LogOptions, LogSource, PodDirectory, PodSelector, PodWatchEvent,
};
use kubestream_types::{OwnerRef, PodKey, PodRecord, PodStatus, SetType};

pub(crate) fn running_pod(namespace: &str, name: &str, containers: &[&str]) -> PodRecord {
    let mut pod = PodRecord::new(namespace, name);
    pod.status = PodStatus::Running;
    pod.containers = containers.iter().map(|c| c.to_string()).collect();
    pod
}

pub(crate) fn owned_pod(namespace: &str, name: &str, owner: &str, set_type: SetType) -> PodRecord {
    let mut pod = running_pod(namespace, name, &["app"]);
    pod.owners.push(OwnerRef {
        kind: set_type.kind().to_string(),
        name: owner.to_string(),
    });
    pod
}

/// Poll until the condition holds, failing the test after two seconds
pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {}", what);
}

/// Decrements the live watch count when the watch stream is dropped
struct WatchGuard(Arc<AtomicUsize>);

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

type WatchSender = mpsc::UnboundedSender<Result<PodWatchEvent, K8sError>>;

#[derive(Default)]
pub(crate) struct FakeDirectory {
    pods: Mutex<Vec<PodRecord>>,
    watchers: Mutex<Vec<WatchSender>>,
    active_watches: Arc<AtomicUsize>,
    selectors: Mutex<HashMap<(String, SetType), String>>,
    unreachable: bool,
}

impl FakeDirectory {
    pub(crate) fn new(pods: Vec<PodRecord>) -> Self {
        Self {
            pods: Mutex::new(pods),
            ..Self::default()
        }
    }

    /// A directory whose list calls always fail
    pub(crate) fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub(crate) fn with_set_selector(self, set: &str, set_type: SetType, labels: &str) -> Self {
        self.selectors
            .lock()
            .insert((set.to_string(), set_type), labels.to_string());
        self
    }

    /// Deliver an event to every open watch
    pub(crate) fn emit(&self, event: PodWatchEvent) {
        self.watchers
            .lock()
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    pub(crate) fn active_watches(&self) -> usize {
        self.active_watches.load(Ordering::SeqCst)
    }
}

impl PodDirectory for FakeDirectory {
    fn list_pods(
        &self,
        selector: &PodSelector,
    ) -> BoxFuture<'static, Result<Vec<PodRecord>, K8sError>> {
        if self.unreachable {
            return future::ready(Err(K8sError::NotFound("directory offline".to_string()))).boxed();
        }

        let name = selector
            .fields
            .as_deref()
            .and_then(|f| f.strip_prefix("metadata.name="));
        let pods = self
            .pods
            .lock()
            .iter()
            .filter(|p| selector.namespace.as_deref().is_none_or(|ns| ns == p.namespace))
            .filter(|p| name.is_none_or(|n| n == p.name))
            .cloned()
            .collect();
        future::ready(Ok(pods)).boxed()
    }

    fn watch_pods(
        &self,
        _selector: &PodSelector,
    ) -> BoxStream<'static, Result<PodWatchEvent, K8sError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().push(tx);
        self.active_watches.fetch_add(1, Ordering::SeqCst);
        let guard = WatchGuard(self.active_watches.clone());

        stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|event| (event, (rx, guard)))
        })
        .boxed()
    }

    fn set_selector(
        &self,
        _namespace: &str,
        set: &str,
        set_type: SetType,
    ) -> BoxFuture<'static, Result<Option<String>, K8sError>> {
        let labels = self
            .selectors
            .lock()
            .get(&(set.to_string(), set_type))
            .cloned();
        future::ready(Ok(labels)).boxed()
    }
}

/// Log source whose streams are fed by the test
#[derive(Default)]
pub(crate) struct FakeLogSource {
    feeds: Mutex<HashMap<PodKey, mpsc::UnboundedSender<Vec<u8>>>>,
    opens: Mutex<HashMap<PodKey, Vec<LogOptions>>>,
    failures: Mutex<HashMap<PodKey, usize>>,
    missing: Mutex<HashSet<PodKey>>,
}

impl FakeLogSource {
    /// Send bytes to the open stream; false if nothing is reading it
    pub(crate) fn feed(&self, key: &PodKey, bytes: &[u8]) -> bool {
        self.feeds
            .lock()
            .get(key)
            .is_some_and(|tx| tx.send(bytes.to_vec()).is_ok())
    }

    /// Whether a tailer currently holds the stream for this key
    pub(crate) fn is_attached(&self, key: &PodKey) -> bool {
        self.feeds.lock().get(key).is_some_and(|tx| !tx.is_closed())
    }

    /// End the current stream for this key
    pub(crate) fn end(&self, key: &PodKey) {
        self.feeds.lock().remove(key);
    }

    /// Make the next `count` opens for this key fail
    pub(crate) fn fail_next(&self, key: &PodKey, count: usize) {
        self.failures.lock().insert(key.clone(), count);
    }

    /// Opens for this key report the container as gone
    pub(crate) fn set_missing(&self, key: &PodKey) {
        self.missing.lock().insert(key.clone());
    }

    pub(crate) fn open_count(&self, key: &PodKey) -> usize {
        self.opens.lock().get(key).map_or(0, Vec::len)
    }

    pub(crate) fn opens(&self, key: &PodKey) -> Vec<LogOptions> {
        self.opens.lock().get(key).cloned().unwrap_or_default()
    }
}

impl LogSource for FakeLogSource {
    fn open(
        &self,
        pod: &kubestream_types::PodIdentity,
        options: &LogOptions,
    ) -> BoxFuture<'static, Result<ByteStream, K8sError>> {
        let key = pod.key();
        self.opens
            .lock()
            .entry(key.clone())
            .or_default()
            .push(options.clone());

        if self.missing.lock().contains(&key) {
            return future::ready(Err(K8sError::NotFound(key.to_string()))).boxed();
        }

        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(&key).filter(|n| **n > 0) {
                *remaining -= 1;
                let err = std::io::Error::other("connection refused");
                return future::ready(Err(K8sError::Io(err))).boxed();
            }
        }

        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.feeds.lock().insert(key, tx);

        let chunks = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok(chunk), rx))
        })
        .boxed();
        future::ready(Ok(chunks)).boxed()
    }
}
