use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubestream_k8s::{LogOptions, LogSource};
use kubestream_types::{LineEvent, PodIdentity, PodKey};

use crate::parser::split_timestamp;
use crate::queue::TailQueue;
use crate::reassembler::{ChunkReassembler, LineFlush};

/// Tuning for a single container tail
#[derive(Clone, Debug)]
pub struct TailerConfig {
    /// Keep server timestamps on the emitted lines
    pub timestamps: bool,
    /// Read the previous terminated instance instead of following
    pub previous: bool,
    /// Lines of history on first attach (None = all)
    pub tail_lines: Option<i64>,
    /// Consecutive failed attaches before giving up
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub queue_capacity: usize,
    pub flush: LineFlush,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            timestamps: false,
            previous: false,
            tail_lines: None,
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            queue_capacity: 1000,
            flush: LineFlush::Terminated,
        }
    }
}

impl TailerConfig {
    /// Delay before the given reattach attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Sent when a tailer's reader stops without being cancelled
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TailerExit {
    pub key: PodKey,
    pub serial: u64,
}

type ExitNotice = (u64, mpsc::UnboundedSender<TailerExit>);

/// Tails one container into the session's outbound channel
///
/// Two tasks per tailer: a reader that attaches, reassembles and queues
/// lines, and a forwarder that drains the queue into the outbound
/// channel. Both stop when the tailer's token is cancelled.
pub struct LogTailer {
    identity: PodIdentity,
    serial: u64,
    cancel: CancellationToken,
    queue: TailQueue,
    reader: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

impl LogTailer {
    pub fn spawn(
        identity: PodIdentity,
        source: Arc<dyn LogSource>,
        config: Arc<TailerConfig>,
        outbound: mpsc::Sender<LineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self::spawn_with(identity, source, config, outbound, cancel, None)
    }

    /// Like `spawn`, reporting on `exits` under `serial` if the tail stops on its own
    pub fn spawn_reporting(
        identity: PodIdentity,
        source: Arc<dyn LogSource>,
        config: Arc<TailerConfig>,
        outbound: mpsc::Sender<LineEvent>,
        cancel: CancellationToken,
        serial: u64,
        exits: mpsc::UnboundedSender<TailerExit>,
    ) -> Self {
        Self::spawn_with(identity, source, config, outbound, cancel, Some((serial, exits)))
    }

    fn spawn_with(
        identity: PodIdentity,
        source: Arc<dyn LogSource>,
        config: Arc<TailerConfig>,
        outbound: mpsc::Sender<LineEvent>,
        cancel: CancellationToken,
        exit: Option<ExitNotice>,
    ) -> Self {
        let serial = exit.as_ref().map_or(0, |(serial, _)| *serial);
        let queue = TailQueue::new(config.queue_capacity);

        let reader = {
            let tail = Tail {
                reassembler: ChunkReassembler::new(config.flush),
                identity: identity.clone(),
                source,
                config,
                queue: queue.clone(),
                cancel: cancel.clone(),
                last_seen: None,
                delivered_at_last: 0,
                resume_after: None,
                replayed_at_cutoff: 0,
                exit,
            };
            tokio::spawn(tail.run())
        };

        let forwarder = tokio::spawn(forward(queue.clone(), outbound, cancel.clone()));

        Self {
            identity,
            serial,
            cancel,
            queue,
            reader,
            forwarder,
        }
    }

    pub fn identity(&self) -> &PodIdentity {
        &self.identity
    }

    /// Stop tailing; no further lines are forwarded
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.forwarder.is_finished()
    }

    /// Whether the reader is still attached or retrying
    pub fn is_tailing(&self) -> bool {
        !self.reader.is_finished()
    }

    /// Lines lost to queue overflow
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Wait for both tasks to exit
    pub async fn join(self) {
        let _ = self.reader.await;
        let _ = self.forwarder.await;
    }
}

struct Tail {
    identity: PodIdentity,
    source: Arc<dyn LogSource>,
    config: Arc<TailerConfig>,
    queue: TailQueue,
    cancel: CancellationToken,
    reassembler: ChunkReassembler,
    /// Newest server timestamp seen so far
    last_seen: Option<DateTime<Utc>>,
    /// Lines delivered carrying exactly `last_seen`
    delivered_at_last: usize,
    /// Lines before this instant were already delivered
    resume_after: Option<DateTime<Utc>>,
    /// Replayed lines at `resume_after` skipped since the reattach
    replayed_at_cutoff: usize,
    exit: Option<ExitNotice>,
}

impl Tail {
    async fn run(mut self) {
        let key = self.identity.key();
        self.attach_loop().await;
        self.queue.close();

        if let Some((serial, exits)) = self.exit.take() {
            if !self.cancel.is_cancelled() {
                let _ = exits.send(TailerExit {
                    key: key.clone(),
                    serial,
                });
            }
        }

        let dropped = self.queue.dropped();
        if dropped > 0 {
            warn!(pod = %key, dropped, "Dropped lines because the client fell behind");
        }
        debug!(pod = %key, "Tailer finished");
    }

    async fn attach_loop(&mut self) {
        let key = self.identity.key();
        let mut failures: u32 = 0;
        let mut first_attach = true;

        loop {
            let options = LogOptions {
                follow: !self.config.previous,
                previous: self.config.previous,
                // Always requested; needed to resume without duplicates
                timestamps: true,
                tail_lines: if first_attach { self.config.tail_lines } else { None },
                since_time: if first_attach { None } else { self.last_seen },
            };
            self.resume_after = if first_attach { None } else { self.last_seen };
            self.replayed_at_cutoff = 0;

            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                opened = self.source.open(&self.identity, &options) => opened,
            };

            let last_error = match opened {
                Ok(mut stream) => {
                    debug!(pod = %key, first_attach, "Attached to log stream");
                    first_attach = false;
                    let mut got_data = false;

                    let ended_with = loop {
                        let next = tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return,
                            next = stream.next() => next,
                        };
                        match next {
                            Some(Ok(chunk)) => {
                                got_data = true;
                                let lines: Vec<String> = self.reassembler.push(&chunk).collect();
                                for line in lines {
                                    self.emit(&line);
                                }
                            }
                            Some(Err(e)) => break Some(e.to_string()),
                            None => break None,
                        }
                    };

                    if let Some(rest) = self.reassembler.finish() {
                        self.emit(&rest);
                    }
                    if got_data {
                        failures = 0;
                    }

                    match ended_with {
                        None if self.config.previous => {
                            info!(pod = %key, "Finished reading previous instance log");
                            return;
                        }
                        None => "log stream ended".to_string(),
                        Some(e) => e,
                    }
                }
                Err(e) if e.is_not_found() => {
                    info!(pod = %key, "Container no longer exists");
                    self.queue.push(LineEvent::diagnostic(
                        self.identity.clone(),
                        format!("{} no longer exists", key),
                    ));
                    return;
                }
                Err(e) => e.to_string(),
            };

            failures += 1;
            if failures >= self.config.max_attempts || self.config.previous {
                warn!(pod = %key, attempts = failures, error = %last_error, "Giving up on log stream");
                self.queue.push(LineEvent::diagnostic(
                    self.identity.clone(),
                    format!(
                        "gave up tailing {} after {} attempts: {}",
                        key, failures, last_error
                    ),
                ));
                return;
            }

            let delay = self.config.backoff(failures);
            debug!(pod = %key, attempt = failures, ?delay, error = %last_error, "Reattaching");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn emit(&mut self, raw: &str) {
        let (timestamp, text) = split_timestamp(raw);

        // The server resends everything from the cutoff instant on; skip
        // only as many lines at that instant as were already delivered
        if let (Some(ts), Some(cutoff)) = (timestamp, self.resume_after) {
            if ts < cutoff {
                return;
            }
            if ts == cutoff && self.replayed_at_cutoff < self.delivered_at_last {
                self.replayed_at_cutoff += 1;
                return;
            }
        }
        if let Some(ts) = timestamp {
            if self.last_seen == Some(ts) {
                self.delivered_at_last += 1;
            } else {
                self.last_seen = Some(ts);
                self.delivered_at_last = 1;
            }
        }

        let mut event = LineEvent::new(self.identity.clone(), text.to_string());
        if self.config.timestamps {
            event.timestamp = timestamp;
        }
        self.queue.push(event);
    }
}

/// Drain the queue into the outbound channel until cancelled or closed
async fn forward(queue: TailQueue, outbound: mpsc::Sender<LineEvent>, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = queue.pop() => next,
        };
        let Some(event) = next else {
            break;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = outbound.send(event) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLogSource, eventually};
    use kubestream_types::PodKey;

    fn fast_config() -> TailerConfig {
        TailerConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            ..TailerConfig::default()
        }
    }

    fn start(
        source: &Arc<FakeLogSource>,
        config: TailerConfig,
    ) -> (LogTailer, PodKey, mpsc::Receiver<LineEvent>) {
        start_with_outbound(source, config, 64)
    }

    fn start_with_outbound(
        source: &Arc<FakeLogSource>,
        config: TailerConfig,
        outbound: usize,
    ) -> (LogTailer, PodKey, mpsc::Receiver<LineEvent>) {
        let identity = PodIdentity::new("default", "web-0", "app");
        let key = identity.key();
        let (tx, rx) = mpsc::channel(outbound);
        let tailer = LogTailer::spawn(
            identity,
            source.clone(),
            Arc::new(config),
            tx,
            CancellationToken::new(),
        );
        (tailer, key, rx)
    }

    #[test]
    fn test_backoff_is_bounded() {
        let config = TailerConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(4), Duration::from_secs(8));
        assert_eq!(config.backoff(10), Duration::from_secs(30));
        assert_eq!(config.backoff(100), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let source = Arc::new(FakeLogSource::default());
        let (tailer, key, mut rx) = start(&source, fast_config());
        eventually("attach", || source.is_attached(&key)).await;

        source.feed(&key, b"2024-01-15T10:30:00.5Z hel");
        source.feed(&key, b"lo\n2024-01-15T10:30:01Z world\n");

        assert_eq!(rx.recv().await.unwrap().text, "hello");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.text, "world");
        // Timestamps were not asked for
        assert!(second.timestamp.is_none());

        tailer.cancel();
        tailer.join().await;
    }

    #[tokio::test]
    async fn test_timestamps_kept_when_requested() {
        let source = Arc::new(FakeLogSource::default());
        let config = TailerConfig {
            timestamps: true,
            ..fast_config()
        };
        let (tailer, key, mut rx) = start(&source, config);
        eventually("attach", || source.is_attached(&key)).await;

        source.feed(&key, b"2024-01-15T10:30:00Z ready\n");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.text, "ready");
        assert_eq!(
            event.timestamp.map(|t| t.to_rfc3339()).as_deref(),
            Some("2024-01-15T10:30:00+00:00")
        );

        tailer.cancel();
        tailer.join().await;
    }

    #[tokio::test]
    async fn test_reattach_resumes_after_last_line() {
        let source = Arc::new(FakeLogSource::default());
        let (tailer, key, mut rx) = start(&source, fast_config());
        eventually("attach", || source.is_attached(&key)).await;

        source.feed(&key, b"2024-01-15T10:30:00Z one\n2024-01-15T10:30:01Z partial");
        assert_eq!(rx.recv().await.unwrap().text, "one");
        source.end(&key);
        // The fragment is flushed when the stream ends
        assert_eq!(rx.recv().await.unwrap().text, "partial");

        eventually("reattach", || source.open_count(&key) == 2 && source.is_attached(&key)).await;
        let opens = source.opens(&key);
        assert!(opens[1].since_time.is_some());
        assert_eq!(opens[1].tail_lines, None);

        // Replayed history at or before the last line is skipped
        source.feed(&key, b"2024-01-15T10:30:01Z partial\n2024-01-15T10:30:02Z two\n");
        assert_eq!(rx.recv().await.unwrap().text, "two");

        tailer.cancel();
        tailer.join().await;
    }

    #[tokio::test]
    async fn test_reattach_keeps_new_lines_sharing_last_timestamp() {
        let source = Arc::new(FakeLogSource::default());
        let (tailer, key, mut rx) = start(&source, fast_config());
        eventually("attach", || source.is_attached(&key)).await;

        source.feed(&key, b"2024-01-15T10:30:01Z a\n2024-01-15T10:30:01Z b\n");
        assert_eq!(rx.recv().await.unwrap().text, "a");
        assert_eq!(rx.recv().await.unwrap().text, "b");
        source.end(&key);

        eventually("reattach", || source.open_count(&key) == 2 && source.is_attached(&key)).await;
        source.feed(
            &key,
            b"2024-01-15T10:30:01Z a\n2024-01-15T10:30:01Z b\n2024-01-15T10:30:01Z c\n2024-01-15T10:30:02Z d\n",
        );
        assert_eq!(rx.recv().await.unwrap().text, "c");
        assert_eq!(rx.recv().await.unwrap().text, "d");

        // Only one line was delivered at :02 before this resume
        source.end(&key);
        eventually("reattach", || source.open_count(&key) == 3 && source.is_attached(&key)).await;
        source.feed(&key, b"2024-01-15T10:30:02Z d\n2024-01-15T10:30:02Z e\n");
        assert_eq!(rx.recv().await.unwrap().text, "e");

        tailer.cancel();
        tailer.join().await;
    }

    #[tokio::test]
    async fn test_full_outbound_drops_oldest_but_keeps_reading() {
        let source = Arc::new(FakeLogSource::default());
        let config = TailerConfig {
            queue_capacity: 4,
            ..fast_config()
        };
        let (tailer, key, mut rx) = start_with_outbound(&source, config, 1);
        eventually("attach", || source.is_attached(&key)).await;

        for i in 0..20 {
            assert!(source.feed(&key, format!("line {}\n", i).as_bytes()));
        }
        // Two lines left the queue: one sits in the channel, one waits to send
        eventually("overflow", || tailer.dropped() == 14).await;

        // Nobody is receiving, yet the reader still consumes the stream
        for i in 20..40 {
            assert!(source.feed(&key, format!("line {}\n", i).as_bytes()));
        }
        eventually("still reading", || tailer.dropped() == 34).await;
        assert!(source.is_attached(&key));

        let mut received = Vec::new();
        while received.last().map(String::as_str) != Some("line 39") {
            received.push(rx.recv().await.unwrap().text);
            assert!(received.len() <= 6, "{:?}", received);
        }
        assert_eq!(
            received[received.len() - 4..],
            ["line 36", "line 37", "line 38", "line 39"]
        );

        tailer.cancel();
        tailer.join().await;
    }

    #[tokio::test]
    async fn test_exit_reported_only_when_stopping_on_its_own() {
        let source = Arc::new(FakeLogSource::default());
        let identity = PodIdentity::new("default", "web-0", "app");
        source.set_missing(&identity.key());

        let (exits_tx, mut exits) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::channel(8);
        let tailer = LogTailer::spawn_reporting(
            identity.clone(),
            source.clone(),
            Arc::new(fast_config()),
            tx.clone(),
            CancellationToken::new(),
            7,
            exits_tx.clone(),
        );
        assert_eq!(tailer.serial(), 7);
        assert!(rx.recv().await.unwrap().is_diagnostic());
        assert_eq!(
            exits.recv().await,
            Some(TailerExit {
                key: identity.key(),
                serial: 7,
            })
        );
        tailer.join().await;

        // A cancelled tailer is not reported
        let other = PodIdentity::new("default", "web-1", "app");
        let tailer = LogTailer::spawn_reporting(
            other.clone(),
            source.clone(),
            Arc::new(fast_config()),
            tx,
            CancellationToken::new(),
            8,
            exits_tx,
        );
        eventually("attach", || source.is_attached(&other.key())).await;
        assert!(tailer.is_tailing());
        tailer.cancel();
        tailer.join().await;
        assert!(exits.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_gives_up_with_diagnostic() {
        let source = Arc::new(FakeLogSource::default());
        let identity = PodIdentity::new("default", "web-0", "app");
        source.fail_next(&identity.key(), 10);

        let config = TailerConfig {
            max_attempts: 3,
            ..fast_config()
        };
        let (tailer, key, mut rx) = start(&source, config);

        let event = rx.recv().await.unwrap();
        assert!(event.is_diagnostic());
        assert!(event.text.contains("after 3 attempts"), "{}", event.text);
        assert_eq!(source.open_count(&key), 3);

        // Channel ends once the tailer is done
        assert!(rx.recv().await.is_none());
        tailer.join().await;
    }

    #[tokio::test]
    async fn test_missing_container_is_terminal() {
        let source = Arc::new(FakeLogSource::default());
        let identity = PodIdentity::new("default", "web-0", "app");
        source.set_missing(&identity.key());

        let (tailer, key, mut rx) = start(&source, fast_config());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.text, "Error: default/web-0/app no longer exists");
        assert!(rx.recv().await.is_none());
        assert_eq!(source.open_count(&key), 1);
        tailer.join().await;
    }

    #[tokio::test]
    async fn test_cancel_detaches() {
        let source = Arc::new(FakeLogSource::default());
        let (tailer, key, mut rx) = start(&source, fast_config());
        eventually("attach", || source.is_attached(&key)).await;

        tailer.cancel();
        eventually("detach", || !source.is_attached(&key)).await;
        assert!(!source.feed(&key, b"late\n"));
        tailer.join().await;
        assert!(rx.recv().await.is_none());
    }
}
