use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::detect::DetectionBatch;
use crate::publish::queue::{EventQueue, QueuedBatch, DEFAULT_QUEUE_CAPACITY};
use crate::publish::sink::EventSink;
use crate::publish::wire::to_wire_json;

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    /// Worker wake cadence; at most one batch is sent per wake.
    pub flush_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub enqueued: u64,
    pub published: u64,
    pub failed: u64,
    pub evicted: u64,
    /// Batches refused because the publisher had stopped.
    pub rejected: u64,
    pub queue_depth: usize,
}

#[derive(Debug, Default)]
pub(crate) struct PublisherCounters {
    enqueued: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
}

struct Worker {
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

/// Bounded queue plus a background worker delivering to an `EventSink`.
///
/// `enqueue` never touches the network. The worker wakes every
/// `flush_interval`, takes at most one batch, serializes it and sends it.
/// Anything but HTTP 200 counts as a failure and the batch is dropped.
pub struct EventPublisher {
    config: PublisherConfig,
    queue: Arc<EventQueue>,
    counters: Arc<PublisherCounters>,
    sink: Option<Box<dyn EventSink>>,
    worker: Option<Worker>,
    stopped: AtomicBool,
}

impl EventPublisher {
    pub fn new(sink: Box<dyn EventSink>, config: PublisherConfig) -> Result<Self> {
        if config.flush_interval.is_zero() {
            return Err(anyhow!("publisher flush interval must be > 0"));
        }
        Ok(Self {
            queue: Arc::new(EventQueue::new(config.queue_capacity)),
            config,
            counters: Arc::new(PublisherCounters::default()),
            sink: Some(sink),
            worker: None,
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn the delivery worker.
    pub fn start(&mut self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(anyhow!("event publisher already stopped"));
        }
        if self.worker.is_some() {
            return Ok(());
        }
        let sink = self
            .sink
            .take()
            .ok_or_else(|| anyhow!("event publisher has no sink"))?;
        let destination = sink.describe();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let queue = Arc::clone(&self.queue);
        let counters = Arc::clone(&self.counters);
        let interval = self.config.flush_interval;
        let join = thread::Builder::new()
            .name("event-publisher".to_string())
            .spawn(move || {
                let mut sink = sink;
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if let Some(entry) = queue.pop() {
                        deliver(sink.as_mut(), &entry, &counters);
                    }
                }
            })
            .context("spawn event publisher thread")?;
        self.worker = Some(Worker { stop_tx, join });
        log::info!(
            "EventPublisher: started, delivering to {} every {:?}",
            destination,
            interval
        );
        Ok(())
    }

    /// Queue a batch for delivery, evicting the oldest when full. Returns
    /// false once the publisher has stopped.
    pub fn enqueue(&self, batch: DetectionBatch) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if let Some(evicted) = self.queue.push(batch) {
            let total = self.counters.evicted.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!(
                "EventPublisher: queue full, evicted batch from {} queued {:?} ago ({} evicted)",
                evicted.batch.source_id,
                evicted.enqueued_at.elapsed(),
                total
            );
        }
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            queue_depth: self.queue.len(),
        }
    }

    /// Stop the worker and discard whatever is still queued. The sink is
    /// dropped with the worker. Safe to call more than once.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            worker
                .join
                .join()
                .map_err(|_| anyhow!("event publisher thread panicked"))?;
        }
        self.sink = None;
        let discarded = self.queue.clear();
        let stats = self.stats();
        log::info!(
            "EventPublisher: stopped (published {}, failed {}, evicted {}, discarded {})",
            stats.published,
            stats.failed,
            stats.evicted,
            discarded
        );
        Ok(())
    }
}

impl Drop for EventPublisher {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("EventPublisher: stop during drop failed: {}", err);
        }
    }
}

fn deliver(sink: &mut dyn EventSink, entry: &QueuedBatch, counters: &PublisherCounters) {
    let body = match to_wire_json(&entry.batch) {
        Ok(body) => body,
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            log::warn!("EventPublisher: dropping batch: {:#}", err);
            return;
        }
    };
    match sink.send(&body) {
        Ok(200) => {
            let published = counters.published.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!(
                "EventPublisher: published {} detection(s) ({} total)",
                entry.batch.len(),
                published
            );
        }
        Ok(status) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            log::warn!("EventPublisher: collector answered HTTP {}", status);
        }
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            log::debug!("EventPublisher: {:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Records bodies and answers with a fixed status.
    struct RecordingSink {
        status: Option<u16>,
        bodies: Arc<Mutex<Vec<String>>>,
    }

    impl EventSink for RecordingSink {
        fn send(&mut self, body: &str) -> Result<u16> {
            self.bodies.lock().unwrap().push(body.to_string());
            self.status.ok_or_else(|| anyhow!("connection refused"))
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    fn publisher(status: Option<u16>, interval_ms: u64) -> (EventPublisher, Arc<Mutex<Vec<String>>>) {
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink {
            status,
            bodies: Arc::clone(&bodies),
        };
        let publisher = EventPublisher::new(
            Box::new(sink),
            PublisherConfig {
                flush_interval: Duration::from_millis(interval_ms),
                queue_capacity: 100,
            },
        )
        .unwrap();
        (publisher, bodies)
    }

    fn batch(tag: &str) -> DetectionBatch {
        DetectionBatch::new(Vec::new(), Utc::now(), 640, 480, tag)
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn delivers_in_enqueue_order_one_per_wake() -> Result<()> {
        let (mut publisher, bodies) = publisher(Some(200), 10);
        for tag in ["a", "b", "c"] {
            assert!(publisher.enqueue(batch(tag)));
        }
        publisher.start()?;
        assert!(wait_until(Duration::from_secs(2), || publisher.stats().published == 3));
        let sent = bodies.lock().unwrap().clone();
        let ids: Vec<String> = sent
            .iter()
            .map(|b| serde_json::from_str::<serde_json::Value>(b).unwrap()["camera_id"].to_string())
            .collect();
        assert_eq!(ids, vec!["\"a\"", "\"b\"", "\"c\""]);
        publisher.stop()?;
        Ok(())
    }

    #[test]
    fn non_200_and_transport_errors_count_as_failures() -> Result<()> {
        for status in [Some(204), Some(500), None] {
            let (mut publisher, bodies) = publisher(status, 10);
            publisher.start()?;
            publisher.enqueue(batch("x"));
            assert!(wait_until(Duration::from_secs(2), || publisher.stats().failed == 1));
            thread::sleep(Duration::from_millis(40));
            assert_eq!(bodies.lock().unwrap().len(), 1, "failed batch must not be retried");
            assert_eq!(publisher.stats().published, 0);
            publisher.stop()?;
        }
        Ok(())
    }

    #[test]
    fn stop_discards_queue_and_rejects_new_batches() -> Result<()> {
        let (mut publisher, bodies) = publisher(Some(200), 60_000);
        publisher.start()?;
        for i in 0..5 {
            publisher.enqueue(batch(&format!("cam-{i}")));
        }
        assert_eq!(publisher.queue_depth(), 5);
        let started = Instant::now();
        publisher.stop()?;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(publisher.queue_depth(), 0);
        assert!(bodies.lock().unwrap().is_empty());
        assert!(!publisher.enqueue(batch("late")));
        assert_eq!(publisher.stats().rejected, 1);
        assert!(publisher.start().is_err());
        Ok(())
    }

    #[test]
    fn rejects_zero_interval() {
        let sink = RecordingSink {
            status: Some(200),
            bodies: Arc::new(Mutex::new(Vec::new())),
        };
        let config = PublisherConfig {
            flush_interval: Duration::ZERO,
            queue_capacity: 10,
        };
        assert!(EventPublisher::new(Box::new(sink), config).is_err());
    }
}
