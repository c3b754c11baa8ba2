//! Disruptor style persistence pipeline.
//!
//! Producers claim the next sequence of a bounded [`RingBuffer`] and write a
//! [`StoreOp`] into its slot. Three dedicated threads follow the cursor, each
//! gated on the stage before it:
//!
//! 1. **matcher**: runs the [`EventMatcher`] over every new slot
//! 2. **persister**: acquires matched slots and writes the remaining
//!    operations in batches of at most `max_batch_size`, retrying a failed
//!    batch as a whole
//! 3. **completion**: reports every operation to the completion hook and
//!    frees the slot for reuse
//!
//! Producers only block when the ring is full, that is when the completion
//! stage is a whole ring behind the cursor.

use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::adapter::StorageAdapter;
use super::matcher::EventMatcher;
use super::ring::{RingBuffer, INITIAL_SEQUENCE};
use super::wait::WaitStrategy;
use super::{offload_blocking, StorageError, StoreOp};
use crate::metrics::MetricsRegistry;
use crate::Backpressure;

/// Called once per non-cancelled operation after it went through the
/// persister, with the failure reason if it could not be written.
pub type CompletionHook = Box<dyn Fn(&StoreOp, Option<&str>) + Send + Sync>;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ring_size: usize,
    pub max_batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub wait_timeout: Duration,
    /// Events the matcher looks back over; defaults to the ring size
    pub matcher_window: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ring_size: 4096,
            max_batch_size: 256,
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
            wait_timeout: Duration::from_millis(10),
            matcher_window: None,
        }
    }
}

impl PipelineConfig {
    pub fn with_ring_size(mut self, ring_size: usize) -> Self {
        self.ring_size = ring_size;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    fn window(&self) -> usize {
        self.matcher_window.unwrap_or(self.ring_size)
    }
}

struct Shared {
    ring: RingBuffer,
    cursor: CachePadded<AtomicI64>,
    matcher_seq: CachePadded<AtomicI64>,
    persister_seq: CachePadded<AtomicI64>,
    completion_seq: CachePadded<AtomicI64>,
    /// Serialises sequence claims between producers
    claim: Mutex<()>,
    wait: WaitStrategy,
    alert: AtomicBool,
    halted: AtomicBool,
    metrics: Arc<MetricsRegistry>,
    config: PipelineConfig,
}

impl Shared {
    fn signal(&self) {
        self.wait.signal_all();
    }
}

pub struct PersistencePipeline {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PersistencePipeline {
    pub fn start(
        adapter: Arc<dyn StorageAdapter>,
        config: PipelineConfig,
        metrics: Arc<MetricsRegistry>,
        hook: CompletionHook,
    ) -> Result<Self, StorageError> {
        if config.max_batch_size == 0 {
            return Err(StorageError::Backend(
                "Maximum batch size must be positive".to_string(),
            ));
        }
        let ring = RingBuffer::new(config.ring_size)?;
        let window = config.window();
        let shared = Arc::new(Shared {
            ring,
            cursor: CachePadded::new(AtomicI64::new(INITIAL_SEQUENCE)),
            matcher_seq: CachePadded::new(AtomicI64::new(INITIAL_SEQUENCE)),
            persister_seq: CachePadded::new(AtomicI64::new(INITIAL_SEQUENCE)),
            completion_seq: CachePadded::new(AtomicI64::new(INITIAL_SEQUENCE)),
            claim: Mutex::new(()),
            wait: WaitStrategy::new(config.wait_timeout),
            alert: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            metrics,
            config,
        });

        let mut workers = Vec::with_capacity(3);
        let matcher_shared = Arc::clone(&shared);
        workers.push(
            thread::Builder::new()
                .name("amqbroker-matcher".to_string())
                .spawn(move || run_matcher(matcher_shared, window))?,
        );
        let persister_shared = Arc::clone(&shared);
        workers.push(
            thread::Builder::new()
                .name("amqbroker-persister".to_string())
                .spawn(move || run_persister(persister_shared, adapter))?,
        );
        let completion_shared = Arc::clone(&shared);
        workers.push(
            thread::Builder::new()
                .name("amqbroker-completion".to_string())
                .spawn(move || run_completion(completion_shared, hook))?,
        );

        info!(
            ring_size = shared.ring.size(),
            max_batch_size = shared.config.max_batch_size,
            window,
            "Persistence pipeline started"
        );
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Publish an operation, blocking while the ring is full. On a tokio
    /// worker the wait goes through [`offload_blocking`].
    pub fn publish(&self, op: StoreOp) -> Result<i64, StorageError> {
        self.ensure_running()?;
        let _claim = self.shared.claim.lock();
        let next = self.shared.cursor.load(Ordering::Acquire) + 1;
        let wrap_point = next - self.shared.ring.size() as i64;
        if self.shared.completion_seq.load(Ordering::Acquire) < wrap_point {
            offload_blocking(|| {
                self.shared
                    .wait
                    .wait_for(wrap_point, &self.shared.completion_seq, &self.shared.alert)
            })
            .map_err(|_| StorageError::Halted)?;
        }
        Ok(self.commit(next, op))
    }

    /// Publish without blocking. A full ring is reported as backpressure.
    pub fn try_publish(&self, op: StoreOp) -> Result<Result<i64, Backpressure>, StorageError> {
        self.ensure_running()?;
        let _claim = self.shared.claim.lock();
        let next = self.shared.cursor.load(Ordering::Acquire) + 1;
        let wrap_point = next - self.shared.ring.size() as i64;
        if self.shared.completion_seq.load(Ordering::Acquire) < wrap_point {
            return Ok(Err(Backpressure::RingBufferFull));
        }
        Ok(Ok(self.commit(next, op)))
    }

    fn ensure_running(&self) -> Result<(), StorageError> {
        if self.shared.halted.load(Ordering::Acquire) || self.shared.alert.load(Ordering::Acquire)
        {
            return Err(StorageError::Halted);
        }
        Ok(())
    }

    fn commit(&self, sequence: i64, op: StoreOp) -> i64 {
        self.shared.ring.get(sequence).write(sequence, op);
        self.shared.cursor.store(sequence, Ordering::Release);
        self.shared.signal();
        sequence
    }

    /// Last published sequence
    pub fn cursor(&self) -> i64 {
        self.shared.cursor.load(Ordering::Acquire)
    }

    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::Acquire)
    }

    /// Wait until the completion stage passed `sequence`.
    pub fn wait_for_persisted(&self, sequence: i64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.shared
            .wait
            .wait_until(sequence, &self.shared.completion_seq, deadline)
            .is_some()
    }

    /// Drain published operations and stop the worker threads.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        if workers.is_empty() {
            return;
        }

        let cursor = self.cursor();
        if !self.wait_for_persisted(cursor, DRAIN_TIMEOUT) {
            warn!(
                cursor,
                completed = self.shared.completion_seq.load(Ordering::Acquire),
                "Persistence pipeline did not drain before shutdown"
            );
        }
        self.shared.alert.store(true, Ordering::Release);
        self.shared.signal();

        for worker in workers.drain(..) {
            if worker.join().is_err() {
                error!("Persistence pipeline worker panicked");
            }
        }
        info!("Persistence pipeline stopped");
    }
}

impl Drop for PersistencePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_matcher(shared: Arc<Shared>, window: usize) {
    let mut matcher = EventMatcher::new(window);
    let mut next = shared.matcher_seq.load(Ordering::Acquire) + 1;
    while let Ok(available) = shared.wait.wait_for(next, &shared.cursor, &shared.alert) {
        let mut cancelled = 0;
        while next <= available {
            cancelled += matcher.on_event(&shared.ring, next);
            next += 1;
        }
        if cancelled > 0 {
            shared.metrics.storage.record_cancelled(cancelled);
        }
        shared.matcher_seq.store(available, Ordering::Release);
        shared.signal();
    }
}

fn run_persister(shared: Arc<Shared>, adapter: Arc<dyn StorageAdapter>) {
    let max_batch = shared.config.max_batch_size as i64;
    let mut next = shared.persister_seq.load(Ordering::Acquire) + 1;
    let mut batch = Vec::with_capacity(shared.config.max_batch_size);
    let mut sequences = Vec::with_capacity(shared.config.max_batch_size);

    while let Ok(available) = shared.wait.wait_for(next, &shared.matcher_seq, &shared.alert) {
        while next <= available {
            let end = available.min(next + max_batch - 1);
            batch.clear();
            sequences.clear();
            for sequence in next..=end {
                let slot = shared.ring.get(sequence);
                let backoff = Backoff::new();
                // the matcher may hold the slot for a moment while cancelling
                while !slot.acquire_for_persisting() {
                    backoff.snooze();
                }
                if let Some(op) = slot.cloned_op() {
                    batch.push(op);
                    sequences.push(sequence);
                }
            }

            if !batch.is_empty() {
                persist_batch(&shared, adapter.as_ref(), &batch, &sequences);
            }
            shared.persister_seq.store(end, Ordering::Release);
            shared.signal();
            next = end + 1;
        }
    }
}

fn persist_batch(shared: &Shared, adapter: &dyn StorageAdapter, batch: &[StoreOp], sequences: &[i64]) {
    if shared.halted.load(Ordering::Acquire) {
        fail_batch(shared, sequences, &StorageError::Halted.to_string());
        return;
    }

    let mut attempts = 0;
    loop {
        attempts += 1;
        match adapter.persist_batch(batch) {
            Ok(()) => {
                shared.metrics.storage.record_batch(batch.len() as u64);
                debug!(operations = batch.len(), attempts, "Persisted batch");
                return;
            }
            Err(e) if attempts <= shared.config.max_retries => {
                warn!(attempt = attempts, error = %e, "Persisting batch failed, retrying");
                shared.metrics.storage.record_retry();
                thread::sleep(shared.config.retry_backoff * attempts);
            }
            Err(e) => {
                let exhausted = StorageError::RetriesExhausted {
                    attempts,
                    reason: e.to_string(),
                };
                error!(
                    operations = batch.len(),
                    error = %exhausted,
                    "Halting persistence pipeline, durability can no longer be guaranteed"
                );
                shared.halted.store(true, Ordering::Release);
                fail_batch(shared, sequences, &exhausted.to_string());
                return;
            }
        }
    }
}

fn fail_batch(shared: &Shared, sequences: &[i64], reason: &str) {
    for sequence in sequences {
        shared.ring.get(*sequence).set_failure(reason.to_string());
    }
    shared.metrics.storage.record_failed(sequences.len() as u64);
}

fn run_completion(shared: Arc<Shared>, hook: CompletionHook) {
    let mut next = shared.completion_seq.load(Ordering::Acquire) + 1;
    while let Ok(available) = shared.wait.wait_for(next, &shared.persister_seq, &shared.alert) {
        while next <= available {
            let slot = shared.ring.get(next);
            let failure = slot.take_failure();
            if let Some(op) = slot.take_op() {
                hook(&op, failure.as_deref());
            }
            slot.clear();
            next += 1;
        }
        shared.completion_seq.store(available, Ordering::Release);
        shared.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MessageData, Metadata};
    use crate::store::{InMemoryAdapter, StoredMessage};
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn insert(id: u64) -> StoreOp {
        StoreOp::Insert(StoredMessage {
            id,
            data: Arc::new(MessageData::new(
                Metadata::new("", "q", 1),
                Bytes::from_static(b"x"),
            )),
            queues: vec!["q".to_string()],
        })
    }

    /// Adapter failing every batch until `failures` attempts were made
    struct FlakyAdapter {
        inner: InMemoryAdapter,
        failures: AtomicUsize,
        batches: Mutex<Vec<usize>>,
    }

    impl FlakyAdapter {
        fn new(failures: usize) -> Self {
            Self {
                inner: InMemoryAdapter::new(),
                failures: AtomicUsize::new(failures),
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    impl StorageAdapter for FlakyAdapter {
        fn persist_batch(&self, ops: &[StoreOp]) -> Result<(), StorageError> {
            let remaining = self.failures.load(Ordering::Acquire);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::Release);
                return Err(StorageError::Backend("disk unavailable".to_string()));
            }
            self.batches.lock().push(ops.len());
            self.inner.persist_batch(ops)
        }

        fn read(&self, ids: &[u64]) -> Result<HashMap<u64, Arc<MessageData>>, StorageError> {
            self.inner.read(ids)
        }

        fn read_all(&self, queue: &str) -> Result<Vec<u64>, StorageError> {
            self.inner.read_all(queue)
        }

        fn store_prepared(&self, xid: &crate::transaction::Xid, ops: &[StoreOp]) -> Result<(), StorageError> {
            self.inner.store_prepared(xid, ops)
        }

        fn remove_prepared(&self, xid: &crate::transaction::Xid) -> Result<(), StorageError> {
            self.inner.remove_prepared(xid)
        }

        fn prepared(&self) -> Result<Vec<(crate::transaction::Xid, Vec<StoreOp>)>, StorageError> {
            self.inner.prepared()
        }

        fn max_message_id(&self) -> Result<u64, StorageError> {
            self.inner.max_message_id()
        }
    }

    fn counting_hook() -> (CompletionHook, Arc<Mutex<Vec<(u64, Option<String>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);
        let hook: CompletionHook = Box::new(move |op, failure| {
            hook_seen
                .lock()
                .push((op.message_id(), failure.map(str::to_string)));
        });
        (hook, seen)
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig::default()
            .with_ring_size(16)
            .with_retries(2, Duration::from_millis(1))
    }

    #[test]
    fn test_operations_reach_adapter() {
        let adapter = Arc::new(InMemoryAdapter::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let (hook, seen) = counting_hook();
        let pipeline =
            PersistencePipeline::start(adapter.clone(), fast_config(), metrics.clone(), hook)
                .unwrap();

        // more operations than slots exercises wraparound
        for id in 1..=40 {
            pipeline.publish(insert(id)).unwrap();
        }
        for id in 1..=20 {
            pipeline.publish(StoreOp::Delete { id }).unwrap();
        }
        assert!(pipeline.wait_for_persisted(pipeline.cursor(), Duration::from_secs(5)));
        pipeline.shutdown();

        assert_eq!(adapter.read_all("q").unwrap(), (21..=40).collect::<Vec<_>>());
        assert!(seen.lock().iter().all(|(_, failure)| failure.is_none()));
        let persisted = metrics.storage.persisted_operations();
        let cancelled = metrics.storage.cancelled_operations();
        assert_eq!(persisted + cancelled, 60);
    }

    #[test]
    fn test_insert_then_delete_collapses_before_persisting() {
        let adapter = Arc::new(FlakyAdapter::new(0));
        let metrics = Arc::new(MetricsRegistry::new());
        let (hook, _) = counting_hook();
        let pipeline =
            PersistencePipeline::start(adapter.clone(), fast_config(), metrics.clone(), hook)
                .unwrap();

        pipeline.publish(insert(7)).unwrap();
        pipeline.publish(StoreOp::Delete { id: 7 }).unwrap();
        pipeline.shutdown();

        // either the pair cancelled or both were written, never half of it
        assert!(adapter.read_all("q").unwrap().is_empty());
        let written: usize = adapter.batches.lock().iter().sum();
        assert_eq!(
            written as u64 + metrics.storage.cancelled_operations(),
            2
        );
    }

    #[test]
    fn test_failed_batch_is_retried() {
        let adapter = Arc::new(FlakyAdapter::new(2));
        let metrics = Arc::new(MetricsRegistry::new());
        let (hook, seen) = counting_hook();
        let pipeline =
            PersistencePipeline::start(adapter.clone(), fast_config(), metrics.clone(), hook)
                .unwrap();

        pipeline.publish(insert(1)).unwrap();
        assert!(pipeline.wait_for_persisted(0, Duration::from_secs(5)));
        assert!(!pipeline.is_halted());
        assert_eq!(adapter.read_all("q").unwrap(), vec![1]);
        assert_eq!(seen.lock().as_slice(), &[(1, None)]);
        assert_eq!(metrics.snapshot().storage.batch_retries, 2);
    }

    #[test]
    fn test_exhausted_retries_halt_pipeline() {
        let adapter = Arc::new(FlakyAdapter::new(usize::MAX));
        let metrics = Arc::new(MetricsRegistry::new());
        let (hook, seen) = counting_hook();
        let pipeline =
            PersistencePipeline::start(adapter.clone(), fast_config(), metrics.clone(), hook)
                .unwrap();

        pipeline.publish(insert(1)).unwrap();
        assert!(pipeline.wait_for_persisted(0, Duration::from_secs(5)));
        assert!(pipeline.is_halted());
        assert!(matches!(
            pipeline.publish(insert(2)),
            Err(StorageError::Halted)
        ));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].1.as_deref().unwrap().contains("3 attempts"));
        assert_eq!(metrics.snapshot().storage.failed_operations, 1);
    }

    #[test]
    fn test_try_publish_reports_full_ring() {
        let adapter = Arc::new(InMemoryAdapter::new());
        let (hook, _) = counting_hook();
        let pipeline = PersistencePipeline::start(
            adapter,
            fast_config(),
            Arc::new(MetricsRegistry::new()),
            hook,
        )
        .unwrap();

        let mut accepted = 0;
        for id in 0..10_000 {
            match pipeline.try_publish(insert(id)).unwrap() {
                Ok(_) => accepted += 1,
                Err(Backpressure::RingBufferFull) => break,
                Err(other) => panic!("unexpected {:?}", other),
            }
        }
        assert!(accepted >= 16);
        pipeline.shutdown();
        assert!(matches!(pipeline.publish(insert(1)), Err(StorageError::Halted)));
    }

    #[test]
    fn test_ring_size_validation() {
        let (hook, _) = counting_hook();
        let result = PersistencePipeline::start(
            Arc::new(InMemoryAdapter::new()),
            PipelineConfig::default().with_ring_size(12),
            Arc::new(MetricsRegistry::new()),
            hook,
        );
        assert!(result.is_err());
    }
}
