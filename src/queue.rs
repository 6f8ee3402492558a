//! Durable Write Queue (C5)
//!
//! A single in-process priority queue of upsert operations with bounded
//! concurrency, exponential-backoff retry on transient errors, and
//! drain-on-shutdown. Ordering is higher-priority-first, ties broken FIFO —
//! this guarantees a finalization write (priority 10) can never be overtaken
//! by a later periodic write (priority 1) for the same session.
//!
//! Grounded on the retry/backoff shape of a connect-with-retry loop
//! (`2^(attempt-1) * base_backoff_ms`) and on a `DashMap`-backed in-flight
//! guard so the same operation id is never running twice concurrently.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::constants::DEFAULT_WRITE_QUEUE;
use crate::errors::PersistenceError;
use crate::model::TranscriptionRecord;
use crate::store::{Store, TranscriptionUpdate};

/// The payload of one queued operation.
#[derive(Debug, Clone)]
pub enum WritePayload {
    CreateTranscription(Box<TranscriptionRecord>),
    UpdateTranscription(Box<TranscriptionUpdate>),
}

#[derive(Debug, Clone)]
struct WriteOp {
    /// Also the in-flight dedup key — the conversationId the op targets.
    id: String,
    priority: i32,
    retries: u32,
    max_retries: u32,
    seq: u64,
    payload: WritePayload,
}

struct HeapEntry(WriteOp);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.seq == other.0.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority pops first; for equal
        // priority, the lower sequence number (enqueued earlier) pops first.
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

struct QueueInner {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    in_flight: DashSet<String>,
    store: Arc<dyn Store>,
    seq: AtomicU64,
    max_concurrency: usize,
    max_retries: u32,
}

/// Handle to the durable write queue. Cheap to clone; the dispatcher runs on
/// a background task owned by the handle returned from [`DurableWriteQueue::spawn`].
#[derive(Clone)]
pub struct DurableWriteQueue {
    inner: Arc<QueueInner>,
}

impl DurableWriteQueue {
    /// Start the dispatcher (polls every `dispatch_poll_ms`) and return a
    /// handle. The dispatcher runs until `cancel` is triggered.
    ///
    /// `max_concurrency`/`max_retries` come from [`crate::config::Config`]
    /// (`WRITE_QUEUE_MAX_CONCURRENCY`/`WRITE_QUEUE_MAX_RETRIES`); callers that
    /// don't need to override the spec's defaults can pass
    /// `DEFAULT_WRITE_QUEUE.max_concurrency`/`.max_retries`.
    pub fn spawn(store: Arc<dyn Store>, cancel: CancellationToken, max_concurrency: usize, max_retries: u32) -> Self {
        let inner = Arc::new(QueueInner {
            heap: Mutex::new(BinaryHeap::new()),
            in_flight: DashSet::new(),
            store,
            seq: AtomicU64::new(0),
            max_concurrency,
            max_retries,
        });

        let dispatcher_inner = inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(DEFAULT_WRITE_QUEUE.dispatch_poll_ms));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => dispatch_ready(&dispatcher_inner),
                }
            }
        });

        Self { inner }
    }

    /// Enqueue a `create` upsert at the given priority (10 = final, 1 = periodic).
    pub fn enqueue_create(&self, conversation_id: &str, priority: i32, record: TranscriptionRecord) {
        self.push(conversation_id, priority, WritePayload::CreateTranscription(Box::new(record)));
    }

    /// Enqueue an `update` upsert at the given priority.
    pub fn enqueue_update(&self, conversation_id: &str, priority: i32, fields: TranscriptionUpdate) {
        self.push(conversation_id, priority, WritePayload::UpdateTranscription(Box::new(fields)));
    }

    fn push(&self, conversation_id: &str, priority: i32, payload: WritePayload) {
        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let op = WriteOp {
            id: conversation_id.to_string(),
            priority,
            retries: 0,
            max_retries: self.inner.max_retries,
            seq,
            payload,
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.heap.lock().await.push(HeapEntry(op));
        });
    }

    /// Block until both the queue and the in-flight set are empty. Used on
    /// graceful shutdown.
    pub async fn flush(&self) {
        loop {
            let empty = self.inner.heap.lock().await.is_empty() && self.inner.in_flight.is_empty();
            if empty {
                return;
            }
            tokio::time::sleep(Duration::from_millis(DEFAULT_WRITE_QUEUE.dispatch_poll_ms)).await;
        }
    }
}

fn dispatch_ready(inner: &Arc<QueueInner>) {
    let inner = inner.clone();
    tokio::spawn(async move {
        loop {
            if inner.in_flight.len() >= inner.max_concurrency {
                return;
            }
            let next = {
                let mut heap = inner.heap.lock().await;
                // Skip (peek-and-requeue) ops whose id is already in flight so a
                // periodic op never races a final op for the same session.
                let mut deferred = Vec::new();
                let mut picked = None;
                while let Some(HeapEntry(op)) = heap.pop() {
                    if inner.in_flight.contains(&op.id) {
                        deferred.push(op);
                        continue;
                    }
                    picked = Some(op);
                    break;
                }
                for op in deferred {
                    heap.push(HeapEntry(op));
                }
                picked
            };

            let Some(op) = next else { return };
            inner.in_flight.insert(op.id.clone());
            let worker_inner = inner.clone();
            tokio::spawn(async move {
                run_with_retry(worker_inner.store.clone(), op, worker_inner.clone()).await;
            });
        }
    });
}

async fn run_with_retry(store: Arc<dyn Store>, mut op: WriteOp, inner: Arc<QueueInner>) {
    loop {
        let result = execute(&store, &op).await;
        match result {
            Ok(()) => {
                inner.in_flight.remove(&op.id);
                return;
            }
            Err(e) if e.is_transient() && op.retries < op.max_retries => {
                op.retries += 1;
                let backoff_ms = DEFAULT_WRITE_QUEUE.retry_base_backoff_ms * 2_u64.pow(op.retries - 1);
                tracing::warn!(
                    conversation_id = %op.id,
                    attempt = op.retries,
                    backoff_ms,
                    error = %e,
                    "durable write failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
            Err(e) => {
                tracing::error!(conversation_id = %op.id, error = %e, "durable write dropped");
                inner.in_flight.remove(&op.id);
                return;
            }
        }
    }
}

async fn execute(store: &Arc<dyn Store>, op: &WriteOp) -> Result<(), PersistenceError> {
    match &op.payload {
        WritePayload::CreateTranscription(record) => store.upsert_transcription_create(record).await,
        WritePayload::UpdateTranscription(fields) => store.upsert_transcription_update(&op.id, fields).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_pops_before_lower() {
        let mut heap = BinaryHeap::new();
        heap.push(HeapEntry(WriteOp {
            id: "a".into(),
            priority: 1,
            retries: 0,
            max_retries: 3,
            seq: 0,
            payload: WritePayload::CreateTranscription(Box::new(sample_record())),
        }));
        heap.push(HeapEntry(WriteOp {
            id: "b".into(),
            priority: 10,
            retries: 0,
            max_retries: 3,
            seq: 1,
            payload: WritePayload::CreateTranscription(Box::new(sample_record())),
        }));

        let first = heap.pop().unwrap();
        assert_eq!(first.0.id, "b");
    }

    #[test]
    fn equal_priority_breaks_ties_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(HeapEntry(WriteOp {
            id: "first".into(),
            priority: 1,
            retries: 0,
            max_retries: 3,
            seq: 0,
            payload: WritePayload::CreateTranscription(Box::new(sample_record())),
        }));
        heap.push(HeapEntry(WriteOp {
            id: "second".into(),
            priority: 1,
            retries: 0,
            max_retries: 3,
            seq: 1,
            payload: WritePayload::CreateTranscription(Box::new(sample_record())),
        }));

        let first = heap.pop().unwrap();
        assert_eq!(first.0.id, "first");
    }

    fn sample_record() -> TranscriptionRecord {
        TranscriptionRecord {
            id: "c1".into(),
            organization_id: "org1".into(),
            duration_in_ms: 0,
            model_name: "stt-rt-v3".into(),
            target_language: "id".into(),
            source_language: None,
            transcription_result: None,
            translation_result: None,
            vocabularies: None,
            status: crate::model::TranscriptionStatus::InProgress,
            version: 1,
        }
    }
}
