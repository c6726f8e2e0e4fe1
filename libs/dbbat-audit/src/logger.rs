use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::event::AuditEvent;

/// Whatever ultimately persists an [`AuditEvent`]. The proxy implements this
/// over its `Store`; tests can implement it over a `Vec`.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync + 'static {
    async fn write(&self, event: AuditEvent);
}

struct Shared {
    queue: Mutex<VecDeque<AuditEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

/// Queues audit events in memory and hands them to an [`AuditSink`] from a
/// dedicated background task, so neither pump ever blocks on the store.
///
/// When the queue is at capacity, the oldest queued event is discarded to
/// make room for the newest one: under sustained overload we'd rather lose
/// old, already-stale events than stop accepting new ones.
pub struct AuditLogger {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl AuditLogger {
    pub fn spawn(capacity: usize, sink: Arc<dyn AuditSink>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        });

        let worker_shared = shared.clone();
        let worker = tokio::spawn(async move {
            loop {
                let event = {
                    let mut queue = worker_shared.queue.lock().await;
                    queue.pop_front()
                };
                match event {
                    Some(event) => sink.write(event).await,
                    None => worker_shared.notify.notified().await,
                }
            }
        });

        Self { shared, worker }
    }

    /// Enqueue an event. Never awaits on the store; only ever contends the
    /// in-memory queue lock.
    pub async fn log(&self, event: AuditEvent) {
        let mut queue = self.shared.queue.lock().await;
        if queue.len() >= self.shared.capacity {
            queue.pop_front();
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                dropped_total = self.shared.dropped.load(Ordering::Relaxed),
                "audit queue at capacity, dropping oldest event"
            );
        }
        queue.push_back(event);
        drop(queue);
        self.shared.notify.notify_one();
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
