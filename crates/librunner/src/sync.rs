//! Asynchronous replication of written files into object storage.
//!
//! [`SyncWriter::enqueue`] never blocks the caller. A single worker task owns
//! the queue: jobs are keyed by object key, a newer job for a key replaces a
//! queued older one, and at most one upload per key is in flight so objects
//! settle on the last write. Transient store failures are retried with
//! exponential backoff; permanent failures and exhausted retries are logged
//! and dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::store::ObjectStore;
use crate::workspace::WorkspaceId;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn normalized_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retrying after the `attempt`-th failure.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let capped = attempt.min(31);
        let mult = 1u64 << capped.saturating_sub(1);
        let millis = self.base_delay.as_millis() as u64;
        let raw = millis.saturating_mul(mult);
        Duration::from_millis(raw.min(self.max_delay.as_millis() as u64))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub retry: RetryPolicy,
    /// Prepended to every object key as `{prefix}/`.
    pub key_prefix: Option<String>,
    pub max_concurrent: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            key_prefix: None,
            max_concurrent: 4,
        }
    }
}

/// One file version waiting to be replicated.
#[derive(Debug, Clone)]
pub struct ReplicationJob {
    pub key: String,
    pub workspace_id: WorkspaceId,
    pub relative_path: String,
    pub content: Arc<[u8]>,
    pub enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct SyncStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    superseded: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    pub retried: u64,
    pub superseded: u64,
    pub dropped: u64,
}

impl SyncSnapshot {
    /// Jobs accepted but not yet delivered, dropped or superseded.
    pub fn outstanding(&self) -> u64 {
        self.enqueued
            .saturating_sub(self.delivered + self.dropped + self.superseded)
    }
}

/// Handle for queueing replication jobs. Cheap to clone; the worker drains
/// and exits once every handle is dropped.
#[derive(Clone)]
pub struct SyncWriter {
    tx: mpsc::UnboundedSender<ReplicationJob>,
    stats: Arc<SyncStats>,
    key_prefix: Option<String>,
}

impl SyncWriter {
    /// Start the replication worker on the current runtime.
    pub fn spawn(store: Arc<dyn ObjectStore>, config: SyncConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(SyncStats::default());
        let key_prefix = config
            .key_prefix
            .as_deref()
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        let worker = tokio::spawn(run_worker(store, config, Arc::clone(&stats), rx));
        (
            Self {
                tx,
                stats,
                key_prefix,
            },
            worker,
        )
    }

    /// Object key for a workspace file: `{prefix}/{workspace id}/{path}`.
    pub fn key_for(&self, workspace_id: &WorkspaceId, relative_path: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}/{workspace_id}/{relative_path}"),
            None => format!("{workspace_id}/{relative_path}"),
        }
    }

    /// Queue `content` for replication. Returns immediately.
    pub fn enqueue(&self, workspace_id: &WorkspaceId, relative_path: &str, content: Vec<u8>) {
        let job = ReplicationJob {
            key: self.key_for(workspace_id, relative_path),
            workspace_id: workspace_id.clone(),
            relative_path: relative_path.to_string(),
            content: content.into(),
            enqueued_at: Instant::now(),
        };
        let key = job.key.clone();
        if self.tx.send(job).is_err() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            error!(key = %key, "replication worker is gone; dropping job");
            return;
        }
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "replication enqueued");
    }

    pub fn stats(&self) -> SyncSnapshot {
        SyncSnapshot {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            superseded: self.stats.superseded.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

struct Worker {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    max_concurrent: usize,
    stats: Arc<SyncStats>,
    pending: HashMap<String, ReplicationJob>,
    order: VecDeque<String>,
    in_flight: HashSet<String>,
    task_keys: HashMap<tokio::task::Id, String>,
    tasks: JoinSet<()>,
}

async fn run_worker(
    store: Arc<dyn ObjectStore>,
    config: SyncConfig,
    stats: Arc<SyncStats>,
    mut rx: mpsc::UnboundedReceiver<ReplicationJob>,
) {
    let mut worker = Worker {
        store,
        retry: config.retry,
        max_concurrent: config.max_concurrent.max(1),
        stats,
        pending: HashMap::new(),
        order: VecDeque::new(),
        in_flight: HashSet::new(),
        task_keys: HashMap::new(),
        tasks: JoinSet::new(),
    };
    let mut open = true;

    loop {
        worker.dispatch();
        if !open && worker.pending.is_empty() && worker.tasks.is_empty() {
            break;
        }

        tokio::select! {
            job = rx.recv(), if open => match job {
                Some(job) => worker.accept(job),
                None => {
                    open = false;
                    debug!(pending = worker.pending.len(), "replication queue closed; draining");
                }
            },
            Some(done) = worker.tasks.join_next_with_id(), if !worker.tasks.is_empty() => {
                let id = match done {
                    Ok((id, ())) => id,
                    Err(e) => {
                        error!(error = %e, "replication task failed");
                        e.id()
                    }
                };
                if let Some(key) = worker.task_keys.remove(&id) {
                    worker.in_flight.remove(&key);
                }
            }
            else => {
                warn!(pending = worker.pending.len(), "replication worker stalled");
                break;
            }
        }
    }

    info!("replication worker stopped");
}

impl Worker {
    fn accept(&mut self, job: ReplicationJob) {
        let key = job.key.clone();
        if let Some(old) = self.pending.insert(key.clone(), job) {
            self.stats.superseded.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, age_ms = old.enqueued_at.elapsed().as_millis() as u64, "queued version superseded");
        } else {
            self.order.push_back(key);
        }
    }

    fn dispatch(&mut self) {
        let mut i = 0;
        while i < self.order.len() && self.tasks.len() < self.max_concurrent {
            if self.in_flight.contains(&self.order[i]) {
                i += 1;
                continue;
            }
            let Some(key) = self.order.remove(i) else {
                break;
            };
            let Some(job) = self.pending.remove(&key) else {
                continue;
            };
            let handle = self.tasks.spawn(deliver(
                Arc::clone(&self.store),
                job,
                self.retry.clone(),
                Arc::clone(&self.stats),
            ));
            self.in_flight.insert(key.clone());
            self.task_keys.insert(handle.id(), key);
        }
    }
}

async fn deliver(
    store: Arc<dyn ObjectStore>,
    job: ReplicationJob,
    retry: RetryPolicy,
    stats: Arc<SyncStats>,
) {
    let attempts = retry.normalized_attempts();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store.put(&job.key, &job.content).await {
            Ok(()) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                info!(
                    key = %job.key,
                    workspace_id = %job.workspace_id,
                    bytes = job.content.len(),
                    attempt,
                    latency_ms = job.enqueued_at.elapsed().as_millis() as u64,
                    "file replicated"
                );
                return;
            }
            Err(e) if e.is_transient() && attempt < attempts => {
                stats.retried.fetch_add(1, Ordering::Relaxed);
                let delay = retry.backoff_delay(attempt);
                warn!(
                    key = %job.key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "replication failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    key = %job.key,
                    path = %job.relative_path,
                    attempts = attempt,
                    error = %e,
                    "replication dropped"
                );
                return;
            }
        }
    }
}
