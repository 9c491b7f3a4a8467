//! Fetch coordinator: single-flight, concurrency-limited upstream fetching
//!
//! Every cache miss goes through [`FetchCoordinator::fetch`]:
//!
//! - Callers asking for a control number that is already being fetched join
//!   that fetch and receive its outcome; no second upstream call is made.
//! - New fetches are pushed onto a bounded FIFO queue. A dispatcher task
//!   admits them one at a time whenever fewer than `concurrency` upstream
//!   calls are outstanding. A full queue rejects the fetch with
//!   [`FetchError::Overloaded`].
//! - Each admitted fetch runs on its own task, so a caller that goes away
//!   does not cancel the upstream call. A successful record is written to
//!   the cache before the in-flight entry is dropped and waiters are woken.
//!   Failures are never cached and never retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::cache::CertificateCache;
use crate::config::CoordinatorConfig;
use crate::error::FetchError;
use crate::upstream::CertificateSource;

/// Result delivered to every waiter of one fetch
type FetchOutcome = Result<Value, FetchError>;

/// A fetch waiting for a concurrency slot
struct FetchJob {
    control_number: String,
    /// Same channel as the in-flight table entry
    sender: broadcast::Sender<FetchOutcome>,
    enqueued_at: Instant,
}

/// State shared by the coordinator handle, the dispatcher and fetch tasks
struct Shared {
    source: Arc<dyn CertificateSource>,
    cache: Arc<CertificateCache>,
    /// At most one entry per control number; waiters subscribe to it
    in_flight: DashMap<String, broadcast::Sender<FetchOutcome>>,
    timeout: Duration,
    stats: CoordinatorStats,
}

#[derive(Debug, Default)]
struct CoordinatorStats {
    upstream_calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    joined: AtomicU64,
    rejected: AtomicU64,
    active: AtomicUsize,
}

/// Deduplicating, concurrency-limited scheduler for upstream fetches
pub struct FetchCoordinator {
    shared: Arc<Shared>,
    queue: mpsc::Sender<FetchJob>,
    concurrency: usize,
    queue_limit: usize,
}

impl FetchCoordinator {
    /// Create a coordinator and start its dispatcher.
    ///
    /// Must be called from within a Tokio runtime. `timeout` bounds each
    /// upstream call; successful records are stored in `cache`.
    pub fn new(
        config: &CoordinatorConfig,
        timeout: Duration,
        source: Arc<dyn CertificateSource>,
        cache: Arc<CertificateCache>,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        let queue_limit = config.queue_limit.max(1);

        let shared = Arc::new(Shared {
            source,
            cache,
            in_flight: DashMap::new(),
            timeout,
            stats: CoordinatorStats::default(),
        });

        let (queue, receiver) = mpsc::channel(queue_limit);
        let slots = Arc::new(Semaphore::new(concurrency));
        tokio::spawn(dispatch(Arc::clone(&shared), slots, receiver));

        debug!(concurrency, queue_limit, timeout_ms = timeout.as_millis(), "Fetch coordinator started");

        Self {
            shared,
            queue,
            concurrency,
            queue_limit,
        }
    }

    /// Fetch the record for `control_number`, joining an in-flight fetch if
    /// one exists.
    ///
    /// All callers waiting on the same fetch receive the same record or the
    /// same error.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn fetch(&self, control_number: &str) -> Result<Value, FetchError> {
        let mut receiver = match self.join_or_enqueue(control_number)? {
            Admission::Ready(record) => return Ok(record),
            Admission::Waiting(receiver) => receiver,
        };

        match receiver.recv().await {
            Ok(outcome) => outcome,
            Err(_) => Err(FetchError::Aborted(format!(
                "fetch for {control_number} ended without a result"
            ))),
        }
    }

    /// Attach to the in-flight fetch for `control_number` or enqueue a new one.
    ///
    /// The check and the insert happen under the same map shard lock, so two
    /// callers can never both start a fetch for one control number.
    fn join_or_enqueue(&self, control_number: &str) -> Result<Admission, FetchError> {
        match self.shared.in_flight.entry(control_number.to_string()) {
            Entry::Occupied(entry) => {
                self.shared.stats.joined.fetch_add(1, Ordering::Relaxed);
                trace!(control_number, "Joined in-flight fetch");
                Ok(Admission::Waiting(entry.get().subscribe()))
            }
            Entry::Vacant(entry) => {
                // A fetch may have completed between the caller's cache miss
                // and taking this lock.
                if let Some(record) = self.shared.cache.peek(control_number) {
                    return Ok(Admission::Ready(record));
                }

                let (sender, receiver) = broadcast::channel(1);
                let job = FetchJob {
                    control_number: control_number.to_string(),
                    sender: sender.clone(),
                    enqueued_at: Instant::now(),
                };

                match self.queue.try_send(job) {
                    Ok(()) => {
                        entry.insert(sender);
                        Ok(Admission::Waiting(receiver))
                    }
                    Err(TrySendError::Full(_)) => {
                        self.shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(control_number, queue_limit = self.queue_limit, "Fetch queue full, rejecting");
                        Err(FetchError::Overloaded(self.queue_limit))
                    }
                    Err(TrySendError::Closed(_)) => {
                        Err(FetchError::Aborted("fetch dispatcher stopped".to_string()))
                    }
                }
            }
        }
    }

    /// Number of fetches waiting for a concurrency slot
    pub fn queue_depth(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    /// Number of distinct control numbers currently being fetched or queued
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.len()
    }

    /// Get coordinator statistics
    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        let stats = &self.shared.stats;
        CoordinatorStatsSnapshot {
            upstream_calls: stats.upstream_calls.load(Ordering::Relaxed),
            successes: stats.successes.load(Ordering::Relaxed),
            failures: stats.failures.load(Ordering::Relaxed),
            joined: stats.joined.load(Ordering::Relaxed),
            rejected: stats.rejected.load(Ordering::Relaxed),
            active: stats.active.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            queued: self.queue_depth(),
            concurrency: self.concurrency,
            queue_limit: self.queue_limit,
        }
    }
}

enum Admission {
    /// Record was already cached
    Ready(Value),
    /// Outcome arrives on this channel
    Waiting(broadcast::Receiver<FetchOutcome>),
}

/// Admit queued fetches in FIFO order as concurrency slots free up.
///
/// Exits once every coordinator handle is dropped and the queue is drained.
async fn dispatch(
    shared: Arc<Shared>,
    slots: Arc<Semaphore>,
    mut queue: mpsc::Receiver<FetchJob>,
) {
    loop {
        // Take a slot before the job so queued jobs stay queued, in order
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        let Some(job) = queue.recv().await else {
            break;
        };

        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            shared.run(job).await;
            drop(permit);
        });
    }
    debug!("Fetch dispatcher stopped");
}

impl Shared {
    /// Execute one upstream call and publish its outcome
    async fn run(&self, job: FetchJob) {
        let FetchJob {
            control_number,
            sender,
            enqueued_at,
        } = job;
        let guard = InFlightGuard {
            in_flight: &self.in_flight,
            control_number: &control_number,
            sender: &sender,
            completed: false,
        };

        self.stats.upstream_calls.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let outcome = match tokio::time::timeout(self.timeout, self.source.fetch(&control_number)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(FetchError::Timeout(self.timeout)),
        };

        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        let latency_ms = started.elapsed().as_millis();
        let queued_ms = started.duration_since(enqueued_at).as_millis();

        match &outcome {
            Ok(record) => {
                self.stats.successes.fetch_add(1, Ordering::Relaxed);
                self.cache.set(&control_number, record.clone());
                info!(control_number = %control_number, latency_ms, queued_ms, "Fetched certificate");
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(control_number = %control_number, error = %e, latency_ms, queued_ms, "Upstream fetch failed");
            }
        }

        guard.complete();
        let waiters = sender.receiver_count();
        // No receivers left is fine: the record is cached either way
        let _ = sender.send(outcome);
        trace!(control_number = %control_number, waiters, "Released waiters");
    }
}

/// Removes the in-flight entry even if the fetch task panics, so later
/// lookups start a fresh fetch instead of waiting forever.
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<String, broadcast::Sender<FetchOutcome>>,
    control_number: &'a str,
    sender: &'a broadcast::Sender<FetchOutcome>,
    completed: bool,
}

impl InFlightGuard<'_> {
    fn complete(mut self) {
        self.remove();
        self.completed = true;
    }

    fn remove(&self) {
        self.in_flight
            .remove_if(self.control_number, |_, current| current.same_channel(self.sender));
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.remove();
        }
    }
}

/// Snapshot of coordinator statistics
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatsSnapshot {
    /// Upstream calls issued
    pub upstream_calls: u64,
    /// Upstream calls that produced a record
    pub successes: u64,
    /// Upstream calls that failed or timed out
    pub failures: u64,
    /// Callers that joined an existing fetch
    pub joined: u64,
    /// Fetches rejected because the queue was full
    pub rejected: u64,
    /// Upstream calls currently running
    pub active: usize,
    /// Control numbers currently being fetched or queued
    pub in_flight: usize,
    /// Fetches waiting for a slot
    pub queued: usize,
    /// Maximum concurrent upstream calls
    pub concurrency: usize,
    /// Maximum queued fetches
    pub queue_limit: usize,
}
