//! Parallel bucket listing engine
//!
//! A controller spawns N workers that cooperatively page-scan the key
//! namespace. Worker 0 starts with the whole namespace; the others idle
//! until a busy worker donates the un-scanned tail of its range (work
//! stealing). The controller supervises liveness and detects the moment
//! every worker is simultaneously idle, which means the namespace has
//! been fully enumerated.

mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::Receiver;
use tokio::task::JoinHandle;

use crate::retry::RetryPolicy;
use crate::storage::ObjectStore;
use crate::types::{KeyRange, ObjectDescriptor, StorageClass};
use crate::{Error, Result};

use worker::{ListWorker, WorkerChannels, WorkerStats};

const SUPERVISION_TICK: Duration = Duration::from_millis(200);

/// Pause between worker spawns so each one finishes its startup
/// registration before the next races on the same channels.
const SPAWN_STAGGER: Duration = Duration::from_millis(100);

/// How long a worker may take to exit after the shutdown sentinel before
/// it is forcibly aborted.
const CLEANUP_BUDGET: Duration = Duration::from_secs(10);

const MIN_CRASH_THRESHOLD: Duration = Duration::from_secs(60);

/// Options for [`list_bucket`].
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Number of parallel listing workers.
    pub workers: usize,

    /// Only list objects under this key prefix.
    pub prefix: String,

    /// Sort the final result by name and size.
    pub sort: bool,

    /// Filter out objects under the reserved composite prefix.
    pub skip_composites: bool,

    /// Include directory placeholder objects (names ending in `/`).
    pub include_directories: bool,

    /// Storage classes to include in the result.
    pub allowed_storage_classes: Vec<StorageClass>,

    /// Retry policy applied to every list call.
    pub retry: RetryPolicy,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            prefix: String::new(),
            sort: false,
            skip_composites: true,
            include_directories: false,
            allowed_storage_classes: vec![StorageClass::Standard],
            retry: RetryPolicy::default(),
        }
    }
}

/// List every object in `bucket` (under `options.prefix`) using the
/// parallel work-stealing engine.
pub async fn list_bucket(
    store: Arc<dyn ObjectStore>,
    bucket: &str,
    options: ListOptions,
) -> Result<Vec<ObjectDescriptor>> {
    ListingController::new(store, bucket, options).run().await
}

/// Supervises the listing worker pool.
pub struct ListingController {
    bucket: String,
    store: Arc<dyn ObjectStore>,
    options: ListOptions,
    initialized: HashSet<String>,
    checkins: HashMap<String, Instant>,
    waiting_for_work: usize,
}

impl ListingController {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, options: ListOptions) -> Self {
        Self {
            bucket: bucket.into(),
            store,
            options,
            initialized: HashSet::new(),
            checkins: HashMap::new(),
            waiting_for_work: 0,
        }
    }

    /// Run the listing to completion and return the aggregated result set.
    pub async fn run(mut self) -> Result<Vec<ObjectDescriptor>> {
        if self.options.workers == 0 {
            return Err(Error::invalid_argument("need at least one listing worker"));
        }

        let (need_work_tx, need_work_rx) = async_channel::unbounded();
        let (direct_work_tx, direct_work_rx) = async_channel::unbounded();
        let (heartbeat_tx, heartbeat_rx) = async_channel::unbounded();
        let (idle_tx, idle_rx) = async_channel::unbounded();
        let (unidle_tx, unidle_rx) = async_channel::unbounded();
        let (results_tx, results_rx) = async_channel::unbounded();
        let (metadata_tx, metadata_rx) = async_channel::unbounded();
        let (error_tx, error_rx) = async_channel::unbounded();

        let channels = WorkerChannels {
            need_work_tx,
            need_work_rx,
            direct_work_tx: direct_work_tx.clone(),
            direct_work_rx,
            heartbeat_tx,
            idle_tx,
            unidle_tx,
            results_tx,
            metadata_tx,
            error_tx,
        };

        let mut handles = Vec::with_capacity(self.options.workers);
        for i in 0..self.options.workers {
            // Only the first worker is seeded; the rest block until a
            // donated range arrives.
            let seed = (i == 0).then(KeyRange::whole);
            let worker = ListWorker::new(
                format!("listing-worker-{i}"),
                self.bucket.clone(),
                self.store.clone(),
                channels.clone(),
                seed,
                self.options.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
            tokio::time::sleep(SPAWN_STAGGER).await;
        }

        let crash_threshold = self.crash_threshold();
        let mut results: HashSet<ObjectDescriptor> = HashSet::new();

        let outcome: Result<()> = loop {
            tokio::time::sleep(SUPERVISION_TICK).await;

            if let Ok(e) = error_rx.try_recv() {
                tracing::error!(error = %e, "listing worker reported an error; terminating");
                break Err(Error::listing(format!("listing worker failed: {e}")));
            }

            while let Ok(batch) = results_rx.try_recv() {
                results.extend(batch);
            }

            let any_alive = handles.iter().any(|handle| !handle.is_finished());
            self.drain_tracking(&idle_rx, &unidle_rx, &heartbeat_rx);

            if let Some(crashed) = self.find_crashed(crash_threshold) {
                tracing::error!(worker = %crashed, "worker heartbeat timed out; terminating");
                break Err(Error::listing(
                    "listing worker became unresponsive; check logs for the underlying error",
                ));
            }

            if !any_alive {
                break Ok(());
            }

            tracing::debug!(
                initialized = self.initialized.len(),
                waiting_for_work = self.waiting_for_work,
                results = results.len(),
                "supervision tick"
            );
            if self.waiting_for_work > 0 && self.initialized.len() == self.waiting_for_work {
                tracing::debug!("all workers idle; shutting down");
                for _ in 0..self.options.workers * 2 {
                    if direct_work_tx.send(None).await.is_err() {
                        break;
                    }
                }
                break Ok(());
            }
        };

        if let Err(e) = outcome {
            for handle in &handles {
                handle.abort();
            }
            return Err(e);
        }

        // Drain results while the workers wind down; one may still be
        // finishing a range it stole just before shutdown was decided.
        let wind_down_started = Instant::now();
        loop {
            while let Ok(batch) = results_rx.try_recv() {
                results.extend(batch);
            }
            if handles.iter().all(JoinHandle::is_finished) {
                break;
            }
            if wind_down_started.elapsed() > CLEANUP_BUDGET {
                tracing::debug!("workers outlived the cleanup budget; aborting stragglers");
                for handle in &handles {
                    handle.abort();
                }
                break;
            }
            tokio::time::sleep(SUPERVISION_TICK).await;
        }
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::debug!(error = %e, "listing worker task failed to join");
                }
            }
        }
        while let Ok(batch) = results_rx.try_recv() {
            results.extend(batch);
        }

        let mut api_calls = 0;
        while let Ok(WorkerStats {
            api_calls: calls, ..
        }) = metadata_rx.try_recv()
        {
            api_calls += calls;
        }
        tracing::debug!(api_calls, results = results.len(), "listing complete");

        let mut listed: Vec<ObjectDescriptor> = results.into_iter().collect();
        if self.options.sort {
            listed.sort();
        }
        Ok(listed)
    }

    /// Fold pending idle/unidle/heartbeat signals into the tracking state.
    fn drain_tracking(
        &mut self,
        idle_rx: &Receiver<String>,
        unidle_rx: &Receiver<String>,
        heartbeat_rx: &Receiver<String>,
    ) {
        while idle_rx.try_recv().is_ok() {
            self.waiting_for_work += 1;
        }
        while unidle_rx.try_recv().is_ok() {
            self.waiting_for_work = self.waiting_for_work.saturating_sub(1);
        }
        while let Ok(name) = heartbeat_rx.try_recv() {
            self.checkins.insert(name.clone(), Instant::now());
            self.initialized.insert(name);
        }
    }

    /// An initialized worker that has not checked in within the threshold
    /// has crashed.
    fn find_crashed(&self, threshold: Duration) -> Option<String> {
        let now = Instant::now();
        for (name, last_checkin) in &self.checkins {
            if self.initialized.contains(name) && now.duration_since(*last_checkin) > threshold {
                return Some(name.clone());
            }
        }
        None
    }

    /// Wait at least a minute, or twice the retry delay cap, before
    /// declaring a worker crashed; anything shorter misfires while a
    /// worker is legitimately backing off.
    fn crash_threshold(&self) -> Duration {
        MIN_CRASH_THRESHOLD.max(self.options.retry.max_delay * 2)
    }
}
