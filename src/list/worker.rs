//! Listing worker
//!
//! Each worker page-scans its current key range and cooperates with its
//! peers through MPMC channels: it donates the un-scanned tail of its
//! range when another worker announces it is out of work, and it reports
//! liveness so the controller can tell a slow worker from a dead one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender, TryRecvError};

use crate::download::COMPOSED_PREFIX;
use crate::list::ListOptions;
use crate::splitter::RangeSplitter;
use crate::storage::{ObjectMeta, ObjectStore};
use crate::types::{KeyRange, ObjectDescriptor};
use crate::Error;

/// Hard page cap per list call.
pub(crate) const DEFAULT_PAGE_SIZE: usize = 5000;

/// List-call failures tolerated before the worker gives up. Each failure
/// has already exhausted the retry policy's backoff budget.
const DEFAULT_MAX_RETRIES: u32 = 5;

const POLL_SLEEP: Duration = Duration::from_millis(100);

/// Coordination endpoints shared by every listing worker.
///
/// `direct_work` carries donated ranges; `None` on it is the shutdown
/// sentinel. Workers both produce and consume `need_work` and
/// `direct_work`; the remaining channels flow worker-to-controller only.
#[derive(Clone)]
pub(crate) struct WorkerChannels {
    pub need_work_tx: Sender<String>,
    pub need_work_rx: Receiver<String>,
    pub direct_work_tx: Sender<Option<KeyRange>>,
    pub direct_work_rx: Receiver<Option<KeyRange>>,
    pub heartbeat_tx: Sender<String>,
    pub idle_tx: Sender<String>,
    pub unidle_tx: Sender<String>,
    pub results_tx: Sender<HashSet<ObjectDescriptor>>,
    pub metadata_tx: Sender<WorkerStats>,
    pub error_tx: Sender<Error>,
}

/// Final per-worker accounting, reported on shutdown.
#[derive(Debug, Clone)]
pub(crate) struct WorkerStats {
    pub name: String,
    pub api_calls: u64,
}

pub(crate) struct ListWorker {
    name: String,
    bucket: String,
    store: Arc<dyn ObjectStore>,
    channels: WorkerChannels,
    range: Option<KeyRange>,
    results: HashSet<ObjectDescriptor>,
    splitter: RangeSplitter,
    options: ListOptions,
    page_size: usize,
    max_retries: u32,
    api_calls: u64,
}

impl ListWorker {
    pub(crate) fn new(
        name: String,
        bucket: String,
        store: Arc<dyn ObjectStore>,
        channels: WorkerChannels,
        range: Option<KeyRange>,
        options: ListOptions,
    ) -> Self {
        Self {
            name,
            bucket,
            store,
            channels,
            range,
            results: HashSet::new(),
            splitter: RangeSplitter::default(),
            options,
            page_size: DEFAULT_PAGE_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            api_calls: 0,
        }
    }

    /// Run the worker until its range space is exhausted and the
    /// controller sends the shutdown sentinel, or until an error survives
    /// the retry budget. A closed channel means the controller is gone and
    /// the worker exits quietly.
    pub(crate) async fn run(mut self) {
        tracing::debug!(worker = %self.name, "listing worker starting");
        // Startup registration: idle and unidle cancel out on the
        // controller's waiting-for-work counter, and the first heartbeat
        // doubles as the initialized signal.
        if self.channels.idle_tx.send(self.name.clone()).await.is_err() {
            return;
        }
        if self.channels.unidle_tx.send(self.name.clone()).await.is_err() {
            return;
        }
        if self
            .channels
            .heartbeat_tx
            .send(self.name.clone())
            .await
            .is_err()
        {
            return;
        }

        if self.range.is_none() && !self.wait_for_work().await {
            return;
        }

        let mut retries_remaining = self.max_retries;
        loop {
            let range = match &self.range {
                Some(range) => range.clone(),
                None => return,
            };

            let page = match self.list_one_page(&range).await {
                Ok(page) => {
                    retries_remaining = self.max_retries;
                    page
                }
                Err(e) => {
                    retries_remaining -= 1;
                    tracing::error!(
                        worker = %self.name,
                        retries_remaining,
                        error = %e,
                        "list call failed"
                    );
                    if retries_remaining == 0 {
                        tracing::error!(worker = %self.name, "out of retries; exiting");
                        let _ = self.channels.error_tx.send(e).await;
                        return;
                    }
                    continue;
                }
            };

            if self.consume_page(page) {
                if !self.maybe_donate().await {
                    return;
                }
            } else {
                // Range exhausted: flush and go idle.
                if !self.results.is_empty() {
                    let results = std::mem::take(&mut self.results);
                    if self.channels.results_tx.send(results).await.is_err() {
                        return;
                    }
                }
                if !self.wait_for_work().await {
                    return;
                }
            }
        }
    }

    /// Fetch one page for `range`, retrying with backoff and emitting a
    /// heartbeat on every attempt so the crash detector stays quiet during
    /// legitimate backoff.
    async fn list_one_page(&mut self, range: &KeyRange) -> crate::Result<Vec<ObjectMeta>> {
        let prefix = self.options.prefix.clone();
        let start = format!("{prefix}{}", range.start);
        let end = if range.end.is_empty() {
            String::new()
        } else {
            format!("{prefix}{}", range.end)
        };

        let mut backoff = self.options.retry.backoff();
        loop {
            if self
                .channels
                .heartbeat_tx
                .send(self.name.clone())
                .await
                .is_err()
            {
                return Err(Error::internal("heartbeat channel closed"));
            }
            self.api_calls += 1;
            match self
                .store
                .list_page(&self.bucket, &start, &end, &prefix, self.page_size)
                .await
            {
                Ok(page) => return Ok(page),
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::debug!(worker = %self.name, error = %e, "retrying list call");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    /// Record one page of results and advance the range start past it.
    /// Returns true when the page was full, meaning pagination continues.
    fn consume_page(&mut self, page: Vec<ObjectMeta>) -> bool {
        let full_page = page.len() == self.page_size;
        for meta in page {
            if self.passes_filters(&meta) {
                self.results
                    .insert(ObjectDescriptor::new(meta.name.clone(), meta.size));
            }
            // Advance past every key, filtered or not, with the caller's
            // prefix stripped so range arithmetic stays prefix-agnostic.
            let stripped = meta
                .name
                .strip_prefix(&self.options.prefix)
                .unwrap_or(&meta.name)
                .to_string();
            if let Some(range) = &mut self.range {
                range.start = stripped;
            }
        }
        full_page
    }

    fn passes_filters(&self, meta: &ObjectMeta) -> bool {
        if self.options.skip_composites && meta.name.starts_with(COMPOSED_PREFIX) {
            return false;
        }
        if !self.options.include_directories && meta.name.ends_with('/') {
            return false;
        }
        self.options
            .allowed_storage_classes
            .contains(&meta.storage_class)
    }

    /// Donate the upper half of the remaining range if a peer is waiting
    /// for work. Returns false when coordination channels have closed.
    async fn maybe_donate(&mut self) -> bool {
        let token = match self.channels.need_work_rx.try_recv() {
            Ok(token) => token,
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Closed) => return false,
        };
        let range = match self.range.clone() {
            Some(range) => range,
            None => return true,
        };

        let splits = match self.splitter.split_range(&range.start, &range.end, 1) {
            Ok(splits) => splits,
            Err(e) => {
                let _ = self.channels.error_tx.send(e).await;
                return false;
            }
        };
        match splits.first() {
            Some(point) => {
                tracing::debug!(
                    worker = %self.name,
                    split = %point,
                    "donating upper range half"
                );
                let donated = KeyRange::new(point.clone(), range.end.clone());
                if self
                    .channels
                    .direct_work_tx
                    .send(Some(donated))
                    .await
                    .is_err()
                {
                    return false;
                }
                if let Some(range) = &mut self.range {
                    range.end = point.clone();
                }
            }
            None => {
                // The remaining tail is too narrow to split; hand the
                // request back so a peer with more room can serve it.
                let _ = self.channels.need_work_tx.send(token).await;
            }
        }
        true
    }

    /// Block until donated work or the shutdown sentinel arrives.
    ///
    /// Announces need-work and idleness once, then polls the direct-work
    /// channel, heartbeating each iteration. Returns false on shutdown.
    pub(crate) async fn wait_for_work(&mut self) -> bool {
        if self
            .channels
            .need_work_tx
            .send(self.name.clone())
            .await
            .is_err()
        {
            return false;
        }
        if self.channels.idle_tx.send(self.name.clone()).await.is_err() {
            return false;
        }
        tracing::debug!(worker = %self.name, "waiting for work");

        let new_range = loop {
            if self
                .channels
                .heartbeat_tx
                .send(self.name.clone())
                .await
                .is_err()
            {
                return false;
            }
            match self.channels.direct_work_rx.try_recv() {
                Ok(range) => break range,
                Err(TryRecvError::Empty) => tokio::time::sleep(POLL_SLEEP).await,
                Err(TryRecvError::Closed) => return false,
            }
        };

        match new_range {
            Some(range) => {
                if self.channels.unidle_tx.send(self.name.clone()).await.is_err() {
                    return false;
                }
                tracing::debug!(
                    worker = %self.name,
                    start = %range.start,
                    end = %range.end,
                    "received new range"
                );
                self.range = Some(range);
                true
            }
            None => {
                tracing::debug!(worker = %self.name, "received shutdown signal");
                let _ = self
                    .channels
                    .metadata_tx
                    .send(WorkerStats {
                        name: self.name.clone(),
                        api_calls: self.api_calls,
                    })
                    .await;
                false
            }
        }
    }
}
