//! Batched download engine
//!
//! Minimizes request count when fetching many small objects: batches are
//! server-side concatenated into one temporary composite object, the
//! composite is downloaded once and sliced back into per-object payloads,
//! then deleted. Objects larger than the batch size cap are downloaded
//! directly. Output order always matches input order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};

use bytes::Bytes;
use futures::stream::Stream;
use uuid::Uuid;

use crate::retry::RetryPolicy;
use crate::storage::ObjectStore;
use crate::types::ObjectDescriptor;
use crate::{Error, Result};

/// Server-side limit on sources per compose call.
pub const MAX_COMPOSE_MEMBERS: usize = 32;

/// Reserved key prefix for transient composite objects. Callers must not
/// create objects under this prefix; listing filters it out by default.
pub const COMPOSED_PREFIX: &str = "composed-objects/";

const DEFAULT_MAX_COMPOSITE_SIZE: u64 = 100 * 1024 * 1024;

/// Fan-out mode for the download engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    /// One strictly sequential batch loop.
    Single,

    /// Partition the object list into contiguous chunks and run one batch
    /// loop per chunk concurrently, sharing the store client.
    Tasks(usize),
}

/// Options for [`download`] and [`download_lazy`].
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Upper bound on a compose batch's cumulative size. The object that
    /// first crosses the bound is still admitted; objects individually
    /// larger than it are downloaded directly.
    pub max_composite_size: u64,

    /// Fan-out mode.
    pub parallelism: Parallelism,

    /// Retry policy applied to every store call.
    pub retry: RetryPolicy,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_composite_size: DEFAULT_MAX_COMPOSITE_SIZE,
            parallelism: Parallelism::Single,
            retry: RetryPolicy::default(),
        }
    }
}

/// The composite currently being processed by this process's batch loop,
/// kept where the interrupt handler can reach it. Written only by the
/// batch loop; read by the Ctrl-C task.
struct ActiveComposite {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    object: String,
}

static ACTIVE_COMPOSITE: Mutex<Option<ActiveComposite>> = Mutex::new(None);
static INTERRUPT_HANDLER: Once = Once::new();

fn register_composite(store: &Arc<dyn ObjectStore>, bucket: &str, object: &str) {
    if let Ok(mut slot) = ACTIVE_COMPOSITE.lock() {
        *slot = Some(ActiveComposite {
            store: store.clone(),
            bucket: bucket.to_string(),
            object: object.to_string(),
        });
    }
}

fn clear_composite() {
    if let Ok(mut slot) = ACTIVE_COMPOSITE.lock() {
        *slot = None;
    }
}

/// Delete the currently registered composite, if any. Best effort: a
/// failure is logged and otherwise ignored.
pub async fn cleanup_active_composite() {
    let active = match ACTIVE_COMPOSITE.lock() {
        Ok(mut slot) => slot.take(),
        Err(_) => None,
    };
    if let Some(active) = active {
        if let Err(e) = active.store.delete(&active.bucket, &active.object).await {
            tracing::error!(
                object = %active.object,
                error = %e,
                "failed to delete composite object during interrupt cleanup"
            );
        }
    }
}

/// Install the Ctrl-C cleanup task once per process. Multiplexed chunk
/// tasks never call this; their parent owns interrupt handling.
fn install_interrupt_handler() {
    INTERRUPT_HANDLER.call_once(|| {
        tokio::spawn(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; cleaning up composite objects");
                cleanup_active_composite().await;
                std::process::exit(130);
            }
        });
    });
}

/// Download every object in `objects`, returning payloads in input order.
pub async fn download(
    store: Arc<dyn ObjectStore>,
    bucket: &str,
    objects: &[ObjectDescriptor],
    options: DownloadOptions,
) -> Result<Vec<Bytes>> {
    match options.parallelism {
        Parallelism::Single => {
            install_interrupt_handler();
            download_chunk(store, bucket.to_string(), objects.to_vec(), options).await
        }
        Parallelism::Tasks(tasks) => download_multiplexed(store, bucket, objects, options, tasks).await,
    }
}

/// Fan the batch loop out over contiguous chunks; results are concatenated
/// in chunk order so output still matches input order.
async fn download_multiplexed(
    store: Arc<dyn ObjectStore>,
    bucket: &str,
    objects: &[ObjectDescriptor],
    options: DownloadOptions,
    tasks: usize,
) -> Result<Vec<Bytes>> {
    if tasks == 0 {
        return Err(Error::invalid_argument("need at least one download task"));
    }
    if objects.is_empty() {
        return Ok(Vec::new());
    }

    let chunk_size = objects.len().div_ceil(tasks);
    let mut handles = Vec::new();
    for chunk in objects.chunks(chunk_size) {
        let store = store.clone();
        let bucket = bucket.to_string();
        let chunk = chunk.to_vec();
        let options = options.clone();
        handles.push(tokio::spawn(download_chunk(store, bucket, chunk, options)));
    }

    let mut contents = Vec::with_capacity(objects.len());
    for handle in handles {
        let chunk_contents = handle
            .await
            .map_err(|e| Error::internal(format!("download task failed: {e}")))??;
        contents.extend(chunk_contents);
    }
    Ok(contents)
}

/// The sequential engine: walk `objects` in order, forming batches.
async fn download_chunk(
    store: Arc<dyn ObjectStore>,
    bucket: String,
    objects: Vec<ObjectDescriptor>,
    options: DownloadOptions,
) -> Result<Vec<Bytes>> {
    let mut contents = Vec::with_capacity(objects.len());
    let mut index = 0;
    while index < objects.len() {
        match next_batch(&objects, &mut index, options.max_composite_size) {
            Batch::Single(descriptor) => {
                contents.push(download_single(&store, &bucket, &descriptor.name, &options.retry).await?);
            }
            Batch::Composed(members) => {
                contents.extend(fetch_composed(&store, &bucket, &members, &options.retry).await?);
            }
        }
    }
    Ok(contents)
}

enum Batch {
    Single(ObjectDescriptor),
    Composed(Vec<ObjectDescriptor>),
}

/// Advance `index` past the next batch. An object larger than the size cap
/// goes alone; otherwise members are admitted while the cumulative size
/// before each admission stays within the cap (so the object that crosses
/// it is still taken) and the member count stays under the compose limit.
fn next_batch(objects: &[ObjectDescriptor], index: &mut usize, max_composite_size: u64) -> Batch {
    let first = &objects[*index];
    if first.size > max_composite_size {
        *index += 1;
        return Batch::Single(first.clone());
    }

    let mut members = Vec::new();
    let mut cumulative = 0u64;
    while *index < objects.len()
        && cumulative <= max_composite_size
        && members.len() < MAX_COMPOSE_MEMBERS
    {
        cumulative += objects[*index].size;
        members.push(objects[*index].clone());
        *index += 1;
    }

    match members.len() {
        1 => Batch::Single(members.swap_remove(0)),
        _ => Batch::Composed(members),
    }
}

/// Compose one batch, download it, slice it apart, and delete the
/// composite. The composite is registered for interrupt cleanup for the
/// duration of the batch.
async fn fetch_composed(
    store: &Arc<dyn ObjectStore>,
    bucket: &str,
    members: &[ObjectDescriptor],
    retry: &RetryPolicy,
) -> Result<Vec<Bytes>> {
    // Fresh name per batch so concurrent engines sharing a bucket never
    // collide on the composite object.
    let composite = format!("{COMPOSED_PREFIX}{}", Uuid::new_v4());
    compose_objects(store, bucket, &composite, members, retry).await?;
    register_composite(store, bucket, &composite);

    let slices = match decompose(store, bucket, &composite, members, retry).await {
        Ok(slices) => slices,
        Err(e) => {
            delete_composite(store, bucket, &composite, retry).await;
            clear_composite();
            return Err(e);
        }
    };

    delete_composite(store, bucket, &composite, retry).await;
    clear_composite();
    Ok(slices)
}

/// Server-side concatenate `members`, in order, into `destination`.
pub async fn compose_objects(
    store: &Arc<dyn ObjectStore>,
    bucket: &str,
    destination: &str,
    members: &[ObjectDescriptor],
    retry: &RetryPolicy,
) -> Result<()> {
    if members.len() > MAX_COMPOSE_MEMBERS {
        return Err(Error::invalid_argument(format!(
            "at most {MAX_COMPOSE_MEMBERS} objects can be composed, got {}",
            members.len()
        )));
    }
    let sources: Vec<String> = members.iter().map(|m| m.name.clone()).collect();
    retry.run(|| store.compose(bucket, destination, &sources)).await
}

/// Download `composite` and slice it back into per-member payloads by the
/// member sizes, in order.
pub async fn decompose(
    store: &Arc<dyn ObjectStore>,
    bucket: &str,
    composite: &str,
    members: &[ObjectDescriptor],
    retry: &RetryPolicy,
) -> Result<Vec<Bytes>> {
    let content = retry.run(|| store.download(bucket, composite)).await?;
    Ok(slice_composite(&content, members, composite))
}

/// Slice the composite by member sizes. A mismatch between the metadata
/// sizes and the downloaded length means the server-side object diverged
/// from the listing; the slices are clamped and the mismatch logged.
fn slice_composite(content: &Bytes, members: &[ObjectDescriptor], composite: &str) -> Vec<Bytes> {
    let mut slices = Vec::with_capacity(members.len());
    let mut offset = 0usize;
    for member in members {
        let start = offset.min(content.len());
        let end = (offset + member.size as usize).min(content.len());
        slices.push(content.slice(start..end));
        offset += member.size as usize;
    }
    if offset != content.len() {
        tracing::error!(
            composite = %composite,
            expected = offset,
            actual = content.len(),
            "composite length does not match member sizes"
        );
    }
    slices
}

/// Download one object with retries.
pub async fn download_single(
    store: &Arc<dyn ObjectStore>,
    bucket: &str,
    object: &str,
    retry: &RetryPolicy,
) -> Result<Bytes> {
    retry.run(|| store.download(bucket, object)).await
}

/// Best-effort composite deletion; a failure is logged, never raised, so
/// already-downloaded data is not thrown away.
async fn delete_composite(
    store: &Arc<dyn ObjectStore>,
    bucket: &str,
    composite: &str,
    retry: &RetryPolicy,
) {
    if let Err(e) = retry.run(|| store.delete(bucket, composite)).await {
        tracing::error!(
            object = %composite,
            error = %e,
            "failed to delete composite object"
        );
    }
}

struct LazyState {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    objects: Vec<ObjectDescriptor>,
    options: DownloadOptions,
    index: usize,
    pending: VecDeque<Bytes>,
    /// Composite from the batch currently being drained; deleted once the
    /// consumer has pulled the batch's last slice.
    cleanup: Option<String>,
}

/// Stream variant of [`download`]: identical batching, but payloads are
/// produced as the consumer pulls them, and each batch's composite is
/// deleted only after that batch's slices have been drained.
pub fn download_lazy(
    store: Arc<dyn ObjectStore>,
    bucket: impl Into<String>,
    objects: Vec<ObjectDescriptor>,
    options: DownloadOptions,
) -> impl Stream<Item = Result<Bytes>> {
    let state = LazyState {
        store,
        bucket: bucket.into(),
        objects,
        options,
        index: 0,
        pending: VecDeque::new(),
        cleanup: None,
    };

    futures::stream::try_unfold(state, |mut state| async move {
        if matches!(state.options.parallelism, Parallelism::Single) {
            install_interrupt_handler();
        }
        loop {
            if let Some(bytes) = state.pending.pop_front() {
                return Ok(Some((bytes, state)));
            }

            // The previous batch is fully drained; its composite can go.
            if let Some(composite) = state.cleanup.take() {
                delete_composite(&state.store, &state.bucket, &composite, &state.options.retry)
                    .await;
                clear_composite();
            }
            if state.index >= state.objects.len() {
                return Ok(None);
            }

            match next_batch(&state.objects, &mut state.index, state.options.max_composite_size) {
                Batch::Single(descriptor) => {
                    let bytes = download_single(
                        &state.store,
                        &state.bucket,
                        &descriptor.name,
                        &state.options.retry,
                    )
                    .await?;
                    state.pending.push_back(bytes);
                }
                Batch::Composed(members) => {
                    let composite = format!("{COMPOSED_PREFIX}{}", Uuid::new_v4());
                    compose_objects(
                        &state.store,
                        &state.bucket,
                        &composite,
                        &members,
                        &state.options.retry,
                    )
                    .await?;
                    register_composite(&state.store, &state.bucket, &composite);
                    match decompose(
                        &state.store,
                        &state.bucket,
                        &composite,
                        &members,
                        &state.options.retry,
                    )
                    .await
                    {
                        Ok(slices) => {
                            state.pending.extend(slices);
                            state.cleanup = Some(composite);
                        }
                        Err(e) => {
                            delete_composite(
                                &state.store,
                                &state.bucket,
                                &composite,
                                &state.options.retry,
                            )
                            .await;
                            clear_composite();
                            return Err(e);
                        }
                    }
                }
            }
        }
    })
}
