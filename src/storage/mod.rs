//! Object-store abstraction layer
//!
//! The listing and download engines consume this trait; the shipped
//! backends are Google Cloud Storage and an in-memory store used by tests
//! and local development.

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::StorageClass;
use crate::Result;

pub mod gcs;
pub mod memory;

/// Metadata for one listed object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub name: String,
    pub size: u64,
    pub storage_class: StorageClass,
}

/// Object-store operations.
///
/// Implementations perform exactly one attempt per call; retry loops live
/// in the engines so the listing workers can interleave liveness
/// heartbeats between attempts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List up to `max_results` objects with keys in `[start, end)` under
    /// `prefix`, in ascending key order. `start` is inclusive, `end` is
    /// exclusive; an empty bound is unbounded on that side.
    async fn list_page(
        &self,
        bucket: &str,
        start: &str,
        end: &str,
        prefix: &str,
        max_results: usize,
    ) -> Result<Vec<ObjectMeta>>;

    /// Download the full contents of one object.
    async fn download(&self, bucket: &str, object: &str) -> Result<Bytes>;

    /// Server-side concatenate `sources`, in order, into `destination`.
    /// The store enforces a limit of
    /// [`MAX_COMPOSE_MEMBERS`](crate::download::MAX_COMPOSE_MEMBERS)
    /// sources per call.
    async fn compose(&self, bucket: &str, destination: &str, sources: &[String]) -> Result<()>;

    /// Delete one object.
    async fn delete(&self, bucket: &str, object: &str) -> Result<()>;
}
