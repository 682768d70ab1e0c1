//! Object-store contracts. The source store is read-only metadata (existence
//! probes); the target store carries the full copy surface: single server-side
//! copies, multipart part copies, and deletes.

use anyhow::Result;
use futures::future::BoxFuture;
use std::fmt;

/// Metadata returned by a head probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub etag: Option<String>,
}

/// Inclusive byte range of one multipart part, formatted for the store as
/// `bytes=lo-hi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}-{}", self.start, self.end)
    }
}

/// Parameters of one server-side part copy.
#[derive(Debug, Clone)]
pub struct PartCopy<'a> {
    pub upload_id: &'a str,
    pub part_number: i32,
    pub src_bucket: &'a str,
    pub src_key: &'a str,
    pub dst_key: &'a str,
    pub range: ByteRange,
}

/// A finished part, indexed for the completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPartTag {
    pub number: i32,
    pub etag: String,
}

/// Well-known store failures surfaced through `anyhow` and recovered with
/// `downcast_ref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The addressed object does not exist.
    NotFound,
    /// The store rejected a single-call copy because the object exceeds the
    /// platform's single-copy ceiling.
    SingleCopyTooLarge,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "object not found"),
            StoreError::SingleCopyTooLarge => {
                write!(f, "object exceeds the single-call copy ceiling")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref(), Some(StoreError::NotFound)))
    }

    pub fn is_single_copy_too_large(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref(), Some(StoreError::SingleCopyTooLarge)))
    }
}

/// Read-only contract against the source store.
pub trait SourceStore: Send + Sync {
    /// Probes `key`; `Ok(None)` means the object does not exist.
    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<ObjectHead>>>;
}

/// Full mirroring contract against the target store.
pub trait TargetStore: Send + Sync {
    /// Probes `key` on the target; `Ok(None)` means the object does not exist.
    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<ObjectHead>>>;

    /// One server-side copy call. Fails with [`StoreError::SingleCopyTooLarge`]
    /// when the object exceeds the platform ceiling.
    fn copy_single<'a>(
        &'a self,
        src_bucket: &'a str,
        src_key: &'a str,
        dst_key: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    /// Opens a multipart upload for `dst_key` and returns its upload id.
    fn initiate_multipart<'a>(&'a self, dst_key: &'a str) -> BoxFuture<'a, Result<String>>;

    /// Server-side copy of one byte range into an open upload; returns the
    /// part's ETag.
    fn copy_part<'a>(&'a self, part: PartCopy<'a>) -> BoxFuture<'a, Result<String>>;

    /// Commits an upload from its part list, which must be sorted by part
    /// number.
    fn complete_multipart<'a>(
        &'a self,
        dst_key: &'a str,
        upload_id: &'a str,
        parts: &'a [CompletedPartTag],
    ) -> BoxFuture<'a, Result<()>>;

    /// Abandons an open upload. Idempotent on the store side.
    fn abort_multipart<'a>(&'a self, dst_key: &'a str, upload_id: &'a str)
        -> BoxFuture<'a, Result<()>>;

    /// Unconditional delete. May fail with [`StoreError::NotFound`], which
    /// callers treat as success.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}
