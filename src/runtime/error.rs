//! Mirror-level error kinds. Every instance travels inside an `anyhow::Error`
//! and is recovered with `downcast_ref`; the variants match the failure
//! classes the worker and dispatcher log and act on.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorError {
    /// An event referenced a bucket other than the configured source.
    ConfigMismatch { bucket: String },
    /// The queue message body could not be parsed into sync events.
    MalformedEvent { reason: String },
    /// The source metadata probe failed after retries.
    SourceHeadFailed { key: String },
    /// A copy exhausted its retries or was cancelled mid-flight.
    CopyFailed { key: String },
    /// The object cannot be tiled into parts under the platform limits.
    ObjectTooLarge { key: String, size: u64 },
    /// A target-side delete exhausted its retries.
    DeleteFailed { key: String },
    /// The message lease lapsed while work was in flight.
    LeaseLost,
    /// The queue was unreachable beyond the bounded retry limit.
    QueueUnavailable,
    /// The compute platform accepted fewer launches than requested.
    LaunchFailed { requested: u32, launched: u32 },
}

impl fmt::Display for MirrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorError::ConfigMismatch { bucket } => {
                write!(f, "event bucket {bucket} does not match the configured source")
            }
            MirrorError::MalformedEvent { reason } => {
                write!(f, "malformed event body: {reason}")
            }
            MirrorError::SourceHeadFailed { key } => {
                write!(f, "source metadata probe failed for {key}")
            }
            MirrorError::CopyFailed { key } => write!(f, "copy failed for {key}"),
            MirrorError::ObjectTooLarge { key, size } => {
                write!(f, "object {key} of {size} bytes cannot fit the part limits")
            }
            MirrorError::DeleteFailed { key } => write!(f, "delete failed for {key}"),
            MirrorError::LeaseLost => write!(f, "message lease lost while work was in flight"),
            MirrorError::QueueUnavailable => write!(f, "queue unavailable after bounded retries"),
            MirrorError::LaunchFailed { requested, launched } => {
                write!(f, "launched {launched} of {requested} requested workers")
            }
        }
    }
}

impl std::error::Error for MirrorError {}

impl MirrorError {
    /// Finds the first `MirrorError` in `err`'s chain, if any.
    pub fn find(err: &anyhow::Error) -> Option<&MirrorError> {
        err.chain().find_map(|cause| cause.downcast_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn find_walks_the_context_chain() {
        let err = anyhow!(MirrorError::CopyFailed {
            key: "a/b.txt".into()
        })
        .context("processing record 0");

        match MirrorError::find(&err) {
            Some(MirrorError::CopyFailed { key }) => assert_eq!(key, "a/b.txt"),
            other => panic!("unexpected lookup result: {other:?}"),
        }

        assert!(MirrorError::find(&anyhow!("io error")).is_none());
    }
}
