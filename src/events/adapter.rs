//! Event source adapter: parses queue-message bodies into normalized sync
//! events. One message may fan out to multiple events, all sharing the
//! message's receipt.

use crate::clients::queue::{MessageReceipt, QueueMessage};
use crate::events::envelope::{decode_key, EventEnvelope};
use crate::runtime::error::MirrorError;
use anyhow::{anyhow, Result};
use std::time::Instant;

const CREATED_PREFIX: &str = "ObjectCreated";
const REMOVED_PREFIX: &str = "ObjectRemoved";

/// What the source store did to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Delete,
}

/// One normalized source event, ready for the copy or delete engine.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub kind: EventKind,
    pub key: String,
    pub size_hint: Option<u64>,
    pub etag_hint: Option<String>,
    pub received_at: Instant,
    pub receipt: MessageReceipt,
    pub attempts: u32,
}

/// Stateless translator from raw message bodies to [`SyncEvent`]s.
#[derive(Debug, Clone)]
pub struct EventAdapter {
    source_bucket: String,
}

impl EventAdapter {
    pub fn new(source_bucket: impl Into<String>) -> Self {
        Self {
            source_bucket: source_bucket.into(),
        }
    }

    /// Parses one queue message into zero or more events.
    ///
    /// Unknown event-name prefixes are skipped, not errors. A record naming a
    /// bucket other than the configured source fails the whole message with
    /// [`MirrorError::ConfigMismatch`]; an unparsable body fails it with
    /// [`MirrorError::MalformedEvent`]. Neither failure acks the message, so
    /// the queue redrives it.
    pub fn parse(&self, message: &QueueMessage) -> Result<Vec<SyncEvent>> {
        let envelope: EventEnvelope = serde_json::from_str(&message.body).map_err(|err| {
            anyhow!(MirrorError::MalformedEvent {
                reason: err.to_string(),
            })
        })?;

        let received_at = Instant::now();
        let mut events = Vec::with_capacity(envelope.records.len());

        for record in envelope.records {
            if record.s3.bucket.name != self.source_bucket {
                return Err(anyhow!(MirrorError::ConfigMismatch {
                    bucket: record.s3.bucket.name,
                }));
            }

            let kind = if record.event_name.starts_with(CREATED_PREFIX) {
                EventKind::Create
            } else if record.event_name.starts_with(REMOVED_PREFIX) {
                // Delete-marker creations count as deletions too; the target
                // is unversioned.
                EventKind::Delete
            } else {
                tracing::debug!(
                    event_name = %record.event_name,
                    "skipping record with unrecognized event name"
                );
                continue;
            };

            events.push(SyncEvent {
                kind,
                key: decode_key(&record.s3.object.key),
                size_hint: record.s3.object.size,
                etag_hint: record.s3.object.etag,
                received_at,
                receipt: message.receipt.clone(),
                attempts: message.attempts,
            });
        }

        Ok(events)
    }
}
