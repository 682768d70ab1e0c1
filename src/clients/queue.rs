//! Durable-queue contract: long-poll receive, ack, visibility extension, and
//! approximate depth inspection. The queue is expected to redeliver unacked
//! messages after their visibility window and to route messages to a
//! dead-letter sink once the redrive limit is exceeded.

use anyhow::Result;
use futures::future::BoxFuture;
use std::fmt;
use std::time::Duration;

/// Opaque handle identifying one received delivery of a message. Acks and
/// visibility extensions are addressed to the receipt, not the message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReceipt(String);

impl MessageReceipt {
    pub fn new(receipt: impl Into<String>) -> Self {
        Self(receipt.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One received queue message. `attempts` counts deliveries including this
/// one, so it is always at least 1.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: String,
    pub body: String,
    pub receipt: MessageReceipt,
    pub attempts: u32,
}

/// Approximate queue depth split into visible and in-flight messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub visible: u64,
    pub in_flight: u64,
}

impl QueueDepth {
    pub fn new(visible: u64, in_flight: u64) -> Self {
        Self { visible, in_flight }
    }

    /// Total backlog. In-flight messages count as work already being done, so
    /// scaling decisions that use this total do not oversubscribe against them.
    pub fn total(&self) -> u64 {
        self.visible.saturating_add(self.in_flight)
    }
}

/// Well-known queue failures surfaced through `anyhow` and recovered with
/// `downcast_ref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The receipt no longer addresses an in-flight message: the visibility
    /// window lapsed or the message was deleted by another receiver.
    MessageGone,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::MessageGone => write!(f, "message is no longer in flight"),
        }
    }
}

impl std::error::Error for QueueError {}

impl QueueError {
    /// True when `err` carries a [`QueueError::MessageGone`] anywhere in its
    /// chain.
    pub fn is_message_gone(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref(), Some(QueueError::MessageGone)))
    }
}

/// Contract the core consumes from the durable queue.
pub trait QueueClient: Send + Sync {
    /// Long-polls for up to `max_messages` messages, waiting at most `wait`.
    /// An empty vec is a normal outcome, not an error.
    fn receive(&self, wait: Duration, max_messages: usize)
        -> BoxFuture<'_, Result<Vec<QueueMessage>>>;

    /// Deletes the message addressed by `receipt`. Only called after every
    /// record in the message succeeded.
    fn ack<'a>(&'a self, receipt: &'a MessageReceipt) -> BoxFuture<'a, Result<()>>;

    /// Resets the visibility window of the message addressed by `receipt` to
    /// `visibility` from now.
    fn extend<'a>(
        &'a self,
        receipt: &'a MessageReceipt,
        visibility: Duration,
    ) -> BoxFuture<'a, Result<()>>;

    /// Approximate counts of visible and in-flight messages.
    fn depth(&self) -> BoxFuture<'_, Result<QueueDepth>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn depth_total_saturates() {
        let depth = QueueDepth::new(u64::MAX, 5);
        assert_eq!(depth.total(), u64::MAX);
        assert_eq!(QueueDepth::new(30, 5).total(), 35);
    }

    #[test]
    fn message_gone_is_detected_through_context() {
        let err = anyhow!(QueueError::MessageGone).context("extending visibility");
        assert!(QueueError::is_message_gone(&err));

        let other = anyhow!("network unreachable");
        assert!(!QueueError::is_message_gone(&other));
    }
}
