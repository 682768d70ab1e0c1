/// Lifecycle of one worker process. Transitions are worker-local; no state is
/// shared across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Polling,
    Processing,
    Draining,
    Exited,
}

/// Why the run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitReason {
    /// The queue stayed empty for the configured number of polls.
    Idle,
    /// A preemption signal arrived and the current work was wound down.
    Drained,
}

/// Terminal disposition of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageOutcome {
    /// Every record succeeded; the ack was attempted.
    Completed,
    /// A record failed; the message was left for the queue to redrive.
    Failed,
    /// Shutdown interrupted the message; it was left for redrive.
    Drained,
}

/// Final accounting returned by [`super::Worker::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub messages_processed: u64,
    pub drained: bool,
}
