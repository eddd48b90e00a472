// Error taxonomy for the trace core
//
// Local errors (malformed lines, events no span accepts) are counted and
// logged where they occur; they never cross a stage boundary. Everything in
// `PipelineError` is fatal for its pipeline: the failing stage poisons its
// downstream channel, closes upstream, and the error surfaces once after all
// pipelines settle.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A polled cross-spanner context carried the wrong expectation.
    #[error("context mismatch: expected {expected}, got {got}")]
    ContextMismatch {
        expected: &'static str,
        got: &'static str,
    },

    /// An id/addr equality the protocol requires did not hold.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Upstream closed the channel; normal shutdown, not an error for
    /// consumers that drain, but writers observing it must stop.
    #[error("channel closed")]
    ChannelClosed,

    /// A peer poisoned the channel; fatal shutdown signal.
    #[error("channel poisoned")]
    ChannelPoisoned,

    /// Reader failure underneath a parser.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A context queue was used by an unregistered or third spanner.
    #[error("context queue misuse: {0}")]
    QueueMisuse(&'static str),
}

impl PipelineError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        PipelineError::InvariantViolation(msg.into())
    }
}
