// Spanners - per-component state machines turning events into spans
//
// Each spanner is the terminal consumer of one pipeline. It dispatches on
// the event kind, extends or opens spans through the tracer, and
// synchronizes with its peer components through context queues. The
// tie-break is always extension first: only when every candidate pending
// span rejects an event may a new span start.
//
// Events nothing accepts are kept in a local holdover, retried once against
// the pending spans when the input drains, and the leftovers are handed to
// the tracer's unmatched report.

pub mod host;
pub mod network;
pub mod nic;

pub use host::HostSpanner;
pub use network::NetworkSpanner;
pub use nic::NicSpanner;

use crate::context::{Context, ContextQueue, Expectation};
use crate::env::TraceEnv;
use crate::errors::PipelineError;
use crate::events::Event;
use crate::intern::Sym;
use crate::span::{AddResult, SpanRef};
use crate::tracer::Tracer;
use std::sync::Arc;

/// Identity and shared plumbing of one spanner.
pub struct SpannerCore {
    pub id: u64,
    pub name: Sym,
    pub tracer: Arc<Tracer>,
    pub env: Arc<TraceEnv>,
    unmatched: Vec<Event>,
}

impl SpannerCore {
    pub fn new(tracer: Arc<Tracer>, name: &str) -> Self {
        let env = Arc::clone(tracer.env());
        Self {
            id: env.next_spanner_id(),
            name: env.intern(name),
            tracer,
            env,
            unmatched: Vec::new(),
        }
    }

    /// Record an event no span accepted.
    pub fn hold_unmatched(&mut self, event: Event) {
        tracing::debug!(spanner = %self.name, event = %event, "event matched no span");
        self.unmatched.push(event);
    }

    /// Retry held events once against a set of still-pending spans, then
    /// forward the rest to the tracer's report.
    pub fn finish_unmatched(&mut self, pending: &[SpanRef]) {
        let held = std::mem::take(&mut self.unmatched);
        let mut still_unmatched = 0usize;
        for event in held {
            let absorbed = pending
                .iter()
                .any(|span| self.tracer.try_add_to_span(*span, &event) == AddResult::Added);
            if !absorbed {
                still_unmatched += 1;
                self.tracer.add_unmatched(event);
            }
        }
        if still_unmatched > 0 {
            tracing::info!(
                spanner = %self.name,
                count = still_unmatched,
                "events left unmatched at end of stream"
            );
        }
    }

    /// Validate a polled context against the promised expectation. A wrong
    /// expectation is a protocol violation and fatal for this spanner.
    pub fn expect_context(
        &self,
        context: Option<Context>,
        expected: Expectation,
    ) -> Result<Option<Context>, PipelineError> {
        match context {
            Some(ctx) if ctx.expectation == expected => Ok(Some(ctx)),
            Some(ctx) => Err(PipelineError::ContextMismatch {
                expected: expected.name(),
                got: ctx.expectation.name(),
            }),
            None => Ok(None),
        }
    }
}

/// Close every given queue pair; used on normal end of input so peers
/// drain buffered contexts and stop waiting.
pub fn close_queues(queues: &[&Arc<ContextQueue>]) {
    for queue in queues {
        let outstanding = queue.outstanding();
        if outstanding > 0 {
            tracing::debug!(outstanding, "closing context queue with unconsumed contexts");
        }
        queue.close();
    }
}

/// Poison every given queue pair on fatal shutdown.
pub fn poison_queues(queues: &[&Arc<ContextQueue>]) {
    for queue in queues {
        queue.poison();
    }
}
