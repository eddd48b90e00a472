// Context queues - cross-spanner handoff of causal parents
//
// Two components always interact pairwise (host <-> nic, nic <-> network),
// so one queue object carries both directions: the first registered spanner
// writes to side a and reads side b, the second writes side b and reads
// side a. Keeping the pair in one object makes the boundary explicit and
// prevents cross-wiring the four lists that two separate pairs would need.
//
// A context promises the receiver an event kind (the expectation) and hands
// over the parent span to anchor it under.

use crate::channel::Channel;
use crate::errors::PipelineError;
use crate::span::SpanRef;
use std::fmt;
use std::sync::Mutex;

/// The kind of event the peer spanner is promised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    Mmio,
    Dma,
    Msix,
    Rx,
}

impl Expectation {
    pub fn name(&self) -> &'static str {
        match self {
            Expectation::Mmio => "mmio",
            Expectation::Dma => "dma",
            Expectation::Msix => "msix",
            Expectation::Rx => "rx",
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handed across a context queue; ownership moves with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub expectation: Expectation,
    pub parent: SpanRef,
}

#[derive(Debug, Default)]
struct Registration {
    slots: [Option<u64>; 2],
}

/// Paired bidirectional queue between exactly two registered spanners.
#[derive(Debug)]
pub struct ContextQueue {
    registration: Mutex<Registration>,
    /// Written by the first registered spanner, read by the second.
    queue_a: Channel<Context>,
    /// Written by the second registered spanner, read by the first.
    queue_b: Channel<Context>,
}

impl Default for ContextQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextQueue {
    pub fn new() -> Self {
        Self {
            registration: Mutex::new(Registration::default()),
            queue_a: Channel::unbounded(),
            queue_b: Channel::unbounded(),
        }
    }

    /// Register a spanner on this queue. Fails deterministically on a third
    /// registration or a duplicate id.
    pub fn register(&self, spanner_id: u64) -> Result<(), PipelineError> {
        let mut reg = self.registration.lock().unwrap();
        if reg.slots.iter().flatten().any(|id| *id == spanner_id) {
            return Err(PipelineError::QueueMisuse(
                "spanner registered twice on context queue",
            ));
        }
        for slot in reg.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(spanner_id);
                return Ok(());
            }
        }
        Err(PipelineError::QueueMisuse(
            "context queue already has two registered spanners",
        ))
    }

    fn side_of(&self, spanner_id: u64) -> Result<usize, PipelineError> {
        let reg = self.registration.lock().unwrap();
        reg.slots
            .iter()
            .position(|slot| *slot == Some(spanner_id))
            .ok_or(PipelineError::QueueMisuse(
                "spanner not registered on context queue",
            ))
    }

    fn write_queue(&self, side: usize) -> &Channel<Context> {
        if side == 0 {
            &self.queue_a
        } else {
            &self.queue_b
        }
    }

    fn read_queue(&self, side: usize) -> &Channel<Context> {
        if side == 0 {
            &self.queue_b
        } else {
            &self.queue_a
        }
    }

    /// Publish a context to the peer. Returns false when the queue is
    /// closed (the peer already finished; the context is dropped). Poison
    /// is fatal.
    pub async fn push(
        &self,
        spanner_id: u64,
        expectation: Expectation,
        parent: SpanRef,
    ) -> Result<bool, PipelineError> {
        let side = self.side_of(spanner_id)?;
        let context = Context {
            expectation,
            parent,
        };
        let queue = self.write_queue(side);
        if queue.push(context).await {
            return Ok(true);
        }
        if queue.is_poisoned() {
            return Err(PipelineError::ChannelPoisoned);
        }
        Ok(false)
    }

    /// Wait for a context from the peer. None once the queue is closed and
    /// drained; an error if the peer poisoned it.
    pub async fn poll(&self, spanner_id: u64) -> Result<Option<Context>, PipelineError> {
        let side = self.side_of(spanner_id)?;
        let queue = self.read_queue(side);
        match queue.pop().await {
            Some(ctx) => Ok(Some(ctx)),
            None if queue.is_poisoned() => Err(PipelineError::ChannelPoisoned),
            None => Ok(None),
        }
    }

    /// Non-blocking poll.
    pub fn try_poll(&self, spanner_id: u64) -> Result<Option<Context>, PipelineError> {
        let side = self.side_of(spanner_id)?;
        let queue = self.read_queue(side);
        match queue.try_pop() {
            Some(ctx) => Ok(Some(ctx)),
            None if queue.is_poisoned() => Err(PipelineError::ChannelPoisoned),
            None => Ok(None),
        }
    }

    /// Number of contexts the peer has not consumed yet (both directions).
    pub fn outstanding(&self) -> usize {
        self.queue_a.len() + self.queue_b.len()
    }

    /// Shut both directions down; blocked polls resume with None.
    pub fn close(&self) {
        self.queue_a.close();
        self.queue_b.close();
    }

    /// Fatal shutdown of both directions.
    pub fn poison(&self) {
        self.queue_a.poison();
        self.queue_b.poison();
    }
}
