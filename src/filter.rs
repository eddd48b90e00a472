// Event-stream actors - transforms applied between parser and spanner
//
// Each actor inspects one event at a time and either passes it downstream
// or filters it out. They compose in configuration order as pipeline
// transforms.

use crate::channel::Channel;
use crate::env::TraceEnv;
use crate::errors::PipelineError;
use crate::events::Event;
use crate::intern::Sym;
use crate::pipeline::Transform;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Decide per event; shared plumbing lives in the Transform impl.
pub trait EventActor: Send {
    fn act_on(&mut self, event: &Event) -> bool;
}

/// Wraps an actor into a pipeline transform.
pub struct ActorStage<A: EventActor> {
    actor: A,
}

impl<A: EventActor> ActorStage<A> {
    pub fn new(actor: A) -> Self {
        Self { actor }
    }
}

#[async_trait]
impl<A: EventActor> Transform<Event> for ActorStage<A> {
    async fn process(
        &mut self,
        input: Arc<Channel<Event>>,
        out: Arc<Channel<Event>>,
    ) -> Result<(), PipelineError> {
        while let Some(event) = input.pop().await {
            if !self.actor.act_on(&event) {
                continue;
            }
            match out.send(event).await {
                Ok(()) => {}
                Err(PipelineError::ChannelClosed) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        if input.is_poisoned() {
            return Err(PipelineError::ChannelPoisoned);
        }
        Ok(())
    }
}

/// Keeps events whose kind name is on the list; inverted, drops them.
pub struct EventTypeFilter {
    names: HashSet<String>,
    inverted: bool,
}

impl EventTypeFilter {
    pub fn new(names: impl IntoIterator<Item = String>, inverted: bool) -> Self {
        Self {
            names: names.into_iter().collect(),
            inverted,
        }
    }
}

impl EventActor for EventTypeFilter {
    fn act_on(&mut self, event: &Event) -> bool {
        let listed = self.names.contains(event.name());
        if self.inverted {
            !listed
        } else {
            listed
        }
    }
}

/// Inclusive timestamp window; events outside every window are dropped.
#[derive(Debug, Clone, Copy)]
pub struct TimeBoundary {
    pub lower_ps: u64,
    pub upper_ps: u64,
}

pub struct EventTimestampFilter {
    boundaries: Vec<TimeBoundary>,
}

impl EventTimestampFilter {
    pub fn new(boundaries: Vec<TimeBoundary>) -> Self {
        Self { boundaries }
    }
}

impl EventActor for EventTimestampFilter {
    fn act_on(&mut self, event: &Event) -> bool {
        self.boundaries
            .iter()
            .any(|b| b.lower_ps <= event.timestamp && event.timestamp <= b.upper_ps)
    }
}

/// Filters host calls by function name; other events always pass.
pub struct HostCallFuncFilter {
    list: HashSet<Sym>,
    blacklist: bool,
}

impl HostCallFuncFilter {
    pub fn new(env: &TraceEnv, funcs: impl IntoIterator<Item = String>, blacklist: bool) -> Self {
        Self {
            list: funcs.into_iter().map(|f| env.intern(&f)).collect(),
            blacklist,
        }
    }
}

impl EventActor for HostCallFuncFilter {
    fn act_on(&mut self, event: &Event) -> bool {
        let Some(func) = event.call_func() else {
            return true;
        };
        if self.blacklist {
            !self.list.contains(func)
        } else {
            self.list.contains(func)
        }
    }
}
