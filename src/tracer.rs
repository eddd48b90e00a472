// Tracer - span arena, causal graph, and trace registry
//
// Spans live in a slab arena and are referenced everywhere else by SpanRef
// (slab key + span id, checked on every access). The causal graph stores
// triggered_by / children edges as refs, never owning pointers in both
// directions. A trace is the connected component reachable from a root
// span; roots are spans started without a parent (syscall entries, inbound
// frames). Traces are evaluated when all pipelines have drained: complete
// ones go to the sink, still-pending ones are reported.

use crate::context::Context;
use crate::env::TraceEnv;
use crate::events::Event;
use crate::intern::Sym;
use crate::span::{AddResult, Span, SpanKind, SpanRef};
use serde::Serialize;
use slab::Slab;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct TracerInner {
    spans: Slab<Span>,
    /// trace id -> member spans, first member is the root
    traces: HashMap<u64, Vec<SpanRef>>,
    /// events nothing accepted, kept for the end-of-stream report
    unmatched: Vec<Event>,
}

pub struct Tracer {
    env: Arc<TraceEnv>,
    inner: Mutex<TracerInner>,
}

/// Flattened view of one completed trace handed to sinks.
#[derive(Debug, Clone, Serialize)]
pub struct TraceDump {
    pub id: u64,
    pub spans: Vec<SpanDump>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpanDump {
    pub id: u64,
    pub kind: &'static str,
    pub spanner: Sym,
    pub source_id: Option<u64>,
    pub source_name: Option<Sym>,
    pub start_ts: Option<u64>,
    pub end_ts: Option<u64>,
    pub parent: Option<u64>,
    pub triggered_by: Option<u64>,
    pub children: Vec<u64>,
    pub pending: bool,
    /// Nesting depth below the trace root, for indented printing.
    pub depth: usize,
    /// Events in canonical event-stream form.
    pub events: Vec<String>,
}

/// What fell out of a run after the sink consumed every complete trace.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainSummary {
    pub traces_emitted: usize,
    pub traces_pending: usize,
    pub spans_total: usize,
    pub unmatched_events: usize,
}

impl Tracer {
    pub fn new(env: Arc<TraceEnv>) -> Self {
        Self {
            env,
            inner: Mutex::new(TracerInner::default()),
        }
    }

    pub fn env(&self) -> &Arc<TraceEnv> {
        &self.env
    }

    fn insert_span(
        inner: &mut TracerInner,
        env: &TraceEnv,
        kind: SpanKind,
        first_event: &Event,
        spanner: &Sym,
    ) -> Option<(SpanRef, Span)> {
        let mut span = Span::new(env.next_span_id(), kind, spanner.clone());
        if span.try_add(first_event, env) != AddResult::Added {
            tracing::debug!(
                kind = kind.name(),
                event = %first_event,
                "event cannot open a span of the requested kind"
            );
            return None;
        }
        let id = span.id;
        let key = inner.spans.vacant_key();
        Some((SpanRef { key, id }, span))
    }

    /// Allocate a root span; it anchors a new trace.
    pub fn start_span(
        &self,
        kind: SpanKind,
        first_event: &Event,
        spanner: &Sym,
    ) -> Option<SpanRef> {
        let mut inner = self.inner.lock().unwrap();
        let (span_ref, mut span) = Self::insert_span(&mut inner, &self.env, kind, first_event, spanner)?;
        let trace_id = self.env.next_trace_id();
        span.trace_id = trace_id;
        inner.spans.insert(span);
        inner.traces.insert(trace_id, vec![span_ref]);
        Some(span_ref)
    }

    /// Allocate a span as a child of `parent`: the parent gains a child
    /// edge, the new span points back through triggered_by and joins the
    /// parent's trace.
    pub fn start_span_by_parent(
        &self,
        parent: SpanRef,
        kind: SpanKind,
        first_event: &Event,
        spanner: &Sym,
    ) -> Option<SpanRef> {
        let mut inner = self.inner.lock().unwrap();
        let trace_id = {
            let parent_span = inner.spans.get(parent.key)?;
            if parent_span.id != parent.id {
                tracing::error!("stale span reference {:?}", parent);
                return None;
            }
            parent_span.trace_id
        };

        let (span_ref, mut span) = Self::insert_span(&mut inner, &self.env, kind, first_event, spanner)?;
        span.trace_id = trace_id;
        span.parent = Some(parent);
        span.triggered_by = Some(parent);
        inner.spans.insert(span);
        inner.spans[parent.key].children.push(span_ref);
        inner
            .traces
            .entry(trace_id)
            .or_default()
            .push(span_ref);
        Some(span_ref)
    }

    /// Same as start_span_by_parent, but the parent arrives in a context
    /// handed over from a peer spanner; the context is consumed.
    pub fn start_span_by_parent_pass_on_context(
        &self,
        context: Context,
        kind: SpanKind,
        first_event: &Event,
        spanner: &Sym,
    ) -> Option<SpanRef> {
        self.start_span_by_parent(context.parent, kind, first_event, spanner)
    }

    /// Link an existing root span under a parent discovered later (e.g. a
    /// receive context consumed by an already-open host call). The child's
    /// trace is folded into the parent's.
    pub fn attach_as_child(&self, parent: SpanRef, child: SpanRef) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(parent_span) = inner.spans.get(parent.key) else {
            return false;
        };
        if parent_span.id != parent.id {
            return false;
        }
        let parent_trace = parent_span.trace_id;

        let Some(child_span) = inner.spans.get(child.key) else {
            return false;
        };
        if child_span.id != child.id || child_span.triggered_by.is_some() {
            return false;
        }
        let child_trace = child_span.trace_id;

        inner.spans[child.key].triggered_by = Some(parent);
        inner.spans[parent.key].children.push(child);

        if child_trace != parent_trace {
            if let Some(members) = inner.traces.remove(&child_trace) {
                for member in &members {
                    inner.spans[member.key].trace_id = parent_trace;
                }
                inner
                    .traces
                    .entry(parent_trace)
                    .or_default()
                    .extend(members);
            }
        }
        true
    }

    /// Offer an event to an existing pending span.
    pub fn try_add_to_span(&self, span_ref: SpanRef, event: &Event) -> AddResult {
        let mut inner = self.inner.lock().unwrap();
        match inner.spans.get_mut(span_ref.key) {
            Some(span) if span.id == span_ref.id => span.try_add(event, &self.env),
            _ => AddResult::Rejected,
        }
    }

    pub fn mark_done(&self, span_ref: SpanRef) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(span) = inner.spans.get_mut(span_ref.key) {
            if span.id == span_ref.id {
                span.mark_done();
            }
        }
    }

    /// Read access to a span for state checks.
    pub fn read_span<R>(&self, span_ref: SpanRef, f: impl FnOnce(&Span) -> R) -> Option<R> {
        let inner = self.inner.lock().unwrap();
        match inner.spans.get(span_ref.key) {
            Some(span) if span.id == span_ref.id => Some(f(span)),
            _ => None,
        }
    }

    /// Record an event nothing accepted, for the end-of-stream report.
    pub fn add_unmatched(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap();
        inner.unmatched.push(event);
    }

    /// Evaluate all traces at end of input: complete ones are delivered to
    /// `emit`, pending ones are reported in the summary.
    pub fn drain(&self, mut emit: impl FnMut(TraceDump)) -> DrainSummary {
        let inner = self.inner.lock().unwrap();
        let mut summary = DrainSummary {
            spans_total: inner.spans.len(),
            unmatched_events: inner.unmatched.len(),
            ..Default::default()
        };

        let mut trace_ids: Vec<u64> = inner.traces.keys().copied().collect();
        trace_ids.sort_unstable();

        for trace_id in trace_ids {
            let members = &inner.traces[&trace_id];
            let complete = members.iter().all(|r| inner.spans[r.key].is_complete());
            if !complete {
                summary.traces_pending += 1;
                tracing::warn!(trace = trace_id, "trace still pending at end of input");
                continue;
            }
            summary.traces_emitted += 1;
            emit(Self::dump_trace(&inner, trace_id, members));
        }

        for event in &inner.unmatched {
            tracing::warn!(event = %event, "event matched no span");
        }
        summary
    }

    fn dump_trace(inner: &TracerInner, trace_id: u64, members: &[SpanRef]) -> TraceDump {
        // pre-order walk from the root keeps parents above their children
        let root = members[0];
        let mut ordered = Vec::with_capacity(members.len());
        let mut stack = vec![(root, 0usize)];
        let mut visited = std::collections::HashSet::new();
        while let Some((span_ref, depth)) = stack.pop() {
            if !visited.insert(span_ref.id) {
                continue;
            }
            ordered.push((span_ref, depth));
            let span = &inner.spans[span_ref.key];
            for child in span.children.iter().rev() {
                stack.push((*child, depth + 1));
            }
        }
        // members merged in from other roots may not be reachable from here
        for member in members {
            if !visited.contains(&member.id) {
                ordered.push((*member, 0));
            }
        }

        TraceDump {
            id: trace_id,
            spans: ordered
                .into_iter()
                .map(|(span_ref, depth)| {
                    let span = &inner.spans[span_ref.key];
                    SpanDump {
                        id: span.id,
                        kind: span.kind.name(),
                        spanner: span.spanner.clone(),
                        source_id: span.source_id(),
                        source_name: span.source_name().cloned(),
                        start_ts: span.start_ts(),
                        end_ts: span.end_ts(),
                        parent: span.parent.map(|r| r.id),
                        triggered_by: span.triggered_by.map(|r| r.id),
                        children: span.children.iter().map(|r| r.id).collect(),
                        pending: span.pending,
                        depth,
                        events: span.events.iter().map(|e| e.to_string()).collect(),
                    }
                })
                .collect(),
        }
    }
}
