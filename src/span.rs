// Span model - groups of correlated events with per-kind closure rules
//
// A span collects the events of one logical operation (a syscall, an MMIO
// access, a DMA transfer, a frame hop). Events are offered through
// `try_add`; each kind implements its own ordered state machine deciding
// whether the event extends the span, completes it, or belongs to a new
// span. A span only ever accepts events from the source that opened it.

use crate::env::TraceEnv;
use crate::events::{Boundary, Event, EventKind};
use crate::intern::Sym;

/// Stable handle to a span in the tracer's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanRef {
    /// Slab key in the tracer arena.
    pub key: usize,
    /// Globally unique span id.
    pub id: u64,
}

/// The kind of operation a span represents. HostMmio carries the MSI-X
/// descriptor flag because that write sub-protocol closes without a
/// completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    HostCall,
    HostMsix,
    HostMmio { pci_msix_desc_addr_before: bool },
    HostDma,
    HostInt,
    NicDma,
    NicMmio,
    NicEth,
    NicMsix,
    NetDevice,
    GenericSingle,
}

impl SpanKind {
    pub fn name(&self) -> &'static str {
        match self {
            SpanKind::HostCall => "host_call",
            SpanKind::HostMsix => "host_msix",
            SpanKind::HostMmio { .. } => "host_mmio",
            SpanKind::HostDma => "host_dma",
            SpanKind::HostInt => "host_int",
            SpanKind::NicDma => "nic_dma",
            SpanKind::NicMmio => "nic_mmio",
            SpanKind::NicEth => "nic_eth",
            SpanKind::NicMsix => "nic_msix",
            SpanKind::NetDevice => "net_device",
            SpanKind::GenericSingle => "generic_single",
        }
    }
}

/// Outcome of offering an event to a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// Event was appended.
    Added,
    /// Event belongs to a fresh span of the same kind; the current span has
    /// been marked complete.
    Full,
    /// Event does not fit this span at all.
    Rejected,
}

#[derive(Debug)]
enum SpanState {
    HostCall {
        entry_seen: bool,
        transmits: bool,
        receives: bool,
        /// Touches the network stack or a network interface syscall.
        relevant: bool,
    },
    HostMmio {
        msix_desc_path: bool,
        is_read: bool,
        issue_id: Option<u64>,
        issue_ts: u64,
        im_resp_seen: bool,
    },
    HostDma {
        issue_id: Option<u64>,
        is_read: bool,
    },
    HostInt {
        posted: bool,
    },
    NicDma {
        issue: Option<(u64, u64)>,
        executed: bool,
        is_read: bool,
    },
    NicMmio {
        is_read: bool,
    },
    NicEth {
        is_tx: bool,
    },
    SingleEvent,
    NetDevice {
        node_device: Option<(u32, u32)>,
    },
}

impl SpanState {
    fn initial(kind: SpanKind) -> Self {
        match kind {
            SpanKind::HostCall => SpanState::HostCall {
                entry_seen: false,
                transmits: false,
                receives: false,
                relevant: false,
            },
            SpanKind::HostMmio {
                pci_msix_desc_addr_before,
            } => SpanState::HostMmio {
                msix_desc_path: pci_msix_desc_addr_before,
                is_read: false,
                issue_id: None,
                issue_ts: 0,
                im_resp_seen: false,
            },
            SpanKind::HostDma => SpanState::HostDma {
                issue_id: None,
                is_read: true,
            },
            SpanKind::HostInt => SpanState::HostInt { posted: false },
            SpanKind::NicDma => SpanState::NicDma {
                issue: None,
                executed: false,
                is_read: true,
            },
            SpanKind::NicMmio => SpanState::NicMmio { is_read: false },
            SpanKind::NicEth => SpanState::NicEth { is_tx: false },
            SpanKind::HostMsix | SpanKind::NicMsix | SpanKind::GenericSingle => {
                SpanState::SingleEvent
            }
            SpanKind::NetDevice => SpanState::NetDevice { node_device: None },
        }
    }
}

#[derive(Debug)]
pub struct Span {
    pub id: u64,
    pub kind: SpanKind,
    /// Name of the spanner that built this span.
    pub spanner: Sym,
    pub events: Vec<Event>,
    /// Direct causal parent (set at creation time by the tracer).
    pub parent: Option<SpanRef>,
    /// Span that triggered this one; equals `parent` for spans created
    /// through start_span_by_parent, may be attached later for roots.
    pub triggered_by: Option<SpanRef>,
    /// Spans this one triggered.
    pub children: Vec<SpanRef>,
    /// Trace this span belongs to.
    pub trace_id: u64,
    pub pending: bool,
    state: SpanState,
}

impl Span {
    pub fn new(id: u64, kind: SpanKind, spanner: Sym) -> Self {
        Self {
            id,
            kind,
            spanner,
            events: Vec::new(),
            parent: None,
            triggered_by: None,
            children: Vec::new(),
            trace_id: 0,
            pending: true,
            state: SpanState::initial(kind),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.pending
    }

    pub fn mark_done(&mut self) {
        self.pending = false;
    }

    pub fn source_id(&self) -> Option<u64> {
        self.events.first().map(|e| e.source_id)
    }

    pub fn source_name(&self) -> Option<&Sym> {
        self.events.first().map(|e| &e.source_name)
    }

    pub fn start_ts(&self) -> Option<u64> {
        self.events.first().map(|e| e.timestamp)
    }

    pub fn end_ts(&self) -> Option<u64> {
        self.events.last().map(|e| e.timestamp)
    }

    /// Read/write direction for mmio/dma spans, transmit for eth spans.
    #[allow(dead_code)]
    pub fn is_read(&self) -> bool {
        match &self.state {
            SpanState::HostMmio { is_read, .. }
            | SpanState::NicMmio { is_read }
            | SpanState::HostDma { is_read, .. }
            | SpanState::NicDma { is_read, .. } => *is_read,
            _ => false,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self.state,
            SpanState::HostMmio { is_read: false, .. }
                | SpanState::NicMmio { is_read: false }
                | SpanState::HostDma { is_read: false, .. }
                | SpanState::NicDma { is_read: false, .. }
        )
    }

    #[allow(dead_code)]
    pub fn is_transmit(&self) -> bool {
        matches!(self.state, SpanState::NicEth { is_tx: true })
    }

    /// Whether this host call span contains a driver transmit / receive.
    pub fn transmits(&self) -> bool {
        matches!(self.state, SpanState::HostCall { transmits: true, .. })
    }

    pub fn receives(&self) -> bool {
        matches!(self.state, SpanState::HostCall { receives: true, .. })
    }

    /// Whether this host call span touched the network stack at all.
    pub fn is_relevant(&self) -> bool {
        matches!(self.state, SpanState::HostCall { relevant: true, .. })
    }

    /// Source guard shared by every kind: complete spans accept nothing and
    /// a span never adopts events from a different source.
    fn is_potential_add(&self, event: &Event) -> bool {
        if self.is_complete() {
            return false;
        }
        match self.events.first() {
            Some(first) => first.source_id == event.source_id,
            None => true,
        }
    }

    /// Offer an event to this span.
    pub fn try_add(&mut self, event: &Event, env: &TraceEnv) -> AddResult {
        if !self.is_potential_add(event) {
            return AddResult::Rejected;
        }

        match &mut self.state {
            SpanState::HostCall {
                entry_seen,
                transmits,
                receives,
                relevant,
            } => {
                if !matches!(event.kind, EventKind::HostCall { .. }) {
                    return AddResult::Rejected;
                }
                if env.is_sys_entry(event) {
                    if *entry_seen {
                        // previous call returned; this entry opens the next span
                        self.pending = false;
                        return AddResult::Full;
                    }
                    *entry_seen = true;
                    self.events.push(event.clone());
                    return AddResult::Added;
                }
                if !*entry_seen {
                    return AddResult::Rejected;
                }
                if env.is_driver_tx(event) {
                    *transmits = true;
                } else if env.is_driver_rx(event) {
                    *receives = true;
                }
                if env.is_linux_net_func(event)
                    || env.is_interface_send(event)
                    || env.is_interface_recv(event)
                {
                    *relevant = true;
                }
                self.events.push(event.clone());
                AddResult::Added
            }

            SpanState::HostMmio {
                msix_desc_path,
                is_read,
                issue_id,
                issue_ts,
                im_resp_seen,
            } => {
                match &event.kind {
                    EventKind::HostMmioW { id, .. } => {
                        if issue_id.is_some() {
                            // the descriptor write protocol never emits a
                            // completion, so the next write starts a new span
                            if *msix_desc_path {
                                self.pending = false;
                                return AddResult::Full;
                            }
                            return AddResult::Rejected;
                        }
                        *is_read = false;
                        *issue_id = Some(*id);
                        *issue_ts = event.timestamp;
                    }
                    EventKind::HostMmioR { id, .. } => {
                        if *msix_desc_path {
                            if *is_read || issue_id.is_none() || !*im_resp_seen {
                                return AddResult::Rejected;
                            }
                            if *issue_id != Some(*id) {
                                return AddResult::Rejected;
                            }
                            self.pending = false;
                        } else {
                            if issue_id.is_some() {
                                return AddResult::Rejected;
                            }
                            *is_read = true;
                            *issue_id = Some(*id);
                            *issue_ts = event.timestamp;
                        }
                    }
                    EventKind::HostMmioImRespPoW => {
                        if issue_id.is_none() || *is_read || *im_resp_seen {
                            return AddResult::Rejected;
                        }
                        if *issue_ts != event.timestamp {
                            return AddResult::Rejected;
                        }
                        *im_resp_seen = true;
                    }
                    EventKind::HostMmioCW { id } => {
                        if *is_read || issue_id.is_none() || !*im_resp_seen || *msix_desc_path {
                            return AddResult::Rejected;
                        }
                        if *issue_id != Some(*id) {
                            return AddResult::Rejected;
                        }
                        self.pending = false;
                    }
                    EventKind::HostMmioCR { id } => {
                        if !*is_read || issue_id.is_none() || *msix_desc_path {
                            return AddResult::Rejected;
                        }
                        if *issue_id != Some(*id) {
                            return AddResult::Rejected;
                        }
                        self.pending = false;
                    }
                    _ => return AddResult::Rejected,
                }
                self.events.push(event.clone());
                AddResult::Added
            }

            SpanState::HostDma { issue_id, is_read } => {
                match &event.kind {
                    EventKind::HostDmaR { id, .. } | EventKind::HostDmaW { id, .. } => {
                        if issue_id.is_some() {
                            return AddResult::Rejected;
                        }
                        *is_read = matches!(event.kind, EventKind::HostDmaR { .. });
                        *issue_id = Some(*id);
                    }
                    EventKind::HostDmaC { id } => {
                        if *issue_id != Some(*id) {
                            return AddResult::Rejected;
                        }
                        self.pending = false;
                    }
                    _ => return AddResult::Rejected,
                }
                self.events.push(event.clone());
                AddResult::Added
            }

            SpanState::HostInt { posted } => {
                match event.kind {
                    EventKind::HostPostInt => {
                        if *posted {
                            return AddResult::Rejected;
                        }
                        *posted = true;
                    }
                    EventKind::HostClearInt => {
                        if !*posted {
                            return AddResult::Rejected;
                        }
                        self.pending = false;
                    }
                    _ => return AddResult::Rejected,
                }
                self.events.push(event.clone());
                AddResult::Added
            }

            SpanState::NicDma {
                issue,
                executed,
                is_read,
            } => {
                match &event.kind {
                    EventKind::NicDmaI { id, addr, .. } => {
                        if issue.is_some() {
                            return AddResult::Rejected;
                        }
                        *issue = Some((*id, *addr));
                    }
                    EventKind::NicDmaEx { id, addr, .. } => {
                        if *issue != Some((*id, *addr)) || *executed {
                            return AddResult::Rejected;
                        }
                        *executed = true;
                    }
                    EventKind::NicDmaEn { id, addr, .. } => {
                        // recorded between issue and completion, no state change
                        if *issue != Some((*id, *addr)) {
                            return AddResult::Rejected;
                        }
                    }
                    EventKind::NicDmaCR { id, addr, .. } | EventKind::NicDmaCW { id, addr, .. } => {
                        if !*executed || *issue != Some((*id, *addr)) {
                            return AddResult::Rejected;
                        }
                        *is_read = matches!(event.kind, EventKind::NicDmaCR { .. });
                        self.pending = false;
                    }
                    _ => return AddResult::Rejected,
                }
                self.events.push(event.clone());
                AddResult::Added
            }

            SpanState::NicMmio { is_read } => {
                match event.kind {
                    EventKind::NicMmioR { .. } => *is_read = true,
                    EventKind::NicMmioW { .. } => *is_read = false,
                    _ => return AddResult::Rejected,
                }
                self.pending = false;
                self.events.push(event.clone());
                AddResult::Added
            }

            SpanState::NicEth { is_tx } => {
                match event.kind {
                    EventKind::NicTx { .. } => *is_tx = true,
                    EventKind::NicRx { .. } => *is_tx = false,
                    _ => return AddResult::Rejected,
                }
                self.pending = false;
                self.events.push(event.clone());
                AddResult::Added
            }

            SpanState::SingleEvent => {
                let fits = match self.kind {
                    SpanKind::HostMsix => matches!(event.kind, EventKind::HostMsiX { .. }),
                    SpanKind::NicMsix => matches!(event.kind, EventKind::NicMsix { .. }),
                    _ => true,
                };
                if !fits || !self.events.is_empty() {
                    return AddResult::Rejected;
                }
                self.pending = false;
                self.events.push(event.clone());
                AddResult::Added
            }

            SpanState::NetDevice { node_device } => {
                let Some(data) = event.kind.network_data() else {
                    return AddResult::Rejected;
                };
                match node_device {
                    Some(pair) => {
                        if *pair != (data.node, data.device) {
                            return AddResult::Rejected;
                        }
                    }
                    None => *node_device = Some((data.node, data.device)),
                }
                if data.boundary == Boundary::ToAdapter
                    || matches!(event.kind, EventKind::NetworkDrop(_))
                {
                    self.pending = false;
                }
                self.events.push(event.clone());
                AddResult::Added
            }
        }
    }
}
