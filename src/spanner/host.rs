// Host spanner - stitches host CPU simulator events into spans
//
// Tracks one pending syscall span, one pending MMIO span, one pending
// interrupt span and a list of in-flight DMA spans (correlated by id).
// MMIO completions are announced to the NIC through an Mmio context; DMA
// parents arrive from the NIC as Dma contexts; MSI-X interrupts close
// against an Msix context; a driver receive call adopts the receive
// context the NIC published for the inbound frame.

use super::{close_queues, poison_queues, SpannerCore};
use crate::channel::Channel;
use crate::context::{ContextQueue, Expectation};
use crate::env::TraceEnv;
use crate::errors::PipelineError;
use crate::events::{Event, EventKind};
use crate::pipeline::Consumer;
use crate::span::{AddResult, SpanKind, SpanRef};
use crate::tracer::Tracer;
use async_trait::async_trait;
use std::sync::Arc;

pub struct HostSpanner {
    core: SpannerCore,
    /// Paired queue with the NIC: we write Mmio, the NIC writes Dma/Msix.
    nic_queue: Arc<ContextQueue>,
    /// Receive announcements from the NIC (Rx contexts for driver_rx).
    nic_receives: Arc<ContextQueue>,

    pending_call: Option<SpanRef>,
    pending_mmio: Option<SpanRef>,
    pending_int: Option<SpanRef>,
    pending_dma: Vec<SpanRef>,
    /// Set when the last admitted host call was the MSI-X descriptor
    /// marker; the next MMIO span then follows the descriptor protocol.
    pci_msix_desc_addr_before: bool,
}

impl HostSpanner {
    pub fn new(
        tracer: Arc<Tracer>,
        name: &str,
        nic_queue: Arc<ContextQueue>,
        nic_receives: Arc<ContextQueue>,
    ) -> Self {
        let core = SpannerCore::new(tracer, name);
        nic_queue
            .register(core.id)
            .expect("host spanner registration on nic queue");
        nic_receives
            .register(core.id)
            .expect("host spanner registration on receive queue");
        Self {
            core,
            nic_queue,
            nic_receives,
            pending_call: None,
            pending_mmio: None,
            pending_int: None,
            pending_dma: Vec::new(),
            pci_msix_desc_addr_before: false,
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), PipelineError> {
        match &event.kind {
            EventKind::HostCall { .. } => self.handle_call(event).await,
            EventKind::HostMsiX { .. } => self.handle_msix(event).await,
            EventKind::HostPostInt | EventKind::HostClearInt => self.handle_int(event),
            _ if TraceEnv::is_mmio_related(&event) => self.handle_mmio(event).await,
            _ if TraceEnv::is_dma_related(&event) => self.handle_dma(event),
            _ => {
                // conf/pci/instr/sync events have no span rule on the host side
                self.core.hold_unmatched(event);
                Ok(())
            }
        }
    }

    async fn handle_call(&mut self, event: Event) -> Result<(), PipelineError> {
        let tracer = Arc::clone(&self.core.tracer);

        if let Some(call) = self.pending_call {
            match tracer.try_add_to_span(call, &event) {
                AddResult::Added => {
                    self.pci_msix_desc_addr_before = self.core.env.is_pci_msix_desc_addr(&event);
                    // both the driver poll and the receive syscall can be
                    // the first sign of an inbound frame
                    if self.core.env.is_driver_rx(&event) || self.core.env.is_interface_recv(&event)
                    {
                        self.adopt_receive_context(call)?;
                    }
                    return Ok(());
                }
                AddResult::Full => {
                    // previous call returned; this entry opens the next span
                    let (transmits, receives, relevant) = tracer
                        .read_span(call, |s| (s.transmits(), s.receives(), s.is_relevant()))
                        .unwrap_or((false, false, false));
                    tracing::debug!(
                        spanner = %self.core.name,
                        transmits,
                        receives,
                        relevant,
                        "syscall span closed"
                    );
                    self.pending_call = None;
                }
                AddResult::Rejected => {
                    self.core.hold_unmatched(event);
                    return Ok(());
                }
            }
        }

        if !self.core.env.is_sys_entry(&event) {
            self.core.hold_unmatched(event);
            return Ok(());
        }
        self.pci_msix_desc_addr_before = false;
        match tracer.start_span(SpanKind::HostCall, &event, &self.core.name) {
            Some(span) => {
                self.pending_call = Some(span);
                Ok(())
            }
            None => {
                self.core.hold_unmatched(event);
                Ok(())
            }
        }
    }

    /// A driver receive call links the whole syscall under the frame the
    /// NIC announced.
    fn adopt_receive_context(&mut self, call: SpanRef) -> Result<(), PipelineError> {
        let polled = self.nic_receives.try_poll(self.core.id)?;
        if let Some(ctx) = self.core.expect_context(polled, Expectation::Rx)? {
            if !self.core.tracer.attach_as_child(ctx.parent, call) {
                tracing::debug!(
                    spanner = %self.core.name,
                    "receive context ignored: call span already has a trigger"
                );
            }
        }
        Ok(())
    }

    async fn handle_mmio(&mut self, event: Event) -> Result<(), PipelineError> {
        let tracer = Arc::clone(&self.core.tracer);

        if let Some(mmio) = self.pending_mmio {
            match tracer.try_add_to_span(mmio, &event) {
                AddResult::Added => {
                    if tracer.read_span(mmio, |s| s.is_complete()).unwrap_or(false) {
                        self.publish_mmio(mmio).await?;
                        self.pending_mmio = None;
                    }
                    return Ok(());
                }
                AddResult::Full => {
                    // descriptor-protocol span closed by the next write
                    self.pending_mmio = None;
                }
                AddResult::Rejected => {
                    self.core.hold_unmatched(event);
                    return Ok(());
                }
            }
        }

        let kind = SpanKind::HostMmio {
            pci_msix_desc_addr_before: self.pci_msix_desc_addr_before,
        };
        let opened = match self.pending_call {
            Some(call) => tracer.start_span_by_parent(call, kind, &event, &self.core.name),
            None => tracer.start_span(kind, &event, &self.core.name),
        };
        match opened {
            Some(span) => {
                self.pending_mmio = Some(span);
                Ok(())
            }
            None => {
                self.core.hold_unmatched(event);
                Ok(())
            }
        }
    }

    /// Announce a completed MMIO operation to the NIC so its mirrored
    /// register access can anchor beneath it. Descriptor-protocol spans
    /// have no NIC counterpart and stay private.
    async fn publish_mmio(&self, span: SpanRef) -> Result<(), PipelineError> {
        let msix_desc = self
            .core
            .tracer
            .read_span(span, |s| {
                matches!(
                    s.kind,
                    SpanKind::HostMmio {
                        pci_msix_desc_addr_before: true
                    }
                )
            })
            .unwrap_or(false);
        if msix_desc {
            return Ok(());
        }
        if !self
            .nic_queue
            .push(self.core.id, Expectation::Mmio, span)
            .await?
        {
            tracing::debug!(spanner = %self.core.name, "nic side finished; mmio context dropped");
        }
        Ok(())
    }

    fn handle_dma(&mut self, event: Event) -> Result<(), PipelineError> {
        let tracer = Arc::clone(&self.core.tracer);

        // extension first: one of the in-flight DMA spans may match by id
        for index in 0..self.pending_dma.len() {
            let span = self.pending_dma[index];
            match tracer.try_add_to_span(span, &event) {
                AddResult::Added => {
                    if tracer.read_span(span, |s| s.is_complete()).unwrap_or(false) {
                        self.pending_dma.swap_remove(index);
                    }
                    return Ok(());
                }
                AddResult::Full => unreachable!("host dma spans never report Full"),
                AddResult::Rejected => {}
            }
        }

        if !matches!(
            event.kind,
            EventKind::HostDmaR { .. } | EventKind::HostDmaW { .. }
        ) {
            self.core.hold_unmatched(event);
            return Ok(());
        }

        // the NIC publishes the causing dma span ahead of our execution
        let polled = self.nic_queue.try_poll(self.core.id)?;
        let opened = match self.core.expect_context(polled, Expectation::Dma)? {
            Some(ctx) => tracer.start_span_by_parent_pass_on_context(
                ctx,
                SpanKind::HostDma,
                &event,
                &self.core.name,
            ),
            None => match self.pending_call {
                Some(call) => {
                    tracer.start_span_by_parent(call, SpanKind::HostDma, &event, &self.core.name)
                }
                None => tracer.start_span(SpanKind::HostDma, &event, &self.core.name),
            },
        };
        match opened {
            Some(span) => {
                self.pending_dma.push(span);
                Ok(())
            }
            None => {
                self.core.hold_unmatched(event);
                Ok(())
            }
        }
    }

    async fn handle_msix(&mut self, event: Event) -> Result<(), PipelineError> {
        // the NIC always announces the interrupt before the host sees it
        let polled = self.nic_queue.poll(self.core.id).await?;
        let Some(ctx) = self.core.expect_context(polled, Expectation::Msix)? else {
            self.core.hold_unmatched(event);
            return Ok(());
        };
        if self
            .core
            .tracer
            .start_span_by_parent_pass_on_context(ctx, SpanKind::HostMsix, &event, &self.core.name)
            .is_none()
        {
            self.core.hold_unmatched(event);
        }
        Ok(())
    }

    fn handle_int(&mut self, event: Event) -> Result<(), PipelineError> {
        let tracer = Arc::clone(&self.core.tracer);

        if let Some(int_span) = self.pending_int {
            match tracer.try_add_to_span(int_span, &event) {
                AddResult::Added => {
                    if tracer
                        .read_span(int_span, |s| s.is_complete())
                        .unwrap_or(false)
                    {
                        self.pending_int = None;
                    }
                    return Ok(());
                }
                AddResult::Full => unreachable!("host int spans never report Full"),
                AddResult::Rejected => {
                    self.core.hold_unmatched(event);
                    return Ok(());
                }
            }
        }

        let opened = match self.pending_call {
            Some(call) => {
                tracer.start_span_by_parent(call, SpanKind::HostInt, &event, &self.core.name)
            }
            None => tracer.start_span(SpanKind::HostInt, &event, &self.core.name),
        };
        match opened {
            Some(span) => {
                self.pending_int = Some(span);
                Ok(())
            }
            None => {
                self.core.hold_unmatched(event);
                Ok(())
            }
        }
    }

    fn finish(&mut self) {
        let mut pending: Vec<SpanRef> = Vec::new();
        pending.extend(self.pending_call);
        pending.extend(self.pending_mmio);
        pending.extend(self.pending_int);
        pending.extend(self.pending_dma.iter().copied());
        self.core.finish_unmatched(&pending);
    }
}

#[async_trait]
impl Consumer<Event> for HostSpanner {
    async fn consume(&mut self, input: Arc<Channel<Event>>) -> Result<(), PipelineError> {
        while let Some(event) = input.pop().await {
            if let Err(err) = self.handle_event(event).await {
                poison_queues(&[&self.nic_queue, &self.nic_receives]);
                return Err(err);
            }
        }
        if input.is_poisoned() {
            poison_queues(&[&self.nic_queue, &self.nic_receives]);
            return Err(PipelineError::ChannelPoisoned);
        }
        self.finish();
        close_queues(&[&self.nic_queue, &self.nic_receives]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<Tracer>, Arc<TraceEnv>, HostSpanner, Arc<ContextQueue>, Arc<ContextQueue>)
    {
        let env = Arc::new(TraceEnv::with_defaults());
        let tracer = Arc::new(Tracer::new(Arc::clone(&env)));
        let nic_queue = Arc::new(ContextQueue::new());
        let receives = Arc::new(ContextQueue::new());
        let spanner = HostSpanner::new(
            Arc::clone(&tracer),
            "host-test",
            Arc::clone(&nic_queue),
            Arc::clone(&receives),
        );
        (tracer, env, spanner, nic_queue, receives)
    }

    fn ev(env: &TraceEnv, ts: u64, kind: EventKind) -> Event {
        Event::new(ts, 0, env.intern("gem5-client"), kind)
    }

    fn call(env: &TraceEnv, ts: u64, func: &str) -> Event {
        ev(
            env,
            ts,
            EventKind::HostCall {
                pc: 0x1000,
                func: env.intern(func),
                comp: env.intern("linux"),
            },
        )
    }

    // Scenario: MMIO read issue + completion form one complete read span.
    #[tokio::test]
    async fn test_mmio_read_completion() {
        let (tracer, env, mut spanner, _nic_queue, _receives) = setup();

        let events = vec![
            ev(
                &env,
                1,
                EventKind::HostMmioR {
                    id: 7,
                    addr: 0xc0080300,
                    size: 4,
                    bar: 0,
                    offset: 0x80300,
                },
            ),
            ev(&env, 2, EventKind::HostMmioCR { id: 7 }),
        ];
        for event in events {
            spanner.handle_event(event).await.unwrap();
        }

        let mut dumped = Vec::new();
        let summary = tracer.drain(|t| dumped.push(t));
        assert_eq!(summary.traces_emitted, 1);
        assert_eq!(summary.unmatched_events, 0);
        let span = &dumped[0].spans[0];
        assert_eq!(span.kind, "host_mmio");
        assert!(!span.pending);
        assert_eq!(span.events.len(), 2);
    }

    #[tokio::test]
    async fn test_completed_mmio_publishes_context_to_nic() {
        let (tracer, env, mut spanner, nic_queue, _receives) = setup();
        let nic_side = 99;
        nic_queue.register(nic_side).unwrap();

        spanner
            .handle_event(ev(
                &env,
                1,
                EventKind::HostMmioR {
                    id: 7,
                    addr: 0xc0080300,
                    size: 4,
                    bar: 0,
                    offset: 0x80300,
                },
            ))
            .await
            .unwrap();
        assert_eq!(nic_queue.try_poll(nic_side).unwrap(), None);

        spanner
            .handle_event(ev(&env, 2, EventKind::HostMmioCR { id: 7 }))
            .await
            .unwrap();
        let ctx = nic_queue.try_poll(nic_side).unwrap().unwrap();
        assert_eq!(ctx.expectation, Expectation::Mmio);
        assert!(tracer
            .read_span(ctx.parent, |s| s.is_complete())
            .unwrap());
    }

    #[tokio::test]
    async fn test_overlapping_dmas_correlate_by_id() {
        let (tracer, env, mut spanner, _nic_queue, _receives) = setup();

        let events = vec![
            ev(&env, 1, EventKind::HostDmaR { id: 1, addr: 0x1000, size: 8 }),
            ev(&env, 2, EventKind::HostDmaW { id: 2, addr: 0x2000, size: 16 }),
            // completions arrive out of issue order
            ev(&env, 3, EventKind::HostDmaC { id: 2 }),
            ev(&env, 4, EventKind::HostDmaC { id: 1 }),
        ];
        for event in events {
            spanner.handle_event(event).await.unwrap();
        }

        let mut dumped = Vec::new();
        let summary = tracer.drain(|t| dumped.push(t));
        assert_eq!(summary.traces_emitted, 2);
        assert_eq!(summary.unmatched_events, 0);
        for trace in &dumped {
            assert_eq!(trace.spans[0].kind, "host_dma");
            assert_eq!(trace.spans[0].events.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_dma_adopts_nic_context_when_available() {
        let (tracer, env, mut spanner, nic_queue, _receives) = setup();
        let nic_side = 99;
        nic_queue.register(nic_side).unwrap();

        // the NIC announced the causing dma span
        let nic_name = env.intern("nic-test");
        let nic_dma_parent = tracer
            .start_span(
                SpanKind::NicDma,
                &Event::new(
                    5,
                    1,
                    env.intern("nicbm-client"),
                    EventKind::NicDmaI {
                        id: 3,
                        addr: 0xdead,
                        len: 8,
                    },
                ),
                &nic_name,
            )
            .unwrap();
        nic_queue
            .push(nic_side, Expectation::Dma, nic_dma_parent)
            .await
            .unwrap();

        spanner
            .handle_event(ev(&env, 6, EventKind::HostDmaR { id: 3, addr: 0xdead, size: 8 }))
            .await
            .unwrap();

        let host_dma = spanner.pending_dma[0];
        assert_eq!(
            tracer.read_span(host_dma, |s| s.triggered_by).unwrap(),
            Some(nic_dma_parent)
        );
    }

    #[tokio::test]
    async fn test_msix_closes_against_nic_context() {
        let (tracer, env, mut spanner, nic_queue, _receives) = setup();
        let nic_side = 99;
        nic_queue.register(nic_side).unwrap();

        let nic_name = env.intern("nic-test");
        let msix_parent = tracer
            .start_span(
                SpanKind::NicMsix,
                &Event::new(
                    5,
                    1,
                    env.intern("nicbm-client"),
                    EventKind::NicMsix {
                        vec: 2,
                        is_msix_x: true,
                    },
                ),
                &nic_name,
            )
            .unwrap();
        nic_queue
            .push(nic_side, Expectation::Msix, msix_parent)
            .await
            .unwrap();

        spanner
            .handle_event(ev(&env, 6, EventKind::HostMsiX { vec: 2 }))
            .await
            .unwrap();

        let trigger = tracer
            .read_span(msix_parent, |s| s.children.clone())
            .unwrap();
        assert_eq!(trigger.len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_expectation_is_fatal() {
        let (_tracer, env, mut spanner, nic_queue, _receives) = setup();
        let nic_side = 99;
        nic_queue.register(nic_side).unwrap();

        // NIC promises an Msix where the host will look for a Dma
        let tracer = Arc::clone(&spanner.core.tracer);
        let nic_name = env.intern("nic-test");
        let parent = tracer
            .start_span(
                SpanKind::NicMsix,
                &Event::new(
                    5,
                    1,
                    env.intern("nicbm-client"),
                    EventKind::NicMsix {
                        vec: 2,
                        is_msix_x: true,
                    },
                ),
                &nic_name,
            )
            .unwrap();
        nic_queue
            .push(nic_side, Expectation::Msix, parent)
            .await
            .unwrap();

        let result = spanner
            .handle_event(ev(&env, 6, EventKind::HostDmaR { id: 3, addr: 0, size: 8 }))
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::ContextMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_int_span_parented_to_call() {
        let (tracer, env, mut spanner, _nic_queue, _receives) = setup();

        spanner
            .handle_event(call(&env, 1, "entry_SYSCALL_64"))
            .await
            .unwrap();
        spanner
            .handle_event(ev(&env, 2, EventKind::HostPostInt))
            .await
            .unwrap();
        spanner
            .handle_event(ev(&env, 3, EventKind::HostClearInt))
            .await
            .unwrap();

        let call_span = spanner.pending_call.unwrap();
        let children = tracer.read_span(call_span, |s| s.children.clone()).unwrap();
        assert_eq!(children.len(), 1);
        assert!(tracer
            .read_span(children[0], |s| s.is_complete() && s.kind.name() == "host_int")
            .unwrap());
    }

    #[tokio::test]
    async fn test_msix_descriptor_write_protocol() {
        let (tracer, env, mut spanner, nic_queue, _receives) = setup();
        let nic_side = 99;
        nic_queue.register(nic_side).unwrap();

        spanner
            .handle_event(call(&env, 1, "entry_SYSCALL_64"))
            .await
            .unwrap();
        spanner
            .handle_event(call(&env, 2, "pci_msix_desc_addr"))
            .await
            .unwrap();

        // descriptor write: W -> ImResp -> R(id), no completion event
        spanner
            .handle_event(ev(
                &env,
                10,
                EventKind::HostMmioW {
                    id: 5,
                    addr: 0xfee00000,
                    size: 4,
                    bar: 0,
                    offset: 0,
                    posted: true,
                },
            ))
            .await
            .unwrap();
        spanner
            .handle_event(ev(&env, 10, EventKind::HostMmioImRespPoW))
            .await
            .unwrap();

        // the matching read closes the span, so grab its ref while it is
        // still the pending mmio span
        let mmio = spanner.pending_mmio.expect("descriptor span open");
        spanner
            .handle_event(ev(
                &env,
                11,
                EventKind::HostMmioR {
                    id: 5,
                    addr: 0xfee00000,
                    size: 4,
                    bar: 0,
                    offset: 0,
                },
            ))
            .await
            .unwrap();

        // the span completed, left the pending slot, and must not
        // announce itself to the NIC
        assert!(tracer.read_span(mmio, |s| s.is_complete()).unwrap());
        assert!(spanner.pending_mmio.is_none());
        assert_eq!(nic_queue.try_poll(nic_side).unwrap(), None);
    }

    #[tokio::test]
    async fn test_unmatched_events_reach_tracer_report() {
        let (tracer, env, mut spanner, _nic_queue, _receives) = setup();
        spanner
            .handle_event(ev(&env, 1, EventKind::HostMmioCR { id: 9 }))
            .await
            .unwrap();
        spanner.finish();
        let summary = tracer.drain(|_| {});
        assert_eq!(summary.unmatched_events, 1);
    }
}
