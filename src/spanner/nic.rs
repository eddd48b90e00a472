// NIC spanner - stitches NIC behavioral model events into spans
//
// Register accesses adopt the Mmio context the host published for the
// mirrored operation; the last completed register write is remembered as
// the cause of subsequent DMA, transmit and interrupt activity. DMA spans
// are correlated by (id, addr); when a DMA reaches the execute stage the
// host is told to expect its memory-side counterpart. A received frame
// opens a fresh trace and is announced both to the host (for the driver
// receive call) and to the network simulator (for the device chain).

use super::{close_queues, poison_queues, SpannerCore};
use crate::channel::Channel;
use crate::context::{ContextQueue, Expectation};
use crate::errors::PipelineError;
use crate::events::{Event, EventKind};
use crate::pipeline::Consumer;
use crate::span::{AddResult, SpanKind, SpanRef};
use crate::tracer::Tracer;
use async_trait::async_trait;
use std::sync::Arc;

pub struct NicSpanner {
    core: SpannerCore,
    /// Paired queue with the host: the host writes Mmio, we write Dma/Msix.
    host_queue: Arc<ContextQueue>,
    /// Receive announcements toward the host.
    host_receives: Arc<ContextQueue>,
    /// Paired queue with the network simulator.
    network_queue: Arc<ContextQueue>,

    /// Last completed register write; attributed as the cause of DMA,
    /// transmit and interrupt activity that follows it.
    last_causing: Option<SpanRef>,
    pending_dma: Vec<SpanRef>,
}

impl NicSpanner {
    pub fn new(
        tracer: Arc<Tracer>,
        name: &str,
        host_queue: Arc<ContextQueue>,
        host_receives: Arc<ContextQueue>,
        network_queue: Arc<ContextQueue>,
    ) -> Self {
        let core = SpannerCore::new(tracer, name);
        host_queue
            .register(core.id)
            .expect("nic spanner registration on host queue");
        host_receives
            .register(core.id)
            .expect("nic spanner registration on receive queue");
        network_queue
            .register(core.id)
            .expect("nic spanner registration on network queue");
        Self {
            core,
            host_queue,
            host_receives,
            network_queue,
            last_causing: None,
            pending_dma: Vec::new(),
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), PipelineError> {
        match &event.kind {
            EventKind::NicMmioR { .. } | EventKind::NicMmioW { .. } => {
                self.handle_mmio(event).await
            }
            EventKind::NicDmaI { .. }
            | EventKind::NicDmaEx { .. }
            | EventKind::NicDmaEn { .. }
            | EventKind::NicDmaCR { .. }
            | EventKind::NicDmaCW { .. } => self.handle_dma(event).await,
            EventKind::NicTx { .. } | EventKind::NicRx { .. } => self.handle_txrx(event).await,
            EventKind::NicMsix { .. } => self.handle_msix(event).await,
            _ => self.handle_generic(event),
        }
    }

    async fn handle_mmio(&mut self, event: Event) -> Result<(), PipelineError> {
        let is_write = matches!(event.kind, EventKind::NicMmioW { .. });

        // the host announces every mirrored register operation
        let polled = self.host_queue.poll(self.core.id).await?;
        let Some(ctx) = self.core.expect_context(polled, Expectation::Mmio)? else {
            self.core.hold_unmatched(event);
            return Ok(());
        };

        let span = self.core.tracer.start_span_by_parent_pass_on_context(
            ctx,
            SpanKind::NicMmio,
            &event,
            &self.core.name,
        );
        match span {
            Some(span) => {
                if is_write {
                    self.last_causing = Some(span);
                }
                Ok(())
            }
            None => {
                self.core.hold_unmatched(event);
                Ok(())
            }
        }
    }

    async fn handle_dma(&mut self, event: Event) -> Result<(), PipelineError> {
        let tracer = Arc::clone(&self.core.tracer);

        for index in 0..self.pending_dma.len() {
            let span = self.pending_dma[index];
            match tracer.try_add_to_span(span, &event) {
                AddResult::Added => {
                    if tracer.read_span(span, |s| s.is_complete()).unwrap_or(false) {
                        self.pending_dma.swap_remove(index);
                    } else if matches!(event.kind, EventKind::NicDmaEx { .. }) {
                        // the memory side happens next; hand the host its parent
                        if !self
                            .host_queue
                            .push(self.core.id, Expectation::Dma, span)
                            .await?
                        {
                            tracing::debug!(
                                spanner = %self.core.name,
                                "host side finished; dma context dropped"
                            );
                        }
                    }
                    return Ok(());
                }
                AddResult::Full => unreachable!("nic dma spans never report Full"),
                AddResult::Rejected => {}
            }
        }

        if !matches!(event.kind, EventKind::NicDmaI { .. }) {
            self.core.hold_unmatched(event);
            return Ok(());
        }

        let opened = match self.last_causing {
            Some(cause) => {
                tracer.start_span_by_parent(cause, SpanKind::NicDma, &event, &self.core.name)
            }
            None => tracer.start_span(SpanKind::NicDma, &event, &self.core.name),
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

    async fn handle_txrx(&mut self, event: Event) -> Result<(), PipelineError> {
        let tracer = Arc::clone(&self.core.tracer);

        match event.kind {
            EventKind::NicTx { .. } => {
                if let Some(cause) = self.last_causing {
                    let causing_is_write = tracer
                        .read_span(cause, |s| s.kind == SpanKind::NicMmio && s.is_write())
                        .unwrap_or(false);
                    if !causing_is_write {
                        tracing::warn!(
                            spanner = %self.core.name,
                            "transmit caused by a non-write register access"
                        );
                    }
                }
                let opened = match self.last_causing {
                    Some(cause) => {
                        tracer.start_span_by_parent(cause, SpanKind::NicEth, &event, &self.core.name)
                    }
                    None => tracer.start_span(SpanKind::NicEth, &event, &self.core.name),
                };
                if opened.is_none() {
                    self.core.hold_unmatched(event);
                }
            }
            EventKind::NicRx { .. } => {
                // an inbound frame anchors a brand-new trace
                let Some(span) = tracer.start_span(SpanKind::NicEth, &event, &self.core.name)
                else {
                    self.core.hold_unmatched(event);
                    return Ok(());
                };
                self.last_causing = Some(span);

                let host_side = self
                    .host_receives
                    .push(self.core.id, Expectation::Rx, span)
                    .await?;
                let network_side = self
                    .network_queue
                    .push(self.core.id, Expectation::Rx, span)
                    .await?;
                if !host_side || !network_side {
                    tracing::debug!(
                        spanner = %self.core.name,
                        "peer finished; receive context dropped"
                    );
                }
            }
            _ => unreachable!("handle_txrx only sees tx/rx events"),
        }
        Ok(())
    }

    async fn handle_msix(&mut self, event: Event) -> Result<(), PipelineError> {
        let tracer = Arc::clone(&self.core.tracer);
        let opened = match self.last_causing {
            Some(cause) => {
                tracer.start_span_by_parent(cause, SpanKind::NicMsix, &event, &self.core.name)
            }
            None => tracer.start_span(SpanKind::NicMsix, &event, &self.core.name),
        };
        let Some(span) = opened else {
            self.core.hold_unmatched(event);
            return Ok(());
        };
        if !self
            .host_queue
            .push(self.core.id, Expectation::Msix, span)
            .await?
        {
            tracing::debug!(spanner = %self.core.name, "host side finished; msix context dropped");
        }
        Ok(())
    }

    /// Events with no dedicated rule become standalone single-event spans.
    fn handle_generic(&mut self, event: Event) -> Result<(), PipelineError> {
        if self
            .core
            .tracer
            .start_span(SpanKind::GenericSingle, &event, &self.core.name)
            .is_none()
        {
            self.core.hold_unmatched(event);
        }
        Ok(())
    }

    fn finish(&mut self) {
        let pending = self.pending_dma.clone();
        self.core.finish_unmatched(&pending);
    }
}

#[async_trait]
impl Consumer<Event> for NicSpanner {
    async fn consume(&mut self, input: Arc<Channel<Event>>) -> Result<(), PipelineError> {
        while let Some(event) = input.pop().await {
            if let Err(err) = self.handle_event(event).await {
                poison_queues(&[&self.host_queue, &self.host_receives, &self.network_queue]);
                return Err(err);
            }
        }
        if input.is_poisoned() {
            poison_queues(&[&self.host_queue, &self.host_receives, &self.network_queue]);
            return Err(PipelineError::ChannelPoisoned);
        }
        self.finish();
        close_queues(&[&self.host_queue, &self.host_receives, &self.network_queue]);
        Ok(())
    }
}
