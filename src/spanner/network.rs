// Network spanner - stitches simulator enqueue/dequeue/drop events into
// per-device spans
//
// A device span covers the contiguous run of events one device sees for a
// frame. A frame entering from an adapter adopts the Rx context published
// by the upstream NIC; every further device in the path chains off the
// previous device span. When the frame leaves toward an adapter, an Rx
// context is published downstream so the receiving side can attach.

use super::{close_queues, poison_queues, SpannerCore};
use crate::channel::Channel;
use crate::context::{ContextQueue, Expectation};
use crate::errors::PipelineError;
use crate::events::{Boundary, Event, EventKind};
use crate::pipeline::Consumer;
use crate::span::{AddResult, SpanKind, SpanRef};
use crate::tracer::Tracer;
use async_trait::async_trait;
use std::sync::Arc;

pub struct NetworkSpanner {
    core: SpannerCore,
    /// Paired queue with the NIC feeding this network.
    nic_queue: Arc<ContextQueue>,
    /// Receive announcements toward the downstream host/NIC side.
    downstream: Arc<ContextQueue>,

    current_device: Option<SpanRef>,
}

impl NetworkSpanner {
    pub fn new(
        tracer: Arc<Tracer>,
        name: &str,
        nic_queue: Arc<ContextQueue>,
        downstream: Arc<ContextQueue>,
    ) -> Self {
        let core = SpannerCore::new(tracer, name);
        nic_queue
            .register(core.id)
            .expect("network spanner registration on nic queue");
        downstream
            .register(core.id)
            .expect("network spanner registration on downstream queue");
        Self {
            core,
            nic_queue,
            downstream,
            current_device: None,
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), PipelineError> {
        let Some(data) = event.kind.network_data() else {
            self.core.hold_unmatched(event);
            return Ok(());
        };
        let boundary = data.boundary;
        let tracer = Arc::clone(&self.core.tracer);

        // extension first: the current device may still be working the frame
        if let Some(current) = self.current_device {
            match tracer.try_add_to_span(current, &event) {
                AddResult::Added => {
                    if boundary == Boundary::ToAdapter {
                        self.publish_downstream(current).await?;
                    }
                    return Ok(());
                }
                AddResult::Full => unreachable!("net device spans never report Full"),
                AddResult::Rejected => {}
            }
        }

        let span = if boundary == Boundary::FromAdapter {
            // frame enters the simulator; adopt the upstream announcement
            let polled = self.nic_queue.poll(self.core.id).await?;
            match self.core.expect_context(polled, Expectation::Rx)? {
                Some(ctx) => tracer.start_span_by_parent_pass_on_context(
                    ctx,
                    SpanKind::NetDevice,
                    &event,
                    &self.core.name,
                ),
                None => {
                    self.core.hold_unmatched(event);
                    return Ok(());
                }
            }
        } else {
            match self.current_device {
                Some(previous) => tracer.start_span_by_parent(
                    previous,
                    SpanKind::NetDevice,
                    &event,
                    &self.core.name,
                ),
                None => tracer.start_span(SpanKind::NetDevice, &event, &self.core.name),
            }
        };

        let Some(span) = span else {
            self.core.hold_unmatched(event);
            return Ok(());
        };
        self.current_device = Some(span);
        if boundary == Boundary::ToAdapter {
            self.publish_downstream(span).await?;
        }
        Ok(())
    }

    async fn publish_downstream(&self, span: SpanRef) -> Result<(), PipelineError> {
        if !self
            .downstream
            .push(self.core.id, Expectation::Rx, span)
            .await?
        {
            tracing::debug!(
                spanner = %self.core.name,
                "downstream side finished; receive context dropped"
            );
        }
        Ok(())
    }

    fn finish(&mut self) {
        let pending: Vec<SpanRef> = self.current_device.into_iter().collect();
        self.core.finish_unmatched(&pending);
    }
}

#[async_trait]
impl Consumer<Event> for NetworkSpanner {
    async fn consume(&mut self, input: Arc<Channel<Event>>) -> Result<(), PipelineError> {
        while let Some(event) = input.pop().await {
            if let Err(err) = self.handle_event(event).await {
                poison_queues(&[&self.nic_queue, &self.downstream]);
                return Err(err);
            }
        }
        if input.is_poisoned() {
            poison_queues(&[&self.nic_queue, &self.downstream]);
            return Err(PipelineError::ChannelPoisoned);
        }
        self.finish();
        close_queues(&[&self.nic_queue, &self.downstream]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::TraceEnv;
    use crate::events::{DeviceKind, NetworkEventData};

    struct Fixture {
        tracer: Arc<Tracer>,
        env: Arc<TraceEnv>,
        spanner: NetworkSpanner,
        nic_queue: Arc<ContextQueue>,
        downstream: Arc<ContextQueue>,
        peer: u64,
    }

    fn setup() -> Fixture {
        let env = Arc::new(TraceEnv::with_defaults());
        let tracer = Arc::new(Tracer::new(Arc::clone(&env)));
        let nic_queue = Arc::new(ContextQueue::new());
        let downstream = Arc::new(ContextQueue::new());
        let spanner = NetworkSpanner::new(
            Arc::clone(&tracer),
            "network-test",
            Arc::clone(&nic_queue),
            Arc::clone(&downstream),
        );
        let peer = 99;
        nic_queue.register(peer).unwrap();
        downstream.register(peer).unwrap();
        Fixture {
            tracer,
            env,
            spanner,
            nic_queue,
            downstream,
            peer,
        }
    }

    fn net_ev(
        env: &TraceEnv,
        ts: u64,
        node: u32,
        device: u32,
        boundary: Boundary,
        enqueue: bool,
    ) -> Event {
        let data = NetworkEventData {
            node,
            device,
            device_kind: DeviceKind::CosimNet,
            payload_size: 42,
            boundary,
            eth_header: None,
            ipv4_header: None,
        };
        let kind = if enqueue {
            EventKind::NetworkEnqueue(data)
        } else {
            EventKind::NetworkDequeue(data)
        };
        Event::new(ts, 2, env.intern("ns3-test"), kind)
    }

    fn nic_parent(f: &Fixture) -> SpanRef {
        let name = f.env.intern("nic-test");
        let span = f
            .tracer
            .start_span(
                SpanKind::NicEth,
                &Event::new(
                    1,
                    1,
                    f.env.intern("nicbm-client"),
                    EventKind::NicRx { port: 0, len: 98 },
                ),
                &name,
            )
            .unwrap();
        span
    }

    // Frame enters from the adapter, hops across two devices, and leaves
    // toward the far adapter: one chain of device spans off the eth span.
    #[tokio::test]
    async fn test_device_chain_adopts_rx_context() {
        let mut f = setup();
        let eth = nic_parent(&f);
        f.nic_queue
            .push(f.peer, Expectation::Rx, eth)
            .await
            .unwrap();

        let events = vec![
            net_ev(&f.env, 10, 1, 2, Boundary::FromAdapter, true),
            net_ev(&f.env, 11, 1, 2, Boundary::Within, false),
            net_ev(&f.env, 12, 0, 2, Boundary::Within, true),
            net_ev(&f.env, 13, 0, 2, Boundary::ToAdapter, false),
        ];
        for event in events {
            f.spanner.handle_event(event).await.unwrap();
        }

        // first device span hangs off the eth span
        let first_children = f.tracer.read_span(eth, |s| s.children.clone()).unwrap();
        assert_eq!(first_children.len(), 1);
        let first = first_children[0];
        assert_eq!(
            f.tracer.read_span(first, |s| s.events.len()).unwrap(),
            2
        );

        // second device chains off the first and completed on ToAdapter
        let second = f.tracer.read_span(first, |s| s.children.clone()).unwrap()[0];
        assert!(f.tracer.read_span(second, |s| s.is_complete()).unwrap());

        // the departure was announced downstream with the device span as
        // parent
        let ctx = f.downstream.try_poll(f.peer).unwrap().unwrap();
        assert_eq!(ctx.expectation, Expectation::Rx);
        assert_eq!(ctx.parent, second);
    }

    #[tokio::test]
    async fn test_to_adapter_on_extension_still_publishes() {
        let mut f = setup();
        let eth = nic_parent(&f);
        f.nic_queue
            .push(f.peer, Expectation::Rx, eth)
            .await
            .unwrap();

        // enqueue and dequeue on the same device; the dequeue leaves
        for event in [
            net_ev(&f.env, 10, 0, 2, Boundary::FromAdapter, true),
            net_ev(&f.env, 11, 0, 2, Boundary::ToAdapter, false),
        ] {
            f.spanner.handle_event(event).await.unwrap();
        }
        let ctx = f.downstream.try_poll(f.peer).unwrap().unwrap();
        assert_eq!(ctx.expectation, Expectation::Rx);
    }

    #[tokio::test]
    async fn test_drop_completes_device_span() {
        let mut f = setup();
        let within = net_ev(&f.env, 10, 0, 1, Boundary::Within, true);
        f.spanner.handle_event(within).await.unwrap();

        let drop_ev = Event::new(
            11,
            2,
            f.env.intern("ns3-test"),
            EventKind::NetworkDrop(NetworkEventData {
                node: 0,
                device: 1,
                device_kind: DeviceKind::CosimNet,
                payload_size: 42,
                boundary: Boundary::Within,
                eth_header: None,
                ipv4_header: None,
            }),
        );
        f.spanner.handle_event(drop_ev).await.unwrap();

        let span = f.spanner.current_device.unwrap();
        assert!(f.tracer.read_span(span, |s| s.is_complete()).unwrap());
        // nothing announced downstream for a dropped frame
        assert_eq!(f.downstream.try_poll(f.peer).unwrap(), None);
    }

    #[tokio::test]
    async fn test_from_adapter_without_context_is_unmatched() {
        let mut f = setup();
        f.nic_queue.close();
        f.spanner
            .handle_event(net_ev(&f.env, 10, 1, 2, Boundary::FromAdapter, true))
            .await
            .unwrap();
        f.spanner.finish();
        let summary = f.tracer.drain(|_| {});
        assert_eq!(summary.unmatched_events, 1);
    }
}
