// Network simulator (ns-3) log parser
//
// One event per line. The prefix selects the kind, then the trace path
// names node, device and device model, then the optional protocol headers
// and the payload size:
//
//   + 1945871772000 /NodeList/1/DeviceList/2/$ns3::CosimNetDevice/fromAdapter \
//     EthernetHeader(length/type=0x806, source=.., destination=..) Payload (size=42)
//
// `+` enqueue, `-` dequeue, `d` drop. A `fromAdapter` / `toAdapter` marker
// in the remaining trace path classifies the boundary; its absence means
// the frame stayed within the simulator.

use crate::channel::Channel;
use crate::env::TraceEnv;
use crate::errors::PipelineError;
use crate::events::{Boundary, DeviceKind, Event, EventKind, NetworkEventData};
use crate::intern::Sym;
use crate::pipeline::Producer;
use crate::reader::{LineHandler, LineReader};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

pub struct Ns3Parser {
    name: Sym,
    ident: u64,
    log_path: PathBuf,
    malformed: u64,
}

enum LineKind {
    Enqueue,
    Dequeue,
    Drop,
}

impl Ns3Parser {
    pub fn new(env: &TraceEnv, name: &str, log_path: impl Into<PathBuf>) -> Self {
        Self {
            name: env.intern(name),
            ident: env.next_parser_id(),
            log_path: log_path.into(),
            malformed: 0,
        }
    }

    pub fn ident(&self) -> u64 {
        self.ident
    }

    pub fn parse_line(&self, lh: &mut LineHandler) -> Option<Event> {
        let kind = if lh.consume_char('+') {
            LineKind::Enqueue
        } else if lh.consume_char('-') {
            LineKind::Dequeue
        } else if lh.consume_char('d') {
            LineKind::Drop
        } else {
            return None;
        };

        lh.trim_l();
        let timestamp = lh.parse_uint(10)?;

        if !lh.consume_till_str("NodeList/") {
            return None;
        }
        let node = lh.parse_int()?;
        if !lh.consume_till_str("DeviceList/") {
            return None;
        }
        let device = lh.parse_int()?;

        let device_kind = if lh.consume_till_str("ns3::SimpleNetDevice") {
            DeviceKind::SimpleNet
        } else if lh.consume_till_str("ns3::CosimNetDevice") {
            DeviceKind::CosimNet
        } else {
            return None;
        };

        // remaining trace path segment carries the adapter boundary marker
        let path_rest = lh.extract_until(|c| !c.is_whitespace()).to_string();
        let boundary = if path_rest.contains("fromAdapter") {
            Boundary::FromAdapter
        } else if path_rest.contains("toAdapter") {
            Boundary::ToAdapter
        } else {
            Boundary::Within
        };

        lh.trim_l();
        let eth_header = super::try_parse_ethernet_header(lh);
        let ipv4_header = super::try_parse_ipv4_header(lh);

        if !lh.consume_till_str("Payload (size=") {
            return None;
        }
        let payload_size = lh.parse_uint(10)?;

        let data = NetworkEventData {
            node: node as u32,
            device: device as u32,
            device_kind,
            payload_size,
            boundary,
            eth_header,
            ipv4_header,
        };
        let kind = match kind {
            LineKind::Enqueue => EventKind::NetworkEnqueue(data),
            LineKind::Dequeue => EventKind::NetworkDequeue(data),
            LineKind::Drop => EventKind::NetworkDrop(data),
        };
        Some(Event::new(timestamp, self.ident, self.name.clone(), kind))
    }
}

#[async_trait]
impl Producer<Event> for Ns3Parser {
    async fn produce(&mut self, out: Arc<Channel<Event>>) -> Result<(), PipelineError> {
        let mut reader = LineReader::open(&self.log_path).await?;

        while let Some(mut lh) = reader.next_line().await? {
            match self.parse_line(&mut lh) {
                Some(event) => match out.send(event).await {
                    Ok(()) => {}
                    Err(PipelineError::ChannelClosed) => return Ok(()),
                    Err(err) => return Err(err),
                },
                None => {
                    self.malformed += 1;
                    tracing::debug!(
                        parser = %self.name,
                        line = reader.line_number(),
                        "skipping unparsable ns3 line: {}",
                        lh.raw_line()
                    );
                }
            }
        }

        if self.malformed > 0 {
            tracing::info!(
                parser = %self.name,
                skipped = self.malformed,
                "finished with unparsable lines skipped"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EthernetHeader;

    fn parser() -> Ns3Parser {
        let env = TraceEnv::with_defaults();
        Ns3Parser::new(&env, "ns3-test", "/dev/null")
    }

    #[test]
    fn test_parse_arp_enqueue_from_adapter() {
        let parser = parser();
        let mut lh = LineHandler::new(
            "+ 1945871772000 /NodeList/1/DeviceList/2/$ns3::CosimNetDevice/fromAdapter \
             EthernetHeader(length/type=0x806, source=cc:18:61:cf:61:4f, \
             destination=ff:ff:ff:ff:ff:ff) Payload (size=42)"
                .to_string(),
        );
        let event = parser.parse_line(&mut lh).unwrap();
        assert_eq!(event.timestamp, 1945871772000);
        assert_eq!(
            event.kind,
            EventKind::NetworkEnqueue(NetworkEventData {
                node: 1,
                device: 2,
                device_kind: DeviceKind::CosimNet,
                payload_size: 42,
                boundary: Boundary::FromAdapter,
                eth_header: Some(EthernetHeader {
                    length_type: 0x806,
                    src_mac: [0xcc, 0x18, 0x61, 0xcf, 0x61, 0x4f],
                    dst_mac: [0xff; 6],
                }),
                ipv4_header: None,
            })
        );
    }

    #[test]
    fn test_parse_dequeue_to_adapter_with_ip_header() {
        let parser = parser();
        let mut lh = LineHandler::new(
            "- 1946922071000 /NodeList/0/DeviceList/2/$ns3::CosimNetDevice/toAdapter \
             EthernetHeader(length/type=0x800, source=cc:18:61:cf:61:4f, \
             destination=5c:1a:f9:8b:6f:b2) Ipv4Header(length: 84, 192.168.64.2 > 192.168.64.1) \
             Payload (size=98)"
                .to_string(),
        );
        let event = parser.parse_line(&mut lh).unwrap();
        let EventKind::NetworkDequeue(data) = &event.kind else {
            panic!("expected dequeue");
        };
        assert_eq!(data.boundary, Boundary::ToAdapter);
        assert_eq!(data.device_kind, DeviceKind::CosimNet);
        let ip = data.ipv4_header.unwrap();
        assert_eq!(ip.length, 84);
        assert_eq!(ip.src_ip, 0xc0a84002);
    }

    #[test]
    fn test_parse_simple_device_within() {
        let parser = parser();
        let mut lh = LineHandler::new(
            "+ 1945871772000 /NodeList/1/DeviceList/1/$ns3::SimpleNetDevice/TxQueue \
             Payload (size=42)"
                .to_string(),
        );
        let event = parser.parse_line(&mut lh).unwrap();
        let data = event.kind.network_data().unwrap();
        assert_eq!(data.device_kind, DeviceKind::SimpleNet);
        assert_eq!(data.boundary, Boundary::Within);
        assert!(data.eth_header.is_none());
    }

    #[test]
    fn test_parse_drop() {
        let parser = parser();
        let mut lh = LineHandler::new(
            "d 100 /NodeList/0/DeviceList/1/$ns3::SimpleNetDevice/Drop Payload (size=10)"
                .to_string(),
        );
        let event = parser.parse_line(&mut lh).unwrap();
        assert!(matches!(event.kind, EventKind::NetworkDrop(_)));
    }

    #[test]
    fn test_unknown_prefix_is_malformed() {
        let parser = parser();
        let mut lh = LineHandler::new("* 100 whatever".to_string());
        assert!(parser.parse_line(&mut lh).is_none());
    }
}
