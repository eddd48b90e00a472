// Replayable event-stream parser
//
// Re-ingests the canonical one-line-per-event serialization produced by
// `Display for Event`. The line key is the event name, followed by the
// shared header and the kind-specific `k=v` fields:
//
//   HostMmioW: source_id=0, source_name=gem5-client, timestamp=10, id=1, addr=c040000c, ...
//
// Source ids and names are taken from the line, not reassigned, so a
// replayed stream is identical to the stream that was dumped.

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

pub struct EventStreamParser {
    name: Sym,
    env: Arc<TraceEnv>,
    log_path: PathBuf,
    malformed: u64,
}

impl EventStreamParser {
    pub fn new(env: Arc<TraceEnv>, name: &str, log_path: impl Into<PathBuf>) -> Self {
        Self {
            name: env.intern(name),
            env,
            log_path: log_path.into(),
            malformed: 0,
        }
    }

    pub fn parse_line(&self, lh: &mut LineHandler) -> Option<Event> {
        lh.trim_l();
        let name = lh.extract_until(|c| c != ':').to_string();
        if name.is_empty() || !lh.consume_char(':') {
            return None;
        }

        if !lh.consume_str(" source_id=") {
            return None;
        }
        let source_id = lh.parse_uint(10)?;
        if !lh.consume_str(", source_name=") {
            return None;
        }
        let source_name = {
            let raw = lh.extract_until(|c| c != ',').to_string();
            self.env.intern(raw.trim())
        };
        if !lh.consume_str(", timestamp=") {
            return None;
        }
        let timestamp = lh.parse_uint(10)?;

        let kind = self.parse_kind(&name, lh)?;
        Some(Event::new(timestamp, source_id, source_name, kind))
    }

    fn parse_kind(&self, name: &str, lh: &mut LineHandler) -> Option<EventKind> {
        match name {
            "SimSendSync" => Some(EventKind::SimSendSync),
            "SimProcInEvent" => Some(EventKind::SimProcInEvent),
            "HostMmioImRespPoW" => Some(EventKind::HostMmioImRespPoW),
            "HostClearInt" => Some(EventKind::HostClearInt),
            "HostPostInt" => Some(EventKind::HostPostInt),

            "HostInstr" => {
                if !lh.consume_str(", pc=") {
                    return None;
                }
                let pc = lh.parse_uint(16)?;
                Some(EventKind::HostInstr { pc })
            }
            "HostCall" => {
                if !lh.consume_str(", pc=") {
                    return None;
                }
                let pc = lh.parse_uint(16)?;
                if !lh.consume_str(", func=") {
                    return None;
                }
                let func = self.env.intern(&lh.extract_until(super::is_symbol_char).to_string());
                if !lh.consume_str(", comp=") {
                    return None;
                }
                let comp = self.env.intern(&lh.extract_until(super::is_symbol_char).to_string());
                Some(EventKind::HostCall { pc, func, comp })
            }

            "HostMmioCR" | "HostMmioCW" | "HostDmaC" => {
                if !lh.consume_str(", id=") {
                    return None;
                }
                let id = lh.parse_uint(10)?;
                Some(match name {
                    "HostMmioCR" => EventKind::HostMmioCR { id },
                    "HostMmioCW" => EventKind::HostMmioCW { id },
                    _ => EventKind::HostDmaC { id },
                })
            }

            "HostMmioR" | "HostMmioW" | "HostDmaR" | "HostDmaW" => {
                if !lh.consume_str(", id=") {
                    return None;
                }
                let id = lh.parse_uint(10)?;
                if !lh.consume_str(", addr=") {
                    return None;
                }
                let addr = lh.parse_uint(16)?;
                if !lh.consume_str(", size=") {
                    return None;
                }
                let size = lh.parse_uint(16)?;
                match name {
                    "HostMmioR" | "HostMmioW" => {
                        if !lh.consume_str(", bar=") {
                            return None;
                        }
                        let bar = lh.parse_uint(10)? as u32;
                        if !lh.consume_str(", offset=") {
                            return None;
                        }
                        let offset = lh.parse_uint(16)?;
                        if name == "HostMmioW" {
                            if !lh.consume_str(", posted=") {
                                return None;
                            }
                            let posted = lh.parse_bool()?;
                            Some(EventKind::HostMmioW {
                                id,
                                addr,
                                size,
                                bar,
                                offset,
                                posted,
                            })
                        } else {
                            Some(EventKind::HostMmioR {
                                id,
                                addr,
                                size,
                                bar,
                                offset,
                            })
                        }
                    }
                    "HostDmaR" => Some(EventKind::HostDmaR { id, addr, size }),
                    _ => Some(EventKind::HostDmaW { id, addr, size }),
                }
            }

            "HostMsiX" => {
                if !lh.consume_str(", vec=") {
                    return None;
                }
                let vec = lh.parse_uint(10)?;
                Some(EventKind::HostMsiX { vec })
            }

            "HostConfRead" | "HostConfWrite" => {
                if !lh.consume_str(", dev=") {
                    return None;
                }
                let dev = lh.parse_uint(16)?;
                if !lh.consume_str(", func=") {
                    return None;
                }
                let func = lh.parse_uint(16)?;
                if !lh.consume_str(", reg=") {
                    return None;
                }
                let reg = lh.parse_uint(16)?;
                if !lh.consume_str(", bytes=") {
                    return None;
                }
                let bytes = lh.parse_uint(10)?;
                if !lh.consume_str(", data=") {
                    return None;
                }
                let data = lh.parse_uint(16)?;
                Some(EventKind::HostConf {
                    dev,
                    func,
                    reg,
                    bytes,
                    data,
                    is_read: name == "HostConfRead",
                })
            }

            "HostPciR" | "HostPciW" => {
                if !lh.consume_str(", offset=") {
                    return None;
                }
                let offset = lh.parse_uint(16)?;
                if !lh.consume_str(", size=") {
                    return None;
                }
                let size = lh.parse_uint(10)?;
                Some(EventKind::HostPciRW {
                    offset,
                    size,
                    is_read: name == "HostPciR",
                })
            }

            "NicMsix" | "NicMsi" => {
                if !lh.consume_str(", vec=") {
                    return None;
                }
                let vec = lh.parse_uint(10)?;
                Some(EventKind::NicMsix {
                    vec,
                    is_msix_x: name == "NicMsix",
                })
            }

            "SetIX" => {
                if !lh.consume_str(", interrupt=") {
                    return None;
                }
                let intr = lh.parse_uint(16)?;
                Some(EventKind::SetIX { intr })
            }

            "NicDmaI" | "NicDmaEx" | "NicDmaEn" | "NicDmaCR" | "NicDmaCW" => {
                if !lh.consume_str(", id=") {
                    return None;
                }
                let id = lh.parse_uint(10)?;
                if !lh.consume_str(", addr=") {
                    return None;
                }
                let addr = lh.parse_uint(16)?;
                if !lh.consume_str(", size=") {
                    return None;
                }
                let len = lh.parse_uint(16)?;
                Some(match name {
                    "NicDmaI" => EventKind::NicDmaI { id, addr, len },
                    "NicDmaEx" => EventKind::NicDmaEx { id, addr, len },
                    "NicDmaEn" => EventKind::NicDmaEn { id, addr, len },
                    "NicDmaCR" => EventKind::NicDmaCR { id, addr, len },
                    _ => EventKind::NicDmaCW { id, addr, len },
                })
            }

            "NicMmioR" | "NicMmioW" => {
                if !lh.consume_str(", off=") {
                    return None;
                }
                let off = lh.parse_uint(16)?;
                if !lh.consume_str(", len=") {
                    return None;
                }
                let len = lh.parse_uint(16)?;
                if !lh.consume_str(", val=") {
                    return None;
                }
                let val = lh.parse_uint(16)?;
                if name == "NicMmioW" {
                    if !lh.consume_str(", posted=") {
                        return None;
                    }
                    let posted = lh.parse_bool()?;
                    Some(EventKind::NicMmioW {
                        off,
                        len,
                        val,
                        posted,
                    })
                } else {
                    Some(EventKind::NicMmioR { off, len, val })
                }
            }

            "NicTx" => {
                if !lh.consume_str(", len=") {
                    return None;
                }
                let len = lh.parse_uint(16)?;
                Some(EventKind::NicTx { len })
            }
            "NicRx" => {
                if !lh.consume_str(", len=") {
                    return None;
                }
                let len = lh.parse_uint(16)?;
                if !lh.consume_str(", port=") {
                    return None;
                }
                let port = lh.parse_uint(10)? as u32;
                Some(EventKind::NicRx { port, len })
            }

            "NetworkEnqueue" | "NetworkDequeue" | "NetworkDrop" => {
                let data = Self::parse_network_data(lh)?;
                Some(match name {
                    "NetworkEnqueue" => EventKind::NetworkEnqueue(data),
                    "NetworkDequeue" => EventKind::NetworkDequeue(data),
                    _ => EventKind::NetworkDrop(data),
                })
            }

            _ => None,
        }
    }

    fn parse_network_data(lh: &mut LineHandler) -> Option<NetworkEventData> {
        if !lh.consume_str(", node=") {
            return None;
        }
        let node = lh.parse_uint(10)? as u32;
        if !lh.consume_str(", device=") {
            return None;
        }
        let device = lh.parse_uint(10)? as u32;
        if !lh.consume_str(", device_name=") {
            return None;
        }
        let device_name = lh.extract_until(super::is_symbol_char).to_string();
        let device_kind = match device_name.as_str() {
            "ns3::CosimNetDevice" => DeviceKind::CosimNet,
            "ns3::SimpleNetDevice" => DeviceKind::SimpleNet,
            _ => return None,
        };
        if !lh.consume_str(", payload_size=") {
            return None;
        }
        let payload_size = lh.parse_uint(10)?;
        if !lh.consume_str(", boundary=") {
            return None;
        }
        let boundary = match lh.extract_until(char::is_alphanumeric) {
            "FromAdapter" => Boundary::FromAdapter,
            "Within" => Boundary::Within,
            "ToAdapter" => Boundary::ToAdapter,
            _ => return None,
        };

        let eth_header = super::try_parse_ethernet_header(lh);
        let ipv4_header = super::try_parse_ipv4_header(lh);

        Some(NetworkEventData {
            node,
            device,
            device_kind,
            payload_size,
            boundary,
            eth_header,
            ipv4_header,
        })
    }
}

#[async_trait]
impl Producer<Event> for EventStreamParser {
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
                        "skipping unparsable event-stream line: {}",
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
