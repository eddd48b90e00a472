// Events that flow from the log parsers to the spanners
//
// Every simulator log line of interest becomes one Event: a shared header
// (timestamp in picoseconds, the id and name of the parser that produced it)
// plus a tagged kind with the fields of that record. Using an enum allows
// pattern matching and ensures type-safe communication between async tasks.
//
// The Display impl renders the canonical event-stream line format. That
// rendering is the exact grammar `parser::event_stream` re-ingests, so
// `format` -> `parse` round-trips every event.

use crate::intern::Sym;
use serde::Serialize;
use std::fmt;

/// Number of octets in a MAC address.
pub const MAC_LEN: usize = 6;

/// Ethernet header attached to network enqueue/dequeue/drop events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EthernetHeader {
    pub length_type: u64,
    pub src_mac: [u8; MAC_LEN],
    pub dst_mac: [u8; MAC_LEN],
}

fn write_mac(f: &mut fmt::Formatter<'_>, mac: &[u8; MAC_LEN]) -> fmt::Result {
    for (i, byte) in mac.iter().enumerate() {
        if i > 0 {
            write!(f, ":")?;
        }
        write!(f, "{:02x}", byte)?;
    }
    Ok(())
}

impl fmt::Display for EthernetHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EthernetHeader(length/type=0x{:x}, source=", self.length_type)?;
        write_mac(f, &self.src_mac)?;
        write!(f, ", destination=")?;
        write_mac(f, &self.dst_mac)?;
        write!(f, ")")
    }
}

/// IPv4 header attached to network enqueue/dequeue/drop events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ipv4Header {
    pub length: u64,
    pub src_ip: u32,
    pub dst_ip: u32,
}

fn write_ip(f: &mut fmt::Formatter<'_>, ip: u32) -> fmt::Result {
    write!(
        f,
        "{}.{}.{}.{}",
        (ip >> 24) & 0xff,
        (ip >> 16) & 0xff,
        (ip >> 8) & 0xff,
        ip & 0xff
    )
}

impl fmt::Display for Ipv4Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ipv4Header(length: {}, ", self.length)?;
        write_ip(f, self.src_ip)?;
        write!(f, " > ")?;
        write_ip(f, self.dst_ip)?;
        write!(f, ")")
    }
}

/// The ns-3 device model that produced a network event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceKind {
    CosimNet,
    SimpleNet,
}

impl DeviceKind {
    /// The device type name as it appears in the simulator trace path.
    pub fn device_name(&self) -> &'static str {
        match self {
            DeviceKind::CosimNet => "ns3::CosimNetDevice",
            DeviceKind::SimpleNet => "ns3::SimpleNetDevice",
        }
    }
}

/// Whether a network event crosses a simulator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Boundary {
    /// Frame enters the network simulator from a co-simulation adapter.
    FromAdapter,
    /// Frame moves between devices inside the network simulator.
    Within,
    /// Frame leaves the network simulator toward an adapter.
    ToAdapter,
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Boundary::FromAdapter => "FromAdapter",
            Boundary::Within => "Within",
            Boundary::ToAdapter => "ToAdapter",
        };
        f.write_str(s)
    }
}

/// Payload shared by the three network event kinds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkEventData {
    pub node: u32,
    pub device: u32,
    pub device_kind: DeviceKind,
    pub payload_size: u64,
    pub boundary: Boundary,
    pub eth_header: Option<EthernetHeader>,
    pub ipv4_header: Option<Ipv4Header>,
}

/// The tagged per-kind payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum EventKind {
    // Simulator bookkeeping
    SimSendSync,
    SimProcInEvent,

    // Host CPU simulator
    HostInstr { pc: u64 },
    HostCall { pc: u64, func: Sym, comp: Sym },
    HostMmioR { id: u64, addr: u64, size: u64, bar: u32, offset: u64 },
    HostMmioW { id: u64, addr: u64, size: u64, bar: u32, offset: u64, posted: bool },
    HostMmioImRespPoW,
    HostMmioCR { id: u64 },
    HostMmioCW { id: u64 },
    HostDmaR { id: u64, addr: u64, size: u64 },
    HostDmaW { id: u64, addr: u64, size: u64 },
    HostDmaC { id: u64 },
    HostMsiX { vec: u64 },
    HostConf { dev: u64, func: u64, reg: u64, bytes: u64, data: u64, is_read: bool },
    HostClearInt,
    HostPostInt,
    HostPciRW { offset: u64, size: u64, is_read: bool },

    // NIC behavioral model
    NicMmioR { off: u64, len: u64, val: u64 },
    NicMmioW { off: u64, len: u64, val: u64, posted: bool },
    NicDmaI { id: u64, addr: u64, len: u64 },
    NicDmaEx { id: u64, addr: u64, len: u64 },
    NicDmaEn { id: u64, addr: u64, len: u64 },
    NicDmaCR { id: u64, addr: u64, len: u64 },
    NicDmaCW { id: u64, addr: u64, len: u64 },
    NicMsix { vec: u64, is_msix_x: bool },
    SetIX { intr: u64 },
    NicTx { len: u64 },
    NicRx { port: u32, len: u64 },

    // Network simulator
    NetworkEnqueue(NetworkEventData),
    NetworkDequeue(NetworkEventData),
    NetworkDrop(NetworkEventData),
}

impl EventKind {
    /// The event name used as the line key in the event-stream format.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::SimSendSync => "SimSendSync",
            EventKind::SimProcInEvent => "SimProcInEvent",
            EventKind::HostInstr { .. } => "HostInstr",
            EventKind::HostCall { .. } => "HostCall",
            EventKind::HostMmioR { .. } => "HostMmioR",
            EventKind::HostMmioW { .. } => "HostMmioW",
            EventKind::HostMmioImRespPoW => "HostMmioImRespPoW",
            EventKind::HostMmioCR { .. } => "HostMmioCR",
            EventKind::HostMmioCW { .. } => "HostMmioCW",
            EventKind::HostDmaR { .. } => "HostDmaR",
            EventKind::HostDmaW { .. } => "HostDmaW",
            EventKind::HostDmaC { .. } => "HostDmaC",
            EventKind::HostMsiX { .. } => "HostMsiX",
            EventKind::HostConf { is_read: true, .. } => "HostConfRead",
            EventKind::HostConf { is_read: false, .. } => "HostConfWrite",
            EventKind::HostClearInt => "HostClearInt",
            EventKind::HostPostInt => "HostPostInt",
            EventKind::HostPciRW { is_read: true, .. } => "HostPciR",
            EventKind::HostPciRW { is_read: false, .. } => "HostPciW",
            EventKind::NicMmioR { .. } => "NicMmioR",
            EventKind::NicMmioW { .. } => "NicMmioW",
            EventKind::NicDmaI { .. } => "NicDmaI",
            EventKind::NicDmaEx { .. } => "NicDmaEx",
            EventKind::NicDmaEn { .. } => "NicDmaEn",
            EventKind::NicDmaCR { .. } => "NicDmaCR",
            EventKind::NicDmaCW { .. } => "NicDmaCW",
            EventKind::NicMsix { is_msix_x: true, .. } => "NicMsix",
            EventKind::NicMsix { is_msix_x: false, .. } => "NicMsi",
            EventKind::SetIX { .. } => "SetIX",
            EventKind::NicTx { .. } => "NicTx",
            EventKind::NicRx { .. } => "NicRx",
            EventKind::NetworkEnqueue(_) => "NetworkEnqueue",
            EventKind::NetworkDequeue(_) => "NetworkDequeue",
            EventKind::NetworkDrop(_) => "NetworkDrop",
        }
    }

    /// The network payload, for the three network kinds.
    pub fn network_data(&self) -> Option<&NetworkEventData> {
        match self {
            EventKind::NetworkEnqueue(data)
            | EventKind::NetworkDequeue(data)
            | EventKind::NetworkDrop(data) => Some(data),
            _ => None,
        }
    }
}

/// One parsed log record: shared header plus tagged payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Simulation time in picoseconds. Monotonic per source.
    pub timestamp: u64,
    /// Identifier of the parser instance that emitted this event.
    pub source_id: u64,
    /// Name of the parser instance.
    pub source_name: Sym,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(timestamp: u64, source_id: u64, source_name: Sym, kind: EventKind) -> Self {
        Self {
            timestamp,
            source_id,
            source_name,
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Host call function symbol, if this is a HostCall.
    pub fn call_func(&self) -> Option<&Sym> {
        match &self.kind {
            EventKind::HostCall { func, .. } => Some(func),
            _ => None,
        }
    }
}

fn write_network_data(f: &mut fmt::Formatter<'_>, data: &NetworkEventData) -> fmt::Result {
    write!(
        f,
        ", node={}, device={}, device_name={}, payload_size={}, boundary={}",
        data.node,
        data.device,
        data.device_kind.device_name(),
        data.payload_size,
        data.boundary
    )?;
    if let Some(eth) = &data.eth_header {
        write!(f, " {}", eth)?;
    }
    if let Some(ip) = &data.ipv4_header {
        write!(f, " {}", ip)?;
    }
    Ok(())
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: source_id={}, source_name={}, timestamp={}",
            self.name(),
            self.source_id,
            self.source_name,
            self.timestamp
        )?;

        match &self.kind {
            EventKind::SimSendSync
            | EventKind::SimProcInEvent
            | EventKind::HostMmioImRespPoW
            | EventKind::HostClearInt
            | EventKind::HostPostInt => Ok(()),

            EventKind::HostInstr { pc } => write!(f, ", pc={:x}", pc),
            EventKind::HostCall { pc, func, comp } => {
                write!(f, ", pc={:x}, func={}, comp={}", pc, func, comp)
            }
            EventKind::HostMmioR {
                id,
                addr,
                size,
                bar,
                offset,
            } => write!(
                f,
                ", id={}, addr={:x}, size={:x}, bar={}, offset={:x}",
                id, addr, size, bar, offset
            ),
            EventKind::HostMmioW {
                id,
                addr,
                size,
                bar,
                offset,
                posted,
            } => write!(
                f,
                ", id={}, addr={:x}, size={:x}, bar={}, offset={:x}, posted={}",
                id, addr, size, bar, offset, posted
            ),
            EventKind::HostMmioCR { id } | EventKind::HostMmioCW { id } | EventKind::HostDmaC { id } => {
                write!(f, ", id={}", id)
            }
            EventKind::HostDmaR { id, addr, size } | EventKind::HostDmaW { id, addr, size } => {
                write!(f, ", id={}, addr={:x}, size={:x}", id, addr, size)
            }
            EventKind::HostMsiX { vec } => write!(f, ", vec={}", vec),
            EventKind::HostConf {
                dev,
                func,
                reg,
                bytes,
                data,
                ..
            } => write!(
                f,
                ", dev={:x}, func={:x}, reg={:x}, bytes={}, data={:x}",
                dev, func, reg, bytes, data
            ),
            EventKind::HostPciRW { offset, size, .. } => {
                write!(f, ", offset={:x}, size={}", offset, size)
            }
            EventKind::NicMmioR { off, len, val } => {
                write!(f, ", off={:x}, len={:x}, val={:x}", off, len, val)
            }
            EventKind::NicMmioW {
                off,
                len,
                val,
                posted,
            } => write!(f, ", off={:x}, len={:x}, val={:x}, posted={}", off, len, val, posted),
            EventKind::NicDmaI { id, addr, len }
            | EventKind::NicDmaEx { id, addr, len }
            | EventKind::NicDmaEn { id, addr, len }
            | EventKind::NicDmaCR { id, addr, len }
            | EventKind::NicDmaCW { id, addr, len } => {
                write!(f, ", id={}, addr={:x}, size={:x}", id, addr, len)
            }
            EventKind::NicMsix { vec, .. } => write!(f, ", vec={}", vec),
            EventKind::SetIX { intr } => write!(f, ", interrupt={:x}", intr),
            EventKind::NicTx { len } => write!(f, ", len={:x}", len),
            EventKind::NicRx { port, len } => write!(f, ", len={:x}, port={}", len, port),
            EventKind::NetworkEnqueue(data)
            | EventKind::NetworkDequeue(data)
            | EventKind::NetworkDrop(data) => write_network_data(f, data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_event(kind: EventKind) -> Event {
        Event::new(1945871772000, 3, Sym::from("NicbmParser-client"), kind)
    }

    #[test]
    fn test_display_carries_shared_header() {
        let ev = header_event(EventKind::SimSendSync);
        assert_eq!(
            ev.to_string(),
            "SimSendSync: source_id=3, source_name=NicbmParser-client, timestamp=1945871772000"
        );
    }

    #[test]
    fn test_display_mmio_write_fields() {
        let ev = header_event(EventKind::HostMmioW {
            id: 1,
            addr: 0xc040000c,
            size: 4,
            bar: 3,
            offset: 0xc,
            posted: false,
        });
        assert_eq!(
            ev.to_string(),
            "HostMmioW: source_id=3, source_name=NicbmParser-client, timestamp=1945871772000, \
             id=1, addr=c040000c, size=4, bar=3, offset=c, posted=false"
        );
    }

    #[test]
    fn test_display_network_event_with_headers() {
        let ev = header_event(EventKind::NetworkEnqueue(NetworkEventData {
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
        }));
        let line = ev.to_string();
        assert!(line.starts_with("NetworkEnqueue: source_id=3"));
        assert!(line.contains("node=1, device=2, device_name=ns3::CosimNetDevice"));
        assert!(line.contains("payload_size=42, boundary=FromAdapter"));
        assert!(line.contains(
            "EthernetHeader(length/type=0x806, source=cc:18:61:cf:61:4f, \
             destination=ff:ff:ff:ff:ff:ff)"
        ));
        assert!(!line.contains("Ipv4Header"));
    }

    #[test]
    fn test_display_ipv4_header() {
        let hdr = Ipv4Header {
            length: 84,
            src_ip: (192 << 24) | (168 << 16) | (64 << 8) | 2,
            dst_ip: (192 << 24) | (168 << 16) | (64 << 8) | 1,
        };
        assert_eq!(hdr.to_string(), "Ipv4Header(length: 84, 192.168.64.2 > 192.168.64.1)");
    }

    #[test]
    fn test_conf_and_pci_names_split_on_direction() {
        let read = EventKind::HostConf {
            dev: 0,
            func: 0,
            reg: 0x3d,
            bytes: 1,
            data: 0x1,
            is_read: true,
        };
        let write = EventKind::HostPciRW {
            offset: 0x20,
            size: 4,
            is_read: false,
        };
        assert_eq!(read.name(), "HostConfRead");
        assert_eq!(write.name(), "HostPciW");
    }

    #[test]
    fn test_events_equal_iff_all_fields_match() {
        let a = header_event(EventKind::NicDmaI {
            id: 3,
            addr: 0xdead,
            len: 8,
        });
        let b = header_event(EventKind::NicDmaI {
            id: 3,
            addr: 0xdead,
            len: 8,
        });
        let c = header_event(EventKind::NicDmaI {
            id: 4,
            addr: 0xdead,
            len: 8,
        });
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
