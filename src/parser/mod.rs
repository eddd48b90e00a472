// Parser module - turns raw simulator log lines into typed events
//
// One parser per log format, each a pipeline Producer over Event. Parsers
// share the cursor primitives from `reader` plus the field parsers below
// (timestamps, addresses, MAC/IP, and the optional Ethernet/IPv4 header
// groups of the network logs). A line that does not decode is counted and
// skipped with a diagnostic; it never aborts the pipeline.

pub mod event_stream;
pub mod gem5;
pub mod nicbm;
pub mod ns3;

pub use event_stream::EventStreamParser;
pub use gem5::{ComponentFilter, Gem5Parser};
pub use nicbm::NicbmParser;
pub use ns3::Ns3Parser;

use crate::events::{EthernetHeader, Ipv4Header, MAC_LEN};
use crate::reader::LineHandler;

/// Decimal picosecond timestamp, leading whitespace tolerated.
pub fn parse_timestamp(lh: &mut LineHandler) -> Option<u64> {
    lh.trim_l();
    lh.parse_uint(10)
}

/// Lowercase hex address without `0x` prefix.
pub fn parse_address(lh: &mut LineHandler) -> Option<u64> {
    lh.parse_uint(16)
}

/// `aa:bb:cc:dd:ee:ff`
pub fn parse_mac(lh: &mut LineHandler) -> Option<[u8; MAC_LEN]> {
    let mut mac = [0u8; MAC_LEN];
    for (i, byte) in mac.iter_mut().enumerate() {
        let octet = lh.parse_uint(16)?;
        if octet > 0xff {
            return None;
        }
        *byte = octet as u8;
        if i < MAC_LEN - 1 && !lh.consume_char(':') {
            return None;
        }
    }
    Some(mac)
}

/// Dotted-quad IPv4 address.
pub fn parse_ipv4(lh: &mut LineHandler) -> Option<u32> {
    let mut addr: u32 = 0;
    for i in 0..4 {
        let octet = lh.parse_uint(10)?;
        if octet > 255 {
            return None;
        }
        addr = (addr << 8) | octet as u32;
        if i < 3 && !lh.consume_char('.') {
            return None;
        }
    }
    Some(addr)
}

/// `EthernetHeader(length/type=0x806, source=.., destination=..)` anywhere
/// in the remainder. The cursor is only advanced when the opening marker is
/// found.
pub fn try_parse_ethernet_header(lh: &mut LineHandler) -> Option<EthernetHeader> {
    lh.trim_l();
    if !lh.consume_till_str("EthernetHeader") {
        return None;
    }

    if !lh.consume_till_str("length/type=0x") {
        return None;
    }
    let length_type = lh.parse_uint(16)?;

    if !lh.consume_till_str("source=") {
        return None;
    }
    let src_mac = parse_mac(lh)?;

    if !lh.consume_till_str("destination=") {
        return None;
    }
    let dst_mac = parse_mac(lh)?;

    Some(EthernetHeader {
        length_type,
        src_mac,
        dst_mac,
    })
}

/// `Ipv4Header(length: 84, 192.168.64.2 > 192.168.64.1)` anywhere in the
/// remainder.
pub fn try_parse_ipv4_header(lh: &mut LineHandler) -> Option<Ipv4Header> {
    lh.trim_l();
    if !lh.consume_till_str("Ipv4Header") {
        return None;
    }

    if !lh.consume_till_str("length: ") {
        return None;
    }
    let length = lh.parse_uint(10)?;

    lh.trim_l();
    lh.consume_char(',');
    lh.trim_l();
    let src_ip = parse_ipv4(lh)?;

    lh.trim_l();
    if !lh.consume_char('>') {
        return None;
    }
    lh.trim_l();
    let dst_ip = parse_ipv4(lh)?;

    Some(Ipv4Header {
        length,
        src_ip,
        dst_ip,
    })
}

/// Charset of function/component identifiers in the event-stream format.
pub fn is_symbol_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.' || c == ':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        let mut lh = LineHandler::new("cc:18:61:cf:61:4f rest".to_string());
        assert_eq!(
            parse_mac(&mut lh),
            Some([0xcc, 0x18, 0x61, 0xcf, 0x61, 0x4f])
        );
        assert_eq!(lh.rest(), " rest");
    }

    #[test]
    fn test_parse_ipv4() {
        let mut lh = LineHandler::new("192.168.64.2 >".to_string());
        assert_eq!(parse_ipv4(&mut lh), Some(0xc0a84002));
    }

    #[test]
    fn test_parse_ipv4_rejects_large_octets() {
        let mut lh = LineHandler::new("300.0.0.1".to_string());
        assert_eq!(parse_ipv4(&mut lh), None);
    }

    #[test]
    fn test_try_parse_ethernet_header() {
        let mut lh = LineHandler::new(
            "ns3::CosimNetDevice EthernetHeader(length/type=0x806, \
             source=cc:18:61:cf:61:4f, destination=ff:ff:ff:ff:ff:ff) Payload (size=42)"
                .to_string(),
        );
        let header = try_parse_ethernet_header(&mut lh).unwrap();
        assert_eq!(header.length_type, 0x806);
        assert_eq!(header.src_mac, [0xcc, 0x18, 0x61, 0xcf, 0x61, 0x4f]);
        assert_eq!(header.dst_mac, [0xff; 6]);
        assert!(lh.rest().contains("Payload"));
    }

    #[test]
    fn test_missing_ethernet_header_leaves_cursor() {
        let mut lh = LineHandler::new("Payload (size=42)".to_string());
        assert!(try_parse_ethernet_header(&mut lh).is_none());
        assert_eq!(lh.rest(), "Payload (size=42)");
    }

    #[test]
    fn test_try_parse_ipv4_header() {
        let mut lh =
            LineHandler::new("Ipv4Header(length: 84, 192.168.64.2 > 192.168.64.1)".to_string());
        let header = try_parse_ipv4_header(&mut lh).unwrap();
        assert_eq!(header.length, 84);
        assert_eq!(header.src_ip, 0xc0a84002);
        assert_eq!(header.dst_ip, 0xc0a84001);
    }
}
