// NIC behavioral model log parser
//
// The log starts with two sidecar metadata lines:
//
//   mac_addr=94de80a125c8
//   sync_pci=1 sync_eth=1
//
// followed by main_time-prefixed records:
//
//   main_time = 1869696460000: nicbm: read(off=0x80300, len=4, val=0x0)
//   main_time = 1869699346000: nicbm: issuing dma op 0x55b0e0a51590 addr 0xd99b0000 len 56 pending 1
//   main_time = 1869970810000: nicbm: eth tx: len 42

use crate::channel::Channel;
use crate::env::TraceEnv;
use crate::errors::PipelineError;
use crate::events::{Event, EventKind};
use crate::intern::Sym;
use crate::pipeline::Producer;
use crate::reader::{LineHandler, LineReader};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

pub struct NicbmParser {
    name: Sym,
    ident: u64,
    log_path: PathBuf,
    mac_addr: Option<u64>,
    sync_pci: bool,
    sync_eth: bool,
    malformed: u64,
    last_timestamp: u64,
}

impl NicbmParser {
    pub fn new(env: &TraceEnv, name: &str, log_path: impl Into<PathBuf>) -> Self {
        Self {
            name: env.intern(name),
            ident: env.next_parser_id(),
            log_path: log_path.into(),
            mac_addr: None,
            sync_pci: false,
            sync_eth: false,
            malformed: 0,
            last_timestamp: 0,
        }
    }

    pub fn ident(&self) -> u64 {
        self.ident
    }

    fn event(&self, timestamp: u64, kind: EventKind) -> Event {
        Event::new(timestamp, self.ident, self.name.clone(), kind)
    }

    fn parse_mac_addr(&mut self, lh: &mut LineHandler) -> bool {
        if !lh.consume_till_str("mac_addr") || !lh.consume_char('=') {
            return false;
        }
        match lh.parse_uint(16) {
            Some(addr) => {
                self.mac_addr = Some(addr);
                true
            }
            None => false,
        }
    }

    fn parse_sync_info(&mut self, lh: &mut LineHandler) -> bool {
        let flag = |lh: &mut LineHandler, key: &str| -> Option<bool> {
            if !lh.consume_till_str(key) || !lh.consume_char('=') {
                return None;
            }
            match lh.parse_uint(10) {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            }
        };
        let Some(pci) = flag(lh, "sync_pci") else {
            return false;
        };
        let Some(eth) = flag(lh, "sync_eth") else {
            return false;
        };
        self.sync_pci = pci;
        self.sync_eth = eth;
        true
    }

    /// `off=0x<hex>, len=<dec>, val=0x<hex>`
    fn parse_off_len_val(lh: &mut LineHandler) -> Option<(u64, u64, u64)> {
        if !lh.consume_till_str("off=0x") {
            return None;
        }
        let off = lh.parse_uint(16)?;
        if !lh.consume_till_str("len=") {
            return None;
        }
        let len = lh.parse_uint(10)?;
        if !lh.consume_till_str("val=0x") {
            return None;
        }
        let val = lh.parse_uint(16)?;
        Some((off, len, val))
    }

    /// `op 0x<hex> addr 0x<hex> len <dec> [pending <dec>]`
    fn parse_op_addr_len(lh: &mut LineHandler, with_pending: bool) -> Option<(u64, u64, u64)> {
        if !lh.consume_till_str("op 0x") {
            return None;
        }
        let op = lh.parse_uint(16)?;
        if !lh.consume_till_str("addr 0x") {
            return None;
        }
        let addr = lh.parse_uint(16)?;
        if !lh.consume_till_str("len ") {
            return None;
        }
        let len = lh.parse_uint(10)?;
        if with_pending {
            if !lh.consume_till_str("pending ") {
                return None;
            }
            lh.parse_uint(10)?;
        }
        Some((op, addr, len))
    }

    fn parse_record(&mut self, lh: &mut LineHandler, timestamp: u64) -> Option<Event> {
        if lh.consume_till_str("read(") {
            let (off, len, val) = Self::parse_off_len_val(lh)?;
            return Some(self.event(timestamp, EventKind::NicMmioR { off, len, val }));
        }
        if lh.consume_till_str("write(") {
            let (off, len, val) = Self::parse_off_len_val(lh)?;
            let posted = lh.consume_till_str("posted");
            return Some(self.event(
                timestamp,
                EventKind::NicMmioW {
                    off,
                    len,
                    val,
                    posted,
                },
            ));
        }
        if lh.consume_till_str("issuing dma") {
            let (id, addr, len) = Self::parse_op_addr_len(lh, true)?;
            return Some(self.event(timestamp, EventKind::NicDmaI { id, addr, len }));
        }
        if lh.consume_till_str("executing dma") {
            let (id, addr, len) = Self::parse_op_addr_len(lh, true)?;
            return Some(self.event(timestamp, EventKind::NicDmaEx { id, addr, len }));
        }
        if lh.consume_till_str("enqueuing dma") {
            let (id, addr, len) = Self::parse_op_addr_len(lh, true)?;
            return Some(self.event(timestamp, EventKind::NicDmaEn { id, addr, len }));
        }
        if lh.consume_till_str("completed dma") {
            if lh.consume_till_str("read") {
                let (id, addr, len) = Self::parse_op_addr_len(lh, false)?;
                return Some(self.event(timestamp, EventKind::NicDmaCR { id, addr, len }));
            }
            if lh.consume_till_str("write") {
                let (id, addr, len) = Self::parse_op_addr_len(lh, false)?;
                return Some(self.event(timestamp, EventKind::NicDmaCW { id, addr, len }));
            }
            return None;
        }
        if lh.consume_till_str("issue MSI") {
            let is_msix_x = if lh.consume_str("-X interrupt vec ") {
                true
            } else if lh.consume_till_str("interrupt vec ") {
                false
            } else {
                return None;
            };
            let vec = lh.parse_uint(10)?;
            return Some(self.event(timestamp, EventKind::NicMsix { vec, is_msix_x }));
        }
        if lh.consume_till_str("eth") {
            if lh.consume_till_str("tx: len ") {
                let len = lh.parse_uint(10)?;
                return Some(self.event(timestamp, EventKind::NicTx { len }));
            }
            if lh.consume_till_str("rx: port ") {
                let port = lh.parse_int()?;
                if !lh.consume_till_str("len ") {
                    return None;
                }
                let len = lh.parse_uint(10)?;
                return Some(self.event(
                    timestamp,
                    EventKind::NicRx {
                        port: port as u32,
                        len,
                    },
                ));
            }
            return None;
        }
        if lh.consume_till_str("set intx interrupt") {
            lh.trim_l();
            lh.consume_str("0x");
            let intr = lh.parse_uint(16)?;
            return Some(self.event(timestamp, EventKind::SetIX { intr }));
        }
        None
    }

    /// Lines that are recognized but intentionally carry no event.
    fn is_ignored(lh: &LineHandler) -> bool {
        let raw = lh.raw_line();
        raw.contains("exit main_time")
            || raw.contains("poll_h2d: peer terminated")
            || raw.contains("dma write data")
    }

    fn note_malformed(&mut self, lh: &LineHandler, line_number: u64) {
        self.malformed += 1;
        tracing::debug!(
            parser = %self.name,
            line = line_number,
            "skipping unparsable nicbm line: {}",
            lh.raw_line()
        );
    }
}

#[async_trait]
impl Producer<Event> for NicbmParser {
    async fn produce(&mut self, out: Arc<Channel<Event>>) -> Result<(), PipelineError> {
        let mut reader = LineReader::open(&self.log_path).await?;

        // sidecar metadata: mac address, then sync flags
        let mac_ok = match reader.next_line().await? {
            Some(mut lh) => self.parse_mac_addr(&mut lh),
            None => false,
        };
        if !mac_ok {
            tracing::warn!(parser = %self.name, "nicbm log missing mac_addr sidecar line");
            return Ok(());
        }
        let sync_ok = match reader.next_line().await? {
            Some(mut lh) => self.parse_sync_info(&mut lh),
            None => false,
        };
        if !sync_ok {
            tracing::warn!(parser = %self.name, "nicbm log missing sync sidecar line");
            return Ok(());
        }
        tracing::debug!(
            parser = %self.name,
            mac = %format_args!("{:x}", self.mac_addr.unwrap_or(0)),
            sync_pci = self.sync_pci,
            sync_eth = self.sync_eth,
            "parsed nicbm sidecar metadata"
        );

        while let Some(mut lh) = reader.next_line().await? {
            if Self::is_ignored(&lh) {
                continue;
            }
            if !lh.consume_till_str("main_time") {
                self.note_malformed(&lh, reader.line_number());
                continue;
            }
            if !lh.consume_str(" = ") {
                self.note_malformed(&lh, reader.line_number());
                continue;
            }
            let Some(timestamp) = lh.parse_uint(10) else {
                self.note_malformed(&lh, reader.line_number());
                continue;
            };
            if !lh.consume_till_str("nicbm") {
                self.note_malformed(&lh, reader.line_number());
                continue;
            }

            match self.parse_record(&mut lh, timestamp) {
                Some(event) => {
                    if event.timestamp < self.last_timestamp {
                        tracing::warn!(
                            parser = %self.name,
                            "timestamp regression: {} after {}",
                            event.timestamp,
                            self.last_timestamp
                        );
                    }
                    self.last_timestamp = event.timestamp;
                    match out.send(event).await {
                        Ok(()) => {}
                        Err(PipelineError::ChannelClosed) => return Ok(()),
                        Err(err) => return Err(err),
                    }
                }
                None => self.note_malformed(&lh, reader.line_number()),
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
    use std::io::Write;

    const LOG: &str = "\
mac_addr=94de80a125c8
sync_pci=1 sync_eth=1
main_time = 1869696460000: nicbm: read(off=0x80300, len=4, val=0x0)
main_time = 1869699346000: nicbm: write(off=0xc, len=4, val=0x1, posted)
main_time = 1869699347000: nicbm: issuing dma op 0x3 addr 0xdead len 8 pending 1
main_time = 1869699348000: nicbm: executing dma op 0x3 addr 0xdead len 8 pending 1
main_time = 1869699349000: nicbm: completed dma read op 0x3 addr 0xdead len 8
main_time = 1869699350000: nicbm: issue MSI-X interrupt vec 2
main_time = 1869699351000: nicbm: eth tx: len 42
main_time = 1869699352000: nicbm: eth rx: port 0 len 98
main_time = 1869699353000: nicbm: set intx interrupt 0x55b0e1c1e0a8
exit main_time = 1869699354000
some garbage the parser has never seen
";

    async fn parse_all(log: &str) -> Vec<Event> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(log.as_bytes()).unwrap();

        let env = TraceEnv::with_defaults();
        let mut parser = NicbmParser::new(&env, "nicbm-test", file.path());
        let out = Arc::new(Channel::unbounded());
        parser.produce(Arc::clone(&out)).await.unwrap();
        out.close();

        let mut events = Vec::new();
        while let Some(ev) = out.try_pop() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn test_parses_expected_event_stream() {
        let events = parse_all(LOG).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.name()).collect();
        assert_eq!(
            kinds,
            vec![
                "NicMmioR", "NicMmioW", "NicDmaI", "NicDmaEx", "NicDmaCR", "NicMsix", "NicTx",
                "NicRx", "SetIX"
            ]
        );

        assert_eq!(
            events[0].kind,
            EventKind::NicMmioR {
                off: 0x80300,
                len: 4,
                val: 0
            }
        );
        assert_eq!(events[0].timestamp, 1869696460000);
        assert_eq!(
            events[1].kind,
            EventKind::NicMmioW {
                off: 0xc,
                len: 4,
                val: 1,
                posted: true
            }
        );
        assert_eq!(
            events[4].kind,
            EventKind::NicDmaCR {
                id: 3,
                addr: 0xdead,
                len: 8
            }
        );
        assert_eq!(
            events[5].kind,
            EventKind::NicMsix {
                vec: 2,
                is_msix_x: true
            }
        );
        assert_eq!(events[7].kind, EventKind::NicRx { port: 0, len: 98 });
        assert_eq!(
            events[8].kind,
            EventKind::SetIX {
                intr: 0x55b0e1c1e0a8
            }
        );
    }

    #[tokio::test]
    async fn test_all_events_carry_parser_identity() {
        let events = parse_all(LOG).await;
        assert!(!events.is_empty());
        let source_id = events[0].source_id;
        assert!(events
            .iter()
            .all(|e| e.source_id == source_id && e.source_name.as_str() == "nicbm-test"));
    }

    #[tokio::test]
    async fn test_missing_sidecar_yields_empty_stream() {
        let events = parse_all("main_time = 1: nicbm: eth tx: len 5\n").await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_timestamps_monotonic_per_source() {
        let events = parse_all(LOG).await;
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}
