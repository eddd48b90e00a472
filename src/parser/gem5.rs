// Host CPU simulator (gem5-style) log parser
//
// Lines have the shape `tick: component: message` with decimal picosecond
// ticks. The component filter admits only the configured subsystems; the
// component then selects the message grammar:
//
//   1869691991749: system.switch_cpus: A0 T0 : 0xffffffff81514b40 @entry_SYSCALL_64 : ...
//   1869691991749: system.pc.simbricks_0: sending read addr c0080300 size 4 id 94469181196688 bar 0 offs 80300
//   1869693118999: system.pc.pci_host: readConfig: dev 0 func 0 reg 0x3d 1 bytes: data = 0x1
//
// Exec-trace program counters are resolved through the environment's symbol
// tables; a hit yields HostCall, a miss HostInstr.

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

/// Admits gem5 components by prefix. An empty filter admits everything.
#[derive(Debug, Clone, Default)]
pub struct ComponentFilter {
    prefixes: Vec<String>,
}

impl ComponentFilter {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    pub fn admits(&self, component: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| component.starts_with(p.as_str()))
    }
}

enum Parsed {
    Event(Event),
    /// Recognized line that intentionally carries no event.
    Skipped,
    Malformed,
}

pub struct Gem5Parser {
    name: Sym,
    ident: u64,
    log_path: PathBuf,
    filter: ComponentFilter,
    env: Arc<TraceEnv>,
    malformed: u64,
}

impl Gem5Parser {
    pub fn new(
        env: Arc<TraceEnv>,
        name: &str,
        log_path: impl Into<PathBuf>,
        filter: ComponentFilter,
    ) -> Self {
        Self {
            name: env.intern(name),
            ident: env.next_parser_id(),
            log_path: log_path.into(),
            filter,
            env,
            malformed: 0,
        }
    }

    pub fn ident(&self) -> u64 {
        self.ident
    }

    fn event(&self, timestamp: u64, kind: EventKind) -> Event {
        Event::new(timestamp, self.ident, self.name.clone(), kind)
    }

    fn parse_line(&self, lh: &mut LineHandler) -> Parsed {
        lh.trim_l();
        let Some(timestamp) = lh.parse_uint(10) else {
            return Parsed::Malformed;
        };
        if !lh.consume_char(':') {
            return Parsed::Malformed;
        }
        lh.trim_l();
        let component = lh.extract_until(|c| c != ':').to_string();
        if !lh.consume_char(':') {
            return Parsed::Malformed;
        }
        if !self.filter.admits(&component) {
            return Parsed::Skipped;
        }
        lh.trim_l();

        if component == "global" {
            self.parse_global(lh, timestamp)
        } else if component.contains("switch_cpus") {
            self.parse_exec_trace(lh, timestamp)
        } else if component.contains("pci_host.interface") {
            self.parse_interface(lh, timestamp)
        } else if component.contains("pci_host") {
            self.parse_pci_host(lh, timestamp)
        } else if component.contains("simbricks") {
            self.parse_adapter(lh, timestamp)
        } else {
            Parsed::Skipped
        }
    }

    fn parse_global(&self, lh: &mut LineHandler, timestamp: u64) -> Parsed {
        if !lh.consume_till_str("simbricks:") {
            return Parsed::Skipped;
        }
        lh.trim_l();
        if lh.consume_str("processInEvent") {
            Parsed::Event(self.event(timestamp, EventKind::SimProcInEvent))
        } else if lh.consume_str("sending sync message") {
            Parsed::Event(self.event(timestamp, EventKind::SimSendSync))
        } else {
            Parsed::Skipped
        }
    }

    fn parse_exec_trace(&self, lh: &mut LineHandler, timestamp: u64) -> Parsed {
        if !lh.consume_till_str("0x") {
            return Parsed::Malformed;
        }
        let Some(pc) = lh.parse_uint(16) else {
            return Parsed::Malformed;
        };
        let kind = match self.env.resolve_symbol(pc) {
            Some((func, comp)) => EventKind::HostCall { pc, func, comp },
            None => EventKind::HostInstr { pc },
        };
        Parsed::Event(self.event(timestamp, kind))
    }

    fn parse_interface(&self, lh: &mut LineHandler, timestamp: u64) -> Parsed {
        if lh.consume_str("postInt") {
            Parsed::Event(self.event(timestamp, EventKind::HostPostInt))
        } else if lh.consume_str("clearInt") {
            Parsed::Event(self.event(timestamp, EventKind::HostClearInt))
        } else {
            Parsed::Skipped
        }
    }

    /// `readConfig: dev 0 func 0 reg 0x3d 1 bytes: data = 0x1`
    fn parse_pci_host(&self, lh: &mut LineHandler, timestamp: u64) -> Parsed {
        let is_read = if lh.consume_str("readConfig:") {
            true
        } else if lh.consume_str("writeConfig:") {
            false
        } else {
            return Parsed::Skipped;
        };

        let fields = (|| {
            if !lh.consume_till_str("dev ") {
                return None;
            }
            let dev = lh.parse_uint(10)?;
            if !lh.consume_till_str("func ") {
                return None;
            }
            let func = lh.parse_uint(10)?;
            if !lh.consume_till_str("reg 0x") {
                return None;
            }
            let reg = lh.parse_uint(16)?;
            lh.trim_l();
            let bytes = lh.parse_uint(10)?;
            if !lh.consume_till_str("data = 0x") {
                return None;
            }
            let data = lh.parse_uint(16)?;
            Some((dev, func, reg, bytes, data))
        })();

        match fields {
            Some((dev, func, reg, bytes, data)) => Parsed::Event(self.event(
                timestamp,
                EventKind::HostConf {
                    dev,
                    func,
                    reg,
                    bytes,
                    data,
                    is_read,
                },
            )),
            None => Parsed::Malformed,
        }
    }

    fn parse_adapter(&self, lh: &mut LineHandler, timestamp: u64) -> Parsed {
        if lh.consume_str("sending read addr ") {
            return self.parse_mmio_issue(lh, timestamp, true);
        }
        if lh.consume_str("sending write addr ") {
            return self.parse_mmio_issue(lh, timestamp, false);
        }
        if lh.consume_str("sending immediate response for posted write") {
            return Parsed::Event(self.event(timestamp, EventKind::HostMmioImRespPoW));
        }
        if lh.consume_str("completed dma id ") {
            return match lh.parse_uint(10) {
                Some(id) => Parsed::Event(self.event(timestamp, EventKind::HostDmaC { id })),
                None => Parsed::Malformed,
            };
        }
        if lh.consume_str("completed read id ") {
            return match lh.parse_uint(10) {
                Some(id) => Parsed::Event(self.event(timestamp, EventKind::HostMmioCR { id })),
                None => Parsed::Malformed,
            };
        }
        if lh.consume_str("completed write id ") {
            return match lh.parse_uint(10) {
                Some(id) => Parsed::Event(self.event(timestamp, EventKind::HostMmioCW { id })),
                None => Parsed::Malformed,
            };
        }
        if lh.consume_str("issuing dma read addr ") {
            return self.parse_dma_issue(lh, timestamp, true);
        }
        if lh.consume_str("issuing dma write addr ") {
            return self.parse_dma_issue(lh, timestamp, false);
        }
        if lh.consume_str("issuing msi-x interrupt vec ") {
            return match lh.parse_uint(10) {
                Some(vec) => Parsed::Event(self.event(timestamp, EventKind::HostMsiX { vec })),
                None => Parsed::Malformed,
            };
        }
        if lh.consume_str("pci read offset 0x") {
            return self.parse_pci_rw(lh, timestamp, true);
        }
        if lh.consume_str("pci write offset 0x") {
            return self.parse_pci_rw(lh, timestamp, false);
        }
        Parsed::Skipped
    }

    /// `<addr> size <s> id <i> bar <b> offs <o> [posted <0|1>]`
    fn parse_mmio_issue(&self, lh: &mut LineHandler, timestamp: u64, is_read: bool) -> Parsed {
        let fields = (|| {
            let addr = lh.parse_uint(16)?;
            if !lh.consume_till_str("size ") {
                return None;
            }
            let size = lh.parse_uint(10)?;
            if !lh.consume_till_str("id ") {
                return None;
            }
            let id = lh.parse_uint(10)?;
            if !lh.consume_till_str("bar ") {
                return None;
            }
            let bar = lh.parse_uint(10)?;
            if !lh.consume_till_str("offs ") {
                return None;
            }
            let offset = lh.parse_uint(16)?;
            Some((addr, size, id, bar, offset))
        })();
        let Some((addr, size, id, bar, offset)) = fields else {
            return Parsed::Malformed;
        };

        let kind = if is_read {
            EventKind::HostMmioR {
                id,
                addr,
                size,
                bar: bar as u32,
                offset,
            }
        } else {
            let posted = match lh.consume_till_str("posted ") {
                true => lh.parse_uint(10) == Some(1),
                false => false,
            };
            EventKind::HostMmioW {
                id,
                addr,
                size,
                bar: bar as u32,
                offset,
                posted,
            }
        };
        Parsed::Event(self.event(timestamp, kind))
    }

    /// `<addr> size <s> id <i>`
    fn parse_dma_issue(&self, lh: &mut LineHandler, timestamp: u64, is_read: bool) -> Parsed {
        let fields = (|| {
            let addr = lh.parse_uint(16)?;
            if !lh.consume_till_str("size ") {
                return None;
            }
            let size = lh.parse_uint(10)?;
            if !lh.consume_till_str("id ") {
                return None;
            }
            let id = lh.parse_uint(10)?;
            Some((addr, size, id))
        })();
        match fields {
            Some((addr, size, id)) => {
                let kind = if is_read {
                    EventKind::HostDmaR { id, addr, size }
                } else {
                    EventKind::HostDmaW { id, addr, size }
                };
                Parsed::Event(self.event(timestamp, kind))
            }
            None => Parsed::Malformed,
        }
    }

    /// `<offset> size <s>`
    fn parse_pci_rw(&self, lh: &mut LineHandler, timestamp: u64, is_read: bool) -> Parsed {
        let fields = (|| {
            let offset = lh.parse_uint(16)?;
            if !lh.consume_till_str("size ") {
                return None;
            }
            let size = lh.parse_uint(10)?;
            Some((offset, size))
        })();
        match fields {
            Some((offset, size)) => Parsed::Event(self.event(
                timestamp,
                EventKind::HostPciRW {
                    offset,
                    size,
                    is_read,
                },
            )),
            None => Parsed::Malformed,
        }
    }
}

#[async_trait]
impl Producer<Event> for Gem5Parser {
    async fn produce(&mut self, out: Arc<Channel<Event>>) -> Result<(), PipelineError> {
        let mut reader = LineReader::open(&self.log_path).await?;

        while let Some(mut lh) = reader.next_line().await? {
            match self.parse_line(&mut lh) {
                Parsed::Event(event) => match out.send(event).await {
                    Ok(()) => {}
                    Err(PipelineError::ChannelClosed) => return Ok(()),
                    Err(err) => return Err(err),
                },
                Parsed::Skipped => {}
                Parsed::Malformed => {
                    self.malformed += 1;
                    tracing::debug!(
                        parser = %self.name,
                        line = reader.line_number(),
                        "skipping unparsable gem5 line: {}",
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
    use std::io::Write;

    fn env_with_syms() -> Arc<TraceEnv> {
        let mut syms = tempfile::NamedTempFile::new().unwrap();
        syms.write_all(b"ffffffff81514b40 <entry_SYSCALL_64>:\nffffffff81600000 <i40e_lan_xmit_frame>:\n")
            .unwrap();
        let (_, path) = syms.keep().unwrap();
        let tables = vec![crate::config::SymbolTableConfig {
            identifier: "linux".to_string(),
            path,
            base_offset: 0,
            filter: crate::config::SymbolFilterKind::All,
            symbols: vec![],
        }];
        Arc::new(TraceEnv::new(&Default::default(), &tables).unwrap())
    }

    fn parse(env: &Arc<TraceEnv>, line: &str) -> Option<Event> {
        let parser = Gem5Parser::new(
            Arc::clone(env),
            "gem5-test",
            "/dev/null",
            ComponentFilter::default(),
        );
        let mut lh = LineHandler::new(line.to_string());
        match parser.parse_line(&mut lh) {
            Parsed::Event(ev) => Some(ev),
            _ => None,
        }
    }

    #[test]
    fn test_parse_mmio_read_issue() {
        let env = env_with_syms();
        let ev = parse(
            &env,
            "1869691991749: system.pc.simbricks_0: sending read addr c0080300 size 4 \
             id 94469181196688 bar 0 offs 80300",
        )
        .unwrap();
        assert_eq!(ev.timestamp, 1869691991749);
        assert_eq!(
            ev.kind,
            EventKind::HostMmioR {
                id: 94469181196688,
                addr: 0xc0080300,
                size: 4,
                bar: 0,
                offset: 0x80300
            }
        );
    }

    #[test]
    fn test_parse_posted_mmio_write_and_completion() {
        let env = env_with_syms();
        let w = parse(
            &env,
            "10: system.pc.simbricks_0: sending write addr c040000c size 4 id 1 bar 3 offs c posted 1",
        )
        .unwrap();
        assert_eq!(
            w.kind,
            EventKind::HostMmioW {
                id: 1,
                addr: 0xc040000c,
                size: 4,
                bar: 3,
                offset: 0xc,
                posted: true
            }
        );
        let resp = parse(
            &env,
            "10: system.pc.simbricks_0: sending immediate response for posted write",
        )
        .unwrap();
        assert_eq!(resp.kind, EventKind::HostMmioImRespPoW);
        let cw = parse(&env, "12: system.pc.simbricks_0: completed write id 1").unwrap();
        assert_eq!(cw.kind, EventKind::HostMmioCW { id: 1 });
    }

    #[test]
    fn test_exec_trace_resolves_to_host_call() {
        let env = env_with_syms();
        let ev = parse(
            &env,
            "1869691991749: system.switch_cpus: A0 T0 : 0xffffffff81514b40 \
             @entry_SYSCALL_64 : MOV_R_R",
        )
        .unwrap();
        match ev.kind {
            EventKind::HostCall { pc, func, comp } => {
                assert_eq!(pc, 0xffffffff81514b40);
                assert_eq!(func.as_str(), "entry_SYSCALL_64");
                assert_eq!(comp.as_str(), "linux");
            }
            other => panic!("expected HostCall, got {:?}", other),
        }
    }

    #[test]
    fn test_unresolved_pc_yields_host_instr() {
        let env = env_with_syms();
        let ev = parse(
            &env,
            "1869691991749: system.switch_cpus: A0 T0 : 0xffffffff81514b44 : MOV_R_R",
        )
        .unwrap();
        assert_eq!(
            ev.kind,
            EventKind::HostInstr {
                pc: 0xffffffff81514b44
            }
        );
    }

    #[test]
    fn test_parse_conf_and_interrupt_lines() {
        let env = env_with_syms();
        let conf = parse(
            &env,
            "5: system.pc.pci_host: readConfig: dev 0 func 0 reg 0x3d 1 bytes: data = 0x1",
        )
        .unwrap();
        assert_eq!(
            conf.kind,
            EventKind::HostConf {
                dev: 0,
                func: 0,
                reg: 0x3d,
                bytes: 1,
                data: 1,
                is_read: true
            }
        );
        let post = parse(&env, "6: system.pc.pci_host.interface: postInt").unwrap();
        assert_eq!(post.kind, EventKind::HostPostInt);
        let clear = parse(&env, "7: system.pc.pci_host.interface: clearInt").unwrap();
        assert_eq!(clear.kind, EventKind::HostClearInt);
    }

    #[test]
    fn test_parse_dma_and_msix_lines() {
        let env = env_with_syms();
        let dma = parse(
            &env,
            "8: system.pc.simbricks_0: issuing dma read addr d99b0000 size 56 id 3",
        )
        .unwrap();
        assert_eq!(
            dma.kind,
            EventKind::HostDmaR {
                id: 3,
                addr: 0xd99b0000,
                size: 56
            }
        );
        let dmac = parse(&env, "9: system.pc.simbricks_0: completed dma id 3").unwrap();
        assert_eq!(dmac.kind, EventKind::HostDmaC { id: 3 });
        let msix = parse(&env, "9: system.pc.simbricks_0: issuing msi-x interrupt vec 2").unwrap();
        assert_eq!(msix.kind, EventKind::HostMsiX { vec: 2 });
    }

    #[test]
    fn test_parse_global_sync_events() {
        let env = env_with_syms();
        let sync = parse(&env, "4: global: simbricks: sending sync message").unwrap();
        assert_eq!(sync.kind, EventKind::SimSendSync);
        let proc_in = parse(&env, "4: global: simbricks: processInEvent").unwrap();
        assert_eq!(proc_in.kind, EventKind::SimProcInEvent);
    }

    #[test]
    fn test_component_filter_skips_unlisted_components() {
        let env = env_with_syms();
        let parser = Gem5Parser::new(
            Arc::clone(&env),
            "gem5-test",
            "/dev/null",
            ComponentFilter::new(vec!["system.pc".to_string()]),
        );
        let mut lh = LineHandler::new(
            "1: system.switch_cpus: A0 T0 : 0xffffffff81514b40 @x :".to_string(),
        );
        assert!(matches!(parser.parse_line(&mut lh), Parsed::Skipped));

        let mut lh = LineHandler::new(
            "1: system.pc.simbricks_0: completed read id 7".to_string(),
        );
        assert!(matches!(parser.parse_line(&mut lh), Parsed::Event(_)));
    }
}
