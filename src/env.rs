// Trace environment - process-wide state shared by parsers and spanners
//
// Built once from the configuration before any pipeline starts, then only
// read (the id counters are atomic, the interner is internally
// synchronized). Holds the string interner, the classifier sets that turn
// host calls into trace anchors, the symbol tables for program-counter
// resolution, and the monotonic id counters.

use crate::config::{ClassifierConfig, SymbolFilterKind, SymbolTableConfig};
use crate::events::{Event, EventKind};
use crate::intern::{Interner, Sym};
use crate::symbols::{SymbolFilter, SymsFilter};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

// Built-in classifier sets for a Linux TCP stack over an i40e-style driver.
// A config file can replace any of them.
const LINUX_NET_FUNCS: &[&str] = &[
    "__sys_socket",
    "__x64_sys_socket",
    "sock_create",
    "__sys_bind",
    "__x64_sys_bind",
    "__sys_connect",
    "__x64_sys_connect",
    "tcp_release_cb",
    "tcp_init_sock",
    "tcp_init_xmit_timers",
    "tcp_v4_connect",
    "ip_route_output_key_hash",
    "tcp_connect",
    "tcp_fastopen_defer_connect",
    "ipv4_dst_check",
    "tcp_sync_mss",
    "tcp_initialize_rcv_mss",
    "tcp_write_queue_purge",
    "tcp_clear_retrans",
    "tcp_transmit_skb",
    "__tcp_transmit_skb",
    "tcp_v4_send_check",
    "__tcp_v4_send_check",
    "ip_queue_xmit",
    "__ip_queue_xmit",
    "ip_local_out",
    "__ip_local_out",
    "ip_output",
    "__ip_finish_output",
    "dev_queue_xmit",
    "__dev_queue_xmit",
    "skb_network_protocol",
    "eth_type_vlan",
    "netdev_start_xmit",
];

const DRIVER_FUNCS: &[&str] = &[
    "i40e_features_check",
    "i40e_lan_xmit_frame",
    "i40e_maybe_stop_tx",
    "vlan_get_protocol",
    "dma_map_single_attrs",
    "dma_map_page_attrs",
];

const DRIVER_TX_FUNCS: &[&str] = &["i40e_lan_xmit_frame"];
const DRIVER_RX_FUNCS: &[&str] = &["i40e_napi_poll"];
const INTERFACE_SEND_FUNCS: &[&str] = &["__sys_sendto"];
const INTERFACE_RECV_FUNCS: &[&str] = &["__sys_recvmsg"];
const SYS_ENTRY_FUNC: &str = "entry_SYSCALL_64";
const PCI_MSIX_DESC_ADDR_FUNC: &str = "pci_msix_desc_addr";

pub struct TraceEnv {
    interner: Interner,

    linux_net_funcs: HashSet<Sym>,
    driver_funcs: HashSet<Sym>,
    driver_tx_funcs: HashSet<Sym>,
    driver_rx_funcs: HashSet<Sym>,
    interface_send_funcs: HashSet<Sym>,
    interface_recv_funcs: HashSet<Sym>,
    sys_entry_func: Sym,
    pci_msix_desc_addr_func: Sym,

    symbol_tables: Vec<SymsFilter>,

    next_parser_id: AtomicU64,
    next_span_id: AtomicU64,
    next_spanner_id: AtomicU64,
    next_trace_id: AtomicU64,
}

impl TraceEnv {
    /// Build the environment: intern the classifier sets and load every
    /// configured symbol table.
    pub fn new(classifiers: &ClassifierConfig, tables: &[SymbolTableConfig]) -> Result<Self> {
        let interner = Interner::new();

        let set = |configured: &[String], builtin: &[&str]| -> HashSet<Sym> {
            if configured.is_empty() {
                builtin.iter().map(|s| interner.intern(s)).collect()
            } else {
                configured.iter().map(|s| interner.intern(s)).collect()
            }
        };

        let linux_net_funcs = set(&classifiers.linux_net_funcs, LINUX_NET_FUNCS);
        let driver_funcs = set(&classifiers.driver_funcs, DRIVER_FUNCS);
        let driver_tx_funcs = set(&classifiers.driver_tx_funcs, DRIVER_TX_FUNCS);
        let driver_rx_funcs = set(&classifiers.driver_rx_funcs, DRIVER_RX_FUNCS);
        let interface_send_funcs = set(&classifiers.interface_send_funcs, INTERFACE_SEND_FUNCS);
        let interface_recv_funcs = set(&classifiers.interface_recv_funcs, INTERFACE_RECV_FUNCS);
        let sys_entry_func =
            interner.intern(classifiers.sys_entry_func.as_deref().unwrap_or(SYS_ENTRY_FUNC));
        let pci_msix_desc_addr_func = interner.intern(
            classifiers
                .pci_msix_desc_addr_func
                .as_deref()
                .unwrap_or(PCI_MSIX_DESC_ADDR_FUNC),
        );

        let mut symbol_tables = Vec::with_capacity(tables.len());
        for table in tables {
            let filter = match table.filter {
                SymbolFilterKind::All => SymbolFilter::All,
                SymbolFilterKind::Whitelist => {
                    SymbolFilter::Whitelist(table.symbols.iter().cloned().collect())
                }
            };
            let loaded = SymsFilter::load(
                &table.identifier,
                &table.path,
                table.base_offset,
                &filter,
                &interner,
            )
            .with_context(|| {
                format!(
                    "failed to load symbol table '{}' from {}",
                    table.identifier,
                    table.path.display()
                )
            })?;
            symbol_tables.push(loaded);
        }

        Ok(Self {
            interner,
            linux_net_funcs,
            driver_funcs,
            driver_tx_funcs,
            driver_rx_funcs,
            interface_send_funcs,
            interface_recv_funcs,
            sys_entry_func,
            pci_msix_desc_addr_func,
            symbol_tables,
            next_parser_id: AtomicU64::new(0),
            next_span_id: AtomicU64::new(0),
            next_spanner_id: AtomicU64::new(0),
            next_trace_id: AtomicU64::new(0),
        })
    }

    /// Environment with built-in classifiers and no symbol tables.
    pub fn with_defaults() -> Self {
        Self::new(&ClassifierConfig::default(), &[]).expect("default environment must build")
    }

    pub fn intern(&self, s: &str) -> Sym {
        self.interner.intern(s)
    }

    // ───────────────────────── id counters ─────────────────────────

    pub fn next_parser_id(&self) -> u64 {
        self.next_parser_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_span_id(&self) -> u64 {
        self.next_span_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_spanner_id(&self) -> u64 {
        self.next_spanner_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_trace_id(&self) -> u64 {
        self.next_trace_id.fetch_add(1, Ordering::Relaxed)
    }

    // ───────────────────────── symbol resolution ─────────────────────────

    /// Resolve a program counter through the tables in configuration order.
    /// Returns the function symbol and the owning component.
    pub fn resolve_symbol(&self, address: u64) -> Option<(Sym, Sym)> {
        for table in &self.symbol_tables {
            if let Some(func) = table.resolve(address) {
                return Some((func.clone(), table.component().clone()));
            }
        }
        None
    }

    pub fn has_symbol_tables(&self) -> bool {
        !self.symbol_tables.is_empty()
    }

    // ───────────────────────── classifiers ─────────────────────────

    pub fn is_sys_entry(&self, event: &Event) -> bool {
        event.call_func() == Some(&self.sys_entry_func)
    }

    pub fn is_pci_msix_desc_addr(&self, event: &Event) -> bool {
        event.call_func() == Some(&self.pci_msix_desc_addr_func)
    }

    pub fn is_driver_tx(&self, event: &Event) -> bool {
        event
            .call_func()
            .is_some_and(|func| self.driver_tx_funcs.contains(func))
    }

    pub fn is_driver_rx(&self, event: &Event) -> bool {
        event
            .call_func()
            .is_some_and(|func| self.driver_rx_funcs.contains(func))
    }

    pub fn is_linux_net_func(&self, event: &Event) -> bool {
        event
            .call_func()
            .is_some_and(|func| self.linux_net_funcs.contains(func))
    }

    #[allow(dead_code)]
    pub fn is_driver_func(&self, event: &Event) -> bool {
        event
            .call_func()
            .is_some_and(|func| self.driver_funcs.contains(func))
    }

    pub fn is_interface_send(&self, event: &Event) -> bool {
        event
            .call_func()
            .is_some_and(|func| self.interface_send_funcs.contains(func))
    }

    pub fn is_interface_recv(&self, event: &Event) -> bool {
        event
            .call_func()
            .is_some_and(|func| self.interface_recv_funcs.contains(func))
    }

    // ───────────────────────── event-kind families ─────────────────────────

    pub fn is_mmio_related(event: &Event) -> bool {
        matches!(
            event.kind,
            EventKind::HostMmioR { .. }
                | EventKind::HostMmioW { .. }
                | EventKind::HostMmioImRespPoW
                | EventKind::HostMmioCR { .. }
                | EventKind::HostMmioCW { .. }
                | EventKind::NicMmioR { .. }
                | EventKind::NicMmioW { .. }
        )
    }

    pub fn is_dma_related(event: &Event) -> bool {
        matches!(
            event.kind,
            EventKind::NicDmaI { .. }
                | EventKind::NicDmaEx { .. }
                | EventKind::HostDmaR { .. }
                | EventKind::HostDmaW { .. }
                | EventKind::HostDmaC { .. }
                | EventKind::NicDmaCR { .. }
                | EventKind::NicDmaCW { .. }
        )
    }
}
