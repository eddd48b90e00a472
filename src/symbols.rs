// Symbol tables - address to function-name resolution for host exec traces
//
// A table is loaded from an objdump-style dump: lines of the form
//
//   ffffffff81514b40 <entry_SYSCALL_64>:
//
// Only label lines are kept; everything else in the dump is skipped. The
// optional base offset is added to every parsed address, so tables for
// relocated images can be reused. Resolution is by exact entry address:
// host call events are emitted at function entry, so interior addresses
// intentionally miss.

use crate::intern::{Interner, Sym};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// How a table narrows the symbols it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolFilter {
    /// Every label in the dump resolves.
    All,
    /// Only the listed symbols resolve.
    Whitelist(HashSet<String>),
}

#[derive(Debug)]
pub struct SymsFilter {
    /// Component this table belongs to (e.g. "linux-client").
    component: Sym,
    entries: HashMap<u64, Sym>,
}

impl SymsFilter {
    /// Load a table from `path`, interning every admitted symbol.
    pub fn load(
        component: &str,
        path: impl AsRef<Path>,
        base_offset: u64,
        filter: &SymbolFilter,
        interner: &Interner,
    ) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut entries = HashMap::new();

        for line in content.lines() {
            let Some((addr, name)) = parse_label_line(line) else {
                continue;
            };
            if let SymbolFilter::Whitelist(allowed) = filter {
                if !allowed.contains(name) {
                    continue;
                }
            }
            entries.insert(addr.wrapping_add(base_offset), interner.intern(name));
        }

        tracing::debug!(
            component = component,
            symbols = entries.len(),
            "loaded symbol table"
        );
        Ok(Self {
            component: interner.intern(component),
            entries,
        })
    }

    pub fn component(&self) -> &Sym {
        &self.component
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Resolve an address to its function symbol, if it is a known entry.
    pub fn resolve(&self, address: u64) -> Option<&Sym> {
        self.entries.get(&address)
    }
}

/// Parse `"<hexaddr> <name>:"`, tolerating leading whitespace.
fn parse_label_line(line: &str) -> Option<(u64, &str)> {
    let line = line.trim_start();
    let (addr_part, rest) = line.split_once(' ')?;
    let addr = u64::from_str_radix(addr_part, 16).ok()?;
    let rest = rest.trim_start();
    let name = rest.strip_prefix('<')?.strip_suffix(">:")?;
    if name.is_empty() {
        return None;
    }
    Some((addr, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DUMP: &str = "\
vmlinux:     file format elf64-x86-64

ffffffff81000000 <startup_64>:
ffffffff81000000:\t48 8d 25 51 3f c0 01\tlea    0x1c03f51(%rip),%rsp
ffffffff81514b40 <entry_SYSCALL_64>:
ffffffff81600000 <i40e_lan_xmit_frame>:
";

    fn write_dump() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DUMP.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_label_line() {
        assert_eq!(
            parse_label_line("ffffffff81514b40 <entry_SYSCALL_64>:"),
            Some((0xffffffff81514b40, "entry_SYSCALL_64"))
        );
        assert_eq!(parse_label_line("not a label"), None);
        assert_eq!(parse_label_line("ffffffff81000000:\t48 8d"), None);
    }

    #[test]
    fn test_resolve_exact_entry_only() {
        let file = write_dump();
        let interner = Interner::new();
        let table =
            SymsFilter::load("linux", file.path(), 0, &SymbolFilter::All, &interner).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.resolve(0xffffffff81514b40).map(|s| s.as_str()),
            Some("entry_SYSCALL_64")
        );
        // interior address of startup_64 does not resolve
        assert_eq!(table.resolve(0xffffffff81000004), None);
    }

    #[test]
    fn test_base_offset_is_applied() {
        let file = write_dump();
        let interner = Interner::new();
        let table =
            SymsFilter::load("linux", file.path(), 0x1000, &SymbolFilter::All, &interner).unwrap();
        assert_eq!(
            table.resolve(0xffffffff81514b40 + 0x1000).map(|s| s.as_str()),
            Some("entry_SYSCALL_64")
        );
        assert_eq!(table.resolve(0xffffffff81514b40), None);
    }

    #[test]
    fn test_whitelist_filters_symbols() {
        let file = write_dump();
        let interner = Interner::new();
        let allowed: HashSet<String> = ["entry_SYSCALL_64".to_string()].into_iter().collect();
        let table = SymsFilter::load(
            "linux",
            file.path(),
            0,
            &SymbolFilter::Whitelist(allowed),
            &interner,
        )
        .unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.resolve(0xffffffff81600000).is_none());
    }
}
