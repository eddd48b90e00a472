//! Configuration for a trace reconstruction run
//!
//! A single YAML file describes everything a run needs: the symbol tables
//! for resolving host program counters, the classifier function sets, the
//! pipelines (which log file feeds which parser and spanner, with which
//! stream filters), and the trace sink.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Symbol tables queried in order when resolving host addresses.
    #[serde(default)]
    pub symbol_tables: Vec<SymbolTableConfig>,

    /// Classifier overrides; defaults cover a Linux TCP stack over an
    /// i40e-style NIC driver.
    #[serde(default)]
    pub classifiers: ClassifierConfig,

    /// One entry per log file / parser / spanner.
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,

    /// Where completed traces go.
    #[serde(default)]
    pub sink: SinkConfig,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for pipeline in &self.pipelines {
            if !names.insert(pipeline.name.as_str()) {
                anyhow::bail!("duplicate pipeline name '{}'", pipeline.name);
            }
            if pipeline.parser == ParserKind::Gem5 && pipeline.spanner != SpannerKind::Host {
                anyhow::bail!(
                    "pipeline '{}': gem5 logs must feed a host spanner",
                    pipeline.name
                );
            }
        }
        Ok(())
    }
}

/// One symbol table: identifier, dump path, relocation offset, filtering.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SymbolTableConfig {
    pub identifier: String,
    pub path: PathBuf,
    #[serde(default)]
    pub base_offset: u64,
    #[serde(default)]
    pub filter: SymbolFilterKind,
    /// Only used with `filter: whitelist`.
    #[serde(default)]
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolFilterKind {
    #[default]
    All,
    Whitelist,
}

/// Function-name classifier sets. Empty lists fall back to built-ins.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub linux_net_funcs: Vec<String>,
    #[serde(default)]
    pub driver_funcs: Vec<String>,
    #[serde(default)]
    pub driver_tx_funcs: Vec<String>,
    #[serde(default)]
    pub driver_rx_funcs: Vec<String>,
    #[serde(default)]
    pub interface_send_funcs: Vec<String>,
    #[serde(default)]
    pub interface_recv_funcs: Vec<String>,
    #[serde(default)]
    pub sys_entry_func: Option<String>,
    #[serde(default)]
    pub pci_msix_desc_addr_func: Option<String>,
}

/// Which log format a pipeline ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParserKind {
    Gem5,
    Nicbm,
    Ns3,
    EventStream,
}

/// Which spanner consumes a pipeline's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpannerKind {
    Host,
    Nic,
    Network,
}

/// One log file wired through a parser and optional filters to a spanner.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub name: String,
    pub parser: ParserKind,
    pub log: PathBuf,
    pub spanner: SpannerKind,
    /// gem5 only: component prefixes admitted by the component filter.
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

/// Event-stream actors applied between parser and spanner, in order.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum FilterConfig {
    /// Keep (or with `invert` drop) the named event kinds.
    EventTypes {
        names: Vec<String>,
        #[serde(default)]
        invert: bool,
    },
    /// Keep events whose timestamp falls into any window.
    TimeWindow { lower_ps: u64, upper_ps: u64 },
    /// Drop host calls on the list (blacklist) or off it (whitelist).
    HostCalls {
        funcs: Vec<String>,
        #[serde(default = "default_true")]
        blacklist: bool,
    },
}

fn default_true() -> bool {
    true
}

/// Trace sink selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum SinkConfig {
    /// Indented text dump, to stdout or a file.
    Text {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// One JSON object per trace.
    Jsonl { path: PathBuf },
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Text { path: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
symbol_tables:
  - identifier: linux-client
    path: /tmp/vmlinux-syms.txt
    base_offset: 0
    filter: all
pipelines:
  - name: gem5-client
    parser: gem5
    log: /tmp/gem5.log
    spanner: host
    components: [system.pc, system.switch_cpus, global]
  - name: nicbm-client
    parser: nicbm
    log: /tmp/nic.log
    spanner: nic
    filters:
      - kind: time_window
        lower_ps: 0
        upper_ps: 2000000000000
  - name: ns3
    parser: ns3
    log: /tmp/ns3.log
    spanner: network
sink:
  kind: jsonl
  path: /tmp/traces.jsonl
";

    #[test]
    fn test_parse_sample_config() {
        let config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.symbol_tables.len(), 1);
        assert_eq!(config.pipelines.len(), 3);
        assert_eq!(config.pipelines[0].parser, ParserKind::Gem5);
        assert_eq!(config.pipelines[1].spanner, SpannerKind::Nic);
        assert!(matches!(config.sink, SinkConfig::Jsonl { .. }));
        assert!(matches!(
            config.pipelines[1].filters[0],
            FilterConfig::TimeWindow {
                lower_ps: 0,
                upper_ps: 2000000000000
            }
        ));
    }

    #[test]
    fn test_duplicate_pipeline_names_rejected() {
        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let clone = config.pipelines[0].clone();
        config.pipelines.push(clone);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gem5_requires_host_spanner() {
        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.pipelines[0].spanner = SpannerKind::Nic;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.pipelines.is_empty());
        assert!(matches!(config.sink, SinkConfig::Text { path: None }));
    }
}
