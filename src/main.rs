// simweave - reconstructs distributed causal traces from the raw logs of a
// hardware-and-network co-simulation
//
// Architecture:
// - Parsers: one per log file (host CPU sim, NIC model, network sim,
//   replayable event stream), each a pipeline producer of typed events
// - Pipeline: bounded channels join producer -> filters -> spanner tasks
// - Spanners: per-component state machines that stitch events into spans
//   and synchronize across component boundaries through context queues
// - Tracer: owns the span arena and causal graph, emits complete traces
//   into the configured sink once every pipeline has drained

mod channel;
mod cli;
mod config;
mod context;
mod env;
mod errors;
mod events;
mod filter;
mod intern;
mod parser;
mod pipeline;
mod reader;
mod sink;
mod span;
mod spanner;
mod symbols;
mod tracer;

use anyhow::{bail, Context, Result};
use clap::Parser as ClapParser;
use cli::Cli;
use config::{AppConfig, FilterConfig, ParserKind, PipelineConfig, SinkConfig, SpannerKind};
use context::ContextQueue;
use env::TraceEnv;
use events::Event;
use filter::{ActorStage, EventTimestampFilter, EventTypeFilter, HostCallFuncFilter, TimeBoundary};
use parser::{ComponentFilter, EventStreamParser, Gem5Parser, NicbmParser, Ns3Parser};
use pipeline::{run_pipelines, Consumer, Pipeline, Producer, Transform};
use sink::{JsonLinesSink, TextSink, TraceSink};
use spanner::{HostSpanner, NetworkSpanner, NicSpanner};
use std::sync::Arc;
use tracer::Tracer;
use tracing_subscriber::EnvFilter;

/// The context queue pairs of a single host / NIC / network topology.
struct QueueSet {
    /// host <-> nic: Mmio one way, Dma/Msix the other
    host_nic: Arc<ContextQueue>,
    /// nic -> host receive announcements
    host_receives: Arc<ContextQueue>,
    /// nic <-> network: Rx announcements into the simulator
    nic_network: Arc<ContextQueue>,
    /// network -> downstream adapter side
    network_downstream: Arc<ContextQueue>,
}

impl QueueSet {
    fn new() -> Self {
        Self {
            host_nic: Arc::new(ContextQueue::new()),
            host_receives: Arc::new(ContextQueue::new()),
            nic_network: Arc::new(ContextQueue::new()),
            network_downstream: Arc::new(ContextQueue::new()),
        }
    }
}

fn build_producer(
    entry: &PipelineConfig,
    env: &Arc<TraceEnv>,
) -> Box<dyn Producer<Event>> {
    match entry.parser {
        ParserKind::Gem5 => Box::new(Gem5Parser::new(
            Arc::clone(env),
            &entry.name,
            &entry.log,
            ComponentFilter::new(entry.components.clone()),
        )),
        ParserKind::Nicbm => Box::new(NicbmParser::new(env, &entry.name, &entry.log)),
        ParserKind::Ns3 => Box::new(Ns3Parser::new(env, &entry.name, &entry.log)),
        ParserKind::EventStream => {
            Box::new(EventStreamParser::new(Arc::clone(env), &entry.name, &entry.log))
        }
    }
}

fn build_transforms(
    entry: &PipelineConfig,
    env: &Arc<TraceEnv>,
) -> Vec<Box<dyn Transform<Event>>> {
    entry
        .filters
        .iter()
        .map(|filter| -> Box<dyn Transform<Event>> {
            match filter {
                FilterConfig::EventTypes { names, invert } => Box::new(ActorStage::new(
                    EventTypeFilter::new(names.iter().cloned(), *invert),
                )),
                FilterConfig::TimeWindow { lower_ps, upper_ps } => {
                    Box::new(ActorStage::new(EventTimestampFilter::new(vec![
                        TimeBoundary {
                            lower_ps: *lower_ps,
                            upper_ps: *upper_ps,
                        },
                    ])))
                }
                FilterConfig::HostCalls { funcs, blacklist } => Box::new(ActorStage::new(
                    HostCallFuncFilter::new(env, funcs.iter().cloned(), *blacklist),
                )),
            }
        })
        .collect()
}

fn build_spanner(
    entry: &PipelineConfig,
    tracer: &Arc<Tracer>,
    queues: &QueueSet,
) -> Box<dyn Consumer<Event>> {
    let name = format!("{}-spanner", entry.name);
    match entry.spanner {
        SpannerKind::Host => Box::new(HostSpanner::new(
            Arc::clone(tracer),
            &name,
            Arc::clone(&queues.host_nic),
            Arc::clone(&queues.host_receives),
        )),
        SpannerKind::Nic => Box::new(NicSpanner::new(
            Arc::clone(tracer),
            &name,
            Arc::clone(&queues.host_nic),
            Arc::clone(&queues.host_receives),
            Arc::clone(&queues.nic_network),
        )),
        SpannerKind::Network => Box::new(NetworkSpanner::new(
            Arc::clone(tracer),
            &name,
            Arc::clone(&queues.nic_network),
            Arc::clone(&queues.network_downstream),
        )),
    }
}

fn build_sink(config: &AppConfig, cli: &Cli) -> Result<Box<dyn TraceSink>> {
    if let Some(path) = &cli.jsonl {
        return Ok(Box::new(JsonLinesSink::new(path.clone())?));
    }
    Ok(match &config.sink {
        SinkConfig::Text { path } => Box::new(TextSink::new(path.clone())),
        SinkConfig::Jsonl { path } => Box::new(JsonLinesSink::new(path.clone())?),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;
    if cli.check {
        println!("configuration ok: {} pipelines", config.pipelines.len());
        return Ok(());
    }
    if config.pipelines.is_empty() {
        bail!("configuration defines no pipelines");
    }
    for kind in [SpannerKind::Host, SpannerKind::Nic, SpannerKind::Network] {
        let count = config.pipelines.iter().filter(|p| p.spanner == kind).count();
        if count > 1 {
            bail!("at most one {:?} spanner per run; split multi-host setups into one run per host/NIC pair", kind);
        }
    }

    let env = Arc::new(
        TraceEnv::new(&config.classifiers, &config.symbol_tables)
            .context("failed to build trace environment")?,
    );
    if !env.has_symbol_tables()
        && config.pipelines.iter().any(|p| p.parser == ParserKind::Gem5)
    {
        tracing::warn!(
            "no symbol tables configured; host exec traces will yield no call events"
        );
    }
    let tracer = Arc::new(Tracer::new(Arc::clone(&env)));
    let queues = QueueSet::new();

    // close the pairs whose peer component is not part of this run, so no
    // spanner blocks polling a queue nothing will ever feed
    let has = |kind: SpannerKind| config.pipelines.iter().any(|p| p.spanner == kind);
    if !has(SpannerKind::Host) || !has(SpannerKind::Nic) {
        queues.host_nic.close();
        queues.host_receives.close();
    }
    if !has(SpannerKind::Nic) || !has(SpannerKind::Network) {
        queues.nic_network.close();
    }

    let mut pipelines = Vec::with_capacity(config.pipelines.len());
    for entry in &config.pipelines {
        tracing::info!(
            pipeline = %entry.name,
            log = %entry.log.display(),
            "wiring pipeline"
        );
        pipelines.push(Pipeline::with_transforms(
            build_producer(entry, &env),
            build_transforms(entry, &env),
            build_spanner(entry, &tracer, &queues),
        ));
    }

    run_pipelines(pipelines)
        .await
        .context("pipeline execution failed")?;

    let mut sink = build_sink(&config, &cli)?;
    let mut sink_error = None;
    let summary = tracer.drain(|trace| {
        if sink_error.is_none() {
            if let Err(err) = sink.accept(&trace) {
                sink_error = Some(err);
            }
        }
    });
    if let Some(err) = sink_error {
        return Err(err.context("trace sink failed"));
    }
    sink.finish()?;

    tracing::info!(
        traces = summary.traces_emitted,
        pending = summary.traces_pending,
        spans = summary.spans_total,
        unmatched = summary.unmatched_events,
        "run complete"
    );
    Ok(())
}
