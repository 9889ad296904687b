//! # Nexus CLI
//!
//! Demo/operational entry point for the Nexus data access engine. Resolves a wire-format
//! resource path against a small built-in demo source, drives a chunked read through the
//! scheduler, and writes the resulting samples to stdout or a file via the writer controller.
//! Real plugins are an external concern (spec §1 Scope); this binary exists to exercise the
//! pipeline end to end the way `rde-cli` exercises `rde-core`'s pipeline wiring.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nexus_core::model::{NexusDataType, Representation, RepresentationKind, Resource};
use nexus_core::tree::{CatalogProvider, CatalogRegistration, CatalogTree};
use nexus_core::{Catalog, CatalogItem, DataSource, DataWriter, NexusResult, PluginContext, ReadRequest};
use nexus_engine::{PipelineRunner, ReadScheduler, SourceControllerHandle, WriterController};
use nexus_storage::{CacheEngine, MemoryTracker};
use serde_json::Value;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 100-nanosecond ticks per second, the engine's time unit throughout (spec §3).
const TICKS_PER_SECOND: i64 = 10_000_000;

#[derive(Parser, Debug)]
#[command(name = "nexus-cli")]
#[command(about = "Resolve a resource path against the demo catalog and stream a read to stdout or a file")]
struct Args {
    /// Wire-format resource path, e.g. `/demo/temperature/1_s`.
    #[arg(short, long, default_value = "/demo/temperature/1_s")]
    resource_path: String,

    /// Start of the read window, in whole seconds since epoch.
    #[arg(long, default_value_t = 0)]
    begin_secs: i64,

    /// End of the read window (exclusive), in whole seconds since epoch.
    #[arg(long, default_value_t = 60)]
    end_secs: i64,

    /// Optional layered configuration file (YAML/TOML/JSON, per the `config` crate).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the memory tracker's ceiling, in bytes.
    #[arg(long)]
    memory_budget: Option<u64>,

    /// Write output here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = nexus_core::config::NexusConfig::load(args.config.as_deref())
        .context("failed to load configuration")?
        .with_cli_override_memory(args.memory_budget);

    let source_controller = SourceControllerHandle::new("demo", Box::new(DemoSource::default()));
    source_controller
        .initialize(Value::Null, None)
        .await
        .context("failed to initialize demo source")?;

    let pipeline = PipelineRunner::new("demo-pipeline", vec![source_controller.clone()]);
    let tree = CatalogTree::new();
    tree.mount(
        CatalogRegistration {
            path: "/demo".to_string(),
            title: Some("Demo catalog".to_string()),
            is_transient: false,
            link_target: None,
            visible: true,
        },
        pipeline as Arc<dyn CatalogProvider>,
        true,
    )
    .await
    .context("failed to mount demo catalog")?;

    let request = tree
        .resolve(&args.resource_path)
        .await
        .with_context(|| format!("failed to resolve resource path {}", args.resource_path))?;

    let cache_file_period_ticks = config.cache_file_period_secs as u64 * TICKS_PER_SECOND as u64;
    let cache = Arc::new(CacheEngine::new(config.cache_root_dir.clone(), cache_file_period_ticks));
    let tracker = MemoryTracker::new(config.total_buffer_memory_consumption);
    let scheduler = ReadScheduler::new(tracker, cache);

    let cancel = CancellationToken::new();
    let begin = args.begin_secs * TICKS_PER_SECOND;
    let end = args.end_secs * TICKS_PER_SECOND;
    let sample_period_ticks = request.item.representation.sample_period_ticks;
    let output_item = request.item.clone();

    let reader = scheduler.read_as_stream(begin, end, source_controller.clone(), request, cancel.clone());

    let sink: Box<dyn Write + Send + Sync> = match &args.output {
        Some(path) => Box::new(std::io::BufWriter::new(
            std::fs::File::create(path).with_context(|| format!("failed to create output file {}", path.display()))?,
        )),
        None => Box::new(std::io::BufWriter::new(std::io::stdout())),
    };
    let writer_controller = WriterController::new("text", Box::new(TextWriter::new(sink)));
    writer_controller
        .initialize(Value::Null, None)
        .await
        .context("failed to initialize text writer")?;

    let run_cancel = cancel.clone();
    let mut run_handle = tokio::spawn(async move {
        writer_controller
            .run(begin, end, sample_period_ticks, cache_file_period_ticks, vec![(output_item, reader)], run_cancel, None)
            .await
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("received Ctrl-C, cancelling");
            cancel.cancel();
            let _ = run_handle.await;
        }
        result = &mut run_handle => {
            result.context("writer task panicked")?.context("read/write pipeline failed")?;
        }
    }

    Ok(())
}

/// Synthetic sine-wave source backing `/demo/temperature/1_s` (spec §1: real plugins are an
/// external concern; this exists purely to exercise the pipeline end to end).
#[derive(Default)]
struct DemoSource;

#[async_trait::async_trait]
impl DataSource for DemoSource {
    async fn set_context(&mut self, _ctx: PluginContext) -> NexusResult<()> {
        Ok(())
    }

    async fn get_catalog_registrations(&self, path: &str) -> NexusResult<Vec<CatalogRegistration>> {
        if path.is_empty() || path == "/" {
            Ok(vec![CatalogRegistration {
                path: "/demo".to_string(),
                title: Some("Demo catalog".to_string()),
                is_transient: false,
                link_target: None,
                visible: true,
            }])
        } else {
            Ok(vec![])
        }
    }

    async fn enrich_catalog(&self, mut catalog: Catalog) -> NexusResult<Catalog> {
        if catalog.id == "/demo" {
            let resource = Resource::new("temperature").with_representation(Representation {
                data_type: NexusDataType::F64,
                sample_period_ticks: TICKS_PER_SECOND as u64,
                kind: RepresentationKind::Original,
                parameters: None,
            })?;
            catalog.resources.insert("temperature".to_string(), resource);
        }
        Ok(catalog)
    }

    async fn get_time_range(&self, _catalog_id: &str) -> NexusResult<(i64, i64)> {
        Ok((0, i64::MAX / 2))
    }

    async fn get_availability(&self, _catalog_id: &str, _begin: i64, _end: i64) -> NexusResult<Vec<f64>> {
        Ok(vec![1.0])
    }

    async fn read(&mut self, begin: i64, _end: i64, requests: &mut [ReadRequest]) -> NexusResult<()> {
        for req in requests {
            let period = req.item.representation.sample_period_ticks as i64;
            for (i, status) in req.status.iter_mut().enumerate() {
                *status = 1;
                let tick = begin + i as i64 * period;
                let seconds = tick as f64 / TICKS_PER_SECOND as f64;
                let value = 20.0 + 5.0 * (seconds / 60.0 * std::f64::consts::TAU).sin();
                req.data[i * 8..(i + 1) * 8].copy_from_slice(&value.to_ne_bytes());
            }
        }
        Ok(())
    }
}

/// Minimal `DataWriter` reference implementation: one tab-separated `item_id, tick, value` line
/// per sample. Grounded in `rde-io::sink_stdout::StdoutSink` — writer codecs proper are out of
/// scope (spec §1); this is the reference implementation tests/demos exercise.
struct TextWriter {
    sink: Box<dyn Write + Send + Sync>,
    current_file_begin: i64,
    current_sample_period: u64,
}

impl TextWriter {
    fn new(sink: Box<dyn Write + Send + Sync>) -> Self {
        TextWriter { sink, current_file_begin: 0, current_sample_period: 1 }
    }
}

#[async_trait::async_trait]
impl DataWriter for TextWriter {
    async fn set_context(&mut self, _ctx: PluginContext) -> NexusResult<()> {
        Ok(())
    }

    async fn open(&mut self, file_begin_ticks: i64, _file_period_ticks: u64, sample_period_ticks: u64, _items: &[CatalogItem]) -> NexusResult<()> {
        self.current_file_begin = file_begin_ticks;
        self.current_sample_period = sample_period_ticks;
        Ok(())
    }

    async fn write(&mut self, file_offset: u64, samples: Vec<(CatalogItem, Vec<f64>)>) -> NexusResult<()> {
        for (item, values) in samples {
            for (i, value) in values.into_iter().enumerate() {
                let tick = self.current_file_begin + (file_offset + i as u64) as i64 * self.current_sample_period as i64;
                writeln!(self.sink, "{}\t{}\t{}", item.item_id(), tick, value)
                    .map_err(|e| nexus_core::NexusError::Internal(format!("failed writing output: {e}")))?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> NexusResult<()> {
        self.sink
            .flush()
            .map_err(|e| nexus_core::NexusError::Internal(format!("failed flushing output: {e}")))
    }
}
