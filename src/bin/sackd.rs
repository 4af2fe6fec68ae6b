//! sackd
//!
//! Runs a self-contained ingestion pipeline on an in-memory backend:
//! producer threads append synthetic measures while worker threads drain
//! sacks into the aggregate store. Prints the backlog when done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;
use sackdb::{
    AggregateStore, Aggregation, Backend, Config, IncomingBuffer, Measure, MemoryBackend, Metric,
    MetricId, ReferenceAggregator, StaticCatalog, Worker,
};
use tracing_subscriber::{fmt, EnvFilter};

/// sackd
#[derive(Parser, Debug)]
#[command(name = "sackd")]
#[command(about = "Sack-partitioned measure ingestion and aggregation")]
#[command(version)]
struct Args {
    /// Number of sacks
    #[arg(short, long, default_value = "128")]
    sacks: u32,

    /// Worker threads
    #[arg(short, long, default_value = "4")]
    workers: usize,

    /// Producer threads
    #[arg(short, long, default_value = "2")]
    producers: usize,

    /// Metrics to feed
    #[arg(short, long, default_value = "1000")]
    metrics: usize,

    /// Measures per appended batch
    #[arg(short, long, default_value = "10")]
    batch_size: usize,

    /// How long producers run, in seconds
    #[arg(short, long, default_value = "5")]
    duration_secs: u64,

    /// Seconds between worker sweeps
    #[arg(long, default_value = "2")]
    sweep_secs: u64,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sackdb=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("sackd v{}", sackdb::VERSION);
    tracing::info!(
        "{} sacks, {} workers, {} producers, {} metrics",
        args.sacks,
        args.workers,
        args.producers,
        args.metrics
    );

    if let Err(e) = run(args) {
        tracing::error!("sackd failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> sackdb::Result<()> {
    let config = Config::builder().default_sack_count(args.sacks).build();
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());

    let sacks = IncomingBuffer::ensure_storage_settings(backend.as_ref(), &config)?;
    tracing::info!("Using {} sacks", sacks);

    let incoming = Arc::new(IncomingBuffer::open(Arc::clone(&backend), config.clone())?);
    let store = Arc::new(AggregateStore::new(Arc::clone(&backend), config));

    let catalog = Arc::new(StaticCatalog::new());
    let aggregations = vec![
        Aggregation::new("last", Duration::from_secs(1))?,
        Aggregation::new("max", Duration::from_secs(60))?,
    ];
    for _ in 0..args.metrics {
        catalog.register(Metric::new(MetricId::new(), aggregations.clone()));
    }
    let ids = Arc::new(catalog.ids());

    let shutdown = Arc::new(AtomicBool::new(false));
    let sweep_interval = Duration::from_secs(args.sweep_secs.max(1));

    // Workers
    let mut workers = Vec::with_capacity(args.workers);
    for n in 0..args.workers {
        let worker = Worker::new(
            Arc::clone(&incoming),
            Arc::clone(&store),
            catalog.clone(),
            Arc::new(ReferenceAggregator),
        );
        let shutdown = Arc::clone(&shutdown);
        workers.push(
            thread::Builder::new()
                .name(format!("worker-{}", n))
                .spawn(move || worker.run(&shutdown, sweep_interval))?,
        );
    }

    // Producers
    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let mut producers = Vec::with_capacity(args.producers);
    for n in 0..args.producers {
        let incoming = Arc::clone(&incoming);
        let ids = Arc::clone(&ids);
        let batch_size = args.batch_size.max(1);
        producers.push(
            thread::Builder::new()
                .name(format!("producer-{}", n))
                .spawn(move || -> sackdb::Result<u64> {
                    let mut appended = 0u64;
                    let mut tick = 0u64;
                    while Instant::now() < deadline {
                        let now = unix_nanos();
                        let batch = ids.iter().skip(n).step_by(args.producers.max(1)).map(|id| {
                            let measures: Vec<Measure> = (0..batch_size)
                                .map(|i| Measure::new(now + i as i64, (tick + i as u64) as f64))
                                .collect();
                            (*id, sackdb::incoming::encode_measures(&measures))
                        });
                        incoming.add_measures_batch(batch)?;
                        appended += 1;
                        tick += 1;
                        thread::sleep(Duration::from_millis(50));
                    }
                    Ok(appended)
                })?,
        );
    }

    for producer in producers {
        match producer.join() {
            Ok(Ok(rounds)) => tracing::info!("Producer finished after {} batches", rounds),
            Ok(Err(e)) => tracing::error!("Producer failed: {}", e),
            Err(_) => tracing::error!("Producer panicked"),
        }
    }

    // Let workers catch up, then stop them
    thread::sleep(sweep_interval);
    shutdown.store(true, Ordering::Relaxed);
    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Worker failed: {}", e),
            Err(_) => tracing::error!("Worker panicked"),
        }
    }

    let report = incoming.report(false)?;
    tracing::info!(
        "Backlog: {} metrics, {} pending batches",
        report.metrics,
        report.measures
    );

    if let Some(id) = ids.first() {
        match store.list_split_keys(id, &aggregations, store.default_version()) {
            Ok(keys) => {
                for (aggregation, splits) in keys {
                    tracing::info!("Metric {} {}: {} splits", id, aggregation, splits.len());
                }
            }
            Err(sackdb::SackError::MetricDoesNotExist(_)) => {
                tracing::info!("Metric {} was never processed", id)
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
