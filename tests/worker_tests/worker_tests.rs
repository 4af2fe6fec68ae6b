//! Tests for Worker
//!
//! These tests verify:
//! - A round aggregates, trims and re-arms the sack
//! - Failed rounds leave measures and marker in place
//! - Unknown metrics are dropped without creating aggregates
//! - Sweeps and the notification loop drain everything
//! - A sack whose rounds keep failing doesn't stop the loop
//! - Metric deletion clears both queue and aggregates

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sackdb::aggregate::AggregateBlock;
use sackdb::backend::{Backend, Command, MemoryBackend};
use sackdb::{
    AggregateStore, Aggregation, Aggregator, Config, IncomingBuffer, Measure, Metric, MetricId,
    ReferenceAggregator, Result, SackError, SplitWrite, StaticCatalog, Worker,
};

const SECOND: i64 = 1_000_000_000;
const EPOCH_2015: i64 = 1_420_070_400 * SECOND;

// =============================================================================
// Helper Functions
// =============================================================================

struct Harness {
    backend: Arc<MemoryBackend>,
    incoming: Arc<IncomingBuffer>,
    store: Arc<AggregateStore>,
    catalog: Arc<StaticCatalog>,
}

impl Harness {
    fn new(sacks: u32) -> Self {
        Self::with_config(Config::builder().default_sack_count(sacks).build())
    }

    fn with_config(config: Config) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        IncomingBuffer::ensure_storage_settings(backend.as_ref(), &config).unwrap();
        let incoming = Arc::new(IncomingBuffer::open(backend.clone(), config.clone()).unwrap());
        let store = Arc::new(AggregateStore::new(backend.clone(), config));
        Self {
            backend,
            incoming,
            store,
            catalog: Arc::new(StaticCatalog::new()),
        }
    }

    fn worker(&self) -> Worker {
        self.worker_with(Arc::new(ReferenceAggregator))
    }

    fn worker_with(&self, aggregator: Arc<dyn Aggregator>) -> Worker {
        Worker::new(
            self.incoming.clone(),
            self.store.clone(),
            self.catalog.clone(),
            aggregator,
        )
    }

    fn register(&self, aggregations: &[Aggregation]) -> MetricId {
        let id = MetricId::new();
        self.catalog.register(Metric::new(id, aggregations.to_vec()));
        id
    }

    fn marker_exists(&self, metric: &MetricId) -> bool {
        self.backend
            .execute(Command::Exists {
                key: self.incoming.sack_for(metric).name().into_bytes(),
            })
            .unwrap()
            .into_integer()
            .unwrap()
            == 1
    }

    /// Points of the split holding `timestamp`, empty when not written
    fn points(&self, metric: &MetricId, aggregation: &Aggregation, timestamp: i64) -> Vec<(i64, f64)> {
        let key = aggregation.split_key_for(timestamp).unwrap();
        let blocks = self
            .store
            .get_measures(metric, &[(key, aggregation.clone())], self.store.default_version())
            .unwrap();
        match &blocks[0] {
            Some(data) => AggregateBlock::decode(data).unwrap().points,
            None => Vec::new(),
        }
    }
}

fn agg(method: &str, secs: u64) -> Aggregation {
    Aggregation::new(method, Duration::from_secs(secs)).unwrap()
}

fn m(offset_ms: i64, value: f64) -> Measure {
    Measure::new(EPOCH_2015 + offset_ms * 1_000_000, value)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Fails every call until told otherwise
struct FlakyAggregator {
    failures_left: AtomicUsize,
}

impl Aggregator for FlakyAggregator {
    fn aggregate(
        &self,
        metric: &Metric,
        measures: &[Measure],
        store: &AggregateStore,
        version: u32,
    ) -> Result<HashMap<Aggregation, Vec<SplitWrite>>> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(SackError::Backend("aggregation backend unavailable".to_string()));
        }
        ReferenceAggregator.aggregate(metric, measures, store, version)
    }
}

/// Swaps the queue of the metric being aggregated for fresh data, once
struct QueueSwappingAggregator {
    incoming: Arc<IncomingBuffer>,
    swapped: AtomicBool,
}

impl Aggregator for QueueSwappingAggregator {
    fn aggregate(
        &self,
        metric: &Metric,
        measures: &[Measure],
        store: &AggregateStore,
        version: u32,
    ) -> Result<HashMap<Aggregation, Vec<SplitWrite>>> {
        if !self.swapped.swap(true, Ordering::SeqCst) {
            self.incoming.delete_queue(&metric.id)?;
            self.incoming.add_measures(metric.id, &[m(5000, 99.0)])?;
        }
        ReferenceAggregator.aggregate(metric, measures, store, version)
    }
}

// =============================================================================
// Round Tests
// =============================================================================

#[test]
fn test_round_aggregates_and_trims() {
    let h = Harness::new(4);
    let last = agg("last", 1);
    let max = agg("max", 60);
    let metric = h.register(&[last.clone(), max.clone()]);
    h.incoming
        .add_measures(metric, &[m(200, 1.0), m(700, 3.0)])
        .unwrap();
    h.incoming
        .add_measures(metric, &[m(1500, 2.0), m(61_000, 10.0)])
        .unwrap();

    let stats = h.worker().process_sack(&h.incoming.sack_for(&metric)).unwrap();

    assert_eq!(stats.rounds, 1);
    assert_eq!(stats.metrics, 1);
    assert_eq!(stats.measures, 4);
    assert_eq!(stats.splits_written, 2);
    assert_eq!(stats.trim.trimmed, 1);
    assert_eq!(stats.trim.batches, 2);

    assert_eq!(
        h.points(&metric, &last, EPOCH_2015),
        vec![
            (EPOCH_2015, 3.0),
            (EPOCH_2015 + SECOND, 2.0),
            (EPOCH_2015 + 61 * SECOND, 10.0),
        ]
    );
    assert_eq!(
        h.points(&metric, &max, EPOCH_2015),
        vec![(EPOCH_2015, 3.0), (EPOCH_2015 + 60 * SECOND, 10.0)]
    );
    assert!(!h.incoming.has_pending(&metric).unwrap());
    assert!(!h.marker_exists(&metric));
}

#[test]
fn test_rounds_merge_with_stored_blocks() {
    let h = Harness::new(4);
    let max = agg("max", 1);
    let metric = h.register(&[max.clone()]);
    let worker = h.worker();
    let sack = h.incoming.sack_for(&metric);

    h.incoming.add_measures(metric, &[m(0, 5.0)]).unwrap();
    worker.process_sack(&sack).unwrap();
    h.incoming
        .add_measures(metric, &[m(100, 4.0), m(2000, 1.0)])
        .unwrap();
    worker.process_sack(&sack).unwrap();

    assert_eq!(
        h.points(&metric, &max, EPOCH_2015),
        vec![(EPOCH_2015, 5.0), (EPOCH_2015 + 2 * SECOND, 1.0)]
    );
}

#[test]
fn test_measures_spanning_splits() {
    let h = Harness::new(1);
    let last = agg("last", 1);
    let metric = h.register(&[last.clone()]);
    let window_ms = 3600 * 1000;
    h.incoming
        .add_measures(metric, &[m(0, 1.0), m(window_ms, 2.0)])
        .unwrap();

    let stats = h.worker().process_sack(&h.incoming.sack_for(&metric)).unwrap();

    assert_eq!(stats.splits_written, 2);
    let listed = h
        .store
        .list_split_keys(&metric, &[last.clone()], h.store.default_version())
        .unwrap();
    assert_eq!(listed[&last].len(), 2);
}

#[test]
fn test_empty_round() {
    let h = Harness::new(4);

    let stats = h
        .worker()
        .process_sack(&h.incoming.router().sack(2).unwrap())
        .unwrap();

    assert_eq!(stats.rounds, 1);
    assert_eq!(stats.metrics, 0);
    assert_eq!(stats.trim.trimmed, 0);
}

#[test]
fn test_failed_round_keeps_measures_and_marker() {
    let h = Harness::new(4);
    let last = agg("last", 1);
    let metric = h.register(&[last.clone()]);
    let worker = h.worker_with(Arc::new(FlakyAggregator {
        failures_left: AtomicUsize::new(1),
    }));
    let sack = h.incoming.sack_for(&metric);
    h.incoming.add_measures(metric, &[m(0, 7.0)]).unwrap();

    let failed = worker.process_sack(&sack);

    assert!(matches!(failed, Err(SackError::Backend(_))));
    assert!(h.incoming.has_pending(&metric).unwrap());
    assert!(h.marker_exists(&metric));

    let retried = worker.process_sack(&sack).unwrap();
    assert_eq!(retried.measures, 1);
    assert_eq!(h.points(&metric, &last, EPOCH_2015), vec![(EPOCH_2015, 7.0)]);
    assert!(!h.incoming.has_pending(&metric).unwrap());
}

#[test]
fn test_queue_replaced_mid_round_is_not_trimmed() {
    let h = Harness::new(2);
    let last = agg("last", 1);
    let metric = h.register(&[last.clone()]);
    let worker = h.worker_with(Arc::new(QueueSwappingAggregator {
        incoming: h.incoming.clone(),
        swapped: AtomicBool::new(false),
    }));
    let sack = h.incoming.sack_for(&metric);
    h.incoming.add_measures(metric, &[m(0, 1.0)]).unwrap();

    let stats = worker.process_sack(&sack).unwrap();

    assert_eq!(stats.trim.trimmed, 0);
    assert_eq!(stats.trim.skipped, 1);
    assert!(h.incoming.has_pending(&metric).unwrap());

    let next = worker.process_sack(&sack).unwrap();
    assert_eq!(next.trim.trimmed, 1);
    assert_eq!(
        h.points(&metric, &last, EPOCH_2015),
        vec![(EPOCH_2015, 1.0), (EPOCH_2015 + 5 * SECOND, 99.0)]
    );
    assert!(!h.incoming.has_pending(&metric).unwrap());
}

#[test]
fn test_unknown_metric_is_dropped() {
    let h = Harness::new(1);
    let known = h.register(&[agg("last", 1)]);
    let unknown = MetricId::new();
    h.incoming.add_measures(known, &[m(0, 1.0)]).unwrap();
    h.incoming.add_measures(unknown, &[m(0, 1.0)]).unwrap();

    let stats = h
        .worker()
        .process_sack(&h.incoming.router().sack(0).unwrap())
        .unwrap();

    assert_eq!(stats.metrics, 1);
    assert_eq!(stats.unknown_metrics, 1);
    assert_eq!(stats.trim.trimmed, 2);
    assert!(!h.incoming.has_pending(&unknown).unwrap());
    assert!(!h.store.metric_exists(&unknown).unwrap());
    assert!(h.store.metric_exists(&known).unwrap());
}

#[test]
fn test_metric_without_aggregations_gets_namespace() {
    let h = Harness::new(1);
    let metric = h.register(&[]);
    h.incoming.add_measures(metric, &[m(0, 1.0)]).unwrap();

    h.worker()
        .process_sack(&h.incoming.sack_for(&metric))
        .unwrap();

    assert!(h.store.metric_exists(&metric).unwrap());
    assert!(!h.incoming.has_pending(&metric).unwrap());
}

#[test]
fn test_unversioned_worker() {
    let h = Harness::new(1);
    let last = agg("last", 1);
    let metric = h.register(&[last.clone()]);
    h.incoming.add_measures(metric, &[m(0, 1.0)]).unwrap();

    h.worker()
        .with_version(0)
        .process_sack(&h.incoming.sack_for(&metric))
        .unwrap();

    let legacy = h.store.list_split_keys(&metric, &[last.clone()], 0).unwrap();
    let current = h.store.list_split_keys(&metric, &[last.clone()], 3).unwrap();
    assert_eq!(legacy[&last].len(), 1);
    assert!(current[&last].is_empty());
}

// =============================================================================
// Sweep Tests
// =============================================================================

#[test]
fn test_sweep_drains_without_markers() {
    let h = Harness::with_config(Config::builder().default_sack_count(8).greedy(false).build());
    let aggregations = [agg("max", 1)];
    let metrics: Vec<MetricId> = (0..20).map(|_| h.register(&aggregations)).collect();
    for metric in &metrics {
        h.incoming.add_measures(*metric, &[m(0, 1.0)]).unwrap();
    }

    let stats = h.worker().sweep().unwrap();

    assert_eq!(stats.metrics, 20);
    assert_eq!(h.incoming.report(false).unwrap().metrics, 0);
}

#[test]
fn test_sweep_on_idle_buffer() {
    let h = Harness::new(8);

    let stats = h.worker().sweep().unwrap();

    assert_eq!(stats, Default::default());
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_delete_metric() {
    let h = Harness::new(4);
    let last = agg("last", 1);
    let metric = h.register(&[last.clone()]);
    let worker = h.worker();
    h.incoming.add_measures(metric, &[m(0, 1.0)]).unwrap();
    worker.process_sack(&h.incoming.sack_for(&metric)).unwrap();
    h.incoming.add_measures(metric, &[m(1000, 2.0)]).unwrap();

    h.catalog.remove(&metric);
    worker.delete_metric(&metric).unwrap();

    assert!(!h.incoming.has_pending(&metric).unwrap());
    assert!(!h.store.metric_exists(&metric).unwrap());
    assert!(matches!(
        h.store.list_split_keys(&metric, &[last], 3),
        Err(SackError::MetricDoesNotExist(_))
    ));
}

#[test]
fn test_run_drains_until_shutdown() {
    let h = Harness::new(4);
    let aggregations = [agg("max", 1)];
    let metrics: Vec<MetricId> = (0..10).map(|_| h.register(&aggregations)).collect();
    // Appended before the worker subscribes: only the startup sweep finds these
    h.incoming.add_measures(metrics[0], &[m(0, 1.0)]).unwrap();

    let shutdown = Arc::new(AtomicBool::new(false));
    let worker = Arc::new(h.worker());
    let handle = {
        let worker = Arc::clone(&worker);
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || worker.run(&shutdown, Duration::from_secs(60)))
    };

    for (i, metric) in metrics.iter().enumerate() {
        h.incoming
            .add_measures(*metric, &[m(i as i64 * 1000, i as f64)])
            .unwrap();
    }

    let drained = wait_until(Duration::from_secs(5), || {
        h.incoming.report(false).unwrap().metrics == 0
            && metrics.iter().all(|id| h.store.metric_exists(id).unwrap())
    });
    shutdown.store(true, Ordering::SeqCst);
    handle.join().unwrap().unwrap();

    assert!(drained, "worker left measures behind");
}

#[test]
fn test_failing_sack_does_not_stop_run() {
    let h = Harness::new(4);
    // The reference aggregator has no "mean", so every round on this sack fails
    let broken = h.register(&[agg("mean", 1)]);
    h.incoming.add_measures(broken, &[m(0, 1.0)]).unwrap();
    let healthy = loop {
        let id = h.register(&[agg("max", 1)]);
        if h.incoming.sack_for(&id) != h.incoming.sack_for(&broken) {
            break id;
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let worker = Arc::new(h.worker());
    let handle = {
        let worker = Arc::clone(&worker);
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || worker.run(&shutdown, Duration::from_millis(50)))
    };
    h.incoming.add_measures(healthy, &[m(0, 2.0)]).unwrap();

    let drained = wait_until(Duration::from_secs(5), || {
        !h.incoming.has_pending(&healthy).unwrap() && h.store.metric_exists(&healthy).unwrap()
    });
    shutdown.store(true, Ordering::SeqCst);
    let result = handle.join().unwrap();

    assert!(result.is_ok(), "run stopped: {:?}", result);
    assert!(drained, "healthy sack was not processed");
    assert!(h.incoming.has_pending(&broken).unwrap());
}

#[test]
fn test_competing_workers_converge() {
    let h = Harness::new(2);
    let max = agg("max", 1);
    let metrics: Vec<MetricId> = (0..8).map(|_| h.register(&[max.clone()])).collect();
    let shutdown = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let worker = h.worker();
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || worker.run(&shutdown, Duration::from_millis(50)))
        })
        .collect();

    for round in 0..20 {
        for metric in &metrics {
            h.incoming
                .add_measures(*metric, &[m(round * 1000, round as f64)])
                .unwrap();
        }
    }

    let drained = wait_until(Duration::from_secs(10), || {
        h.incoming.report(false).unwrap().metrics == 0
    });
    shutdown.store(true, Ordering::SeqCst);
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert!(drained);
    for metric in &metrics {
        // Blocks may race between workers sharing a sack; every metric
        // still ends up aggregated and nothing stays queued
        assert!(!h.points(metric, &max, EPOCH_2015).is_empty(), "metric {}", metric);
        assert!(!h.incoming.has_pending(metric).unwrap());
    }
}
