use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::KeyRing;

/// Metric names recorded by the engine. Plain strings on the wire so nodes
/// of different versions can exchange batches.
pub mod name {
    pub const RPS: &str = "rps";
    pub const ACTIVE_CONNECTIONS: &str = "active_connections";
    pub const LEADER_GAP_MS: &str = "leader_gap_ms";
    pub const ELECTIONS: &str = "elections";
    pub const GAMES: &str = "games";
    pub const TEAMS: &str = "teams";
}

const LATENCY_BOUNDS_MS: [f64; 8] = [1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 500.0];

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sample {
    pub ts: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Histogram {
    /// One count per bound plus an overflow bucket.
    pub counts: Vec<u64>,
    pub total: u64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            counts: vec![0; LATENCY_BOUNDS_MS.len() + 1],
            total: 0,
        }
    }

    fn observe(&mut self, ms: f64) {
        let slot = LATENCY_BOUNDS_MS
            .iter()
            .position(|b| ms <= *b)
            .unwrap_or(LATENCY_BOUNDS_MS.len());
        self.counts[slot] += 1;
        self.total += 1;
    }
}

/// A node's recent series, shipped through consensus as a `MetricsUpdate`
/// command so every node can serve the cluster view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsBatch {
    pub node_id: String,
    pub series: HashMap<String, Vec<Sample>>,
    #[serde(default)]
    pub latency: Option<Histogram>,
}

#[derive(Default)]
struct Inner {
    node: HashMap<String, VecDeque<Sample>>,
    cluster: HashMap<String, MetricsBatch>,
    latency: Option<Histogram>,
}

/// Ring-buffered time series per metric, plus a request-latency histogram.
pub struct MetricsStore {
    inner: RwLock<Inner>,
    capacity: usize,
    requests: AtomicU64,
}

impl MetricsStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                latency: Some(Histogram::new()),
                ..Default::default()
            }),
            capacity,
            requests: AtomicU64::new(0),
        }
    }

    pub fn record(&self, metric: &str, value: f64) {
        let mut inner = self.inner.write().expect("metrics lock poisoned");
        let series = inner.node.entry(metric.to_string()).or_default();
        series.push_back(Sample {
            ts: crate::model::now_ns(),
            value,
        });
        while series.len() > self.capacity {
            series.pop_front();
        }
    }

    pub fn observe_latency_ms(&self, ms: f64) {
        let mut inner = self.inner.write().expect("metrics lock poisoned");
        if let Some(h) = inner.latency.as_mut() {
            h.observe(ms);
        }
    }

    pub fn count_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain the request counter into an RPS sample; called by the sampler
    /// tick with the elapsed window length.
    pub fn sample_rps(&self, window_secs: f64) {
        let count = self.requests.swap(0, Ordering::Relaxed);
        if window_secs > 0.0 {
            self.record(name::RPS, count as f64 / window_secs);
        }
    }

    /// The local node's series packaged for replication.
    pub fn local_batch(&self, node_id: &str) -> MetricsBatch {
        let inner = self.inner.read().expect("metrics lock poisoned");
        MetricsBatch {
            node_id: node_id.to_string(),
            series: inner
                .node
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().copied().collect()))
                .collect(),
            latency: inner.latency.clone(),
        }
    }

    /// Absorb a replicated batch into the cluster view.
    pub fn merge_batch(&self, batch: MetricsBatch) {
        let mut inner = self.inner.write().expect("metrics lock poisoned");
        inner.cluster.insert(batch.node_id.clone(), batch);
    }

    pub fn cluster_view(&self) -> HashMap<String, MetricsBatch> {
        self.inner
            .read()
            .expect("metrics lock poisoned")
            .cluster
            .clone()
    }

    pub fn persist(&self, keys: &KeyRing, path: &Path) -> Result<()> {
        let view = self.cluster_view();
        crate::store::write_blob(keys, path, &view)
    }

    pub fn restore(&self, keys: &KeyRing, path: &Path) -> Result<()> {
        if let Some(view) = crate::store::read_blob::<HashMap<String, MetricsBatch>>(keys, path)? {
            let mut inner = self.inner.write().expect("metrics lock poisoned");
            inner.cluster = view;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_are_ring_buffered() {
        let store = MetricsStore::new(4);
        for i in 0..10 {
            store.record(name::GAMES, i as f64);
        }
        let batch = store.local_batch("n1");
        let series = &batch.series[name::GAMES];
        assert_eq!(series.len(), 4);
        assert_eq!(series.last().unwrap().value, 9.0);
    }

    #[test]
    fn latency_buckets_accumulate() {
        let store = MetricsStore::new(8);
        store.observe_latency_ms(0.5);
        store.observe_latency_ms(30.0);
        store.observe_latency_ms(10_000.0);
        let batch = store.local_batch("n1");
        let hist = batch.latency.unwrap();
        assert_eq!(hist.total, 3);
        assert_eq!(*hist.counts.last().unwrap(), 1);
    }

    #[test]
    fn cluster_merge_replaces_per_node() {
        let store = MetricsStore::new(8);
        let mut batch = MetricsBatch {
            node_id: "n2".into(),
            ..Default::default()
        };
        batch
            .series
            .insert(name::GAMES.into(), vec![Sample { ts: 1, value: 2.0 }]);
        store.merge_batch(batch.clone());
        batch.series.get_mut(name::GAMES).unwrap()[0].value = 5.0;
        store.merge_batch(batch);
        let view = store.cluster_view();
        assert_eq!(view["n2"].series[name::GAMES][0].value, 5.0);
    }
}
