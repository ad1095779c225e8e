//! RequestStatistics (spec §4.3): per-request-type sliding-window counters
//! for queue latency, service latency, and error counts.
//!
//! Sharded one-buffer-per-worker, matching the "coarse sharded counters...
//! snapshot aggregation yields monotonic counts under quiescence" allowance
//! in spec §4.3 — the same shape as the worker-pool metrics in the
//! retrieved `doorway` example (per-counter atomics merged into one
//! snapshot on read).

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Ok,
    Timeout,
    HandlerError,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    queue_wait: Duration,
    service: Duration,
    outcome: SampleOutcome,
}

/// Point-in-time read of one request type's window.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub p50_service_micros: u64,
    pub p90_service_micros: u64,
    pub p99_service_micros: u64,
    /// Requests per second over the window.
    pub rate: f64,
    /// Fraction of requests in the window that were not `Ok`.
    pub error_rate: f64,
    pub sample_count: usize,
}

struct Shard {
    samples: Mutex<VecDeque<Sample>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
        }
    }
}

struct TypeStats {
    shards: Vec<Shard>,
    next_shard: AtomicUsize,
}

impl TypeStats {
    fn new(shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count.max(1)).map(|_| Shard::new()).collect(),
            next_shard: AtomicUsize::new(0),
        }
    }

    fn record(&self, sample: Sample) {
        let idx = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        self.shards[idx].samples.lock().push_back(sample);
    }
}

/// Per-request-type sliding window statistics. Window length is fixed at
/// construction; eviction happens lazily at snapshot time rather than via
/// a background timer.
pub struct RequestStatistics {
    window: Duration,
    shard_count: usize,
    types: DashMap<String, Arc<TypeStats>>,
}

impl RequestStatistics {
    pub fn new(window_millis: u64) -> Self {
        Self::with_shards(window_millis, num_cpus_hint())
    }

    pub fn with_shards(window_millis: u64, shard_count: usize) -> Self {
        Self {
            window: Duration::from_millis(window_millis),
            shard_count,
            types: DashMap::new(),
        }
    }

    pub fn record_ok(&self, request_type: &str, queue_wait: Duration, service: Duration) {
        self.record(request_type, queue_wait, service, SampleOutcome::Ok);
    }

    pub fn record_timeout(&self, request_type: &str, queue_wait: Duration, service: Duration) {
        self.record(request_type, queue_wait, service, SampleOutcome::Timeout);
    }

    pub fn record_handler_error(&self, request_type: &str, queue_wait: Duration, service: Duration) {
        self.record(request_type, queue_wait, service, SampleOutcome::HandlerError);
    }

    fn record(&self, request_type: &str, queue_wait: Duration, service: Duration, outcome: SampleOutcome) {
        let type_stats = self
            .types
            .entry(request_type.to_string())
            .or_insert_with(|| Arc::new(TypeStats::new(self.shard_count)))
            .clone();
        type_stats.record(Sample {
            at: Instant::now(),
            queue_wait,
            service,
            outcome,
        });
    }

    /// Merges all shards for `request_type`, evicts samples older than the
    /// configured window, and computes the snapshot. Readers never block
    /// writers: this only takes each shard's lock briefly in turn.
    pub fn snapshot(&self, request_type: &str) -> Snapshot {
        let Some(type_stats) = self.types.get(request_type) else {
            return Snapshot::default();
        };
        let now = Instant::now();
        let mut merged = Vec::new();
        for shard in &type_stats.shards {
            let mut guard = shard.samples.lock();
            while let Some(front) = guard.front() {
                if now.duration_since(front.at) > self.window {
                    guard.pop_front();
                } else {
                    break;
                }
            }
            merged.extend(guard.iter().copied());
        }

        if merged.is_empty() {
            return Snapshot::default();
        }

        let mut service_micros: Vec<u64> = merged.iter().map(|s| s.service.as_micros() as u64).collect();
        service_micros.sort_unstable();
        let errors = merged.iter().filter(|s| s.outcome != SampleOutcome::Ok).count();
        let count = merged.len();

        Snapshot {
            p50_service_micros: percentile(&service_micros, 0.50),
            p90_service_micros: percentile(&service_micros, 0.90),
            p99_service_micros: percentile(&service_micros, 0.99),
            rate: count as f64 / self.window.as_secs_f64().max(f64::EPSILON),
            error_rate: errors as f64 / count as f64,
            sample_count: count,
        }
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn num_cpus_hint() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_of_unknown_type_is_empty() {
        let stats = RequestStatistics::new(60_000);
        let snap = stats.snapshot("nope");
        assert_eq!(snap.sample_count, 0);
        assert_eq!(snap.error_rate, 0.0);
    }

    #[test]
    fn error_rate_reflects_non_ok_outcomes() {
        let stats = RequestStatistics::with_shards(60_000, 1);
        for _ in 0..3 {
            stats.record_ok("echo", Duration::from_millis(1), Duration::from_millis(2));
        }
        stats.record_timeout("echo", Duration::from_millis(1), Duration::from_millis(50));
        let snap = stats.snapshot("echo");
        assert_eq!(snap.sample_count, 4);
        assert!((snap.error_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn window_eviction_drops_stale_samples() {
        let stats = RequestStatistics::with_shards(1, 1); // 1ms window
        stats.record_ok("echo", Duration::from_millis(1), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        let snap = stats.snapshot("echo");
        assert_eq!(snap.sample_count, 0);
    }
}
