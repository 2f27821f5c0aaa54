//! # Scenario Metrics
//!
//! Each scenario worker owns a [`MetricsCollector`]; the runner merges them
//! once every worker has finished. Latency is recorded per exchange in an
//! HDR histogram, so merged percentiles are exact rather than averaged.

use anyhow::Result;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::error::ExchangeError;
use crate::exchange::ReplyOutcome;

/// How one request/reply exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeOutcome {
    Matched,
    TimedOut,
    Mismatched,
    Failed,
}

impl ExchangeOutcome {
    /// Classify the result of a receive.
    pub fn classify(result: &Result<ReplyOutcome, ExchangeError>) -> Self {
        match result {
            Ok(ReplyOutcome::Matched(_)) => ExchangeOutcome::Matched,
            Ok(ReplyOutcome::TimedOut) => ExchangeOutcome::TimedOut,
            Err(e) if e.is_content_error() => ExchangeOutcome::Mismatched,
            Err(_) => ExchangeOutcome::Failed,
        }
    }
}

/// Per-outcome exchange counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub matched: usize,
    pub timed_out: usize,
    pub mismatched: usize,
    pub failed: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: ExchangeOutcome) {
        match outcome {
            ExchangeOutcome::Matched => self.matched += 1,
            ExchangeOutcome::TimedOut => self.timed_out += 1,
            ExchangeOutcome::Mismatched => self.mismatched += 1,
            ExchangeOutcome::Failed => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &OutcomeCounts) {
        self.matched += other.matched;
        self.timed_out += other.timed_out;
        self.mismatched += other.mismatched;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.matched + self.timed_out + self.mismatched + self.failed
    }

    /// Exchanges that ended in an error (mismatch or infrastructure).
    pub fn errors(&self) -> usize {
        self.mismatched + self.failed
    }
}

/// Latency statistics for a scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    pub median_ns: f64,
    pub std_dev_ns: f64,
    pub percentiles: Vec<PercentileValue>,
    pub total_samples: u64,
}

/// Percentile value pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_ns: u64,
}

/// Exchange rate and request bandwidth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputMetrics {
    pub exchanges_per_second: f64,
    pub bytes_per_second: f64,
    pub total_exchanges: usize,
    pub total_bytes: usize,
    pub duration_ns: u64,
}

/// Everything measured for one scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub latency: Option<LatencyMetrics>,
    pub throughput: ThroughputMetrics,
    pub outcomes: OutcomeCounts,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Latency collector backed by an HDR histogram
pub struct LatencyCollector {
    histogram: Histogram<u64>,
}

impl LatencyCollector {
    pub fn new() -> Result<Self> {
        // 3 significant figures, auto-resizing
        let histogram = Histogram::<u64>::new(3)?;
        Ok(Self { histogram })
    }

    pub fn record(&mut self, latency: Duration) -> Result<()> {
        let latency_ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.histogram.record(latency_ns)?;
        Ok(())
    }

    /// Fold another worker's samples into this collector.
    pub fn merge(&mut self, other: &LatencyCollector) -> Result<()> {
        self.histogram.add(&other.histogram)?;
        Ok(())
    }

    pub fn sample_count(&self) -> u64 {
        self.histogram.len()
    }

    /// Summary statistics, or `None` before the first sample.
    pub fn get_metrics(&self, percentiles: &[f64]) -> Option<LatencyMetrics> {
        if self.histogram.is_empty() {
            return None;
        }

        let percentiles = percentiles
            .iter()
            .map(|&p| PercentileValue {
                percentile: p,
                value_ns: self.histogram.value_at_percentile(p),
            })
            .collect();

        Some(LatencyMetrics {
            min_ns: self.histogram.min(),
            max_ns: self.histogram.max(),
            mean_ns: self.histogram.mean(),
            median_ns: self.histogram.value_at_percentile(50.0) as f64,
            std_dev_ns: self.histogram.stdev(),
            percentiles,
            total_samples: self.histogram.len(),
        })
    }
}

/// Throughput calculator for exchanges and request bytes
pub struct ThroughputCalculator {
    start_time: Instant,
    exchange_count: usize,
    byte_count: usize,
}

impl Default for ThroughputCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputCalculator {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            exchange_count: 0,
            byte_count: 0,
        }
    }

    pub fn record_exchange(&mut self, request_size: usize) {
        self.exchange_count += 1;
        self.byte_count += request_size;
    }

    /// Add another worker's counts; the earlier start time wins.
    pub fn merge(&mut self, other: &ThroughputCalculator) {
        self.exchange_count += other.exchange_count;
        self.byte_count += other.byte_count;
        self.start_time = self.start_time.min(other.start_time);
    }

    pub fn get_metrics(&self) -> ThroughputMetrics {
        let elapsed = self.start_time.elapsed();
        let duration_secs = elapsed.as_secs_f64();
        let rate = |count: usize| {
            if duration_secs > 0.0 {
                count as f64 / duration_secs
            } else {
                0.0
            }
        };

        ThroughputMetrics {
            exchanges_per_second: rate(self.exchange_count),
            bytes_per_second: rate(self.byte_count),
            total_exchanges: self.exchange_count,
            total_bytes: self.byte_count,
            duration_ns: u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
        }
    }
}

/// Combined per-worker collector
pub struct MetricsCollector {
    pub latency_collector: LatencyCollector,
    pub throughput_calculator: ThroughputCalculator,
    pub outcomes: OutcomeCounts,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            latency_collector: LatencyCollector::new()?,
            throughput_calculator: ThroughputCalculator::new(),
            outcomes: OutcomeCounts::default(),
        })
    }

    /// Record one finished exchange. Latency is only sampled for exchanges
    /// that reached the queue manager and came back with a verdict.
    pub fn record_exchange(
        &mut self,
        outcome: ExchangeOutcome,
        request_size: usize,
        latency: Duration,
    ) -> Result<()> {
        self.outcomes.record(outcome);
        self.throughput_calculator.record_exchange(request_size);
        if outcome != ExchangeOutcome::Failed {
            self.latency_collector.record(latency)?;
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &MetricsCollector) -> Result<()> {
        self.latency_collector.merge(&other.latency_collector)?;
        self.throughput_calculator.merge(&other.throughput_calculator);
        self.outcomes.merge(&other.outcomes);
        Ok(())
    }

    /// Merge every worker's collector into one.
    pub fn aggregate(workers: Vec<MetricsCollector>) -> Result<MetricsCollector> {
        let mut workers = workers.into_iter();
        let mut total = match workers.next() {
            Some(first) => first,
            None => return MetricsCollector::new(),
        };
        for worker in workers {
            total.merge(&worker)?;
        }
        Ok(total)
    }

    pub fn get_metrics(&self, percentiles: &[f64]) -> PerformanceMetrics {
        PerformanceMetrics {
            latency: self.latency_collector.get_metrics(percentiles),
            throughput: self.throughput_calculator.get_metrics(),
            outcomes: self.outcomes,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Format a latency value for log output
pub fn format_latency(latency_ns: u64) -> String {
    if latency_ns < 1_000 {
        format!("{}ns", latency_ns)
    } else if latency_ns < 1_000_000 {
        format!("{:.2}μs", latency_ns as f64 / 1_000.0)
    } else if latency_ns < 1_000_000_000 {
        format!("{:.2}ms", latency_ns as f64 / 1_000_000.0)
    } else {
        format!("{:.2}s", latency_ns as f64 / 1_000_000_000.0)
    }
}
