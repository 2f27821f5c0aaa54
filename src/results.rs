use crate::{
    cli::Scenario,
    exchange::DrainTally,
    metrics::{format_latency, PerformanceMetrics},
    scenario::ScenarioConfig,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique identifier for a scenario run.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Everything recorded about one scenario run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResults {
    pub run_id: String,
    pub scenario: Scenario,
    pub config: ScenarioConfig,
    /// Round-trip latency, throughput and outcome counters.
    pub metrics: Option<PerformanceMetrics>,
    /// Drain and validate counts.
    pub drain: Option<DrainTally>,
    /// Messages put on the drained queue before draining.
    pub preloaded: usize,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub test_duration: Duration,
    pub system_info: SystemInfo,
}

/// Environment the run executed in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub crate_version: String,
    pub transport: String,
    pub queue_manager: String,
}

impl SystemInfo {
    pub fn new(transport: &str, queue_manager: &str) -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            crate_version: crate::VERSION.to_string(),
            transport: transport.to_string(),
            queue_manager: queue_manager.to_string(),
        }
    }
}

impl ScenarioResults {
    pub fn new(config: &ScenarioConfig, system_info: SystemInfo) -> Self {
        let now = chrono::Utc::now();
        Self {
            run_id: generate_run_id(),
            scenario: config.scenario,
            config: config.clone(),
            metrics: None,
            drain: None,
            preloaded: 0,
            started_at: now,
            finished_at: now,
            test_duration: Duration::ZERO,
            system_info,
        }
    }

    /// Stamp the end of the run.
    pub fn finish(&mut self, elapsed: Duration) {
        self.finished_at = chrono::Utc::now();
        self.test_duration = elapsed;
    }

    /// Exchanges (round trip) or messages (drain) processed by the run.
    pub fn total_processed(&self) -> usize {
        let exchanges = self.metrics.as_ref().map_or(0, |m| m.outcomes.total());
        let drained = self.drain.map_or(0, |tally| tally.consumed);
        exchanges + drained
    }

    pub fn error_count(&self) -> usize {
        self.metrics.as_ref().map_or(0, |m| m.outcomes.errors())
    }

    /// Log a human-readable summary.
    pub fn log_summary(&self) {
        info!(
            "{} scenario {} finished in {:.2?}",
            self.scenario, self.run_id, self.test_duration
        );
        if let Some(metrics) = &self.metrics {
            let outcomes = &metrics.outcomes;
            info!(
                "Exchanges: {} matched, {} timed out, {} mismatched, {} failed ({:.1}/s)",
                outcomes.matched,
                outcomes.timed_out,
                outcomes.mismatched,
                outcomes.failed,
                metrics.throughput.exchanges_per_second
            );
            if let Some(latency) = &metrics.latency {
                let percentiles = latency
                    .percentiles
                    .iter()
                    .map(|p| format!("p{}={}", p.percentile, format_latency(p.value_ns)))
                    .collect::<Vec<_>>()
                    .join(" ");
                info!(
                    "Latency: min={} mean={} max={} {}",
                    format_latency(latency.min_ns),
                    format_latency(latency.mean_ns as u64),
                    format_latency(latency.max_ns),
                    percentiles
                );
            }
        }
        if let Some(tally) = &self.drain {
            info!(
                "Drained {} message(s) from '{}' ({} preloaded): {} matched, {} unmatched",
                tally.consumed, self.config.queue, self.preloaded, tally.matched, tally.unmatched
            );
        }
    }
}

/// Final document written to the output file
#[derive(Debug, Serialize)]
pub struct FinalResults {
    pub metadata: ResultsMetadata,
    pub results: Vec<ScenarioResults>,
    pub summary: OverallSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultsMetadata {
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub total_runs: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct OverallSummary {
    pub total_processed: usize,
    pub total_errors: usize,
    pub total_matched: usize,
    pub total_unmatched: usize,
}

/// Collects scenario results and writes them out as JSON
pub struct ResultsManager {
    output_file: PathBuf,
    results: Vec<ScenarioResults>,
}

impl ResultsManager {
    pub fn new(output_file: &Path) -> Result<Self> {
        Ok(Self {
            output_file: output_file.to_path_buf(),
            results: Vec::new(),
        })
    }

    pub fn add_results(&mut self, results: ScenarioResults) {
        debug!("Adding results for {} run {}", results.scenario, results.run_id);
        self.results.push(results);
    }

    pub fn results(&self) -> &[ScenarioResults] {
        &self.results
    }

    fn summarize(&self) -> OverallSummary {
        self.results
            .iter()
            .fold(OverallSummary::default(), |mut summary, run| {
                summary.total_processed += run.total_processed();
                summary.total_errors += run.error_count();
                if let Some(metrics) = &run.metrics {
                    summary.total_matched += metrics.outcomes.matched;
                }
                if let Some(tally) = &run.drain {
                    summary.total_matched += tally.matched;
                    summary.total_unmatched += tally.unmatched;
                }
                summary
            })
    }

    /// Write every collected run to the output file as pretty JSON.
    pub fn finalize(&self) -> Result<()> {
        let document = FinalResults {
            metadata: ResultsMetadata {
                version: crate::VERSION.to_string(),
                timestamp: chrono::Utc::now(),
                total_runs: self.results.len(),
            },
            results: self.results.clone(),
            summary: self.summarize(),
        };

        let file = File::create(&self.output_file)
            .with_context(|| format!("Failed to create results file {:?}", self.output_file))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &document)
            .context("Failed to serialize results")?;
        writeln!(writer)?;
        writer.flush()?;

        info!("Results written to {:?}", self.output_file);
        Ok(())
    }
}
