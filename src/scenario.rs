//! # Scenario Runner
//!
//! Drives an [`ExchangeClient`] the way scripted load tests do.
//!
//! ## Scenarios
//!
//! - **round-trip**: `concurrency` workers each run send-then-receive
//!   exchanges, for a fixed number of iterations or for a duration. Every
//!   exchange is timed and classified as matched, timed out, mismatched or
//!   failed. The first failure aborts the run unless `continue_on_error` is
//!   set.
//! - **drain**: optionally preload the queue, then consume it and report how
//!   many messages were removed.
//! - **validate**: like drain, but every message is checked against an
//!   XPath filter/target rule.
//!
//! Workers are independent tokio tasks sharing one client. Their sends
//! serialise on the client's outbound queue cache; receives run on their own
//! connections.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::cli::{Args, Scenario};
use crate::deadline::Deadline;
use crate::error::ExchangeError;
use crate::exchange::{validate_queue_name, DrainTally, ExchangeClient, ReplyOutcome, SendRequest};
use crate::metrics::{ExchangeOutcome, MetricsCollector};
use crate::results::{ScenarioResults, SystemInfo};
use crate::transport::MessageProperties;
use crate::validation::{MessagePredicate, PathError, XPathRule};

/// Path rule applied by the validate scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleConfig {
    pub filter_xpath: String,
    pub filter_value: String,
    pub xpath: String,
    pub value: String,
}

impl RuleConfig {
    pub fn compile(&self) -> Result<XPathRule, PathError> {
        XPathRule::new(&self.filter_xpath, &self.filter_value, &self.xpath, &self.value)
    }
}

/// Parameters of one scenario run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioConfig {
    pub scenario: Scenario,
    pub source_queue: String,
    pub reply_queue: String,
    pub message: String,
    pub properties: MessageProperties,
    pub simulate_reply: bool,
    /// Reply body each exchange must receive; empty accepts any reply.
    pub expected_reply: String,
    /// Exchanges per worker. `None` when running for a duration.
    pub iterations: Option<usize>,
    pub duration: Option<Duration>,
    pub concurrency: usize,
    pub continue_on_error: bool,
    /// Deadline applied to each exchange.
    pub timeout: Option<Duration>,
    /// Queue consumed by drain and validate.
    pub queue: String,
    pub preload: usize,
    pub rule: Option<RuleConfig>,
    pub percentiles: Vec<f64>,
}

impl ScenarioConfig {
    /// Single-worker round trip with default settings.
    pub fn round_trip(source_queue: &str, reply_queue: &str, message: &str) -> Self {
        Self {
            scenario: Scenario::RoundTrip,
            source_queue: source_queue.to_string(),
            reply_queue: reply_queue.to_string(),
            message: message.to_string(),
            properties: MessageProperties::new(),
            simulate_reply: false,
            expected_reply: String::new(),
            iterations: Some(crate::defaults::ITERATIONS),
            duration: None,
            concurrency: crate::defaults::CONCURRENCY,
            continue_on_error: false,
            timeout: None,
            queue: crate::defaults::DRAIN_QUEUE.to_string(),
            preload: 0,
            rule: None,
            percentiles: vec![50.0, 95.0, 99.0, 99.9],
        }
    }

    /// Drain of `queue`, validating against `rule` when one is given.
    pub fn drain(queue: &str, rule: Option<RuleConfig>) -> Self {
        let scenario = if rule.is_some() {
            Scenario::Validate
        } else {
            Scenario::Drain
        };
        Self {
            scenario,
            queue: queue.to_string(),
            rule,
            ..Self::round_trip(
                crate::defaults::SOURCE_QUEUE,
                crate::defaults::REPLY_QUEUE,
                crate::defaults::MESSAGE,
            )
        }
    }

    /// Build and validate a configuration from command-line arguments.
    ///
    /// ## Errors
    /// - zero concurrency or zero iterations without a duration
    /// - an invalid queue name for the selected scenario
    /// - a validate scenario without `--xpath`, or with an unparsable path
    /// - a percentile outside `0..=100`
    pub fn from_args(args: &Args) -> Result<Self> {
        if args.concurrency == 0 {
            bail!("Concurrency must be at least 1");
        }
        if args.duration.is_none() && args.iterations == 0 {
            bail!("Iterations must be at least 1 when no duration is given");
        }
        if let Some(p) = args.percentiles.iter().find(|p| !(0.0..=100.0).contains(*p)) {
            bail!("Percentile {} is outside 0-100", p);
        }

        let rule = match (args.scenario, &args.xpath) {
            (Scenario::Validate, Some(xpath)) => Some(RuleConfig {
                filter_xpath: args.filter_xpath.clone(),
                filter_value: args.filter_value.clone(),
                xpath: xpath.clone(),
                value: args.value.clone(),
            }),
            (Scenario::Validate, None) => bail!("The validate scenario requires --xpath"),
            _ => None,
        };
        if let Some(rule) = &rule {
            rule.compile().context("Invalid validation rule")?;
        }

        let config = Self {
            scenario: args.scenario,
            source_queue: args.source_queue.clone(),
            reply_queue: args.reply_queue.clone(),
            message: args.message.clone(),
            properties: args.properties.iter().cloned().collect(),
            simulate_reply: args.simulate_reply,
            expected_reply: args.expected_reply.clone(),
            // Duration takes precedence over iterations
            iterations: if args.duration.is_some() {
                None
            } else {
                Some(args.iterations)
            },
            duration: args.duration,
            concurrency: args.concurrency,
            continue_on_error: args.continue_on_error,
            timeout: args.timeout,
            queue: args.queue.clone(),
            preload: args.preload,
            rule,
            percentiles: args.percentiles.clone(),
        };
        config.validate_queues()?;
        Ok(config)
    }

    fn validate_queues(&self) -> Result<()> {
        let queues: Vec<&str> = match self.scenario {
            Scenario::RoundTrip => vec![self.source_queue.as_str(), self.reply_queue.as_str()],
            Scenario::Drain | Scenario::Validate => {
                vec![self.queue.as_str(), self.reply_queue.as_str()]
            }
        };
        for queue in queues {
            validate_queue_name(queue)?;
        }
        Ok(())
    }

    fn deadline(&self) -> Deadline {
        self.timeout.map_or_else(Deadline::none, Deadline::after)
    }

    fn keep_going(&self, completed: usize, started: Instant) -> bool {
        match (self.duration, self.iterations) {
            (Some(duration), _) => started.elapsed() < duration,
            (None, Some(iterations)) => completed < iterations,
            (None, None) => false,
        }
    }
}

/// Runs one configured scenario against a shared client
pub struct ScenarioRunner {
    client: Arc<ExchangeClient>,
    config: Arc<ScenarioConfig>,
}

impl ScenarioRunner {
    pub fn new(client: Arc<ExchangeClient>, config: ScenarioConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// Execute the scenario and collect its results.
    ///
    /// ## Errors
    /// A failed exchange (unless `continue_on_error`), a failed preload, or a
    /// failed drain. Drain failures carry a [`DrainError`](crate::DrainError)
    /// with the partial tally, reachable through `downcast_ref`.
    pub async fn run(&self) -> Result<ScenarioResults> {
        let system_info = SystemInfo::new(
            self.client.transport_name(),
            &self.client.descriptor().queue_manager,
        );
        let mut results = ScenarioResults::new(&self.config, system_info);
        let started = Instant::now();
        info!("Running {} scenario (run {})", self.config.scenario, results.run_id);

        match self.config.scenario {
            Scenario::RoundTrip => {
                let metrics = self.run_round_trip().await?;
                results.metrics = Some(metrics.get_metrics(&self.config.percentiles));
            }
            Scenario::Drain | Scenario::Validate => {
                results.preloaded = self.preload().await?;
                results.drain = Some(self.run_drain().await?);
            }
        }

        results.finish(started.elapsed());
        Ok(results)
    }

    async fn run_round_trip(&self) -> Result<MetricsCollector> {
        let handles: Vec<_> = (0..self.config.concurrency)
            .map(|worker_id| {
                let client = Arc::clone(&self.client);
                let config = Arc::clone(&self.config);
                tokio::spawn(run_worker(client, config, worker_id))
            })
            .collect();

        let mut workers = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.await.context("Round-trip worker panicked")? {
                Ok(metrics) => workers.push(metrics),
                Err(e) => {
                    error!("{:#}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        MetricsCollector::aggregate(workers)
    }

    /// Put `preload` copies of the message on the drained queue.
    async fn preload(&self) -> Result<usize> {
        let config = &self.config;
        for i in 0..config.preload {
            let request = SendRequest::new(&config.queue, &config.reply_queue, config.message.as_str())
                .with_properties(config.properties.clone());
            self.client
                .send(request, config.deadline())
                .await
                .with_context(|| format!("Failed to preload message {} onto '{}'", i + 1, config.queue))?;
        }
        if config.preload > 0 {
            info!("Preloaded {} message(s) onto '{}'", config.preload, config.queue);
        }
        Ok(config.preload)
    }

    async fn run_drain(&self) -> Result<DrainTally> {
        let rule = self
            .config
            .rule
            .as_ref()
            .map(RuleConfig::compile)
            .transpose()
            .context("Invalid validation rule")?;
        let predicate = rule.as_ref().map(|rule| rule as &dyn MessagePredicate);

        match self
            .client
            .drain(&self.config.queue, predicate, Deadline::none())
            .await
        {
            Ok(tally) => Ok(tally),
            Err(e) => {
                warn!(
                    "Drain of '{}' stopped early: consumed {}, matched {}, unmatched {}",
                    e.queue, e.tally.consumed, e.tally.matched, e.tally.unmatched
                );
                Err(e.into())
            }
        }
    }
}

/// Send one request and wait for its reply.
async fn exchange_once(
    client: &ExchangeClient,
    config: &ScenarioConfig,
) -> Result<ReplyOutcome, ExchangeError> {
    let deadline = config.deadline();
    let request = SendRequest::new(
        &config.source_queue,
        &config.reply_queue,
        config.message.as_str(),
    )
    .with_properties(config.properties.clone())
    .with_simulated_reply(config.simulate_reply);

    let sent = client.send(request, deadline).await?;
    client
        .receive(&config.reply_queue, &sent.hex(), &config.expected_reply, deadline)
        .await
}

async fn run_worker(
    client: Arc<ExchangeClient>,
    config: Arc<ScenarioConfig>,
    worker_id: usize,
) -> Result<MetricsCollector> {
    let mut metrics = MetricsCollector::new()?;
    let started = Instant::now();
    let mut completed = 0;

    while config.keep_going(completed, started) {
        let exchange_start = Instant::now();
        let result = exchange_once(&client, &config).await;
        let latency = exchange_start.elapsed();

        let outcome = ExchangeOutcome::classify(&result);
        metrics.record_exchange(outcome, config.message.len(), latency)?;
        completed += 1;

        if let Err(e) = result {
            if !config.continue_on_error {
                return Err(anyhow::Error::new(e).context(format!(
                    "Worker {} exchange {} failed",
                    worker_id, completed
                )));
            }
            warn!(
                "Worker {} exchange {} failed (status {}): {}",
                worker_id,
                completed,
                e.status_code(),
                e
            );
        }
    }

    debug!("Worker {} finished {} exchange(s)", worker_id, completed);
    Ok(metrics)
}
