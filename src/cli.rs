use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::connection::RetryPolicy;
use crate::descriptor::ConnectionDescriptor;
use crate::exchange::ExchangeConfig;
use crate::transport::PropertyValue;

/// MQ Exchange - request/reply and drain scenarios against a queue manager
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Scenario to run
    #[clap(short = 'S', long, value_enum, default_value_t = Scenario::RoundTrip, help_heading = "Core Options")]
    pub scenario: Scenario,

    /// Number of exchanges per worker (ignored if duration is specified)
    #[clap(short = 'i', long, default_value_t = crate::defaults::ITERATIONS, help_heading = "Core Options")]
    pub iterations: usize,

    /// Duration to run round-trip workers (takes precedence over iterations)
    #[clap(short = 'd', long, value_parser = parse_duration, help_heading = "Core Options")]
    pub duration: Option<Duration>,

    /// Number of concurrent round-trip workers
    #[clap(short = 'c', long, default_value_t = crate::defaults::CONCURRENCY, help_heading = "Core Options")]
    pub concurrency: usize,

    /// Output file for results (JSON format)
    #[clap(short = 'o', long, default_value = crate::defaults::OUTPUT_FILE, help_heading = "Core Options")]
    pub output_file: PathBuf,

    /// Keep a worker running after a failed exchange
    #[clap(long, default_value_t = false, help_heading = "Core Options")]
    pub continue_on_error: bool,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,

    /// Write plain log output to this file instead of the terminal
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Queue manager name
    #[clap(long, env = "MQ_QMGR", help_heading = "Connection")]
    pub queue_manager: String,

    /// Queue manager host
    #[clap(long, env = "MQ_HOST", help_heading = "Connection")]
    pub host: String,

    /// Queue manager listener port
    #[clap(long, env = "MQ_PORT", help_heading = "Connection")]
    pub port: u16,

    /// Server-connection channel
    #[clap(long, env = "MQ_CHANNEL", help_heading = "Connection")]
    pub channel: String,

    /// User id; empty to connect without credentials
    #[clap(long, env = "MQ_USERID", help_heading = "Connection")]
    pub user_id: String,

    #[clap(long, env = "MQ_PASSWORD", hide_env_values = true, help_heading = "Connection")]
    pub password: String,

    /// Key repository enabling TLS
    #[clap(long, env = "MQ_TLS_KEYSTORE", help_heading = "Connection")]
    pub tls_keystore: Option<PathBuf>,

    /// Application name reported to the queue manager
    #[clap(long, default_value = crate::defaults::APPLICATION_NAME, help_heading = "Connection")]
    pub app_name: String,

    /// Transient connect failures tolerated before giving up
    #[clap(long, default_value_t = crate::defaults::CONNECT_ATTEMPTS, help_heading = "Connection")]
    pub connect_attempts: u32,

    /// Queue requests are put on
    #[clap(long, default_value = crate::defaults::SOURCE_QUEUE, help_heading = "Exchange")]
    pub source_queue: String,

    /// Queue replies are expected on
    #[clap(long, default_value = crate::defaults::REPLY_QUEUE, help_heading = "Exchange")]
    pub reply_queue: String,

    /// Request body
    #[clap(short = 'm', long, default_value = crate::defaults::MESSAGE, help_heading = "Exchange")]
    pub message: String,

    /// Message property attached to every request (repeatable)
    #[clap(short = 'p', long = "property", value_parser = parse_property, help_heading = "Exchange")]
    pub properties: Vec<(String, PropertyValue)>,

    /// Answer each request with a simulated reply
    #[clap(long, default_value_t = false, help_heading = "Exchange")]
    pub simulate_reply: bool,

    /// Reply body every exchange must receive; empty accepts any reply
    #[clap(long, default_value = "", help_heading = "Exchange")]
    pub expected_reply: String,

    /// How long each get waits for a message
    #[clap(long, value_parser = parse_duration, default_value = "3s", help_heading = "Exchange")]
    pub wait_interval: Duration,

    /// Deadline for each individual exchange
    #[clap(long, value_parser = parse_duration, help_heading = "Exchange")]
    pub timeout: Option<Duration>,

    /// Queue consumed by drain and validate scenarios
    #[clap(short = 'q', long, default_value = crate::defaults::DRAIN_QUEUE, help_heading = "Drain")]
    pub queue: String,

    /// Put this many copies of the message on the drained queue first
    #[clap(long, default_value_t = 0, help_heading = "Drain")]
    pub preload: usize,

    /// Path selecting the node that decides whether a message is checked
    #[clap(long, default_value = "", help_heading = "Drain")]
    pub filter_xpath: String,

    /// Text the filter node must contain for the message to be checked
    #[clap(long, default_value = "", help_heading = "Drain")]
    pub filter_value: String,

    /// Path selecting the node whose text is checked
    #[clap(long, help_heading = "Drain")]
    pub xpath: Option<String>,

    /// Expected text of the checked node
    #[clap(long, default_value = "", help_heading = "Drain")]
    pub value: String,

    /// Percentiles to calculate for exchange latency
    #[clap(long, default_values_t = vec![50.0, 95.0, 99.0, 99.9])]
    pub percentiles: Vec<f64>,
}

impl Args {
    /// Connection descriptor built from the connection options.
    pub fn connection_descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor::new(&self.queue_manager, &self.host, self.port, &self.channel)
            .with_credentials(&self.user_id, &self.password)
            .with_tls_keystore(self.tls_keystore.clone())
            .with_application_name(&self.app_name)
    }

    /// Exchange tunables; buffer sizes and the reply body keep their
    /// defaults.
    pub fn exchange_config(&self) -> ExchangeConfig {
        ExchangeConfig {
            wait_interval: self.wait_interval,
            retry: RetryPolicy {
                max_attempts: self.connect_attempts.max(1),
                ..RetryPolicy::default()
            },
            ..ExchangeConfig::default()
        }
    }
}

/// Available scenarios
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Send requests and wait for correlated replies
    #[clap(name = "round-trip")]
    RoundTrip,

    /// Consume a queue and count what was removed
    #[clap(name = "drain")]
    Drain,

    /// Consume a queue and check every message against a path rule
    #[clap(name = "validate")]
    Validate,
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scenario::RoundTrip => write!(f, "Round Trip"),
            Scenario::Drain => write!(f, "Drain"),
            Scenario::Validate => write!(f, "Validate"),
        }
    }
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a positive number: {}", num_str));
    }

    let seconds = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(seconds).map_err(|e| format!("Duration out of range: {} ({})", s, e))
}

/// Parse a `KEY=VALUE` message property.
///
/// The value type is inferred: `true`/`false` become booleans, integers and
/// floats become numbers, a `0x` prefix marks hex-encoded bytes, and
/// anything else is a string.
pub fn parse_property(s: &str) -> Result<(String, PropertyValue), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("Property must be KEY=VALUE: {}", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Property name cannot be empty: {}", s));
    }

    let value = if let Ok(flag) = raw.parse::<bool>() {
        PropertyValue::Bool(flag)
    } else if let Ok(int) = raw.parse::<i64>() {
        PropertyValue::Int(int)
    } else if let Ok(float) = raw.parse::<f64>() {
        PropertyValue::Float(float)
    } else if let Some(encoded) = raw.strip_prefix("0x") {
        let bytes =
            hex::decode(encoded).map_err(|e| format!("Invalid hex bytes in '{}': {}", s, e))?;
        PropertyValue::Bytes(bytes)
    } else {
        PropertyValue::String(raw.to_string())
    };

    Ok((key.to_string(), value))
}
