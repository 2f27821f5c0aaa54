//! # MQ Exchange Library
//!
//! A correlation-based request/reply engine for message-queue backends,
//! plus the scenario runner used to drive it as a load test.
//!
//! ## Architecture Overview
//!
//! - `transport`: the [`QueueTransport`] trait every backend implements, the
//!   message model, and the in-process [`LoopbackQueueManager`]
//! - `connection`: connect/disconnect with bounded retry of transient TLS
//!   initialization failures
//! - `queue_cache`: the lock-guarded outbound handle shared by sends
//! - `exchange`: [`ExchangeClient`] with send, receive, simulated reply and
//!   drain
//! - `validation`: predicates applied while draining, including the XPath
//!   filter/target rule
//! - `metrics`, `results`, `scenario`: load-test execution and reporting
//! - `cli`, `logging`: command-line configuration and log output
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use mq_exchange::{
//!     ConnectionDescriptor, Deadline, ExchangeClient, ExchangeConfig, LoopbackQueueManager,
//!     SendRequest,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let qm = LoopbackQueueManager::with_queues("QM1", ["DEV.QUEUE.1", "DEV.QUEUE.2"]);
//!     let descriptor = ConnectionDescriptor::new("QM1", "localhost", 1414, "DEV.APP.SVRCONN");
//!     let client =
//!         ExchangeClient::connect(Arc::new(qm), descriptor, ExchangeConfig::default(), Deadline::none())
//!             .await?;
//!
//!     let request = SendRequest::new("DEV.QUEUE.1", "DEV.QUEUE.2", "<Ping/>")
//!         .with_simulated_reply(true);
//!     let sent = client.send(request, Deadline::none()).await?;
//!     let outcome = client
//!         .receive("DEV.QUEUE.2", &sent.hex(), "Reply Message", Deadline::none())
//!         .await?;
//!     assert!(outcome.is_matched());
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Command-line interface and configuration
pub mod cli;

/// Connection lifecycle and retry policy
pub mod connection;

pub mod deadline;
pub mod descriptor;
pub mod error;

/// Request/reply operations and the drain loop
pub mod exchange;

pub mod logging;

/// Latency histograms and outcome counters
pub mod metrics;

pub mod queue_cache;

/// Result records and JSON output
pub mod results;

/// Scenario execution
pub mod scenario;

/// Queue transport abstraction and the loopback queue manager
pub mod transport;

pub mod validation;

pub use connection::{ConnectionManager, RetryPolicy};
pub use deadline::Deadline;
pub use descriptor::ConnectionDescriptor;
pub use error::{DrainError, ExchangeError, ReasonCode, TransportError};
pub use exchange::{
    DrainTally, ExchangeClient, ExchangeConfig, ReplyOutcome, SendRequest, SentRequest,
};
pub use transport::{LoopbackQueueManager, MessageId, PropertyValue, QueueTransport};
pub use validation::{MessagePredicate, XPathRule};

/// The current version of the crate, recorded in scenario results.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// How long a get waits for a message.
    pub const WAIT_INTERVAL: Duration = Duration::from_millis(3000);

    /// Largest reply body accepted by a receive.
    pub const RECEIVE_BUFFER_SIZE: usize = 1024;

    /// Largest message body accepted while draining.
    pub const DRAIN_BUFFER_SIZE: usize = 65536;

    /// Body of simulated replies.
    pub const SIMULATED_REPLY_BODY: &str = "Reply Message";

    /// Application name reported to the queue manager.
    pub const APPLICATION_NAME: &str = "mq-exchange";

    /// Connect attempts, including the first, before transient TLS
    /// initialization failures are given up on.
    pub const CONNECT_ATTEMPTS: u32 = 10;

    pub const ITERATIONS: usize = 100;

    pub const CONCURRENCY: usize = 1;

    pub const OUTPUT_FILE: &str = "exchange_results.json";

    pub const SOURCE_QUEUE: &str = "DEV.QUEUE.1";

    pub const REPLY_QUEUE: &str = "DEV.QUEUE.2";

    pub const DRAIN_QUEUE: &str = "DEV.QUEUE.3";

    pub const MESSAGE: &str = "<Message><Id>1</Id><Body>Hello</Body></Message>";
}
