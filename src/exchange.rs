//! # Message Exchange Engine
//!
//! [`ExchangeClient`] implements the request/reply operations on top of a
//! [`QueueTransport`]:
//!
//! - **send**: put a request on a source queue through the shared outbound
//!   handle, stamped with a reply destination and optional properties
//! - **receive**: wait for the reply whose correlation id matches a previous
//!   send, optionally checking its body
//! - **simulate_reply**: act as the responder for one waiting request, so
//!   scenarios run without an external consumer
//! - **drain**: consume a queue until it is empty, optionally judging every
//!   message with a [`MessagePredicate`]
//!
//! ## Connection policy
//!
//! | Operation | Connection | Queue handle |
//! |---|---|---|
//! | send | long-lived client connection | cached output handle |
//! | receive | fresh per call | input-shared, closed before return |
//! | simulate_reply | fresh per call | input-shared plus output, closed before return |
//! | drain | fresh per call | input-exclusive, closed before return |
//!
//! Per-call connections and handles are released on every exit path,
//! including failures.
//!
//! ## Exchange states
//!
//! `send` leaves a request in the SENT state and returns its reply key.
//! `receive` then ends in one of [`ReplyOutcome::Matched`],
//! [`ReplyOutcome::TimedOut`] (both status 0) or a content-mismatch error
//! (status 2). Any other put or get failure is an infrastructure error
//! (status 1).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionManager, LiveConnection, RetryPolicy};
use crate::deadline::Deadline;
use crate::descriptor::ConnectionDescriptor;
use crate::error::{DrainError, ExchangeError, Operation};
use crate::queue_cache::OutboundQueueCache;
use crate::transport::{
    CorrelationId, GetOptions, MatchCriteria, MessageDescriptor, MessageId, MessageProperties,
    OpenMode, PropertyHandle, PutOptions, QueueHandle, QueueTransport, ReceivedMessage,
    FORMAT_STRING,
};
use crate::validation::MessagePredicate;

/// Longest queue name a queue manager accepts.
pub const MAX_QUEUE_NAME_LENGTH: usize = 48;

/// Tunables for an [`ExchangeClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeConfig {
    /// How long a get waits for a message before reporting "no message".
    pub wait_interval: Duration,
    /// Largest reply body `receive` accepts.
    pub receive_buffer_size: usize,
    /// Largest message body `drain` accepts.
    pub drain_buffer_size: usize,
    /// Body of replies produced by `simulate_reply`.
    pub simulated_reply_body: String,
    pub retry: RetryPolicy,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            wait_interval: crate::defaults::WAIT_INTERVAL,
            receive_buffer_size: crate::defaults::RECEIVE_BUFFER_SIZE,
            drain_buffer_size: crate::defaults::DRAIN_BUFFER_SIZE,
            simulated_reply_body: crate::defaults::SIMULATED_REPLY_BODY.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// A request to put on a source queue.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub source_queue: String,
    pub reply_queue: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Answer the request with [`ExchangeClient::simulate_reply`] right
    /// after it is put.
    pub simulate_reply: bool,
}

impl SendRequest {
    pub fn new(
        source_queue: impl Into<String>,
        reply_queue: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            source_queue: source_queue.into(),
            reply_queue: reply_queue.into(),
            body: body.into(),
            properties: MessageProperties::new(),
            simulate_reply: false,
        }
    }

    pub fn with_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<crate::transport::PropertyValue>,
    ) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn with_simulated_reply(mut self, simulate: bool) -> Self {
        self.simulate_reply = simulate;
        self
    }
}

/// Identifiers the queue manager generated for a sent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentRequest {
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
}

impl SentRequest {
    /// Identifier a reply to this request carries as its correlation id.
    ///
    /// Responders copy the request's message id into the reply's
    /// correlation id, so this is the key `receive` matches on.
    pub fn reply_key(&self) -> CorrelationId {
        self.message_id
    }

    /// Hex form of [`reply_key`](Self::reply_key), as handed to callers.
    pub fn hex(&self) -> String {
        self.reply_key().to_hex()
    }
}

/// Successful end states of a receive.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    /// A reply with the requested correlation id arrived.
    Matched(ReceivedMessage),
    /// The wait interval elapsed with no matching reply.
    TimedOut,
}

impl ReplyOutcome {
    /// Both outcomes report status 0.
    pub fn status_code(&self) -> i32 {
        0
    }

    pub fn is_matched(&self) -> bool {
        matches!(self, ReplyOutcome::Matched(_))
    }

    pub fn message(&self) -> Option<&ReceivedMessage> {
        match self {
            ReplyOutcome::Matched(message) => Some(message),
            ReplyOutcome::TimedOut => None,
        }
    }
}

/// Counts gathered by a drain.
///
/// `consumed` counts every message taken off the queue. With a predicate,
/// each message also lands in exactly one of `matched` or `unmatched`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainTally {
    pub consumed: usize,
    pub matched: usize,
    pub unmatched: usize,
}

impl DrainTally {
    fn record(&mut self, verdict: Option<bool>) {
        self.consumed += 1;
        match verdict {
            Some(true) => self.matched += 1,
            Some(false) => self.unmatched += 1,
            None => {}
        }
    }
}

/// Check a queue name before handing it to the transport.
pub fn validate_queue_name(name: &str) -> Result<(), ExchangeError> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '/' | '_' | '%');
    if name.is_empty() || name.len() > MAX_QUEUE_NAME_LENGTH || !name.chars().all(valid_char) {
        return Err(ExchangeError::InvalidQueueName(name.to_string()));
    }
    Ok(())
}

/// Request/reply client bound to one queue manager.
///
/// Safe to share between tasks (`Arc<ExchangeClient>`). Sends from
/// concurrent tasks serialise on the outbound queue cache; receives and
/// drains run on their own connections.
pub struct ExchangeClient {
    transport: Arc<dyn QueueTransport>,
    connections: ConnectionManager,
    session: RwLock<Option<LiveConnection>>,
    outbound: OutboundQueueCache,
    config: ExchangeConfig,
}

impl ExchangeClient {
    /// Validate the descriptor with a probe connection, then open the
    /// long-lived connection used by sends.
    ///
    /// ## Errors
    /// Any connection error from the probe or the long-lived connect.
    pub async fn connect(
        transport: Arc<dyn QueueTransport>,
        descriptor: ConnectionDescriptor,
        config: ExchangeConfig,
        deadline: Deadline,
    ) -> Result<Self, ExchangeError> {
        let connections =
            ConnectionManager::new(Arc::clone(&transport), descriptor, config.retry.clone());
        connections.probe(deadline).await?;
        let session = connections.connect(deadline).await?;
        info!(
            "Exchange client connected to {} over {} transport",
            connections.descriptor(),
            transport.name()
        );

        Ok(Self {
            transport,
            connections,
            session: RwLock::new(Some(session)),
            outbound: OutboundQueueCache::new(),
            config,
        })
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        self.connections.descriptor()
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Queue currently held open by the outbound cache.
    pub async fn outbound_queue(&self) -> Option<String> {
        self.outbound.cached_queue().await
    }

    pub async fn is_closed(&self) -> bool {
        self.session.read().await.is_none()
    }

    /// Put a request on its source queue.
    ///
    /// Properties, if any, are attached through a property handle that is
    /// released once the put completes, whether it succeeded or not. When
    /// the request asks for it, a simulated reply is produced before
    /// returning.
    ///
    /// ## Returns
    /// The generated identifiers. [`SentRequest::hex`] is the key to pass to
    /// [`receive`](Self::receive).
    ///
    /// ## Errors
    /// - [`ExchangeError::Property`] if a property cannot be set
    /// - [`ExchangeError::Queue`] if the open or put fails
    /// - [`ExchangeError::Closed`] after [`shutdown`](Self::shutdown)
    pub async fn send(
        &self,
        request: SendRequest,
        deadline: Deadline,
    ) -> Result<SentRequest, ExchangeError> {
        validate_queue_name(&request.source_queue)?;
        validate_queue_name(&request.reply_queue)?;
        if deadline.is_expired() {
            return Err(ExchangeError::DeadlineExceeded {
                operation: Operation::Put,
            });
        }

        let sent = {
            let session = self.session.read().await;
            let connection = session.as_ref().ok_or(ExchangeError::Closed)?;

            let properties = self.build_properties(connection, &request.properties).await?;
            let mut descriptor = MessageDescriptor {
                format: FORMAT_STRING.to_string(),
                reply_to_queue: request.reply_queue.clone(),
                ..Default::default()
            };
            let put = self
                .outbound
                .put(
                    self.transport.as_ref(),
                    connection,
                    &request.source_queue,
                    &mut descriptor,
                    &PutOptions::request(),
                    properties.as_ref(),
                    &request.body,
                )
                .await;
            if let Some(handle) = properties {
                self.release_properties(handle).await;
            }
            put?;

            SentRequest {
                message_id: descriptor.message_id,
                correlation_id: descriptor.correlation_id,
            }
        };
        debug!(
            "Sent request {} to '{}' (reply to '{}')",
            sent.hex(),
            request.source_queue,
            request.reply_queue
        );

        if request.simulate_reply {
            self.simulate_reply(&request.source_queue, deadline).await?;
        }
        Ok(sent)
    }

    async fn build_properties(
        &self,
        connection: &LiveConnection,
        properties: &MessageProperties,
    ) -> Result<Option<PropertyHandle>, ExchangeError> {
        if properties.is_empty() {
            return Ok(None);
        }

        let handle = self
            .transport
            .create_property_handle(connection.handle())
            .await
            .map_err(|source| ExchangeError::Transport {
                operation: Operation::CreatePropertyHandle,
                source,
            })?;
        for (name, value) in properties {
            if let Err(source) = self.transport.set_property(&handle, name, value).await {
                self.release_properties(handle).await;
                return Err(ExchangeError::Property {
                    operation: Operation::SetProperty,
                    property: name.clone(),
                    source,
                });
            }
        }
        Ok(Some(handle))
    }

    async fn release_properties(&self, handle: PropertyHandle) {
        let id = handle.id();
        if let Err(e) = self.transport.release_property_handle(handle).await {
            warn!("Failed to release property handle {}: {}", id, e);
        }
    }

    /// Wait for the reply correlated with `reply_key` on `reply_queue`.
    ///
    /// The wait is the configured wait interval, shortened to fit
    /// `deadline`. An empty `expected_body` accepts any reply.
    ///
    /// ## Errors
    /// - [`ExchangeError::ContentMismatch`] (status 2) if the reply body
    ///   differs from a non-empty `expected_body`
    /// - [`ExchangeError::InvalidCorrelationId`] if `reply_key` is not hex
    /// - connection, open and get failures (status 1)
    pub async fn receive(
        &self,
        reply_queue: &str,
        reply_key: &str,
        expected_body: &str,
        deadline: Deadline,
    ) -> Result<ReplyOutcome, ExchangeError> {
        self.ensure_open().await?;
        validate_queue_name(reply_queue)?;
        let correlation_id =
            MessageId::from_hex(reply_key).map_err(|e| ExchangeError::InvalidCorrelationId {
                value: reply_key.to_string(),
                reason: e.to_string(),
            })?;

        let connection = self.connections.connect(deadline).await?;
        let result = self
            .receive_on(&connection, reply_queue, correlation_id, expected_body, deadline)
            .await;
        self.connections.disconnect(connection).await;
        result
    }

    async fn receive_on(
        &self,
        connection: &LiveConnection,
        reply_queue: &str,
        correlation_id: CorrelationId,
        expected_body: &str,
        deadline: Deadline,
    ) -> Result<ReplyOutcome, ExchangeError> {
        let handle = self
            .open(connection, reply_queue, OpenMode::InputShared)
            .await?;
        let options = GetOptions {
            syncpoint: false,
            wait: deadline.clamp(self.config.wait_interval),
            matching: MatchCriteria::CorrelationId(correlation_id),
            max_message_length: self.config.receive_buffer_size,
        };
        let got = self.transport.get(&handle, &options).await;
        self.close(handle).await;

        let message = match got.map_err(|e| ExchangeError::queue(Operation::Get, reply_queue, e))? {
            Some(message) => message,
            None => {
                debug!(
                    "No reply for {} on '{}' within {:?}",
                    correlation_id, reply_queue, options.wait
                );
                return Ok(ReplyOutcome::TimedOut);
            }
        };

        if !expected_body.is_empty() && message.body != expected_body.as_bytes() {
            return Err(ExchangeError::ContentMismatch {
                expected: expected_body.to_string(),
                actual: message.body_text(),
            });
        }
        debug!("Matched reply {} on '{}'", correlation_id, reply_queue);
        Ok(ReplyOutcome::Matched(message))
    }

    /// Answer one request waiting on `send_queue`.
    ///
    /// Takes the next message from `send_queue` and puts the configured
    /// reply body on the message's reply destination, correlated by the
    /// request's message id.
    ///
    /// ## Returns
    /// The message id of the request that was answered, or `None` if no
    /// request arrived within the wait interval.
    ///
    /// ## Errors
    /// [`ExchangeError::MissingReplyQueue`] for a request without a reply
    /// destination, plus connection, open, get and put failures.
    pub async fn simulate_reply(
        &self,
        send_queue: &str,
        deadline: Deadline,
    ) -> Result<Option<MessageId>, ExchangeError> {
        self.ensure_open().await?;
        validate_queue_name(send_queue)?;

        let connection = self.connections.connect(deadline).await?;
        let result = self.simulate_reply_on(&connection, send_queue, deadline).await;
        self.connections.disconnect(connection).await;
        result
    }

    async fn simulate_reply_on(
        &self,
        connection: &LiveConnection,
        send_queue: &str,
        deadline: Deadline,
    ) -> Result<Option<MessageId>, ExchangeError> {
        let input = self
            .open(connection, send_queue, OpenMode::InputShared)
            .await?;
        let options = GetOptions {
            syncpoint: false,
            wait: deadline.clamp(self.config.wait_interval),
            matching: MatchCriteria::Any,
            max_message_length: self.config.receive_buffer_size,
        };
        let got = self.transport.get(&input, &options).await;
        self.close(input).await;

        let request = match got.map_err(|e| ExchangeError::queue(Operation::Get, send_queue, e))? {
            Some(request) => request,
            None => {
                debug!("No request waiting on '{}' to reply to", send_queue);
                return Ok(None);
            }
        };

        let reply_queue = request.descriptor.reply_to_queue.trim();
        if reply_queue.is_empty() {
            return Err(ExchangeError::MissingReplyQueue {
                queue: send_queue.to_string(),
            });
        }

        let output = self.open(connection, reply_queue, OpenMode::Output).await?;
        let mut descriptor = MessageDescriptor {
            correlation_id: request.descriptor.message_id,
            format: FORMAT_STRING.to_string(),
            ..Default::default()
        };
        let put = self
            .transport
            .put(
                &output,
                &mut descriptor,
                &PutOptions::reply(),
                None,
                self.config.simulated_reply_body.as_bytes(),
            )
            .await;
        self.close(output).await;
        put.map_err(|e| ExchangeError::queue(Operation::Put, reply_queue, e))?;

        debug!(
            "Simulated reply to {} on '{}'",
            request.descriptor.message_id, reply_queue
        );
        Ok(Some(request.descriptor.message_id))
    }

    /// Consume `queue` until it reports no message available.
    ///
    /// Without a predicate only `consumed` is counted. With one, every body
    /// is trimmed and judged, and lands in `matched` or `unmatched`. The
    /// queue is opened input-exclusive, so a second concurrent drain of the
    /// same queue fails to open.
    ///
    /// ## Errors
    /// A [`DrainError`] carrying the counts gathered before the failure.
    pub async fn drain(
        &self,
        queue: &str,
        predicate: Option<&dyn MessagePredicate>,
        deadline: Deadline,
    ) -> Result<DrainTally, DrainError> {
        let aborted = |source: ExchangeError, tally: DrainTally| DrainError {
            queue: queue.to_string(),
            tally,
            source,
        };

        self.ensure_open()
            .await
            .map_err(|e| aborted(e, DrainTally::default()))?;
        validate_queue_name(queue).map_err(|e| aborted(e, DrainTally::default()))?;
        let connection = self
            .connections
            .connect(deadline)
            .await
            .map_err(|e| aborted(e, DrainTally::default()))?;

        let mut tally = DrainTally::default();
        let result = self
            .drain_on(&connection, queue, predicate, deadline, &mut tally)
            .await;
        self.connections.disconnect(connection).await;

        match result {
            Ok(()) => {
                info!(
                    "Drained '{}': consumed {}, matched {}, unmatched {}",
                    queue, tally.consumed, tally.matched, tally.unmatched
                );
                Ok(tally)
            }
            Err(source) => Err(aborted(source, tally)),
        }
    }

    async fn drain_on(
        &self,
        connection: &LiveConnection,
        queue: &str,
        predicate: Option<&dyn MessagePredicate>,
        deadline: Deadline,
        tally: &mut DrainTally,
    ) -> Result<(), ExchangeError> {
        let handle = self.open(connection, queue, OpenMode::InputExclusive).await?;

        let result = loop {
            if deadline.is_expired() {
                break Err(ExchangeError::DeadlineExceeded {
                    operation: Operation::Get,
                });
            }
            let options = GetOptions {
                syncpoint: false,
                wait: deadline.clamp(self.config.wait_interval),
                matching: MatchCriteria::Any,
                max_message_length: self.config.drain_buffer_size,
            };
            match self.transport.get(&handle, &options).await {
                Ok(Some(message)) => {
                    let verdict = predicate.map(|p| p.evaluate(message.body_text().trim()));
                    tally.record(verdict);
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(ExchangeError::queue(Operation::Get, queue, e)),
            }
        };

        self.close(handle).await;
        result
    }

    /// Close the cached outbound handle and the long-lived connection.
    ///
    /// Later operations fail with [`ExchangeError::Closed`]. Calling it
    /// again is a no-op.
    pub async fn shutdown(&self) {
        let mut session = self.session.write().await;
        if let Some(connection) = session.take() {
            self.outbound.close(self.transport.as_ref()).await;
            self.connections.disconnect(connection).await;
            info!(
                "Exchange client for '{}' shut down",
                self.connections.descriptor().queue_manager
            );
        }
    }

    async fn ensure_open(&self) -> Result<(), ExchangeError> {
        if self.is_closed().await {
            Err(ExchangeError::Closed)
        } else {
            Ok(())
        }
    }

    async fn open(
        &self,
        connection: &LiveConnection,
        queue: &str,
        mode: OpenMode,
    ) -> Result<QueueHandle, ExchangeError> {
        self.transport
            .open_queue(connection.handle(), queue, mode)
            .await
            .map_err(|e| ExchangeError::queue(Operation::Open, queue, e))
    }

    async fn close(&self, handle: QueueHandle) {
        let name = handle.queue_name().to_string();
        if let Err(e) = self.transport.close_queue(handle).await {
            warn!("Failed to close queue '{}': {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReasonCode;
    use crate::transport::{LoopbackQueueManager, PropertyValue};

    const REQUESTS: &str = "DEV.QUEUE.1";
    const REPLIES: &str = "DEV.QUEUE.2";

    fn fast_config() -> ExchangeConfig {
        ExchangeConfig {
            wait_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    async fn client(qm: &LoopbackQueueManager) -> ExchangeClient {
        ExchangeClient::connect(
            Arc::new(qm.clone()),
            ConnectionDescriptor::new("QM1", "localhost", 1414, "DEV.APP.SVRCONN"),
            fast_config(),
            Deadline::none(),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_queue_name_rules() {
        assert!(validate_queue_name("DEV.QUEUE.1").is_ok());
        assert!(validate_queue_name("APP/IN_%1").is_ok());
        assert!(validate_queue_name(&"Q".repeat(MAX_QUEUE_NAME_LENGTH)).is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("BAD QUEUE").is_err());
        assert!(validate_queue_name(&"Q".repeat(MAX_QUEUE_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_tally_counts() {
        let mut tally = DrainTally::default();
        tally.record(None);
        tally.record(Some(true));
        tally.record(Some(false));
        assert_eq!(
            tally,
            DrainTally {
                consumed: 3,
                matched: 1,
                unmatched: 1
            }
        );
    }

    #[tokio::test]
    async fn test_connect_probes_then_holds_one_session() {
        let qm = LoopbackQueueManager::with_queues("QM1", [REQUESTS]);
        let client = client(&qm).await;
        let stats = qm.stats();
        assert_eq!(stats.connect_attempts, 2);
        assert_eq!(stats.live_connections, 1);
        assert!(!client.is_closed().await);
    }

    #[tokio::test]
    async fn test_send_stamps_descriptor_and_attaches_properties() {
        let qm = LoopbackQueueManager::with_queues("QM1", [REQUESTS, REPLIES]);
        let client = client(&qm).await;

        let request = SendRequest::new(REQUESTS, REPLIES, "<Ping/>")
            .with_property("testRun", "LOADTEST-1")
            .with_property("attempt", 3i64);
        let sent = client.send(request, Deadline::none()).await.unwrap();

        let queued = qm.browse(REQUESTS);
        assert_eq!(queued.len(), 1);
        let message = &queued[0];
        assert_eq!(message.descriptor.message_id, sent.message_id);
        assert_eq!(message.descriptor.format, FORMAT_STRING);
        assert_eq!(message.descriptor.reply_to_queue, REPLIES);
        assert_eq!(
            message.properties.get("testRun"),
            Some(&PropertyValue::String("LOADTEST-1".into()))
        );
        assert_eq!(message.properties.get("attempt"), Some(&PropertyValue::Int(3)));

        let stats = qm.stats();
        assert_eq!(stats.property_handles_created, 1);
        assert_eq!(stats.live_property_handles, 0);
    }

    #[tokio::test]
    async fn test_property_failure_releases_handle_and_skips_put() {
        let qm = LoopbackQueueManager::with_queues("QM1", [REQUESTS, REPLIES]);
        let client = client(&qm).await;

        let request = SendRequest::new(REQUESTS, REPLIES, "x").with_property("bad name", true);
        let err = client.send(request, Deadline::none()).await.unwrap_err();
        match err {
            ExchangeError::Property { property, source, .. } => {
                assert_eq!(property, "bad name");
                assert_eq!(source.reason, ReasonCode::PROPERTY_NAME_ERROR);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(qm.depth(REQUESTS), 0);
        assert_eq!(qm.stats().live_property_handles, 0);
    }

    #[tokio::test]
    async fn test_failed_put_still_releases_property_handle() {
        let qm = LoopbackQueueManager::with_queues("QM1", [REQUESTS, REPLIES]);
        let client = client(&qm).await;
        qm.fail_next(Operation::Put, ReasonCode::Q_MGR_QUIESCING);

        let request = SendRequest::new(REQUESTS, REPLIES, "x").with_property("k", 1.5f64);
        let err = client.send(request, Deadline::none()).await.unwrap_err();
        assert_eq!(err.reason(), Some(ReasonCode::Q_MGR_QUIESCING));
        assert_eq!(err.status_code(), 1);
        assert_eq!(qm.stats().live_property_handles, 0);
    }

    #[tokio::test]
    async fn test_receive_releases_resources_on_every_path() {
        let qm = LoopbackQueueManager::with_queues("QM1", [REPLIES]);
        let client = client(&qm).await;
        let key = MessageId::generate().to_hex();

        let outcome = client
            .receive(REPLIES, &key, "", Deadline::none())
            .await
            .unwrap();
        assert_eq!(outcome, ReplyOutcome::TimedOut);

        qm.fail_next(Operation::Get, ReasonCode::CONNECTION_BROKEN);
        let err = client
            .receive(REPLIES, &key, "", Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Queue { operation: Operation::Get, .. }));

        let stats = qm.stats();
        assert_eq!(stats.live_connections, 1);
        assert_eq!(stats.open_handles, 0);
    }

    #[tokio::test]
    async fn test_receive_rejects_bad_reply_key() {
        let qm = LoopbackQueueManager::with_queues("QM1", [REPLIES]);
        let client = client(&qm).await;
        let err = client
            .receive(REPLIES, "zz-not-hex", "", Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidCorrelationId { .. }));
    }

    #[tokio::test]
    async fn test_simulated_reply_needs_reply_destination() {
        let qm = LoopbackQueueManager::with_queues("QM1", [REQUESTS]);
        let client = client(&qm).await;
        qm.inject(
            REQUESTS,
            MessageDescriptor {
                message_id: MessageId::generate(),
                ..Default::default()
            },
            "orphan",
        );

        let err = client
            .simulate_reply(REQUESTS, Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::MissingReplyQueue { .. }));
        assert_eq!(err.status_code(), 2);
        assert_eq!(qm.stats().open_handles, 0);
    }

    #[tokio::test]
    async fn test_simulated_reply_with_empty_queue() {
        let qm = LoopbackQueueManager::with_queues("QM1", [REQUESTS]);
        let client = client(&qm).await;
        let answered = client
            .simulate_reply(REQUESTS, Deadline::none())
            .await
            .unwrap();
        assert!(answered.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let qm = LoopbackQueueManager::with_queues("QM1", [REQUESTS, REPLIES]);
        let client = client(&qm).await;
        client
            .send(SendRequest::new(REQUESTS, REPLIES, "x"), Deadline::none())
            .await
            .unwrap();
        assert_eq!(client.outbound_queue().await.as_deref(), Some(REQUESTS));

        client.shutdown().await;
        client.shutdown().await;
        let stats = qm.stats();
        assert_eq!(stats.live_connections, 0);
        assert_eq!(stats.open_handles, 0);

        let err = client
            .send(SendRequest::new(REQUESTS, REPLIES, "x"), Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Closed));
        let err = client.drain(REQUESTS, None, Deadline::none()).await.unwrap_err();
        assert!(matches!(err.source, ExchangeError::Closed));
    }

    #[tokio::test]
    async fn test_invalid_queue_names_are_rejected_before_io() {
        let qm = LoopbackQueueManager::with_queues("QM1", [REQUESTS]);
        let client = client(&qm).await;
        let puts_before = qm.stats().puts;

        let err = client
            .send(SendRequest::new("bad queue", REPLIES, "x"), Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidQueueName(_)));
        assert_eq!(qm.stats().puts, puts_before);
    }
}
