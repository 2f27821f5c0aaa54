//! In-process queue manager.
//!
//! `LoopbackQueueManager` implements [`QueueTransport`] entirely in memory so
//! scenarios can run without a broker and tests can observe exactly which
//! primitives the exchange engine invoked. It honours the parts of queue
//! manager behaviour the engine relies on:
//!
//! - gets wait up to their wait interval and wake as soon as a matching
//!   message is put
//! - correlation-id matching skips non-matching messages without removing them
//! - an input-exclusive handle excludes every other reader of that queue
//! - messages larger than the caller's buffer fail with `TRUNCATED_MSG_FAILED`
//!   and stay queued
//! - disconnect releases every handle opened through the session
//!
//! Faults can be scripted per operation with [`LoopbackQueueManager::fail_next`]
//! and [`LoopbackQueueManager::fail_connects`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::debug;

use super::{
    ConnectionHandle, GetOptions, MatchCriteria, MessageDescriptor, MessageId, MessageProperties,
    OpenMode, PropertyHandle, PropertyValue, PutOptions, QueueHandle, QueueTransport,
    ReceivedMessage,
};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{Operation, ReasonCode, TransportError};

/// Call counters exposed for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub connect_attempts: u64,
    pub live_connections: usize,
    pub opens: u64,
    pub open_handles: usize,
    pub puts: u64,
    pub gets: u64,
    pub property_handles_created: u64,
    pub live_property_handles: usize,
}

#[derive(Debug)]
struct OpenQueue {
    connection: u64,
    queue_name: String,
    mode: OpenMode,
}

#[derive(Debug)]
struct PendingProperties {
    connection: u64,
    properties: MessageProperties,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<ReceivedMessage>>,
    connections: HashSet<u64>,
    open_queues: HashMap<u64, OpenQueue>,
    property_handles: HashMap<u64, PendingProperties>,
    next_handle: u64,
    faults: HashMap<Operation, VecDeque<ReasonCode>>,
    connect_failures: VecDeque<ReasonCode>,
    opens_by_queue: HashMap<(String, OpenMode), u64>,
    required_credentials: Option<(String, String)>,
    open_delay: Duration,
    stats: LoopbackStats,
}

impl State {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn take_fault(&mut self, operation: Operation) -> Result<(), TransportError> {
        match self.faults.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(reason) => Err(TransportError::failed(reason)),
            None => Ok(()),
        }
    }

    fn live_connection(&self, id: u64) -> Result<(), TransportError> {
        if self.connections.contains(&id) {
            Ok(())
        } else {
            Err(TransportError::failed(ReasonCode::HCONN_ERROR))
        }
    }

    fn open_queue(&self, handle: &QueueHandle) -> Result<&OpenQueue, TransportError> {
        self.open_queues
            .get(&handle.id())
            .ok_or(TransportError::failed(ReasonCode::HOBJ_ERROR))
    }

    fn sync_stats(&mut self) {
        self.stats.live_connections = self.connections.len();
        self.stats.open_handles = self.open_queues.len();
        self.stats.live_property_handles = self.property_handles.len();
    }
}

struct Inner {
    name: String,
    state: Mutex<State>,
    arrivals: Notify,
}

/// Cheaply cloneable handle to a shared in-memory queue manager.
#[derive(Clone)]
pub struct LoopbackQueueManager {
    inner: Arc<Inner>,
}

impl LoopbackQueueManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::default()),
                arrivals: Notify::new(),
            }),
        }
    }

    /// Create a queue manager with the given local queues already defined.
    pub fn with_queues<I, S>(name: impl Into<String>, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let qm = Self::new(name);
        for queue in queues {
            qm.define_queue(queue);
        }
        qm
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Define a local queue. Redefining an existing queue keeps its messages.
    pub fn define_queue(&self, queue_name: impl Into<String>) {
        self.inner
            .state
            .lock()
            .queues
            .entry(queue_name.into())
            .or_default();
    }

    /// Reject connects whose credentials do not match.
    pub fn require_credentials(&self, user_id: &str, password: &str) {
        self.inner.state.lock().required_credentials =
            Some((user_id.to_string(), password.to_string()));
    }

    /// Make the next `count` connects fail with `reason`.
    pub fn fail_connects(&self, count: usize, reason: ReasonCode) {
        let mut state = self.inner.state.lock();
        state.connect_failures.extend(std::iter::repeat(reason).take(count));
    }

    /// Make the next call of `operation` fail with `reason`. Calls queue up.
    pub fn fail_next(&self, operation: Operation, reason: ReasonCode) {
        self.inner
            .state
            .lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(reason);
    }

    /// Delay every open, widening the window in which racing openers overlap.
    pub fn set_open_delay(&self, delay: Duration) {
        self.inner.state.lock().open_delay = delay;
    }

    /// Place a message directly on a queue, bypassing handles.
    pub fn inject(&self, queue_name: &str, descriptor: MessageDescriptor, body: impl Into<Vec<u8>>) {
        {
            let mut state = self.inner.state.lock();
            state
                .queues
                .entry(queue_name.to_string())
                .or_default()
                .push_back(ReceivedMessage {
                    descriptor,
                    body: body.into(),
                    properties: MessageProperties::new(),
                });
        }
        self.inner.arrivals.notify_waiters();
    }

    pub fn depth(&self, queue_name: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue_name)
            .map_or(0, VecDeque::len)
    }

    /// Copies of the messages waiting on a queue, oldest first.
    pub fn browse(&self, queue_name: &str) -> Vec<ReceivedMessage> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue_name)
            .map(|messages| messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> LoopbackStats {
        let mut state = self.inner.state.lock();
        state.sync_stats();
        state.stats.clone()
    }

    /// Number of opens seen for a queue in a given mode.
    pub fn opens_for(&self, queue_name: &str, mode: OpenMode) -> u64 {
        self.inner
            .state
            .lock()
            .opens_by_queue
            .get(&(queue_name.to_string(), mode))
            .copied()
            .unwrap_or(0)
    }
}

fn matches(criteria: &MatchCriteria, message: &ReceivedMessage) -> bool {
    match criteria {
        MatchCriteria::Any => true,
        MatchCriteria::CorrelationId(id) => message.descriptor.correlation_id == *id,
    }
}

#[async_trait]
impl QueueTransport for LoopbackQueueManager {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<ConnectionHandle, TransportError> {
        let mut state = self.inner.state.lock();
        state.stats.connect_attempts += 1;

        if let Some(reason) = state.connect_failures.pop_front() {
            return Err(TransportError::failed(reason));
        }
        state.take_fault(Operation::Connect)?;

        if descriptor.queue_manager != self.inner.name {
            return Err(TransportError::failed(ReasonCode::Q_MGR_NAME_ERROR));
        }
        if let Some((user, password)) = &state.required_credentials {
            let authorised = descriptor
                .credentials
                .as_ref()
                .is_some_and(|c| &c.user_id == user && &c.password == password);
            if !authorised {
                return Err(TransportError::failed(ReasonCode::NOT_AUTHORIZED));
            }
        }

        let id = state.next_handle();
        state.connections.insert(id);
        debug!("Loopback '{}' accepted connection {}", self.inner.name, id);
        Ok(ConnectionHandle::new(id))
    }

    async fn disconnect(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        state.take_fault(Operation::Disconnect)?;
        if !state.connections.remove(&connection.id()) {
            return Err(TransportError::failed(ReasonCode::HCONN_ERROR));
        }
        let id = connection.id();
        state.open_queues.retain(|_, open| open.connection != id);
        state.property_handles.retain(|_, pending| pending.connection != id);
        Ok(())
    }

    async fn open_queue(
        &self,
        connection: &ConnectionHandle,
        queue_name: &str,
        mode: OpenMode,
    ) -> Result<QueueHandle, TransportError> {
        let delay = {
            let mut state = self.inner.state.lock();
            state.take_fault(Operation::Open)?;
            state.open_delay
        };
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.inner.state.lock();
        state.live_connection(connection.id())?;
        if !state.queues.contains_key(queue_name) {
            return Err(TransportError::failed(ReasonCode::UNKNOWN_OBJECT_NAME));
        }
        if mode.is_input() {
            let conflict = state.open_queues.values().any(|open| {
                open.queue_name == queue_name
                    && open.mode.is_input()
                    && (mode == OpenMode::InputExclusive || open.mode == OpenMode::InputExclusive)
            });
            if conflict {
                return Err(TransportError::failed(ReasonCode::OBJECT_IN_USE));
            }
        }

        let id = state.next_handle();
        state.open_queues.insert(
            id,
            OpenQueue {
                connection: connection.id(),
                queue_name: queue_name.to_string(),
                mode,
            },
        );
        state.stats.opens += 1;
        *state
            .opens_by_queue
            .entry((queue_name.to_string(), mode))
            .or_default() += 1;
        debug!("Loopback opened '{}' as {:?} (handle {})", queue_name, mode, id);
        Ok(QueueHandle::new(id, queue_name, mode))
    }

    async fn close_queue(&self, queue: QueueHandle) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        state.take_fault(Operation::Close)?;
        state
            .open_queues
            .remove(&queue.id())
            .map(|_| ())
            .ok_or(TransportError::failed(ReasonCode::HOBJ_ERROR))
    }

    async fn put(
        &self,
        queue: &QueueHandle,
        descriptor: &mut MessageDescriptor,
        options: &PutOptions,
        properties: Option<&PropertyHandle>,
        body: &[u8],
    ) -> Result<(), TransportError> {
        {
            let mut state = self.inner.state.lock();
            state.take_fault(Operation::Put)?;

            let open = state.open_queue(queue)?;
            if open.mode != OpenMode::Output {
                return Err(TransportError::failed(ReasonCode::NOT_OPEN_FOR_OUTPUT));
            }
            state.live_connection(open.connection)?;
            let queue_name = open.queue_name.clone();

            let attached = match properties {
                Some(handle) => state
                    .property_handles
                    .get(&handle.id())
                    .map(|pending| pending.properties.clone())
                    .ok_or(TransportError::failed(ReasonCode::HMSG_ERROR))?,
                None => MessageProperties::new(),
            };

            if options.new_message_id {
                descriptor.message_id = MessageId::generate();
            }
            if options.new_correlation_id {
                descriptor.correlation_id = MessageId::generate();
            }

            state
                .queues
                .entry(queue_name)
                .or_default()
                .push_back(ReceivedMessage {
                    descriptor: descriptor.clone(),
                    body: body.to_vec(),
                    properties: attached,
                });
            state.stats.puts += 1;
        }
        self.inner.arrivals.notify_waiters();
        Ok(())
    }

    async fn get(
        &self,
        queue: &QueueHandle,
        options: &GetOptions,
    ) -> Result<Option<ReceivedMessage>, TransportError> {
        let give_up_at = Instant::now() + options.wait;

        loop {
            let notified = self.inner.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                state.take_fault(Operation::Get)?;

                let open = state.open_queue(queue)?;
                if !open.mode.is_input() {
                    return Err(TransportError::failed(ReasonCode::NOT_OPEN_FOR_INPUT));
                }
                state.live_connection(open.connection)?;
                let queue_name = open.queue_name.clone();

                let messages = state
                    .queues
                    .get_mut(&queue_name)
                    .ok_or(TransportError::failed(ReasonCode::UNKNOWN_OBJECT_NAME))?;
                if let Some(position) = messages.iter().position(|m| matches(&options.matching, m)) {
                    if messages[position].body.len() > options.max_message_length {
                        return Err(TransportError::failed(ReasonCode::TRUNCATED_MSG_FAILED));
                    }
                    let message = messages.remove(position);
                    state.stats.gets += 1;
                    return Ok(message);
                }
            }

            let now = Instant::now();
            if now >= give_up_at {
                return Ok(None);
            }
            // Either a put woke us or the wait ran out; both re-check the queue.
            let _ = timeout(give_up_at - now, notified).await;
        }
    }

    async fn create_property_handle(
        &self,
        connection: &ConnectionHandle,
    ) -> Result<PropertyHandle, TransportError> {
        let mut state = self.inner.state.lock();
        state.take_fault(Operation::CreatePropertyHandle)?;
        state.live_connection(connection.id())?;
        let id = state.next_handle();
        state.property_handles.insert(
            id,
            PendingProperties {
                connection: connection.id(),
                properties: MessageProperties::new(),
            },
        );
        state.stats.property_handles_created += 1;
        Ok(PropertyHandle::new(id))
    }

    async fn set_property(
        &self,
        handle: &PropertyHandle,
        name: &str,
        value: &PropertyValue,
    ) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        state.take_fault(Operation::SetProperty)?;
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(TransportError::failed(ReasonCode::PROPERTY_NAME_ERROR));
        }
        let pending = state
            .property_handles
            .get_mut(&handle.id())
            .ok_or(TransportError::failed(ReasonCode::HMSG_ERROR))?;
        pending.properties.insert(name.to_string(), value.clone());
        Ok(())
    }

    async fn release_property_handle(
        &self,
        handle: PropertyHandle,
    ) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        state.take_fault(Operation::ReleasePropertyHandle)?;
        state
            .property_handles
            .remove(&handle.id())
            .map(|_| ())
            .ok_or(TransportError::failed(ReasonCode::HMSG_ERROR))
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FORMAT_STRING;

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::new("QM1", "localhost", 1414, "DEV.APP.SVRCONN")
    }

    fn get_options(wait: Duration, matching: MatchCriteria) -> GetOptions {
        GetOptions {
            syncpoint: false,
            wait,
            matching,
            max_message_length: 1024,
        }
    }

    #[tokio::test]
    async fn test_put_generates_requested_ids() {
        let qm = LoopbackQueueManager::with_queues("QM1", ["Q1"]);
        let conn = qm.connect(&descriptor()).await.unwrap();
        let out = qm.open_queue(&conn, "Q1", OpenMode::Output).await.unwrap();

        let mut md = MessageDescriptor {
            format: FORMAT_STRING.to_string(),
            ..Default::default()
        };
        qm.put(&out, &mut md, &PutOptions::request(), None, b"hello")
            .await
            .unwrap();
        assert!(!md.message_id.is_none());
        assert!(!md.correlation_id.is_none());
        assert_ne!(md.message_id, md.correlation_id);
        assert_eq!(qm.depth("Q1"), 1);
    }

    #[tokio::test]
    async fn test_get_matches_correlation_id_without_consuming_others() {
        let qm = LoopbackQueueManager::with_queues("QM1", ["Q1"]);
        let wanted = MessageId::generate();
        qm.inject(
            "Q1",
            MessageDescriptor {
                correlation_id: MessageId::generate(),
                ..Default::default()
            },
            "other",
        );
        qm.inject(
            "Q1",
            MessageDescriptor {
                correlation_id: wanted,
                ..Default::default()
            },
            "mine",
        );

        let conn = qm.connect(&descriptor()).await.unwrap();
        let input = qm.open_queue(&conn, "Q1", OpenMode::InputShared).await.unwrap();
        let message = qm
            .get(&input, &get_options(Duration::ZERO, MatchCriteria::CorrelationId(wanted)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.body_text(), "mine");
        assert_eq!(qm.depth("Q1"), 1);
    }

    #[tokio::test]
    async fn test_get_waits_for_late_arrival() {
        let qm = LoopbackQueueManager::with_queues("QM1", ["Q1"]);
        let conn = qm.connect(&descriptor()).await.unwrap();
        let input = qm.open_queue(&conn, "Q1", OpenMode::InputShared).await.unwrap();

        let producer = qm.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.inject("Q1", MessageDescriptor::default(), "late");
        });

        let message = qm
            .get(&input, &get_options(Duration::from_secs(2), MatchCriteria::Any))
            .await
            .unwrap();
        assert_eq!(message.map(|m| m.body_text()), Some("late".to_string()));
    }

    #[tokio::test]
    async fn test_get_times_out_with_no_message() {
        let qm = LoopbackQueueManager::with_queues("QM1", ["Q1"]);
        let conn = qm.connect(&descriptor()).await.unwrap();
        let input = qm.open_queue(&conn, "Q1", OpenMode::InputShared).await.unwrap();
        let message = qm
            .get(&input, &get_options(Duration::from_millis(20), MatchCriteria::Any))
            .await
            .unwrap();
        assert!(message.is_none());
    }

    #[tokio::test]
    async fn test_oversized_message_is_not_consumed() {
        let qm = LoopbackQueueManager::with_queues("QM1", ["Q1"]);
        qm.inject("Q1", MessageDescriptor::default(), vec![b'x'; 2048]);
        let conn = qm.connect(&descriptor()).await.unwrap();
        let input = qm.open_queue(&conn, "Q1", OpenMode::InputShared).await.unwrap();

        let err = qm
            .get(&input, &get_options(Duration::ZERO, MatchCriteria::Any))
            .await
            .unwrap_err();
        assert_eq!(err.reason, ReasonCode::TRUNCATED_MSG_FAILED);
        assert_eq!(qm.depth("Q1"), 1);
    }

    #[tokio::test]
    async fn test_exclusive_input_rejects_other_readers() {
        let qm = LoopbackQueueManager::with_queues("QM1", ["Q1"]);
        let conn = qm.connect(&descriptor()).await.unwrap();
        let exclusive = qm
            .open_queue(&conn, "Q1", OpenMode::InputExclusive)
            .await
            .unwrap();

        let err = qm
            .open_queue(&conn, "Q1", OpenMode::InputShared)
            .await
            .unwrap_err();
        assert_eq!(err.reason, ReasonCode::OBJECT_IN_USE);

        // Writers are unaffected.
        qm.open_queue(&conn, "Q1", OpenMode::Output).await.unwrap();

        qm.close_queue(exclusive).await.unwrap();
        qm.open_queue(&conn, "Q1", OpenMode::InputShared).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_queue_and_queue_manager() {
        let qm = LoopbackQueueManager::new("QM1");
        let conn = qm.connect(&descriptor()).await.unwrap();
        let err = qm
            .open_queue(&conn, "MISSING", OpenMode::Output)
            .await
            .unwrap_err();
        assert_eq!(err.reason, ReasonCode::UNKNOWN_OBJECT_NAME);

        let other = LoopbackQueueManager::new("QM9");
        let err = other.connect(&descriptor()).await.unwrap_err();
        assert_eq!(err.reason, ReasonCode::Q_MGR_NAME_ERROR);
    }

    #[tokio::test]
    async fn test_credentials_are_checked() {
        let qm = LoopbackQueueManager::new("QM1");
        qm.require_credentials("app", "passw0rd");

        let err = qm.connect(&descriptor()).await.unwrap_err();
        assert_eq!(err.reason, ReasonCode::NOT_AUTHORIZED);

        qm.connect(&descriptor().with_credentials("app", "passw0rd"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_releases_handles() {
        let qm = LoopbackQueueManager::with_queues("QM1", ["Q1"]);
        let conn = qm.connect(&descriptor()).await.unwrap();
        let _out = qm.open_queue(&conn, "Q1", OpenMode::Output).await.unwrap();
        let _props = qm.create_property_handle(&conn).await.unwrap();
        assert_eq!(qm.stats().open_handles, 1);

        qm.disconnect(conn).await.unwrap();
        let stats = qm.stats();
        assert_eq!(stats.live_connections, 0);
        assert_eq!(stats.open_handles, 0);
        assert_eq!(stats.live_property_handles, 0);
    }

    #[tokio::test]
    async fn test_scripted_faults_fire_once() {
        let qm = LoopbackQueueManager::with_queues("QM1", ["Q1"]);
        qm.fail_next(Operation::Open, ReasonCode::Q_MGR_QUIESCING);
        let conn = qm.connect(&descriptor()).await.unwrap();

        let err = qm.open_queue(&conn, "Q1", OpenMode::Output).await.unwrap_err();
        assert_eq!(err.reason, ReasonCode::Q_MGR_QUIESCING);
        qm.open_queue(&conn, "Q1", OpenMode::Output).await.unwrap();
    }
}
