//! # Queue Transport Abstraction
//!
//! The exchange engine never talks to a queue manager directly. It drives a
//! [`QueueTransport`] implementation that exposes the small set of primitives
//! it needs: connect/disconnect, open/close, put, get with wait and
//! correlation matching, and message-property handles.
//!
//! Handles returned by a transport are opaque tokens. They are deliberately
//! not `Clone`: whoever opened a queue owns the handle and is responsible for
//! giving it back through [`QueueTransport::close_queue`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::descriptor::ConnectionDescriptor;
use crate::error::TransportError;

pub mod loopback;

pub use loopback::LoopbackQueueManager;

/// Width of message and correlation identifiers, in bytes.
pub const ID_LENGTH: usize = 24;

/// Format tag for character-string message bodies.
pub const FORMAT_STRING: &str = "MQSTR";

/// Fixed-width message or correlation identifier.
///
/// The all-zero value means "no identifier". Identifiers are exchanged with
/// callers as lowercase hex strings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MessageId([u8; ID_LENGTH]);

/// Correlation identifiers share the message identifier representation.
pub type CorrelationId = MessageId;

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(1);

impl MessageId {
    /// The "no identifier" value.
    pub const NONE: MessageId = MessageId([0u8; ID_LENGTH]);

    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh identifier: 16 random bytes followed by a
    /// process-wide sequence number, so two calls never collide.
    pub fn generate() -> Self {
        let mut bytes = [0u8; ID_LENGTH];
        bytes[..16].copy_from_slice(Uuid::new_v4().as_bytes());
        let sequence = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        bytes[16..].copy_from_slice(&sequence.to_be_bytes());
        Self(bytes)
    }

    /// Decode a hex string. Shorter inputs are zero-padded on the right,
    /// matching how queue managers pad identifiers.
    pub fn from_hex(value: &str) -> Result<Self, hex::FromHexError> {
        let decoded = hex::decode(value.trim())?;
        if decoded.len() > ID_LENGTH {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut bytes = [0u8; ID_LENGTH];
        bytes[..decoded.len()].copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == [0u8; ID_LENGTH]
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.to_hex())
    }
}

/// Queue open modes used by the exchange engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenMode {
    /// Write-only handle.
    Output,
    /// Read handle that tolerates other shared readers.
    InputShared,
    /// Read handle that excludes every other reader.
    InputExclusive,
}

impl OpenMode {
    pub fn is_input(self) -> bool {
        matches!(self, OpenMode::InputShared | OpenMode::InputExclusive)
    }
}

/// Message metadata travelling alongside the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDescriptor {
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
    pub format: String,
    pub reply_to_queue: String,
}

impl Default for MessageDescriptor {
    fn default() -> Self {
        Self {
            message_id: MessageId::NONE,
            correlation_id: MessageId::NONE,
            format: String::new(),
            reply_to_queue: String::new(),
        }
    }
}

/// Typed value of a message property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(value: Vec<u8>) -> Self {
        PropertyValue::Bytes(value)
    }
}

/// Key/value properties attached to an outbound message.
pub type MessageProperties = BTreeMap<String, PropertyValue>;

/// Options controlling a put.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Commit as part of a unit of work instead of immediately.
    pub syncpoint: bool,
    /// Ask the queue manager to generate a fresh message id.
    pub new_message_id: bool,
    /// Ask the queue manager to generate a fresh correlation id.
    pub new_correlation_id: bool,
    /// Fail instead of blocking while the queue manager is quiescing.
    pub fail_if_quiescing: bool,
}

impl PutOptions {
    /// Options used for request messages.
    pub fn request() -> Self {
        Self {
            syncpoint: false,
            new_message_id: true,
            new_correlation_id: true,
            fail_if_quiescing: true,
        }
    }

    /// Options used for replies, which keep the caller-chosen correlation id.
    pub fn reply() -> Self {
        Self {
            syncpoint: false,
            new_message_id: true,
            new_correlation_id: false,
            fail_if_quiescing: false,
        }
    }
}

/// Which waiting message a get may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCriteria {
    /// First message in queue order.
    Any,
    /// First message whose correlation id equals the given one.
    CorrelationId(CorrelationId),
}

/// Options controlling a get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOptions {
    pub syncpoint: bool,
    /// How long to wait for a matching message; zero means no wait.
    pub wait: Duration,
    pub matching: MatchCriteria,
    /// Largest body the caller accepts. Larger messages fail with
    /// `TRUNCATED_MSG_FAILED` and stay on the queue.
    pub max_message_length: usize,
}

/// A message taken off a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub descriptor: MessageDescriptor,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl ReceivedMessage {
    /// Body decoded as UTF-8, with invalid sequences replaced.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Opaque live session with a queue manager.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectionHandle {
    id: u64,
}

impl ConnectionHandle {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Opaque handle to an opened queue.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueHandle {
    id: u64,
    queue_name: String,
    mode: OpenMode,
}

impl QueueHandle {
    pub fn new(id: u64, queue_name: impl Into<String>, mode: OpenMode) -> Self {
        Self {
            id,
            queue_name: queue_name.into(),
            mode,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }
}

/// Opaque handle to a set of message properties under construction.
#[derive(Debug, PartialEq, Eq)]
pub struct PropertyHandle {
    id: u64,
}

impl PropertyHandle {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Queue-manager primitives required by the exchange engine.
///
/// All calls may block: connects and puts on network round trips, gets for
/// up to [`GetOptions::wait`]. A get that finds no message within the wait
/// interval returns `Ok(None)`; every other failure is a [`TransportError`].
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Establish a session described by `descriptor`.
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<ConnectionHandle, TransportError>;

    /// Release a session and everything opened through it.
    async fn disconnect(&self, connection: ConnectionHandle) -> Result<(), TransportError>;

    async fn open_queue(
        &self,
        connection: &ConnectionHandle,
        queue_name: &str,
        mode: OpenMode,
    ) -> Result<QueueHandle, TransportError>;

    async fn close_queue(&self, queue: QueueHandle) -> Result<(), TransportError>;

    /// Put a message. Identifiers requested through `options` are generated
    /// by the queue manager and written back into `descriptor`.
    async fn put(
        &self,
        queue: &QueueHandle,
        descriptor: &mut MessageDescriptor,
        options: &PutOptions,
        properties: Option<&PropertyHandle>,
        body: &[u8],
    ) -> Result<(), TransportError>;

    async fn get(
        &self,
        queue: &QueueHandle,
        options: &GetOptions,
    ) -> Result<Option<ReceivedMessage>, TransportError>;

    async fn create_property_handle(
        &self,
        connection: &ConnectionHandle,
    ) -> Result<PropertyHandle, TransportError>;

    async fn set_property(
        &self,
        handle: &PropertyHandle,
        name: &str,
        value: &PropertyValue,
    ) -> Result<(), TransportError>;

    async fn release_property_handle(&self, handle: PropertyHandle)
        -> Result<(), TransportError>;

    /// Transport name for logging.
    fn name(&self) -> &'static str;
}
