//! # Shared Outbound Queue Cache
//!
//! Sends reuse one output handle instead of opening and closing a queue for
//! every message. The handle lives in an explicitly owned slot guarded by an
//! async mutex, and the whole "check, open if absent, put" sequence runs
//! under that lock. Two senders racing on an unopened queue therefore
//! produce exactly one open, and puts through the shared handle are
//! serialised.
//!
//! The slot is keyed by queue name: a send to a different queue closes the
//! cached handle and opens the new queue, rather than writing to whatever
//! happened to be cached first.
//!
//! The lock is only ever taken by this module, so it is never held across a
//! connect, a get, or property-handle setup.

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::LiveConnection;
use crate::error::{ExchangeError, Operation};
use crate::transport::{
    MessageDescriptor, OpenMode, PropertyHandle, PutOptions, QueueHandle, QueueTransport,
};

/// Lazily opened, lock-guarded output handle.
#[derive(Debug, Default)]
pub struct OutboundQueueCache {
    slot: Mutex<Option<QueueHandle>>,
}

impl OutboundQueueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a message on `queue_name`, opening the queue on first use.
    ///
    /// ## Errors
    /// [`ExchangeError::Queue`] with [`Operation::Open`] if the queue cannot
    /// be opened, or [`Operation::Put`] if the put itself fails. A failed open
    /// leaves the slot empty so the next send tries again.
    #[allow(clippy::too_many_arguments)]
    pub async fn put(
        &self,
        transport: &dyn QueueTransport,
        connection: &LiveConnection,
        queue_name: &str,
        descriptor: &mut MessageDescriptor,
        options: &PutOptions,
        properties: Option<&PropertyHandle>,
        body: &[u8],
    ) -> Result<(), ExchangeError> {
        let mut slot = self.slot.lock().await;

        let handle = match slot.take() {
            Some(cached) if cached.queue_name() == queue_name => cached,
            stale => {
                if let Some(previous) = stale {
                    info!(
                        "Outbound queue changed from '{}' to '{}', reopening",
                        previous.queue_name(),
                        queue_name
                    );
                    close_logged(transport, previous).await;
                }
                info!("Opening outbound queue '{}'", queue_name);
                transport
                    .open_queue(connection.handle(), queue_name, OpenMode::Output)
                    .await
                    .map_err(|e| ExchangeError::queue(Operation::Open, queue_name, e))?
            }
        };
        let handle = slot.insert(handle);

        transport
            .put(handle, descriptor, options, properties, body)
            .await
            .map_err(|e| ExchangeError::queue(Operation::Put, queue_name, e))?;
        debug!(
            "Put {} bytes on '{}' (message id {})",
            body.len(),
            queue_name,
            descriptor.message_id
        );
        Ok(())
    }

    /// Name of the queue currently cached, if any.
    pub async fn cached_queue(&self) -> Option<String> {
        self.slot
            .lock()
            .await
            .as_ref()
            .map(|handle| handle.queue_name().to_string())
    }

    /// Close the cached handle, if one is open. Used at client shutdown.
    pub async fn close(&self, transport: &dyn QueueTransport) {
        if let Some(handle) = self.slot.lock().await.take() {
            close_logged(transport, handle).await;
        }
    }
}

async fn close_logged(transport: &dyn QueueTransport, handle: QueueHandle) {
    let name = handle.queue_name().to_string();
    if let Err(e) = transport.close_queue(handle).await {
        warn!("Failed to close outbound queue '{}': {}", name, e);
    }
}
