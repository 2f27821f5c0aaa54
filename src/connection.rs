//! # Connection Lifecycle Management
//!
//! Establishes and releases queue-manager sessions on behalf of every
//! exchange operation. The only failure retried here is the
//! TLS-initialization class (`SSL_INITIALIZATION_ERROR`), which queue
//! managers report while a TLS channel is still being brought up. Retries use
//! exponential backoff bounded by both an attempt limit and the caller's
//! [`Deadline`].
//!
//! ## Policy
//!
//! - **connect**: one attempt, then bounded retries for transient failures;
//!   any other failure is returned as [`ExchangeError::Connection`] carrying
//!   the reason code
//! - **disconnect**: always attempted; failures are logged and swallowed
//! - **probe**: connect-then-disconnect used to validate a descriptor before
//!   a client commits to it

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::deadline::Deadline;
use crate::descriptor::ConnectionDescriptor;
use crate::error::{ExchangeError, Operation};
use crate::transport::{ConnectionHandle, QueueTransport};

/// Backoff schedule for transient connect failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total connect attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::defaults::CONNECT_ATTEMPTS,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given that `attempt` attempts
    /// have already failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// An established session with the queue manager.
#[derive(Debug)]
pub struct LiveConnection {
    handle: ConnectionHandle,
}

impl LiveConnection {
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }
}

/// Owns the connection descriptor and hands out sessions.
pub struct ConnectionManager {
    transport: Arc<dyn QueueTransport>,
    descriptor: ConnectionDescriptor,
    retry: RetryPolicy,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        descriptor: ConnectionDescriptor,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            descriptor,
            retry,
        }
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Open a session, retrying transient TLS-initialization failures.
    ///
    /// ## Errors
    /// - [`ExchangeError::Connection`] for any non-transient failure
    /// - [`ExchangeError::ConnectRetriesExhausted`] once `max_attempts`
    ///   transient failures have been seen
    /// - [`ExchangeError::DeadlineExceeded`] if the next backoff would run
    ///   past `deadline`
    pub async fn connect(&self, deadline: Deadline) -> Result<LiveConnection, ExchangeError> {
        let queue_manager = &self.descriptor.queue_manager;
        let mut attempt = 1;

        loop {
            match self.transport.connect(&self.descriptor).await {
                Ok(handle) => {
                    debug!(
                        "Connected to {} (handle {}) after {} attempt(s)",
                        self.descriptor,
                        handle.id(),
                        attempt
                    );
                    return Ok(LiveConnection { handle });
                }
                Err(e) if e.reason.is_transient_connect_failure() => {
                    if attempt >= self.retry.max_attempts {
                        return Err(ExchangeError::ConnectRetriesExhausted {
                            queue_manager: queue_manager.clone(),
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let delay = self.retry.backoff(attempt);
                    if !deadline.allows(delay) {
                        return Err(ExchangeError::DeadlineExceeded {
                            operation: Operation::Connect,
                        });
                    }
                    warn!(
                        "Transient failure connecting to '{}' ({}), retrying in {:?} (attempt {}/{})",
                        queue_manager, e.reason, delay, attempt, self.retry.max_attempts
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(ExchangeError::Connection {
                        queue_manager: queue_manager.clone(),
                        source: e,
                    });
                }
            }
        }
    }

    /// Release a session. Never fails; problems are only logged.
    pub async fn disconnect(&self, connection: LiveConnection) {
        let id = connection.handle.id();
        match self.transport.disconnect(connection.handle).await {
            Ok(()) => debug!("Disconnected handle {} from '{}'", id, self.descriptor.queue_manager),
            Err(e) => warn!(
                "Failed to disconnect handle {} from '{}': {}",
                id, self.descriptor.queue_manager, e
            ),
        }
    }

    /// Validate the descriptor with a throwaway session.
    pub async fn probe(&self, deadline: Deadline) -> Result<(), ExchangeError> {
        let connection = self.connect(deadline).await?;
        info!("Connection probe to {} succeeded", self.descriptor);
        self.disconnect(connection).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReasonCode;
    use crate::transport::LoopbackQueueManager;

    fn manager(qm: &LoopbackQueueManager, retry: RetryPolicy) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(qm.clone()),
            ConnectionDescriptor::new("QM1", "localhost", 1414, "DEV.APP.SVRCONN"),
            retry,
        )
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            multiplier: 2,
        }
    }

    #[test]
    fn test_backoff_schedule_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let qm = LoopbackQueueManager::new("QM1");
        qm.fail_connects(3, ReasonCode::SSL_INITIALIZATION_ERROR);
        let manager = manager(&qm, fast_retry(5));

        let connection = manager.connect(Deadline::none()).await.unwrap();
        assert_eq!(qm.stats().connect_attempts, 4);
        manager.disconnect(connection).await;
        assert_eq!(qm.stats().live_connections, 0);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let qm = LoopbackQueueManager::new("QM1");
        qm.fail_connects(10, ReasonCode::SSL_INITIALIZATION_ERROR);
        let manager = manager(&qm, fast_retry(3));

        let err = manager.connect(Deadline::none()).await.unwrap_err();
        match err {
            ExchangeError::ConnectRetriesExhausted { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.reason, ReasonCode::SSL_INITIALIZATION_ERROR);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(qm.stats().connect_attempts, 3);
    }

    #[tokio::test]
    async fn test_other_failures_are_fatal() {
        let qm = LoopbackQueueManager::new("QM1");
        qm.fail_connects(1, ReasonCode::NOT_AUTHORIZED);
        let manager = manager(&qm, fast_retry(5));

        let err = manager.connect(Deadline::none()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Connection { .. }));
        assert_eq!(err.reason(), Some(ReasonCode::NOT_AUTHORIZED));
        assert_eq!(qm.stats().connect_attempts, 1);
    }

    #[tokio::test]
    async fn test_deadline_stops_retry_loop() {
        let qm = LoopbackQueueManager::new("QM1");
        qm.fail_connects(10, ReasonCode::SSL_INITIALIZATION_ERROR);
        let retry = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5),
            multiplier: 2,
        };
        let manager = manager(&qm, retry);

        let err = manager
            .connect(Deadline::after(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::DeadlineExceeded { operation: Operation::Connect }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_failure_is_not_fatal() {
        let qm = LoopbackQueueManager::new("QM1");
        let manager = manager(&qm, RetryPolicy::default());
        let connection = manager.connect(Deadline::none()).await.unwrap();

        qm.fail_next(Operation::Disconnect, ReasonCode::CONNECTION_BROKEN);
        manager.disconnect(connection).await;
    }

    #[tokio::test]
    async fn test_probe_leaves_no_session_behind() {
        let qm = LoopbackQueueManager::new("QM1");
        let manager = manager(&qm, RetryPolicy::default());
        manager.probe(Deadline::none()).await.unwrap();

        let stats = qm.stats();
        assert_eq!(stats.connect_attempts, 1);
        assert_eq!(stats.live_connections, 0);
    }

    #[tokio::test]
    async fn test_wrong_queue_manager_name_fails_probe() {
        let qm = LoopbackQueueManager::new("QM2");
        let manager = manager(&qm, RetryPolicy::default());
        let err = manager.probe(Deadline::none()).await.unwrap_err();
        assert_eq!(err.reason(), Some(ReasonCode::Q_MGR_NAME_ERROR));
    }
}
