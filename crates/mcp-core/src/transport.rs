//! The contract every transport variant implements, plus the shared inbound
//! channel they funnel traffic into.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Per-destination and inbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Upper bound on graceful shutdown of a listening socket.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a session may wait for its event stream before it is dropped.
pub const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub queue_capacity: usize,
    pub shutdown_timeout: Duration,
    pub attach_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            attach_timeout: DEFAULT_ATTACH_TIMEOUT,
        }
    }
}

/// Synchronous per-request hook. Transports that know which session a
/// message came from call this instead of queueing to the shared inbound
/// channel, and deliver any returned bytes to that session only.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(
        &self,
        session_id: Option<&str>,
        message: Bytes,
    ) -> anyhow::Result<Option<Bytes>>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin accepting input. Fails if the transport was closed or already
    /// started. Never blocks on the ingestion loop itself.
    async fn start(&self, token: CancellationToken) -> Result<(), TransportError>;

    /// Stop accepting input and end every session. Idempotent.
    async fn stop(&self) -> Result<(), TransportError>;

    /// Best-effort broadcast to every live destination. A full destination
    /// queue drops the message for that destination only.
    async fn send(&self, message: Bytes) -> Result<(), TransportError>;

    /// Take the shared inbound channel. Returns `None` once taken.
    fn receive(&self) -> Option<mpsc::Receiver<Bytes>>;

    /// Stop, then release the inbound channel. Idempotent; the second call
    /// has no side effects.
    async fn close(&self) -> Result<(), TransportError>;

    fn set_message_handler(&self, _handler: Arc<dyn MessageHandler>) {}
}

/// Bounded inbound channel shared by all sessions of a transport.
///
/// Closing drops the stored sender; the receiver drains what is queued and
/// then yields `None`. Closing twice is a no-op.
#[derive(Debug)]
pub struct Inbound {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl Inbound {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Queue without waiting. Returns false if the message was dropped.
    pub fn push(&self, message: Bytes) -> bool {
        let Some(tx) = self.sender() else {
            tracing::debug!("Inbound channel closed, dropping message");
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Inbound buffer full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// A sender clone for loops that prefer to wait for capacity.
    pub fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
