//! In-memory transport for dispatcher and client tests.

use crate::error::TransportError;
use crate::transport::{Inbound, MessageHandler, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct MockTransport {
    inbound: Inbound,
    sent: mpsc::UnboundedSender<Bytes>,
    handler: Mutex<Option<Arc<dyn MessageHandler>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    /// Returns the transport and the receiving end of everything it sends.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (sent, outbound) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            inbound: Inbound::new(100),
            sent,
            handler: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        (transport, outbound)
    }

    /// Feed bytes as if they arrived from the peer.
    pub fn inject(&self, message: &str) -> bool {
        self.inbound.push(Bytes::copy_from_slice(message.as_bytes()))
    }

    pub fn close_inbound(&self) {
        self.inbound.close();
    }

    pub fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self, _token: CancellationToken) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.inbound.close();
        Ok(())
    }

    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.send(message).map_err(|_| TransportError::Closed)
    }

    fn receive(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound.take_receiver()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inbound.close();
        Ok(())
    }

    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}
