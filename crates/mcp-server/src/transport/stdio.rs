//! Line-delimited JSON over a byte stream pair (stdin/stdout by default).
//! One implicit session: everything sent goes to the single peer.

use async_trait::async_trait;
use bytes::Bytes;
use mcp_core::error::TransportError;
use mcp_core::transport::{Inbound, Transport, TransportOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct LineStreamTransport {
    reader: Mutex<Option<Reader>>,
    writer: tokio::sync::Mutex<Writer>,
    inbound: Arc<Inbound>,
    closing: CancellationToken,
    closed: AtomicBool,
}

impl LineStreamTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_options(reader, writer, TransportOptions::default())
    }

    pub fn with_options<R, W>(reader: R, writer: W, options: TransportOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            inbound: Arc::new(Inbound::new(options.queue_capacity)),
            closing: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Process stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[async_trait]
impl Transport for LineStreamTransport {
    async fn start(&self, token: CancellationToken) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::AlreadyStarted)?;
        let tx = self.inbound.sender().ok_or(TransportError::Closed)?;
        let inbound = self.inbound.clone();
        let closing = self.closing.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                let read = tokio::select! {
                    _ = token.cancelled() => break,
                    _ = closing.cancelled() => break,
                    read = reader.read_until(b'\n', &mut buf) => read,
                };
                match read {
                    Ok(0) => {
                        debug!("Input stream ended");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Failed to read input line");
                        break;
                    }
                }
                // Bytes go through untouched; the dispatcher answers
                // anything that is not valid JSON.
                let line = trim_ascii(&buf);
                if line.is_empty() {
                    continue;
                }

                let message = Bytes::copy_from_slice(line);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = closing.cancelled() => break,
                    sent = tx.send(message) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            drop(tx);
            // No-op if close() already released it.
            inbound.close();
            debug!("Line reader stopped");
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.closing.cancel();
        Ok(())
    }

    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut line = Vec::with_capacity(message.len() + 1);
        line.extend_from_slice(&message);
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    fn receive(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound.take_receiver()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closing.cancel();
        self.inbound.close();
        Ok(())
    }
}
