use bytes::Bytes;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Lifecycle of a session's outbound stream.
///
/// `Unattached -> Attached -> Detached`. A detached session never attaches
/// again; the peer has to open a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unattached,
    Attached,
    Detached,
}

/// Outcome of queueing one message for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The session's queue was full; the message was dropped.
    Dropped,
    /// The session is closed or its stream went away.
    Gone,
}

/// One logical peer connection.
///
/// Outbound messages go into a bounded queue owned by the session. The
/// receiving end stays inside the session until a stream attaches, so sends
/// made before attachment are buffered up to the queue capacity.
#[derive(Debug)]
pub struct Session {
    id: String,
    queue: mpsc::Sender<Bytes>,
    stream: Mutex<Option<mpsc::Receiver<Bytes>>>,
    state: Mutex<SessionState>,
    closed: CancellationToken,
    created: Instant,
}

impl Session {
    fn new(id: String, capacity: usize) -> Self {
        let (queue, stream) = mpsc::channel(capacity.max(1));
        Self {
            id,
            queue,
            stream: Mutex::new(Some(stream)),
            state: Mutex::new(SessionState::Unattached),
            closed: CancellationToken::new(),
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the session is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Queue a message without waiting.
    pub fn deliver(&self, message: Bytes) -> Delivery {
        if self.is_closed() {
            return Delivery::Gone;
        }
        match self.queue.try_send(message) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session_id = %self.id, "Session buffer full, dropping message");
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    /// Hand the queue's receiving end to a stream. Succeeds once, and only
    /// while the session is unattached and open.
    pub fn attach(&self) -> Option<mpsc::Receiver<Bytes>> {
        if self.is_closed() {
            return None;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != SessionState::Unattached {
            return None;
        }
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        *state = SessionState::Attached;
        Some(stream)
    }

    /// Mark the stream as gone. The session cannot be attached again.
    pub fn detach(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SessionState::Detached;
        self.close();
    }

    /// Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// Session table owned by one transport instance.
#[derive(Debug)]
pub struct SessionTable {
    sessions: DashMap<String, Arc<Session>>,
    capacity: usize,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            capacity,
        }
    }

    /// 16 random bytes, hex-encoded.
    pub fn generate_id() -> String {
        let bytes: [u8; 16] = rand::random();
        hex::encode(bytes)
    }

    /// Register a session under `id`, or under a fresh id when `None`.
    ///
    /// A session already registered under the same id is closed and replaced.
    pub fn create(&self, id: Option<String>) -> Arc<Session> {
        let id = id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(Self::generate_id);
        let session = Arc::new(Session::new(id.clone(), self.capacity));
        if let Some(previous) = self.sessions.insert(id, session.clone()) {
            tracing::debug!(session_id = %previous.id, "Replacing existing session");
            previous.close();
        }
        session
    }

    /// Look up a session by ID.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Remove and close a session. Returns the removed session, if any.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        session.close();
        Some(session)
    }

    /// Remove `session` only if it is still the one registered under its id.
    /// Used by stream cleanup so a replaced session does not evict its
    /// successor.
    pub fn remove_if_current(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Queue `message` for one session.
    pub fn send_to(&self, id: &str, message: Bytes) -> Delivery {
        match self.get(id) {
            Some(session) => session.deliver(message),
            None => Delivery::Gone,
        }
    }

    /// Queue `message` for every live session. Returns how many queued it.
    pub fn broadcast(&self, message: &Bytes) -> usize {
        // Snapshot first so no shard lock is held while delivering.
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions
            .iter()
            .filter(|session| session.deliver(message.clone()) == Delivery::Queued)
            .count()
    }

    /// Remove and close every session that has stayed unattached for longer
    /// than `max_age`. Returns how many were removed.
    pub fn expire_unattached(&self, max_age: Duration) -> usize {
        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.state() == SessionState::Unattached && session.created.elapsed() > max_age
            })
            .map(|entry| entry.value().clone())
            .collect();
        stale
            .iter()
            .filter(|session| {
                // Re-checked under the entry lock; the stream may have attached meanwhile.
                self.sessions
                    .remove_if(session.id(), |_, current| {
                        Arc::ptr_eq(current, session) && current.state() == SessionState::Unattached
                    })
                    .map(|(_, removed)| removed.close())
                    .is_some()
            })
            .count()
    }

    /// Close and forget every session.
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();
        for session in sessions {
            session.close();
        }
    }
}
