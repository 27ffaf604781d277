//! Correlation table for calls the plugin issues toward the panel.
//!
//! Each outbound call reserves a fresh correlation id and a single-slot
//! receptacle before its envelope is sent. The receive loop hands every
//! reply-shaped envelope to [`PendingCalls::fulfill`], which removes the
//! entry and wakes exactly that caller. Replies with unknown ids are
//! dropped.
//!
//! When the connection closes, [`PendingCalls::close_all`] fails every
//! remaining caller with [`Error::ConnectionClosed`] and refuses new
//! registrations, so no caller waits forever.
//!
//! A [`PendingCall`] that is dropped before its reply arrives (a timed-out
//! or aborted caller) removes its own entry. A reply that shows up later is
//! treated like any other unknown id.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use tokio::sync::oneshot;
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::Error;
use crate::error::Result;

type Slot = oneshot::Sender<Result<Envelope>>;

struct PendingState {
    /// Monotonic counter; ids are never reused within a process.
    next_id: u64,
    entries: HashMap<String, Slot>,
    closed: bool,
}

type SharedState = Arc<Mutex<PendingState>>;

fn lock(state: &Mutex<PendingState>) -> MutexGuard<'_, PendingState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe map from correlation id to waiting caller.
pub struct PendingCalls {
    prefix: String,
    state: SharedState,
}

/// Receiving half of a registered call. Dropping it forgets the entry.
pub struct PendingCall {
    id: String,
    rx: oneshot::Receiver<Result<Envelope>>,
    table: SharedState,
}

impl PendingCall {
    /// Correlation id to stamp on the outbound envelope.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the reply or the connection-closed outcome.
    ///
    /// Cancel safe: dropping the future drops the call and its entry.
    pub async fn wait(mut self) -> Result<Envelope> {
        (&mut self.rx).await.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Blocking variant of [`PendingCall::wait`] for non-async threads.
    pub fn blocking_wait(mut self) -> Result<Envelope> {
        let (_, placeholder) = oneshot::channel();
        let rx = std::mem::replace(&mut self.rx, placeholder);
        rx.blocking_recv().unwrap_or(Err(Error::ConnectionClosed))
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        // Already gone when the reply or the close-out was delivered.
        lock(&self.table).entries.remove(&self.id);
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall").field("id", &self.id).finish()
    }
}

impl PendingCalls {
    /// Create an empty table whose ids start with `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            state: Arc::new(Mutex::new(PendingState {
                next_id: 1,
                entries: HashMap::new(),
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        lock(&self.state)
    }

    /// Reserve a correlation id and its receptacle.
    ///
    /// Fails with [`Error::ConnectionClosed`] once the table is closed.
    pub fn register(&self) -> Result<PendingCall> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        let id = format!("{}-{}", self.prefix, state.next_id);
        state.next_id += 1;

        let (tx, rx) = oneshot::channel();
        state.entries.insert(id.clone(), tx);
        Ok(PendingCall {
            id,
            rx,
            table: Arc::clone(&self.state),
        })
    }

    /// Deliver a reply to the caller waiting on its correlation id.
    ///
    /// Returns `false` when no caller is waiting on that id.
    pub fn fulfill(&self, envelope: Envelope) -> bool {
        let slot = self.lock().entries.remove(&envelope.request_id);
        match slot {
            Some(tx) => {
                // The caller may have stopped waiting; nothing to do then.
                let _ = tx.send(Ok(envelope));
                true
            }
            None => {
                debug!(request_id = %envelope.request_id, "dropping reply with unknown correlation id");
                false
            }
        }
    }

    /// Forget a registration whose request never made it onto the wire.
    ///
    /// The waiting side sees [`Error::ConnectionClosed`].
    pub fn cancel(&self, id: &str) {
        self.lock().entries.remove(id);
    }

    /// Fail every waiting caller and refuse new registrations.
    ///
    /// Returns how many callers were released. Calling this twice is harmless.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Slot> = {
            let mut state = self.lock();
            state.closed = true;
            state.entries.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }
        if count > 0 {
            debug!(released = count, "failed pending calls on connection close");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
