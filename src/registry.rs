//! Pending-response registry.
//!
//! Maps request ids to response slots. The connection's reader task settles
//! slots as responses arrive; callers block on [`PendingResponse::wait`].
//! One mutex guards both the slot map and the id counter; it is never held
//! across an await point.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{ClientError, rpc};

/// Callback invoked when a slot settles. Receives the response message, or
/// `None` when the request was aborted.
pub type ResponseCallback = Box<dyn FnOnce(Option<&serde_json::Value>) + Send>;

struct Slot {
    tx: oneshot::Sender<Option<serde_json::Value>>,
    callback: Option<ResponseCallback>,
}

#[derive(Default)]
struct Inner {
    last_id: u64,
    slots: HashMap<u64, Slot>,
}

/// Registry of in-flight requests for one connection.
#[derive(Default)]
pub struct ResponseRegistry {
    inner: Mutex<Inner>,
}

/// Error for a response whose id matches no pending request.
#[derive(Debug, thiserror::Error)]
#[error("response for unknown request id {id}")]
pub struct UnexpectedResponse {
    pub id: u64,
}

impl ResponseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next request id. Ids start at 1 and are never reused
    /// within a connection's lifetime.
    pub fn alloc_id(&self) -> u64 {
        let mut inner = self.inner.lock().expect("response registry poisoned");
        inner.last_id += 1;
        inner.last_id
    }

    /// Insert a slot for `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` already has a pending slot. Callers allocate ids via
    /// [`alloc_id`](Self::alloc_id), which makes duplicates impossible.
    pub fn register(&self, id: u64, callback: Option<ResponseCallback>) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("response registry poisoned");
        let previous = inner.slots.insert(id, Slot { tx, callback });
        assert!(previous.is_none(), "request id {id} registered twice");
        PendingResponse { rx }
    }

    /// Settle the slot for `id` with `message`.
    ///
    /// The callback (if any) runs before the waiter is released, outside the
    /// registry lock.
    pub fn deliver(
        &self,
        id: u64,
        message: serde_json::Value,
    ) -> Result<(), UnexpectedResponse> {
        let slot = self
            .inner
            .lock()
            .expect("response registry poisoned")
            .slots
            .remove(&id)
            .ok_or(UnexpectedResponse { id })?;
        if let Some(callback) = slot.callback {
            callback(Some(&message));
        }
        // The waiter may have timed out and dropped its receiver.
        let _ = slot.tx.send(Some(message));
        Ok(())
    }

    /// Settle the slot for `id` with `None` (the send never reached the
    /// wire). The waiter is released with `ResponseAborted`.
    pub fn discard(&self, id: u64) {
        let slot = self
            .inner
            .lock()
            .expect("response registry poisoned")
            .slots
            .remove(&id);
        if let Some(slot) = slot {
            if let Some(callback) = slot.callback {
                callback(None);
            }
            let _ = slot.tx.send(None);
        }
    }

    /// Settle every outstanding slot with `None`, releasing all waiters with
    /// `ResponseAborted`. Callbacks run with `None`.
    pub fn abort_all(&self) {
        let slots: Vec<Slot> = {
            let mut inner = self.inner.lock().expect("response registry poisoned");
            inner.slots.drain().map(|(_, slot)| slot).collect()
        };
        if !slots.is_empty() {
            tracing::debug!(count = slots.len(), "aborting outstanding requests");
        }
        for slot in slots {
            if let Some(callback) = slot.callback {
                callback(None);
            }
            let _ = slot.tx.send(None);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .expect("response registry poisoned")
            .slots
            .len()
    }
}

/// Handle for one outstanding request.
pub struct PendingResponse {
    rx: oneshot::Receiver<Option<serde_json::Value>>,
}

impl PendingResponse {
    /// Block until the slot settles or the deadline passes.
    ///
    /// - deadline passed → `ResponseTimeout`
    /// - settled with no message (abort, or registry dropped) → `ResponseAborted`
    /// - message carries an `error` member → `ResponseFailed`
    /// - otherwise the response message
    pub async fn wait(self, timeout: Duration) -> Result<serde_json::Value, ClientError> {
        let settled = tokio::time::timeout(timeout, self.rx)
            .await
            .map_err(|_| ClientError::ResponseTimeout)?;
        let message = settled
            .map_err(|_| ClientError::ResponseAborted)?
            .ok_or(ClientError::ResponseAborted)?;
        if let Some(error) = message.get("error") {
            return Err(ClientError::ResponseFailed {
                code: error
                    .get("code")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or(rpc::UNKNOWN_ERROR_CODE),
                message: error
                    .get("message")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        Ok(message)
    }
}
