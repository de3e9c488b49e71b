//! Correlation of outgoing requests with the responses that answer them.
//!
//! Each slot is resolved exactly once: by the matching response, by
//! expiry, or by cancellation. Whichever happens first removes the slot
//! under the lock, so the others find nothing and become no-ops.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::response::JsonRpcResponse;
use crate::types::RequestId;

/// Why a pending request finished without a response
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PendingError {
    #[error("Request id {0} is already pending")]
    DuplicateId(RequestId),

    #[error("Request {0} timed out")]
    Timeout(RequestId),

    #[error("Request cancelled: {0}")]
    Cancelled(String),
}

pub type PendingOutcome = Result<JsonRpcResponse, PendingError>;

/// Callback invoked with the outcome of an asynchronous request
pub type Continuation = Box<dyn FnOnce(PendingOutcome) + Send + 'static>;

enum PendingSlot {
    Waiter(oneshot::Sender<PendingOutcome>),
    Continuation(Continuation),
}

impl PendingSlot {
    fn complete(self, outcome: PendingOutcome) {
        match self {
            PendingSlot::Waiter(tx) => {
                // The waiter may already have given up
                let _ = tx.send(outcome);
            }
            PendingSlot::Continuation(continuation) => continuation(outcome),
        }
    }
}

/// Registry of requests awaiting a response
#[derive(Clone, Default)]
pub struct PendingRequests {
    slots: Arc<Mutex<HashMap<RequestId, PendingSlot>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id` and return the receiving half
    pub fn prepare(&self, id: RequestId) -> Result<oneshot::Receiver<PendingOutcome>, PendingError> {
        let (tx, rx) = oneshot::channel();
        self.insert(id, PendingSlot::Waiter(tx))?;
        Ok(rx)
    }

    /// Register a continuation for `id`. It runs on whichever task resolves
    /// the slot, so it should hand real work off quickly.
    pub fn prepare_continuation(
        &self,
        id: RequestId,
        continuation: Continuation,
    ) -> Result<(), PendingError> {
        self.insert(id, PendingSlot::Continuation(continuation))
    }

    fn insert(&self, id: RequestId, slot: PendingSlot) -> Result<(), PendingError> {
        let mut slots = self.slots.lock();
        if slots.contains_key(&id) {
            return Err(PendingError::DuplicateId(id));
        }
        slots.insert(id, slot);
        Ok(())
    }

    /// Complete the slot matching the response id. Returns `false` when
    /// nothing was waiting, which happens when a late response loses the
    /// race against a timeout.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id.clone() else {
            warn!("Dropping response without id: {:?}", response.error_object());
            return false;
        };

        let slot = self.slots.lock().remove(&id);
        match slot {
            Some(slot) => {
                slot.complete(Ok(response));
                true
            }
            None => {
                debug!(request_id = %id, "No pending request for response, dropping it");
                false
            }
        }
    }

    /// Complete the slot with a timeout error
    pub fn expire(&self, id: &RequestId) -> bool {
        let slot = self.slots.lock().remove(id);
        match slot {
            Some(slot) => {
                debug!(request_id = %id, "Pending request expired");
                slot.complete(Err(PendingError::Timeout(id.clone())));
                true
            }
            None => false,
        }
    }

    /// Drop the slot without completing it
    pub fn remove(&self, id: &RequestId) -> bool {
        self.slots.lock().remove(id).is_some()
    }

    /// Fail every outstanding request, used when the channel is gone for good
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(RequestId, PendingSlot)> = self.slots.lock().drain().collect();
        let count = drained.len();
        for (id, slot) in drained {
            debug!(request_id = %id, reason, "Cancelling pending request");
            slot.complete(Err(PendingError::Cancelled(reason.to_string())));
        }
        count
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.slots.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("pending", &self.len())
            .finish()
    }
}
