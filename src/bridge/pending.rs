//! Correlation of outstanding requests to inbound responses.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::Response;

/// Outstanding requests keyed by id. Ids are monotonic per bridge instance
/// and never reused while still pending. There is no timeout here: an entry
/// lives until a matching response arrives or the connection drops, at which
/// point it resolves to a synthetic empty response.
pub(crate) struct PendingRequestRegistry {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Response>>,
}

impl PendingRequestRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            pending: HashMap::new(),
        }
    }

    /// Allocate an id without registering a completion (fire-and-forget
    /// notifications still carry ids on the wire).
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Allocate an id and register its completion channel.
    pub fn register(&mut self) -> (u64, oneshot::Receiver<Response>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Deliver a response to the matching entry. Unknown ids are dropped.
    pub fn complete(&mut self, response: Response) -> bool {
        match self.pending.remove(&response.id) {
            Some(tx) => {
                let _ = tx.send(response);
                true
            }
            None => {
                debug!(id = response.id, "response with no pending request");
                false
            }
        }
    }

    /// Resolve one entry with an empty response (request could not be sent).
    pub fn resolve_empty(&mut self, id: u64) {
        if let Some(tx) = self.pending.remove(&id) {
            let _ = tx.send(Response::empty(id));
        }
    }

    /// Resolve everything outstanding with empty responses (disconnect).
    pub fn drain(&mut self) {
        for (id, tx) in self.pending.drain() {
            let _ = tx.send(Response::empty(id));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
