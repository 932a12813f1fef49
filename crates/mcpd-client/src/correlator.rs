//! Request correlation for in-flight protocol requests.
//!
//! Every outbound request gets an id unique to its connection. Responses
//! are matched by id, never by arrival order, and a waiting caller is
//! resolved exactly once. Late or duplicate responses are discarded.

use crate::error::{McpError, McpResult};
use crate::protocol::JsonRpcResponse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;

/// A request awaiting its response.
struct PendingRequest {
    sender: oneshot::Sender<McpResult<JsonRpcResponse>>,
    issued_at: Instant,
}

/// Tracks in-flight requests by id for one server connection.
pub struct RequestCorrelator {
    /// Request ID counter.
    next_id: AtomicU64,
    /// Pending requests awaiting responses. At most one entry per id.
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl RequestCorrelator {
    /// Create a new correlator. Ids start at 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next request id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a pending request and return the receiver the caller
    /// awaits on.
    pub fn register(&self, id: u64) -> oneshot::Receiver<McpResult<JsonRpcResponse>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().expect("correlator lock poisoned");
        pending.insert(
            id,
            PendingRequest {
                sender: tx,
                issued_at: Instant::now(),
            },
        );
        rx
    }

    /// Resolve a pending request with its response.
    ///
    /// Returns false when no entry matches, which covers both responses
    /// to unknown ids and duplicates of already-resolved requests.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let entry = {
            let mut pending = self.pending.lock().expect("correlator lock poisoned");
            pending.remove(&response.id)
        };

        match entry {
            Some(req) => {
                debug!(
                    id = response.id,
                    elapsed_ms = req.issued_at.elapsed().as_millis() as u64,
                    "Resolved request"
                );
                // The caller may have given up (timeout); a dead receiver
                // is fine.
                let _ = req.sender.send(Ok(response));
                true
            }
            None => {
                debug!(id = response.id, "Discarding late or duplicate response");
                false
            }
        }
    }

    /// Fail a single pending request.
    pub fn fail(&self, id: u64, error: McpError) {
        let entry = {
            let mut pending = self.pending.lock().expect("correlator lock poisoned");
            pending.remove(&id)
        };
        if let Some(req) = entry {
            let _ = req.sender.send(Err(error));
        }
    }

    /// Remove a pending entry without resolving it (timeout path).
    pub fn forget(&self, id: u64) {
        let mut pending = self.pending.lock().expect("correlator lock poisoned");
        pending.remove(&id);
    }

    /// Fail every pending request, e.g. on disconnect. Each waiting
    /// caller receives the error produced by `make_error`.
    pub fn fail_all(&self, make_error: impl Fn() -> McpError) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().expect("correlator lock poisoned");
            pending.drain().map(|(_, req)| req).collect()
        };
        for req in drained {
            let _ = req.sender.send(Err(make_error()));
        }
    }

    /// Number of in-flight requests.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().expect("correlator lock poisoned").len()
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
