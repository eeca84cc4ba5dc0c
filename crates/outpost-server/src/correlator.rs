//! Request correlator
//!
//! Matches server-issued `http_request` frames to the agent's
//! `http_response` by request id. Each pending request holds a oneshot
//! sender; dropping the correlator (when its session dies) wakes every
//! waiter with an error, which the dispatcher turns into a 502.

use dashmap::DashMap;
use outpost_proto::HeaderList;
use tokio::sync::oneshot;
use tracing::trace;

/// Response fields the dispatcher needs to answer the public client.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub status_code: u16,
    pub headers: HeaderList,
    pub body: Option<String>,
    pub is_base64: bool,
}

/// In-flight requests for one agent session, keyed by request id.
#[derive(Default)]
pub struct PendingRequests {
    waiting: DashMap<String, oneshot::Sender<AgentResponse>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and get the receiver its response will arrive on.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<AgentResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(request_id.to_string(), tx);
        rx
    }

    /// Complete a pending request. Returns false when the id is unknown,
    /// already completed, or timed out; second completions are ignored.
    pub fn complete(&self, request_id: &str, response: AgentResponse) -> bool {
        match self.waiting.remove(request_id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => {
                trace!(request_id, "response for unknown or finished request");
                false
            }
        }
    }

    /// Drop a request that will no longer be waited on (timeout path).
    pub fn forget(&self, request_id: &str) {
        self.waiting.remove(request_id);
    }

    /// Fail everything still pending. Dropping the senders wakes each
    /// waiter with a receive error; used when the owning session dies.
    pub fn abort_all(&self) {
        self.waiting.clear();
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
