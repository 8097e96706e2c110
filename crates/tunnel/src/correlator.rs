//! Request/reply correlation.
//!
//! Every outbound command gets an id from [`Correlator::next_id`] and a
//! pending entry from [`Correlator::register`]. Inbound envelopes are handed to
//! [`Correlator::resolve`], which completes the matching entry or hands the
//! envelope back as unsolicited.
//!
//! A request may carry a [`ReplyHook`]. The hook runs inside
//! [`Correlator::resolve`], on the task reading the session, before the
//! waiter is woken and before any later frame is routed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use protocol::error::{ProtocolError, Result};
use protocol::{parse_reason, Envelope, Item, Reply, MAX_REQUEST_ID, TAG_ERROR};
use tokio::sync::oneshot;

type Completion = oneshot::Sender<Result<Reply>>;

/// Callback run on a successful reply while it is being routed.
pub type ReplyHook = Arc<dyn Fn(&Reply) + Send + Sync>;

struct Pending {
    completion: Completion,
    hook: Option<ReplyHook>,
}

struct Inner {
    next_id: u64,
    pending: HashMap<u64, Pending>,
}

/// Table of in-flight requests.
pub struct Correlator {
    inner: Mutex<Inner>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Creates an empty correlator whose first id is 1.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                pending: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The table stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the next request id.
    pub fn next_id(&self) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id = if id >= MAX_REQUEST_ID { 0 } else { id + 1 };
        id
    }

    /// Registers a pending request and returns the receiver for its reply.
    ///
    /// Registering an id that is still pending replaces the older entry, whose
    /// waiter then observes a closed channel.
    pub fn register(&self, id: u64) -> oneshot::Receiver<Result<Reply>> {
        self.register_with(id, None)
    }

    /// Registers a pending request whose successful reply also runs `hook`.
    pub fn register_with(
        &self,
        id: u64,
        hook: Option<ReplyHook>,
    ) -> oneshot::Receiver<Result<Reply>> {
        let (completion, rx) = oneshot::channel();
        let pending = Pending { completion, hook };
        if self.lock().pending.insert(id, pending).is_some() {
            tracing::warn!(request_id = id, "request id reused while still pending");
        }
        rx
    }

    /// Allocates an id and registers it in one step.
    pub fn begin(&self) -> (u64, oneshot::Receiver<Result<Reply>>) {
        self.begin_with(None)
    }

    /// Like [`Correlator::begin`], attaching a reply hook.
    pub fn begin_with(&self, hook: Option<ReplyHook>) -> (u64, oneshot::Receiver<Result<Reply>>) {
        let id = self.next_id();
        (id, self.register_with(id, hook))
    }

    /// Drops a pending request without completing it.
    pub fn remove(&self, id: u64) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    /// Number of pending requests.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Routes an inbound envelope.
    ///
    /// Returns `None` if it completed a pending request, or the envelope
    /// itself if it is unsolicited.
    pub fn resolve(&self, envelope: Envelope) -> Option<Envelope> {
        let completion = envelope
            .request_id()
            .and_then(|id| self.lock().pending.remove(&id).map(|tx| (id, tx)));

        let Some((id, pending)) = completion else {
            return Some(envelope);
        };

        let outcome = reply_outcome(envelope.body);
        match (&outcome, &pending.hook) {
            (Ok(reply), Some(hook)) => hook(reply),
            (Err(err), _) => {
                tracing::debug!(request_id = id, error = %err, "request failed remotely")
            }
            _ => {}
        }
        if pending.completion.send(outcome).is_err() {
            tracing::debug!(request_id = id, "reply arrived after its waiter gave up");
        }
        None
    }

    /// Fails every pending request with `ConnectionClosed`.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<Completion> = self
            .lock()
            .pending
            .drain()
            .map(|(_, pending)| pending.completion)
            .collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(ProtocolError::ConnectionClosed(reason.to_string())));
        }
        count
    }
}

fn reply_outcome(body: Vec<Item>) -> Result<Reply> {
    let mut body = body.into_iter();
    let tag = match body.next() {
        Some(item) => item
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| item.to_string()),
        None => return Err(ProtocolError::UnexpectedResponse("empty reply".to_string())),
    };
    let values: Vec<Item> = body.collect();

    if tag == TAG_ERROR {
        Err(ProtocolError::remote(parse_reason(&values)))
    } else {
        Ok(Reply { tag, values })
    }
}
