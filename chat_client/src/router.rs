use std::sync::atomic::{AtomicU64, Ordering};

use chat_api::ServerFrame;
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::warn;

use crate::error::ClientError;

/// Parses inbound socket payloads and fans the resulting events out to
/// every subscriber. Tag-based filtering is the subscriber's job. One
/// router per connection.
pub struct Router {
    subscribers: Mutex<Vec<(u64, UnboundedSender<ServerFrame>)>>,
    next_id: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to all events, returning the subscription id and the
    /// receiving end. Dropping the receiver is enough to unsubscribe;
    /// [`Router::unsubscribe`] removes it eagerly.
    pub fn subscribe(&self) -> (u64, UnboundedReceiver<ServerFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().push((id, tx));
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(sub_id, _)| *sub_id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Parse a raw payload and fan it out. Malformed frames are logged and
    /// dropped; one corrupt frame never affects the frames around it.
    pub fn dispatch_raw(&self, raw: &str) {
        match serde_json::from_str::<ServerFrame>(raw) {
            Ok(frame) => self.dispatch(frame),
            Err(err) => {
                let dropped = ClientError::MalformedFrame {
                    reason: err.to_string(),
                };
                warn!("dropping frame: {dropped}");
            }
        }
    }

    /// Deliver an event to every subscriber. Fan-out runs over a snapshot
    /// of the registry so subscribers may unregister mid-dispatch; dead
    /// senders are pruned afterwards.
    pub fn dispatch(&self, frame: ServerFrame) {
        let snapshot: Vec<(u64, UnboundedSender<ServerFrame>)> =
            self.subscribers.lock().clone();
        let mut dead = Vec::new();
        for (id, tx) in &snapshot {
            if tx.send(frame.clone()).is_err() {
                dead.push(*id);
            }
        }
        if !dead.is_empty() {
            self.subscribers
                .lock()
                .retain(|(id, _)| !dead.contains(id));
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
