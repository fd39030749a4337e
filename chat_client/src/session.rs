use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chat_api::{Message, ServerFrame};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::channel::ConnectionState;

/// A participant currently typing, as exposed to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: i64,
    pub username: String,
}

/// Read-only view of one conversation, recomputed on demand. The UI never
/// mutates session state directly.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub conversation_id: i64,
    pub connection: ConnectionState,
    pub messages: Vec<Message>,
    pub typing: Vec<TypingUser>,
}

struct TypingEntry {
    username: String,
    expires_at: Instant,
}

struct SessionInner {
    messages: Vec<Message>,
    typing: HashMap<i64, TypingEntry>,
    receipts: HashMap<i64, HashSet<i64>>,
    connection: ConnectionState,
}

/// Per-conversation aggregate merging REST history with live events.
/// Messages are deduplicated by id and ordered by `created_at` ascending,
/// ties broken by id. Receipts only ever grow; typing entries decay after
/// the configured timeout even when the stop frame is lost.
#[derive(Clone)]
pub struct ChatSession {
    conversation_id: i64,
    self_user_id: i64,
    typing_timeout: Duration,
    inner: Arc<Mutex<SessionInner>>,
}

impl ChatSession {
    pub fn new(conversation_id: i64, self_user_id: i64, typing_timeout: Duration) -> Self {
        Self {
            conversation_id,
            self_user_id,
            typing_timeout,
            inner: Arc::new(Mutex::new(SessionInner {
                messages: Vec::new(),
                typing: HashMap::new(),
                receipts: HashMap::new(),
                connection: ConnectionState::Disconnected,
            })),
        }
    }

    pub fn conversation_id(&self) -> i64 {
        self.conversation_id
    }

    /// Merge a history page. Existing entries with the same id are
    /// overwritten by the fetched copy, except that a read flag set by a
    /// live receipt is never reverted.
    pub fn merge_history(&self, history: Vec<Message>) {
        let mut inner = self.inner.lock();
        for message in history {
            upsert(&mut inner.messages, message);
        }
        sort_messages(&mut inner.messages);
    }

    /// Apply one live event from the channel's router.
    pub fn apply_event(&self, frame: &ServerFrame) {
        match frame {
            ServerFrame::Message {
                id,
                sender_id,
                content,
                is_read,
                created_at,
            } => {
                let message = Message {
                    id: *id,
                    conversation_id: self.conversation_id,
                    sender_id: *sender_id,
                    content: content.clone(),
                    attachments: Vec::new(),
                    reply_to: None,
                    created_at: *created_at,
                    is_read: *is_read,
                    is_optimistic: false,
                };
                let mut inner = self.inner.lock();
                if upsert(&mut inner.messages, message) {
                    sort_messages(&mut inner.messages);
                }
            }
            ServerFrame::Typing {
                user_id,
                username,
                is_typing,
            } => {
                if *user_id == self.self_user_id {
                    return;
                }
                let mut inner = self.inner.lock();
                if *is_typing {
                    inner.typing.insert(
                        *user_id,
                        TypingEntry {
                            username: username.clone(),
                            expires_at: Instant::now() + self.typing_timeout,
                        },
                    );
                } else {
                    inner.typing.remove(user_id);
                }
            }
            ServerFrame::ReadReceipt {
                message_id,
                user_id,
            } => {
                let mut inner = self.inner.lock();
                inner
                    .receipts
                    .entry(*message_id)
                    .or_default()
                    .insert(*user_id);
                if let Some(message) = inner.messages.iter_mut().find(|m| m.id == *message_id) {
                    if message.sender_id != *user_id {
                        message.is_read = true;
                    }
                }
            }
            ServerFrame::Notification { .. } | ServerFrame::Error { .. } => {
                debug!("non-session frame on chat channel");
            }
        }
    }

    /// Users who have read `message_id`, sorted for stable display.
    pub fn readers(&self, message_id: i64) -> Vec<i64> {
        let inner = self.inner.lock();
        let mut readers: Vec<i64> = inner
            .receipts
            .get(&message_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        readers.sort_unstable();
        readers
    }

    pub fn set_connection(&self, state: ConnectionState) {
        self.inner.lock().connection = state;
    }

    /// Drop typing entries whose stop frame never arrived.
    pub fn prune_expired_typing(&self) {
        let now = Instant::now();
        self.inner.lock().typing.retain(|_, entry| entry.expires_at > now);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.typing.retain(|_, entry| entry.expires_at > now);
        let mut typing: Vec<TypingUser> = inner
            .typing
            .iter()
            .map(|(user_id, entry)| TypingUser {
                user_id: *user_id,
                username: entry.username.clone(),
            })
            .collect();
        typing.sort_by_key(|t| t.user_id);
        SessionSnapshot {
            conversation_id: self.conversation_id,
            connection: inner.connection,
            messages: inner.messages.clone(),
            typing,
        }
    }

    /// Append a provisional outgoing message. At most one placeholder per
    /// client-initiated send exists until it is resolved or removed.
    pub fn insert_optimistic(&self, placeholder: Message) {
        let mut inner = self.inner.lock();
        inner.messages.push(placeholder);
        sort_messages(&mut inner.messages);
    }

    /// Swap the placeholder for the server-confirmed message, keeping its
    /// list position. If the confirmed id already arrived through the
    /// socket the placeholder is simply dropped.
    pub fn resolve_optimistic(&self, temp_id: i64, confirmed: Message) {
        let mut inner = self.inner.lock();
        let already_present = inner
            .messages
            .iter()
            .any(|m| m.id == confirmed.id && m.id != temp_id);
        if already_present {
            inner.messages.retain(|m| m.id != temp_id);
            if let Some(existing) = inner.messages.iter_mut().find(|m| m.id == confirmed.id) {
                let keep_read = existing.is_read || confirmed.is_read;
                *existing = confirmed;
                existing.is_read = keep_read;
                existing.is_optimistic = false;
            }
            return;
        }
        if let Some(slot) = inner.messages.iter_mut().find(|m| m.id == temp_id) {
            *slot = confirmed;
            slot.is_optimistic = false;
        }
    }

    /// Roll back a failed send. Returns whether the placeholder was still
    /// present.
    pub fn remove_optimistic(&self, temp_id: i64) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.messages.len();
        inner.messages.retain(|m| m.id != temp_id);
        inner.messages.len() != before
    }
}

fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

/// Insert or overwrite by id. Returns true when a new entry was added.
/// The read flag is monotone: once set it survives an overwrite carrying
/// `is_read: false`.
fn upsert(messages: &mut Vec<Message>, incoming: Message) -> bool {
    if let Some(existing) = messages.iter_mut().find(|m| m.id == incoming.id) {
        let keep_read = existing.is_read || incoming.is_read;
        *existing = incoming;
        existing.is_read = keep_read;
        false
    } else {
        messages.push(incoming);
        true
    }
}
