use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chat_api::{Attachment, Message};
use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::error::ClientError;
use crate::rest::{OutgoingAttachment, RestClient};
use crate::session::ChatSession;

struct PendingSend {
    temp_id: i64,
    content: String,
    created_at: i64,
}

/// Coordinates optimistic sends for one conversation: placeholder insert,
/// REST dispatch, in-place replacement on success and rollback on failure.
/// Also matches socket echoes of still-pending sends so they are dropped
/// instead of double-inserted.
pub struct SendCoordinator {
    session: ChatSession,
    rest: RestClient,
    self_user_id: i64,
    echo_window_secs: i64,
    next_temp: AtomicI64,
    pending: Mutex<Vec<PendingSend>>,
}

impl SendCoordinator {
    pub fn new(
        session: ChatSession,
        rest: RestClient,
        self_user_id: i64,
        echo_window: Duration,
    ) -> Self {
        Self {
            session,
            rest,
            self_user_id,
            echo_window_secs: echo_window.as_secs() as i64,
            next_temp: AtomicI64::new(-1),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub async fn send(
        &self,
        content: String,
        attachments: Vec<OutgoingAttachment>,
        reply_to: Option<i64>,
    ) -> Result<Message, ClientError> {
        let temp_id = self.next_temp.fetch_sub(1, Ordering::SeqCst);
        let client_key = Uuid::new_v4().to_string();
        let created_at = OffsetDateTime::now_utc().unix_timestamp();
        let placeholder = Message {
            id: temp_id,
            conversation_id: self.session.conversation_id(),
            sender_id: self.self_user_id,
            content: content.clone(),
            attachments: attachments
                .iter()
                .map(|a| Attachment {
                    id: 0,
                    file_name: a.file_name.clone(),
                    url: String::new(),
                    mime: Some(a.mime.clone()),
                    size_bytes: a.data.len() as i64,
                })
                .collect(),
            reply_to,
            created_at,
            is_read: false,
            is_optimistic: true,
        };
        self.session.insert_optimistic(placeholder);
        self.pending.lock().push(PendingSend {
            temp_id,
            content: content.clone(),
            created_at,
        });

        let result = self
            .rest
            .send_message(
                self.session.conversation_id(),
                &content,
                attachments,
                reply_to,
                &client_key,
            )
            .await;
        match result {
            Ok(confirmed) => {
                self.session.resolve_optimistic(temp_id, confirmed.clone());
                self.forget(temp_id);
                debug!("send confirmed as message {}", confirmed.id);
                Ok(confirmed)
            }
            Err(err) => {
                self.session.remove_optimistic(temp_id);
                self.forget(temp_id);
                Err(ClientError::OptimisticSendFailed {
                    reason: format!("{err:#}"),
                })
            }
        }
    }

    /// True when a live message event matches a still-pending send by
    /// sender, content and timestamp window, meaning the event is the
    /// server echoing our own message back before the REST call resolved.
    pub fn is_pending_echo(&self, sender_id: i64, content: &str, created_at: i64) -> bool {
        if sender_id != self.self_user_id {
            return false;
        }
        self.pending.lock().iter().any(|p| {
            p.content == content && (created_at - p.created_at).abs() <= self.echo_window_secs
        })
    }

    fn forget(&self, temp_id: i64) {
        self.pending.lock().retain(|p| p.temp_id != temp_id);
    }
}
