use serde::{Deserialize, Serialize};

/// Severity attached to server notifications.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

/// Reference to a conversation participant.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: i64,
    pub username: String,
}

/// File descriptor attached to a message. The client treats these as opaque
/// handles; upload happens through the REST send call.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: i64,
    pub file_name: String,
    pub url: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub size_bytes: i64,
}

/// A chat message as returned by the REST API and held in session state.
/// Optimistic placeholders use a negative client-assigned id until the
/// server confirms the send.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reply_to: Option<i64>,
    pub created_at: i64,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_optimistic: bool,
}

/// Denormalized summary of the newest message in a conversation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LastMessage {
    pub id: i64,
    pub sender_id: i64,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: i64,
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    pub updated_at: i64,
}

/// Body of the REST send call when no attachments are present. With
/// attachments the same fields travel as multipart form parts instead.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub reply_to: Option<i64>,
    #[serde(default)]
    pub client_key: Option<String>,
}

/// Frames pushed by the server over a socket, tagged by `type`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        id: i64,
        sender_id: i64,
        content: String,
        #[serde(default)]
        is_read: bool,
        created_at: i64,
    },
    Typing {
        user_id: i64,
        username: String,
        is_typing: bool,
    },
    ReadReceipt {
        message_id: i64,
        user_id: i64,
    },
    Notification {
        message: String,
        severity: Severity,
    },
    Error {
        message: String,
    },
}

/// Frames the client writes to a chat socket, tagged by `type`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message { content: String },
    Typing { is_typing: bool },
    Read { message_id: i64 },
}
