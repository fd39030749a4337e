#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequest, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chat_api::{Attachment, Conversation, Message, Participant, SendMessageRequest};
use chat_client::config::ClientConfig;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use url::Url;

/// User id the tests act as; the mock attributes REST sends to it.
pub const SELF_USER: i64 = 9;

#[derive(Clone, Debug)]
pub enum Push {
    Frame(String),
    Drop,
}

pub struct MockStateInner {
    pub next_id: AtomicI64,
    pub conversations: Mutex<Vec<Conversation>>,
    pub histories: Mutex<HashMap<i64, Vec<Message>>>,
    pub sent_keys: Mutex<HashMap<String, Message>>,
    pub chat_pushers: Mutex<HashMap<i64, broadcast::Sender<Push>>>,
    pub notif_pusher: broadcast::Sender<Push>,
    pub chat_dials: Mutex<HashMap<i64, usize>>,
    pub notif_connects: Mutex<usize>,
    pub history_fetches: Mutex<HashMap<i64, usize>>,
    pub read_calls: Mutex<Vec<i64>>,
    pub client_frames: Mutex<Vec<(i64, String)>>,
    pub fail_sends: AtomicBool,
    pub refuse_chat: AtomicBool,
    pub history_delay_ms: AtomicU64,
}

pub type MockState = Arc<MockStateInner>;

pub struct MockServer {
    pub addr: SocketAddr,
    pub state: MockState,
    pub task: JoinHandle<()>,
}

impl MockServer {
    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    pub fn push_chat(&self, conversation_id: i64, frame: &str) {
        let _ = chat_pusher(&self.state, conversation_id).send(Push::Frame(frame.to_string()));
    }

    /// Sever every socket on the conversation's channel without a goodbye.
    pub fn drop_chat(&self, conversation_id: i64) {
        let _ = chat_pusher(&self.state, conversation_id).send(Push::Drop);
    }

    pub fn push_notification(&self, frame: &str) {
        let _ = self.state.notif_pusher.send(Push::Frame(frame.to_string()));
    }

    pub fn chat_dials(&self, conversation_id: i64) -> usize {
        self.state
            .chat_dials
            .lock()
            .get(&conversation_id)
            .copied()
            .unwrap_or(0)
    }

    /// Stall every later history response, its content frozen at request
    /// time.
    pub fn delay_history(&self, delay: Duration) {
        self.state
            .history_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn history_fetches(&self, conversation_id: i64) -> usize {
        self.state
            .history_fetches
            .lock()
            .get(&conversation_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn client_frames(&self, conversation_id: i64) -> Vec<String> {
        self.state
            .client_frames
            .lock()
            .iter()
            .filter(|(id, _)| *id == conversation_id)
            .map(|(_, raw)| raw.clone())
            .collect()
    }
}

fn chat_pusher(state: &MockStateInner, conversation_id: i64) -> broadcast::Sender<Push> {
    state
        .chat_pushers
        .lock()
        .entry(conversation_id)
        .or_insert_with(|| broadcast::channel(64).0)
        .clone()
}

pub async fn spawn_server() -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let state: MockState = Arc::new(MockStateInner {
        next_id: AtomicI64::new(1000),
        conversations: Mutex::new(Vec::new()),
        histories: Mutex::new(HashMap::new()),
        sent_keys: Mutex::new(HashMap::new()),
        chat_pushers: Mutex::new(HashMap::new()),
        notif_pusher: broadcast::channel(64).0,
        chat_dials: Mutex::new(HashMap::new()),
        notif_connects: Mutex::new(0),
        history_fetches: Mutex::new(HashMap::new()),
        read_calls: Mutex::new(Vec::new()),
        client_frames: Mutex::new(Vec::new()),
        fail_sends: AtomicBool::new(false),
        refuse_chat: AtomicBool::new(false),
        history_delay_ms: AtomicU64::new(0),
    });
    let app = Router::new()
        .route("/api/conversations/", get(list_conversations))
        .route(
            "/api/conversations/:id/messages/",
            get(history).post(send_message),
        )
        .route("/api/conversations/:id/read/", post(mark_read))
        .route("/ws/chat/:id/", get(ws_chat))
        .route("/ws/notifications/", get(ws_notifications))
        .with_state(state.clone());
    let task = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    MockServer { addr, state, task }
}

/// Client config pointed at the mock, with timings tightened for tests.
pub fn test_config(server: &MockServer) -> ClientConfig {
    let mut cfg = ClientConfig::new(server.base_url(), SELF_USER);
    cfg.reconnect_base = Duration::from_millis(40);
    cfg.typing_timeout = Duration::from_millis(400);
    cfg.typing_debounce = Duration::from_millis(100);
    cfg
}

pub fn seed_conversation(server: &MockServer, id: i64, unread: u32) {
    server.state.conversations.lock().push(Conversation {
        id,
        participants: vec![
            Participant {
                id: SELF_USER,
                username: "me".into(),
            },
            Participant {
                id: 2,
                username: "alice".into(),
            },
        ],
        last_message: None,
        unread_count: unread,
        updated_at: 0,
    });
}

pub fn seed_message(
    server: &MockServer,
    conversation_id: i64,
    id: i64,
    sender_id: i64,
    content: &str,
    created_at: i64,
) {
    server
        .state
        .histories
        .lock()
        .entry(conversation_id)
        .or_default()
        .push(Message {
            id,
            conversation_id,
            sender_id,
            content: content.into(),
            attachments: Vec::new(),
            reply_to: None,
            created_at,
            is_read: false,
            is_optimistic: false,
        });
}

pub fn message_frame(id: i64, sender_id: i64, content: &str, created_at: i64) -> String {
    serde_json::json!({
        "type": "message",
        "id": id,
        "sender_id": sender_id,
        "content": content,
        "is_read": false,
        "created_at": created_at,
    })
    .to_string()
}

pub fn typing_frame(user_id: i64, username: &str, is_typing: bool) -> String {
    serde_json::json!({
        "type": "typing",
        "user_id": user_id,
        "username": username,
        "is_typing": is_typing,
    })
    .to_string()
}

pub fn receipt_frame(message_id: i64, user_id: i64) -> String {
    serde_json::json!({
        "type": "read_receipt",
        "message_id": message_id,
        "user_id": user_id,
    })
    .to_string()
}

pub fn notification_frame(message: &str, severity: &str) -> String {
    serde_json::json!({
        "type": "notification",
        "message": message,
        "severity": severity,
    })
    .to_string()
}

/// Poll until `cond` holds or the timeout hits.
pub async fn wait_for(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn list_conversations(State(state): State<MockState>) -> Json<Vec<Conversation>> {
    Json(state.conversations.lock().clone())
}

async fn history(
    Path(conversation_id): Path<i64>,
    State(state): State<MockState>,
) -> Json<Vec<Message>> {
    let snapshot = state
        .histories
        .lock()
        .get(&conversation_id)
        .cloned()
        .unwrap_or_default();
    *state
        .history_fetches
        .lock()
        .entry(conversation_id)
        .or_insert(0) += 1;
    let delay = state.history_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    Json(snapshot)
}

fn bad_request<E: std::fmt::Display>(err: E) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
}

async fn send_message(
    Path(conversation_id): Path<i64>,
    State(state): State<MockState>,
    req: axum::http::Request<axum::body::Body>,
) -> Result<Json<Message>, (StatusCode, Json<serde_json::Value>)> {
    if state.fail_sends.load(Ordering::SeqCst) {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "send_unavailable"})),
        ));
    }
    let content_type = req
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut attachments = Vec::new();
    let (content, reply_to, client_key) = if content_type.starts_with("multipart/") {
        let mut multipart = Multipart::from_request(req, &())
            .await
            .map_err(bad_request)?;
        let mut content = String::new();
        let mut reply_to = None;
        let mut client_key = None;
        while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
            match field.name() {
                Some("content") => content = field.text().await.map_err(bad_request)?,
                Some("reply_to") => {
                    reply_to = field.text().await.map_err(bad_request)?.parse().ok()
                }
                Some("client_key") => client_key = Some(field.text().await.map_err(bad_request)?),
                Some("files") => {
                    let file_name = field
                        .file_name()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "file".into());
                    let mime = field.content_type().map(|m| m.to_string());
                    let data = field.bytes().await.map_err(bad_request)?;
                    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
                    attachments.push(Attachment {
                        id,
                        file_name,
                        url: format!("/files/{id}"),
                        mime,
                        size_bytes: data.len() as i64,
                    });
                }
                _ => {}
            }
        }
        (content, reply_to, client_key)
    } else {
        let Json(body): Json<SendMessageRequest> =
            Json::from_request(req, &()).await.map_err(bad_request)?;
        (body.content, body.reply_to, body.client_key)
    };

    if let Some(key) = &client_key {
        if let Some(existing) = state.sent_keys.lock().get(key) {
            return Ok(Json(existing.clone()));
        }
    }

    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    let message = Message {
        id,
        conversation_id,
        sender_id: SELF_USER,
        content,
        attachments,
        reply_to,
        created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
        is_read: false,
        is_optimistic: false,
    };
    state
        .histories
        .lock()
        .entry(conversation_id)
        .or_default()
        .push(message.clone());
    if let Some(key) = client_key {
        state.sent_keys.lock().insert(key, message.clone());
    }
    // broadcast the sender's own message back, as the live server does
    let _ = chat_pusher(&state, conversation_id).send(Push::Frame(message_frame(
        message.id,
        message.sender_id,
        &message.content,
        message.created_at,
    )));
    Ok(Json(message))
}

async fn mark_read(Path(conversation_id): Path<i64>, State(state): State<MockState>) -> StatusCode {
    state.read_calls.lock().push(conversation_id);
    if let Some(conversation) = state
        .conversations
        .lock()
        .iter_mut()
        .find(|c| c.id == conversation_id)
    {
        conversation.unread_count = 0;
    }
    StatusCode::OK
}

async fn ws_chat(
    Path(conversation_id): Path<i64>,
    ws: WebSocketUpgrade,
    State(state): State<MockState>,
) -> Result<impl IntoResponse, StatusCode> {
    *state
        .chat_dials
        .lock()
        .entry(conversation_id)
        .or_insert(0) += 1;
    if state.refuse_chat.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let push_rx = chat_pusher(&state, conversation_id).subscribe();
    Ok(ws.on_upgrade(move |socket| serve_socket(socket, state, conversation_id, push_rx)))
}

async fn ws_notifications(
    ws: WebSocketUpgrade,
    State(state): State<MockState>,
) -> impl IntoResponse {
    *state.notif_connects.lock() += 1;
    let push_rx = state.notif_pusher.subscribe();
    ws.on_upgrade(move |socket| serve_socket(socket, state, 0, push_rx))
}

async fn serve_socket(
    mut socket: WebSocket,
    state: MockState,
    conversation_id: i64,
    mut push_rx: broadcast::Receiver<Push>,
) {
    loop {
        tokio::select! {
            push = push_rx.recv() => match push {
                Ok(Push::Frame(raw)) => {
                    if socket.send(WsFrame::Text(raw)).await.is_err() {
                        break;
                    }
                }
                Ok(Push::Drop) | Err(_) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(WsFrame::Text(raw))) => {
                    state.client_frames.lock().push((conversation_id, raw));
                }
                Some(Ok(WsFrame::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}
