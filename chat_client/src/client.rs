use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chat_api::{ClientFrame, Conversation, Message, ServerFrame, Severity};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelHandle, ChannelStatus, ConnectionState};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::rest::{OutgoingAttachment, RestClient};
use crate::sends::SendCoordinator;
use crate::session::{ChatSession, SessionSnapshot};
use crate::typing::TypingNotifier;

/// Notification delivered on the global feed.
#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub message: String,
    pub severity: Severity,
}

/// Observable handle to the active conversation, handed to the UI layer.
#[derive(Clone)]
pub struct SessionHandle {
    session: ChatSession,
    status_rx: watch::Receiver<ChannelStatus>,
}

impl SessionHandle {
    pub fn conversation_id(&self) -> i64 {
        self.session.conversation_id()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    pub fn status_stream(&self) -> watch::Receiver<ChannelStatus> {
        self.status_rx.clone()
    }
}

struct ActiveConversation {
    id: i64,
    generation: u64,
    channel: ChannelHandle,
    session: ChatSession,
    sends: Arc<SendCoordinator>,
    typing: TypingNotifier,
    sweeper: JoinHandle<()>,
}

struct NotificationChannel {
    channel: ChannelHandle,
    _pump: JoinHandle<()>,
}

/// Facade over the messaging layer. One instance per authenticated
/// session, owned by the application context and passed by reference;
/// it drives at most one chat channel (the active conversation) plus the
/// long-lived notification channel.
pub struct ChatClient {
    config: ClientConfig,
    rest: RestClient,
    feed_tx: broadcast::Sender<FeedEvent>,
    active: Mutex<Option<ActiveConversation>>,
    notifications: Mutex<Option<NotificationChannel>>,
    generation: AtomicU64,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let rest = RestClient::new(&config)?;
        let (feed_tx, _) = broadcast::channel(100);
        Ok(Self {
            config,
            rest,
            feed_tx,
            active: Mutex::new(None),
            notifications: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    /// Open the global notification channel. Idempotent; the channel
    /// survives conversation switches and lives until [`ChatClient::shutdown`].
    pub async fn start_notifications(&self) -> Result<()> {
        let mut guard = self.notifications.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let url = self.config.notification_socket_url()?;
        let channel = ChannelHandle::open(
            url,
            self.config.auth_token.clone(),
            self.config.reconnect_policy(),
        );
        let (_id, mut rx) = channel.subscribe();
        let feed_tx = self.feed_tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    ServerFrame::Notification { message, severity } => {
                        let _ = feed_tx.send(FeedEvent { message, severity });
                    }
                    ServerFrame::Error { message } => {
                        warn!("server error on notification channel: {message}");
                    }
                    other => debug!("ignoring frame on notification channel: {other:?}"),
                }
            }
        });
        *guard = Some(NotificationChannel {
            channel,
            _pump: pump,
        });
        Ok(())
    }

    /// Subscribe to the global notification feed. Safe to call from any
    /// number of UI components.
    pub fn subscribe_feed(&self) -> broadcast::Receiver<FeedEvent> {
        self.feed_tx.subscribe()
    }

    pub async fn notification_state(&self) -> ConnectionState {
        match self.notifications.lock().await.as_ref() {
            Some(n) => n.channel.state(),
            None => ConnectionState::Disconnected,
        }
    }

    /// Make `conversation_id` the active conversation. Reuses the current
    /// channel when the id already matches; otherwise the previous channel
    /// is closed first (its reconnect timer dies with it) and a fresh one
    /// is opened, followed by a history fetch that is discarded if the
    /// active conversation changed again while it was in flight.
    pub async fn open_conversation(&self, conversation_id: i64) -> Result<SessionHandle> {
        let generation;
        let handle;
        {
            let mut guard = self.active.lock().await;
            if let Some(active) = guard.as_ref() {
                if active.id == conversation_id {
                    return Ok(SessionHandle {
                        session: active.session.clone(),
                        status_rx: active.channel.status_stream(),
                    });
                }
            }
            if let Some(previous) = guard.take() {
                close_conversation(previous);
            }

            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let url = self.config.chat_socket_url(conversation_id)?;
            let channel = ChannelHandle::open(
                url,
                self.config.auth_token.clone(),
                self.config.reconnect_policy(),
            );
            let session = ChatSession::new(
                conversation_id,
                self.config.user_id,
                self.config.typing_timeout,
            );
            let sends = Arc::new(SendCoordinator::new(
                session.clone(),
                self.rest.clone(),
                self.config.user_id,
                self.config.echo_window,
            ));

            spawn_event_pump(&channel, session.clone(), sends.clone());
            spawn_resync(
                channel.status_stream(),
                session.clone(),
                self.rest.clone(),
                conversation_id,
            );
            let sweeper = spawn_typing_sweeper(session.clone());

            handle = SessionHandle {
                session: session.clone(),
                status_rx: channel.status_stream(),
            };
            *guard = Some(ActiveConversation {
                id: conversation_id,
                generation,
                channel,
                session,
                sends,
                typing: TypingNotifier::new(self.config.typing_debounce),
                sweeper,
            });
        }

        // initial history fetch, outside the lock so a concurrent switch
        // is never blocked behind it
        match self.rest.fetch_history(conversation_id).await {
            Ok(history) => {
                let guard = self.active.lock().await;
                match guard.as_ref() {
                    Some(active) if active.generation == generation => {
                        active.session.merge_history(history);
                    }
                    _ => debug!("discarding history for conversation {conversation_id}"),
                }
            }
            Err(err) => warn!("history fetch failed for {conversation_id}: {err:#}"),
        }
        Ok(handle)
    }

    /// Close the active conversation's channel without opening another.
    pub async fn close_active(&self) {
        if let Some(previous) = self.active.lock().await.take() {
            close_conversation(previous);
        }
    }

    pub async fn active_snapshot(&self) -> Option<SessionSnapshot> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.session.snapshot())
    }

    /// Send a message in the active conversation. Attachments ride the
    /// REST call; the returned error is retryable.
    pub async fn send_message(
        &self,
        content: String,
        attachments: Vec<OutgoingAttachment>,
        reply_to: Option<i64>,
    ) -> Result<Message, ClientError> {
        let sends = {
            let guard = self.active.lock().await;
            match guard.as_ref() {
                Some(active) => active.sends.clone(),
                None => {
                    return Err(ClientError::OptimisticSendFailed {
                        reason: "no_active_conversation".into(),
                    })
                }
            }
        };
        sends.send(content, attachments, reply_to).await
    }

    /// Emit a typing indicator on the active channel, debounced.
    pub async fn send_typing(&self, is_typing: bool) {
        let guard = self.active.lock().await;
        if let Some(active) = guard.as_ref() {
            if active.typing.should_send(is_typing) {
                active.channel.send(ClientFrame::Typing { is_typing });
            }
        }
    }

    /// Tell the server a specific message was seen.
    pub async fn send_read_receipt(&self, message_id: i64) {
        let guard = self.active.lock().await;
        if let Some(active) = guard.as_ref() {
            active.channel.send(ClientFrame::Read { message_id });
        }
    }

    /// Clear the active conversation's unread state server-side.
    pub async fn mark_conversation_read(&self) -> Result<()> {
        let id = {
            let guard = self.active.lock().await;
            match guard.as_ref() {
                Some(active) => active.id,
                None => anyhow::bail!("no_active_conversation"),
            }
        };
        self.rest.mark_read(id).await
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.rest.list_conversations().await
    }

    /// Manual reconnect for a failed active channel; resets the attempt
    /// counter.
    pub async fn retry_active(&self) {
        let guard = self.active.lock().await;
        if let Some(active) = guard.as_ref() {
            active.channel.retry();
        }
    }

    pub async fn shutdown(&self) {
        self.close_active().await;
        if let Some(notifications) = self.notifications.lock().await.take() {
            notifications.channel.close();
        }
    }
}

fn close_conversation(previous: ActiveConversation) {
    info!("closing channel for conversation {}", previous.id);
    previous.channel.close();
    previous.sweeper.abort();
    // the event pump and resync task wind down on their own once the
    // driver drops the router and the status sender
}

fn spawn_event_pump(channel: &ChannelHandle, session: ChatSession, sends: Arc<SendCoordinator>) {
    let (_id, mut rx) = channel.subscribe();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let ServerFrame::Message {
                sender_id,
                ref content,
                created_at,
                ..
            } = frame
            {
                if sends.is_pending_echo(sender_id, content, created_at) {
                    debug!("dropping echo of pending send");
                    continue;
                }
            }
            if let ServerFrame::Error { ref message } = frame {
                warn!("server error on chat channel: {message}");
            }
            session.apply_event(&frame);
        }
    });
}

/// Watch the channel status and refetch history on every fresh connection,
/// keyed on the dial epoch: a drop and redial that complete between two
/// wakeups still move the epoch. Fetches run in their own task; the
/// observer never awaits REST.
fn spawn_resync(
    mut status_rx: watch::Receiver<ChannelStatus>,
    session: ChatSession,
    rest: RestClient,
    conversation_id: i64,
) {
    tokio::spawn(async move {
        // epoch 1 is the first connect; its history comes with the open call
        let mut synced_epoch: u64 = 1;
        loop {
            let status = *status_rx.borrow_and_update();
            session.set_connection(status.state);
            if status.state == ConnectionState::Connected && status.epoch > synced_epoch {
                synced_epoch = status.epoch;
                let session = session.clone();
                let rest = rest.clone();
                tokio::spawn(async move {
                    match rest.fetch_history(conversation_id).await {
                        Ok(history) => {
                            debug!("resynced history for {conversation_id} after reconnect");
                            session.merge_history(history);
                        }
                        Err(err) => warn!("history resync failed: {err:#}"),
                    }
                });
            }
            if status_rx.changed().await.is_err() {
                break;
            }
        }
    });
}

fn spawn_typing_sweeper(session: ChatSession) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            session.prune_expired_typing();
        }
    })
}
