use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chat_api::ClientFrame;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Notifications the socket task raises to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Closed { code: Option<u16> },
}

enum Command {
    Send(String),
    Close,
}

/// One persistent socket. `open` dials and spawns the I/O task; `close`
/// is idempotent and takes the socket down with a close frame.
pub struct Transport {
    cmd_tx: UnboundedSender<Command>,
    connected: Arc<AtomicBool>,
    manually_closed: Arc<AtomicBool>,
}

impl Transport {
    pub async fn open(
        url: Url,
        auth_token: Option<&str>,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Self, ClientError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ClientError::Transport {
                reason: err.to_string(),
            })?;
        if let Some(token) = auth_token {
            let value = match format!("Bearer {token}").parse() {
                Ok(v) => v,
                Err(_) => {
                    return Err(ClientError::Transport {
                        reason: "invalid_auth_header".into(),
                    })
                }
            };
            request.headers_mut().append("Authorization", value);
        }
        let (stream, _resp) = connect_async(request)
            .await
            .map_err(|err| ClientError::Transport {
                reason: err.to_string(),
            })?;
        let connected = Arc::new(AtomicBool::new(true));
        let manually_closed = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = unbounded_channel();
        let _ = events.send(TransportEvent::Opened);
        tokio::spawn(run_socket(stream, cmd_rx, events, connected.clone()));
        Ok(Self {
            cmd_tx,
            connected,
            manually_closed,
        })
    }

    /// Send a frame. Drops with a log when the socket is not connected;
    /// callers must not assume delivery.
    pub fn send(&self, frame: &ClientFrame) {
        if !self.connected.load(Ordering::SeqCst) {
            warn!("{}", ClientError::SendRejected);
            return;
        }
        match serde_json::to_string(frame) {
            Ok(raw) => {
                if self.cmd_tx.send(Command::Send(raw)).is_err() {
                    warn!("{}", ClientError::SendRejected);
                }
            }
            Err(err) => warn!("unserializable frame: {err}"),
        }
    }

    /// Idempotent manual close.
    pub fn close(&self) {
        if self.manually_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(Command::Close);
    }
}

async fn run_socket(
    stream: WsStream,
    mut cmd_rx: UnboundedReceiver<Command>,
    events: UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
) {
    let (mut sink, mut source) = stream.split();
    let close_code = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(raw)) => {
                    if let Err(err) = sink.send(WsMessage::Text(raw)).await {
                        warn!("socket write failed: {err}");
                        break None;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break None;
                }
            },
            msg = source.next() => match msg {
                Some(Ok(WsMessage::Text(raw))) => {
                    let _ = events.send(TransportEvent::Frame(raw));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    break frame.map(|f| u16::from(f.code));
                }
                Some(Ok(_)) => {} // ping/pong/binary
                Some(Err(err)) => {
                    debug!("socket read failed: {err}");
                    break None;
                }
                None => break None,
            },
        }
    };
    connected.store(false, Ordering::SeqCst);
    let _ = events.send(TransportEvent::Closed { code: close_code });
}
