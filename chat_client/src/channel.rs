use std::sync::Arc;

use chat_api::{ClientFrame, ServerFrame};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::ReconnectPolicy;
use crate::error::ClientError;
use crate::router::Router;
use crate::transport::{Transport, TransportEvent};

/// Connectivity of one channel. Transitions published here are the only
/// source of truth for UI connectivity indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// State plus the dial epoch, published together on the status watch.
/// The epoch counts successful dials; it moves even when a reader misses
/// the intermediate transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub epoch: u64,
}

enum ChannelCommand {
    Send(ClientFrame),
    Close,
    Retry,
}

/// Handle to one live channel: the driver task owns the socket and the
/// reconnect timer; this handle carries the command entry points, the
/// status watch and the router delivering inbound events. Dropping the
/// handle winds the driver down.
pub struct ChannelHandle {
    router: Arc<Router>,
    status_rx: watch::Receiver<ChannelStatus>,
    cmd_tx: UnboundedSender<ChannelCommand>,
}

impl ChannelHandle {
    /// Spawn the driver for `url`. Connecting happens inside the task;
    /// observe progress through [`ChannelHandle::status_stream`].
    pub fn open(url: Url, auth_token: Option<String>, policy: ReconnectPolicy) -> Self {
        let router = Arc::new(Router::new());
        let (status_tx, status_rx) = watch::channel(ChannelStatus {
            state: ConnectionState::Disconnected,
            epoch: 0,
        });
        let (cmd_tx, cmd_rx) = unbounded_channel();
        tokio::spawn(drive(
            url,
            auth_token,
            policy,
            router.clone(),
            status_tx,
            cmd_rx,
        ));
        Self {
            router,
            status_rx,
            cmd_tx,
        }
    }

    pub fn subscribe(&self) -> (u64, UnboundedReceiver<ServerFrame>) {
        self.router.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    pub fn status_stream(&self) -> watch::Receiver<ChannelStatus> {
        self.status_rx.clone()
    }

    /// Queue a frame for the socket. Dropped with a log when the channel
    /// is not connected.
    pub fn send(&self, frame: ClientFrame) {
        if self.cmd_tx.send(ChannelCommand::Send(frame)).is_err() {
            warn!("{}", ClientError::SendRejected);
        }
    }

    /// Close the channel for good. No reconnect will be scheduled; the
    /// pending reconnect timer, if any, dies with the driver.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(ChannelCommand::Close);
    }

    /// Reset the attempt counter and reconnect now. The affordance behind
    /// a "retry" button on a failed channel.
    pub fn retry(&self) {
        let _ = self.cmd_tx.send(ChannelCommand::Retry);
    }
}

enum DialInterrupt {
    Close,
    Retry,
}

async fn wait_interrupt(cmd_rx: &mut UnboundedReceiver<ChannelCommand>) -> DialInterrupt {
    loop {
        match cmd_rx.recv().await {
            Some(ChannelCommand::Close) | None => return DialInterrupt::Close,
            Some(ChannelCommand::Retry) => return DialInterrupt::Retry,
            Some(ChannelCommand::Send(_)) => warn!("{}", ClientError::SendRejected),
        }
    }
}

fn publish(status_tx: &watch::Sender<ChannelStatus>, state: ConnectionState, epoch: u64) {
    let _ = status_tx.send(ChannelStatus { state, epoch });
}

async fn drive(
    url: Url,
    auth_token: Option<String>,
    policy: ReconnectPolicy,
    router: Arc<Router>,
    status_tx: watch::Sender<ChannelStatus>,
    mut cmd_rx: UnboundedReceiver<ChannelCommand>,
) {
    let mut attempt: u32 = 0;
    let mut epoch: u64 = 0;
    loop {
        publish(&status_tx, ConnectionState::Connecting, epoch);
        let (event_tx, mut event_rx) = unbounded_channel();
        let dialed = tokio::select! {
            res = Transport::open(url.clone(), auth_token.as_deref(), event_tx) => Some(res),
            interrupt = wait_interrupt(&mut cmd_rx) => match interrupt {
                DialInterrupt::Close => {
                    publish(&status_tx, ConnectionState::Disconnected, epoch);
                    return;
                }
                DialInterrupt::Retry => {
                    attempt = 0;
                    None
                }
            },
        };
        match dialed {
            None => continue,
            Some(Ok(transport)) => {
                attempt = 0;
                epoch += 1;
                publish(&status_tx, ConnectionState::Connected, epoch);
                info!("channel connected: {url}");
                loop {
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            Some(ChannelCommand::Send(frame)) => transport.send(&frame),
                            Some(ChannelCommand::Retry) => {}
                            Some(ChannelCommand::Close) | None => {
                                transport.close();
                                publish(&status_tx, ConnectionState::Disconnected, epoch);
                                return;
                            }
                        },
                        ev = event_rx.recv() => match ev {
                            Some(TransportEvent::Frame(raw)) => router.dispatch_raw(&raw),
                            Some(TransportEvent::Opened) => {}
                            Some(TransportEvent::Closed { code }) => {
                                debug!("socket closed (code {code:?}): {url}");
                                break;
                            }
                            None => break,
                        },
                    }
                }
            }
            Some(Err(err)) => {
                warn!("connect failed: {err}: {url}");
            }
        }

        // unexpected drop or failed dial: consult the schedule
        match policy.delay_for(attempt) {
            Some(delay) => {
                publish(&status_tx, ConnectionState::Reconnecting, epoch);
                attempt += 1;
                debug!("reconnecting {url} in {delay:?}");
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        cmd = cmd_rx.recv() => match cmd {
                            Some(ChannelCommand::Close) | None => {
                                publish(&status_tx, ConnectionState::Disconnected, epoch);
                                return;
                            }
                            Some(ChannelCommand::Retry) => {
                                attempt = 0;
                                break;
                            }
                            Some(ChannelCommand::Send(_)) => warn!("{}", ClientError::SendRejected),
                        },
                    }
                }
            }
            None => {
                let exhausted = ClientError::ReconnectExhausted {
                    attempts: policy.max_attempts(),
                };
                warn!("{exhausted}: {url}");
                publish(&status_tx, ConnectionState::Failed, epoch);
                loop {
                    match cmd_rx.recv().await {
                        Some(ChannelCommand::Retry) => {
                            attempt = 0;
                            break;
                        }
                        Some(ChannelCommand::Close) | None => {
                            publish(&status_tx, ConnectionState::Disconnected, epoch);
                            return;
                        }
                        Some(ChannelCommand::Send(_)) => warn!("{}", ClientError::SendRejected),
                    }
                }
            }
        }
    }
}
