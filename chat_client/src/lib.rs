pub mod backoff;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod rest;
pub mod router;
pub mod sends;
pub mod session;
pub mod transport;
pub mod typing;

pub use backoff::ReconnectPolicy;
pub use channel::{ChannelHandle, ChannelStatus, ConnectionState};
pub use client::{ChatClient, FeedEvent, SessionHandle};
pub use config::{ClientConfig, ProbeConfig};
pub use error::ClientError;
pub use rest::{OutgoingAttachment, RestClient};
pub use session::{ChatSession, SessionSnapshot, TypingUser};
