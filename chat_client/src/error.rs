use thiserror::Error;

/// Errors raised by the messaging layer. None of these terminate the host
/// application: transport failures feed the reconnect machinery, malformed
/// frames are dropped, and only exhausted reconnects and confirmed send
/// failures reach the UI.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket-level failure (dial error, broken stream).
    #[error("transport_error: {reason}")]
    Transport { reason: String },

    /// Inbound payload that does not parse into a known frame.
    #[error("malformed_frame: {reason}")]
    MalformedFrame { reason: String },

    /// Socket send attempted while the channel was not connected.
    #[error("send_rejected")]
    SendRejected,

    /// Automatic reconnection gave up after the configured attempt count.
    #[error("reconnect_exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// The REST send call failed; the optimistic placeholder was rolled
    /// back and the send may be retried.
    #[error("optimistic_send_failed: {reason}")]
    OptimisticSendFailed { reason: String },
}
