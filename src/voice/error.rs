use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    /// Transport or auth failure while opening the provider socket.
    #[error("connection error: {0}")]
    Connection(String),

    /// Required provider fields are missing or invalid. Never retried.
    #[error("invalid voice configuration: {0}")]
    Configuration(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session is not ready")]
    NotReady,

    #[error("client was closed")]
    Closed,

    #[error("outbound channel closed")]
    ChannelClosed,
}

