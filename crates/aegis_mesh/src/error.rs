use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("not connected to relay")]
    NotConnected,

    #[error("peer key for {0} unknown")]
    UnknownPeerKey(String),

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("invite not accepted within the timeout")]
    InviteTimeout,

    #[error("invite rejected by peer")]
    InviteRejected,

    #[error("consent scope denies tool '{tool}'")]
    ScopeDenied { tool: String },

    #[error("crypto error: {0}")]
    Crypto(#[from] aegis_crypto::CryptoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
