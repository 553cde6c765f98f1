use clawdis_protocol::ErrorShape;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// The socket is not open; `request` fails with this synchronously.
    #[error("gateway not connected")]
    NotOpen,

    /// The connection dropped before the response arrived.
    #[error("gateway closed")]
    Closed,

    /// The gateway answered `res{ok:false}`.
    #[error("{}: {}", .0.code, .0.message)]
    Rpc(ErrorShape),
}

pub type Result<T> = std::result::Result<T, Error>;
