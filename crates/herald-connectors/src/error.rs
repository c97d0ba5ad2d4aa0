use herald_core::SourceError;

/// Failures that are not part of a collaborator call: building a client,
/// or a gateway session ending abnormally.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("gateway lookup failed: {0}")]
    GatewayLookup(#[from] SourceError),

    #[error("gateway protocol: {0}")]
    Protocol(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),
}
