use thiserror::Error;

/// Failure taxonomy for the ingestion pipeline. None of these are fatal:
/// the router and the periodic tasks log them and move on.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("malformed {what} payload: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("no device id in topic '{0}'")]
    MissingDevice(String),

    #[error("unknown message kind in topic '{0}'")]
    UnknownKind(String),

    #[error("not found: {0}")]
    Lookup(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("push delivery failed: {0}")]
    Delivery(String),
}

pub type MonitorResult<T> = Result<T, MonitorError>;

impl MonitorError {
    pub fn decode(what: &'static str, source: serde_json::Error) -> Self {
        Self::Decode { what, source }
    }
}
