use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum GridlinkError {
    /// Malformed input or missing required configuration. Surfaced
    /// synchronously, never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// Dial, login, or timeout failure talking to the overlay or an
    /// upstream. Surfaced to the caller; no automatic reconnect.
    #[error("connectivity: {0}")]
    Connectivity(String),

    /// Durable-store failure. The runner logs and swallows these;
    /// the variant exists for store implementations to return.
    #[error("persistence: {0}")]
    Persistence(String),

    /// Destination rejected by the allowlist. Definitive, not retried.
    #[error("destination {host}:{port} not allowed")]
    PolicyDenied { host: String, port: u16 },

    /// The per-kind execution queue is at capacity.
    #[error("job queue for kind {0:?} is full")]
    QueueFull(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, GridlinkError>;
