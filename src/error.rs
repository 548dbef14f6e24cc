//! Error taxonomy for the extraction engine.
//!
//! Every failure the engine can surface is a variant of [`ExtractError`].
//! The taxonomy drives two decisions at the edges:
//!
//! - **Retry**: the pagination client retries rate limits and server errors
//!   locally with backoff; everything else propagates immediately.
//! - **Exit code**: user errors (bad configuration, bad credentials, rejected
//!   requests) exit with code 1 so the orchestrating platform does not retry
//!   the run; transient upstream failures exit with code 2 so it may.

use thiserror::Error;

pub type Result<T, E = ExtractError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unauthorized request to \"{endpoint}\", make sure the credential is valid and has read scope: {message}")]
    Auth { endpoint: String, message: String },

    #[error("rate limit still exceeded after {attempts} attempts for \"{endpoint}\"")]
    RateLimitExceeded { endpoint: String, attempts: u32 },

    #[error("upstream error {status} for \"{endpoint}\" after {attempts} attempts: {message}")]
    UpstreamServer {
        endpoint: String,
        status: u16,
        attempts: u32,
        message: String,
    },

    #[error("request to \"{endpoint}\" rejected with {status}: {message}")]
    BadRequest {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("failed to fetch the property schema for \"{object_type}\": {source}")]
    SchemaFetch {
        object_type: String,
        #[source]
        source: Box<ExtractError>,
    },

    #[error("association fetch {from_object_type} -> {to_object_type} failed: {source}")]
    AssociationFetch {
        from_object_type: String,
        to_object_type: String,
        #[source]
        source: Box<ExtractError>,
    },

    #[error("unknown object type \"{0}\"")]
    UnknownObjectType(String),

    #[error("invalid response from \"{endpoint}\": {message}")]
    InvalidResponse { endpoint: String, message: String },

    #[error("network error for \"{endpoint}\": {message}")]
    Network { endpoint: String, message: String },

    #[error("checkpoint store error: {0}")]
    State(#[from] sqlx::Error),

    #[error("table sink error: {0}")]
    Sink(#[from] std::io::Error),
}

impl ExtractError {
    /// Errors caused by the user's configuration or credentials. These will
    /// not succeed on a retry of the whole run.
    pub fn is_user_error(&self) -> bool {
        match self {
            Self::Configuration(_)
            | Self::Auth { .. }
            | Self::BadRequest { .. }
            | Self::UnknownObjectType(_) => true,
            Self::SchemaFetch { source, .. } | Self::AssociationFetch { source, .. } => {
                source.is_user_error()
            }
            _ => false,
        }
    }

    /// Errors that may resolve on their own (rate limits, upstream outages,
    /// flaky networks). A platform-level retry of the run is reasonable.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimitExceeded { .. }
            | Self::UpstreamServer { .. }
            | Self::Network { .. }
            | Self::InvalidResponse { .. } => true,
            Self::SchemaFetch { source, .. } | Self::AssociationFetch { source, .. } => {
                source.is_transient()
            }
            _ => false,
        }
    }
}
