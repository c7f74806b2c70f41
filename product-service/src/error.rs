use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("contract violation: {0}")]
    Contract(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Upstream(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn contract(msg: impl Into<String>) -> Self {
        Error::Contract(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

const RETRYABLE_PHRASES: [&str; 7] = [
    "connection refused",
    "i/o timeout",
    "network is unreachable",
    "broker not available",
    "connection reset",
    "broken pipe",
    "no such host",
];

// Broker clients surface network failures as free-form text, so classification
// falls back to substring matching on the lowercased message.
pub fn classify_publish_error(message: &str) -> Error {
    let lowered = message.to_lowercase();
    if RETRYABLE_PHRASES.iter().any(|phrase| lowered.contains(phrase)) {
        Error::Transient(message.to_string())
    } else {
        Error::Upstream(message.to_string())
    }
}

impl From<diesel::result::Error> for Error {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error as DieselError};

        match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                Error::Conflict(info.message().to_string())
            }
            other => Error::Upstream(format!("database error: {other}")),
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Upstream(format!("vectorizer rpc: {status}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_network_phrases_are_transient() {
        for message in [
            "dial tcp: connection refused",
            "read: i/o timeout",
            "Network is unreachable",
            "Broker not available",
            "recv failed: Connection reset by peer",
            "write: broken pipe",
            "lookup kafka: no such host",
        ] {
            let err = classify_publish_error(message);
            assert!(err.is_retryable(), "expected {message:?} to be transient");
        }
    }

    #[test]
    fn unknown_failures_are_permanent() {
        let err = classify_publish_error("message too large");
        assert!(!err.is_retryable());
        assert!(matches!(err, Error::Upstream(_)));
    }
}
