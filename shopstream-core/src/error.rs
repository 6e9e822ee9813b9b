use thiserror::Error;

/// Engine-wide error taxonomy.
///
/// Per-request failures (`Validation`, `NotFound`, `InvalidState`,
/// `Negotiation`) are returned to the requesting participant as structured
/// signaling responses and never take the coordinator down. `WorkerFailure`
/// is deliberately not contained: a dead media worker is fatal to the whole
/// service and is surfaced to the supervisor instead of being retried.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Negotiation failure: {0}")]
    Negotiation(String),

    #[error("Worker failure: {0}")]
    WorkerFailure(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable machine-readable code carried in signaling error responses.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::Negotiation(_) => "negotiation_failure",
            Self::WorkerFailure(_) => "worker_failure",
            Self::Unauthorized(_) => "unauthorized",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("malformed payload: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::Validation(String::new()).code(), "validation");
        assert_eq!(Error::not_found("transport", "t1").code(), "not_found");
        assert_eq!(Error::InvalidState(String::new()).code(), "invalid_state");
        assert_eq!(
            Error::Negotiation(String::new()).code(),
            "negotiation_failure"
        );
        assert_eq!(Error::WorkerFailure(String::new()).code(), "worker_failure");
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("producer", "p42");
        assert_eq!(err.to_string(), "producer not found: p42");
    }
}
