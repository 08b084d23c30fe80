use thiserror::Error;

/// Failures while reading from the stats API.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection failure, timeout, 429 or 5xx. Worth retrying with backoff.
    #[error("transient network failure: {0}")]
    Transient(String),

    /// The response parsed but did not have the expected shape. Retrying
    /// will not help; the operator needs to see this.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Failures while writing a record to the remote store.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Credential rejected. Fatal for the whole run.
    #[error("store authorization rejected: {0}")]
    Auth(String),

    /// Local record shape has drifted from the remote table schema. Fatal.
    #[error("record does not match remote table schema: {0}")]
    SchemaMismatch(String),

    #[error("rate limited by remote store")]
    RateLimited,

    #[error("remote store server error: {0}")]
    Server(String),

    #[error("store transport failure: {0}")]
    Transport(String),
}

impl WriteError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WriteError::RateLimited | WriteError::Server(_) | WriteError::Transport(_)
        )
    }

    /// Auth and schema failures will hit every record in the batch the same
    /// way, so the run stops issuing writes once one is seen.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, WriteError::Auth(_) | WriteError::SchemaMismatch(_))
    }
}

/// The model never produced output passing schema validation within the
/// retry budget. The affected report is skipped, never persisted partially.
#[derive(Debug, Error)]
#[error("model output failed validation after {attempts} attempts: {reason}")]
pub struct GenerationError {
    pub attempts: u32,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_retry_classes() {
        assert!(WriteError::RateLimited.is_retryable());
        assert!(WriteError::Server("500".into()).is_retryable());
        assert!(WriteError::Transport("reset".into()).is_retryable());
        assert!(!WriteError::Auth("401".into()).is_retryable());
        assert!(!WriteError::SchemaMismatch("bad field".into()).is_retryable());
    }

    #[test]
    fn fatal_classes_stop_the_run() {
        assert!(WriteError::Auth("401".into()).is_fatal_for_run());
        assert!(WriteError::SchemaMismatch("bad field".into()).is_fatal_for_run());
        assert!(!WriteError::RateLimited.is_fatal_for_run());
    }
}
