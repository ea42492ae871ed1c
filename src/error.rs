//! Custom error types for the application.
//!
//! `PiccoloError` consolidates the error sources of the server. The variants
//! fall into two families that the resource adapter maps to different
//! response classes:
//!
//! - **domain errors** (`InvalidParameter`, `Busy`, `UnknownChannel`,
//!   `UnknownRun`): the caller asked for something the instrument cannot do
//!   right now. No state was changed; reported as a bad request.
//! - everything else (device faults, I/O, persistence): reported as an
//!   internal error. Device faults additionally push the owning worker back
//!   into its reconnect loop.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type Result<T> = std::result::Result<T, PiccoloError>;

#[derive(Error, Debug)]
pub enum PiccoloError {
    #[error("{0}")]
    InvalidParameter(String),

    #[error("{0} is busy: {1}")]
    Busy(String, String),

    #[error("unknown channel {0}")]
    UnknownChannel(String),

    #[error("unknown run {0}")]
    UnknownRun(String),

    #[error("spectrometer {0} is not connected")]
    NotConnected(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("worker for {0} has gone away")]
    WorkerGone(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scheduler database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PiccoloError {
    /// Construct an invalid-parameter error from anything displayable.
    pub fn invalid(msg: impl Into<String>) -> Self {
        PiccoloError::InvalidParameter(msg.into())
    }

    /// Whether this error is the caller's fault and recoverable, as opposed
    /// to an internal failure.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            PiccoloError::InvalidParameter(_)
                | PiccoloError::Busy(_, _)
                | PiccoloError::UnknownChannel(_)
                | PiccoloError::UnknownRun(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PiccoloError::UnknownChannel("sideways".to_string());
        assert_eq!(err.to_string(), "unknown channel sideways");
        let err = PiccoloError::Busy("spectrometer S_QEP001".into(), "recording".into());
        assert!(err.to_string().contains("busy"));
    }

    #[test]
    fn test_domain_split() {
        assert!(PiccoloError::invalid("target out of range").is_domain());
        assert!(PiccoloError::UnknownRun("r".into()).is_domain());
        assert!(!PiccoloError::Device("vanished".into()).is_domain());
        assert!(!PiccoloError::NotConnected("S_1".into()).is_domain());
    }
}
