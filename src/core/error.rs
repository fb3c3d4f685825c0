use thiserror::Error;
use std::io;

#[derive(Error, Debug)]
pub enum RtevalError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Prepare failed: {0}")]
    Prepare(String),

    #[error("Lifecycle error in module {module}: {message}")]
    Lifecycle { module: String, message: String },

    #[error("Setup of module {module} failed: {reason}")]
    SetupFailure { module: String, reason: String },

    #[error("Module {module} failed at runtime: {reason}")]
    RuntimeFailure { module: String, reason: String },

    #[error("Malformed report fragment from {module}: {reason}")]
    ReportMerge { module: String, reason: String },

    #[error("Report summary error: {0}")]
    Summary(String),

    #[error("Permission denied: {0}")]
    Privilege(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl RtevalError {
    pub fn setup(module: &str, reason: impl Into<String>) -> Self {
        RtevalError::SetupFailure { module: module.to_string(), reason: reason.into() }
    }

    pub fn runtime(module: &str, reason: impl Into<String>) -> Self {
        RtevalError::RuntimeFailure { module: module.to_string(), reason: reason.into() }
    }

    pub fn lifecycle(module: &str, message: impl Into<String>) -> Self {
        RtevalError::Lifecycle { module: module.to_string(), message: message.into() }
    }

    /// Errors that abort a run before any workload executes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RtevalError::Config(_) | RtevalError::Prepare(_) | RtevalError::Privilege(_))
    }
}

pub type Result<T> = std::result::Result<T, RtevalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RtevalError::Config("bad".into()).is_fatal());
        assert!(RtevalError::Prepare("empty".into()).is_fatal());
        assert!(!RtevalError::setup("cyclic", "missing").is_fatal());
        assert!(!RtevalError::runtime("stress", "oom").is_fatal());
    }

    #[test]
    fn test_error_messages_name_module() {
        let err = RtevalError::lifecycle("sysstat", "report requested before stop");
        assert_eq!(
            err.to_string(),
            "Lifecycle error in module sysstat: report requested before stop"
        );
    }
}
