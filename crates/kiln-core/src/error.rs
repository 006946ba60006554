//! Loader error types
//!
//! Every failure the loader can surface. Errors are `Clone` because a single
//! in-flight load is awaited by many callers through a shared future.

use thiserror::Error;

/// Loader errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoaderError {
    #[error("Network error while fetching '{module}': {message}")]
    Network {
        module: String,
        message: String,
        /// Connection drops, timeouts and 5xx responses may succeed on retry.
        transient: bool,
    },

    #[error("Module '{module}' did not signal readiness within {waited_ms}ms")]
    ReadinessTimeout { module: String, waited_ms: u64 },

    #[error("Function '{function}' is not available in module '{module}'")]
    FunctionNotAvailable { module: String, function: String },

    #[error("Isolated worker could not start: {0}")]
    ChannelInitializationFailure(String),

    #[error("Worker request #{request_id} ({kind}) timed out after {timeout_ms}ms")]
    ChannelTimeout {
        request_id: u64,
        kind: String,
        timeout_ms: u64,
    },

    #[error("Worker channel was terminated while a request was outstanding")]
    Terminated,

    #[error("Worker error: {0}")]
    Channel(String),

    #[error("Failed to instantiate module '{module}': {message}")]
    Instantiation { module: String, message: String },

    #[error("Execution of '{function}' failed: {message}")]
    Execution { function: String, message: String },

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("No module exports function '{0}'")]
    UnknownFunction(String),

    #[error("Module '{0}' is not loaded")]
    ModuleNotLoaded(String),

    #[error("Module '{module}' was replaced by a newer load (generation {current})")]
    Superseded { module: String, current: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("{operation} failed: {source}")]
    Invocation {
        operation: String,
        #[source]
        source: Box<LoaderError>,
    },
}

/// Loader result type
pub type LoaderResult<T> = Result<T, LoaderError>;

impl LoaderError {
    pub fn network(module: &str, message: impl Into<String>, transient: bool) -> Self {
        Self::Network {
            module: module.to_string(),
            message: message.into(),
            transient,
        }
    }

    pub fn instantiation(module: &str, message: impl std::fmt::Display) -> Self {
        Self::Instantiation {
            module: module.to_string(),
            message: message.to_string(),
        }
    }

    pub fn execution(function: &str, message: impl std::fmt::Display) -> Self {
        Self::Execution {
            function: function.to_string(),
            message: message.to_string(),
        }
    }

    /// Wrap an error with the name of the operation that produced it.
    pub fn during(self, operation: impl Into<String>) -> Self {
        Self::Invocation {
            operation: operation.into(),
            source: Box::new(self),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { transient: true, .. })
    }

    /// Whether the isolated worker is gone or unresponsive, as opposed to the
    /// module itself failing.
    pub fn is_worker_failure(&self) -> bool {
        matches!(
            self,
            Self::ChannelInitializationFailure(_)
                | Self::ChannelTimeout { .. }
                | Self::Terminated
                | Self::Channel(_)
        )
    }

    /// The innermost error, looking through `Invocation` wrappers.
    pub fn root_cause(&self) -> &LoaderError {
        match self {
            Self::Invocation { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<std::io::Error> for LoaderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_wraps_source() {
        let err = LoaderError::FunctionNotAvailable {
            module: "crypto".to_string(),
            function: "sign".to_string(),
        }
        .during("sign");

        assert_eq!(
            err.to_string(),
            "sign failed: Function 'sign' is not available in module 'crypto'"
        );
        assert!(matches!(
            err.root_cause(),
            LoaderError::FunctionNotAvailable { .. }
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(LoaderError::network("crypto", "connection reset", true).is_transient());
        assert!(!LoaderError::network("crypto", "HTTP 404", false).is_transient());
        assert!(!LoaderError::Terminated.is_transient());
    }

    #[test]
    fn test_worker_failure_classification() {
        assert!(LoaderError::Terminated.is_worker_failure());
        assert!(LoaderError::Channel("worker exited".to_string()).is_worker_failure());
        assert!(
            LoaderError::ChannelTimeout {
                request_id: 3,
                kind: "invoke".to_string(),
                timeout_ms: 60_000,
            }
            .is_worker_failure()
        );
        assert!(!LoaderError::execution("sign", "unreachable").is_worker_failure());
        assert!(!LoaderError::ModuleNotLoaded("crypto".to_string()).is_worker_failure());
    }
}
