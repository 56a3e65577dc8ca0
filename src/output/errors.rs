// Error types for nexus-dispatch

use std::path::PathBuf;

use thiserror::Error;

use crate::executor::result::AggregatedResult;

/// All errors surfaced by the dispatch engine itself.
///
/// Failures raised by a task against a single host are never reported
/// through this type directly; they are captured in that host's
/// [`TaskResult`](crate::executor::TaskResult). Only when a run is
/// configured to raise on error do they escalate, wrapped as
/// [`DispatchError::Execution`].
#[derive(Debug, Error)]
pub enum DispatchError {
    /// At least one host failed and raise-on-error was active
    #[error("{}", execution_summary(.0))]
    Execution(Box<AggregatedResult>),

    /// A connection type name that is not in the registry
    #[error("unknown connection type '{name}'")]
    UnknownConnection {
        name: String,
        available: Vec<String>,
    },

    /// A host name that is not part of the session's inventory
    #[error("unknown host '{0}'")]
    UnknownHost(String),

    /// A connection plugin failed to open
    #[error("connection '{connection}' to host '{host}' failed: {source}")]
    Connection {
        host: String,
        connection: String,
        #[source]
        source: ConnectionError,
    },

    /// Explicit open of a connection that is already open
    #[error("connection '{connection}' is already open on host '{host}'")]
    ConnectionAlreadyOpen { host: String, connection: String },

    /// Failure of the scheduling machinery, not of a task
    #[error("worker pool error: {0}")]
    Pool(String),

    /// Invalid or unreadable configuration
    #[error("configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },
}

impl DispatchError {
    /// The aggregated result carried by an execution error
    pub fn result(&self) -> Option<&AggregatedResult> {
        match self {
            DispatchError::Execution(result) => Some(result),
            _ => None,
        }
    }

    /// Consume the error, returning the aggregated result if there is one
    pub fn into_result(self) -> Option<AggregatedResult> {
        match self {
            DispatchError::Execution(result) => Some(*result),
            _ => None,
        }
    }

    /// A short hint on how to resolve the error, when one applies
    pub fn suggestion(&self) -> Option<String> {
        match self {
            DispatchError::Execution(_) => Some(
                "Inspect the per-host results, or run with raise_on_error disabled to record the failures instead"
                    .to_string(),
            ),
            DispatchError::UnknownConnection { available, .. } if !available.is_empty() => {
                Some(format!("Available connection types: {}", available.join(", ")))
            }
            DispatchError::UnknownConnection { .. } => {
                Some("Register the connection plugin before running tasks".to_string())
            }
            DispatchError::UnknownHost(_) => {
                Some("Check the host name against the session's inventory".to_string())
            }
            DispatchError::ConnectionAlreadyOpen { .. } => {
                Some("Use get_connection to reuse the open connection".to_string())
            }
            DispatchError::Config { path: Some(path), .. } => {
                Some(format!("Check the configuration file at {}", path.display()))
            }
            _ => None,
        }
    }
}

fn execution_summary(result: &AggregatedResult) -> String {
    let failed = result.failed_host_names();
    format!(
        "task '{}' failed on {} of {} host(s): {}",
        result.name(),
        failed.len(),
        result.len(),
        failed.join(", ")
    )
}

/// Errors raised by connection plugins
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to open: {0}")]
    Open(String),

    #[error("connection is not open")]
    NotOpen,

    #[error("connection is not a {0}")]
    WrongType(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
