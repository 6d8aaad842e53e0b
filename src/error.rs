//! Error types shared by the registry and the generator.
//!
//! Nothing in the reconciliation or regeneration pipeline terminates the
//! process. Every failure is wrapped into an [`Error`] and published as an
//! error notification on the component that owns the failing pass.

use std::path::PathBuf;

use crate::runtime::RuntimeError;
use crate::store::{QueryError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Listing, inspecting or subscribing to the daemon failed.
    #[error("daemon error: {0}")]
    Daemon(#[from] RuntimeError),

    /// Reading or writing the snapshot store failed.
    #[error("snapshot store error: {0}")]
    Store(#[from] StoreError),

    /// A daemon event or a template query could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("failed to render template {}: {message}", template.display())]
    Render { template: PathBuf, message: String },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to restart service {service}: {source}")]
    Restart {
        service: String,
        #[source]
        source: RuntimeError,
    },

    /// A reconciliation or generation pass panicked.
    #[error("{pass} pass panicked: {message}")]
    Panicked { pass: String, message: String },
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Parse(err.to_string())
    }
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
