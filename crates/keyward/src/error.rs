//! Error types for the state machine driver.

use keyward_kms::KmsError;
use thiserror::Error;

use crate::collaborators::DatabaseError;

/// Errors surfaced to the caller of [`StateMachine::execute`](crate::StateMachine::execute).
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input: a bad namespace, unusable configuration, or a context
    /// missing data the requested step needs.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A KMS exchange failed.
    #[error(transparent)]
    Kms(#[from] KmsError),

    /// The engine reported an error status, an unknown state, or a state the
    /// driver was not configured to serve.
    #[error("{0}")]
    Protocol(String),

    /// The credential source could not produce KMS provider credentials.
    #[error("KMS credentials unavailable: {0}")]
    Credentials(String),

    /// A database collaborator failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Payload bytes were not a valid document.
    #[error("BSON error: {0}")]
    Bson(String),

    /// The markup helper process could not be started.
    #[error("Failed to spawn markup helper: {0}")]
    Spawn(String),

    /// The operation deadline elapsed.
    #[error("{0}")]
    OperationTimedOut(&'static str),
}

impl Error {
    /// Returns true for network timeouts reported by a database collaborator.
    ///
    /// This is the only failure the markings step recovers from.
    pub fn is_network_timeout(&self) -> bool {
        matches!(self, Self::Database(DatabaseError::NetworkTimeout(_)))
    }
}

impl From<bson::raw::Error> for Error {
    fn from(e: bson::raw::Error) -> Self {
        Self::Bson(e.to_string())
    }
}

impl From<bson::ser::Error> for Error {
    fn from(e: bson::ser::Error) -> Self {
        Self::Bson(e.to_string())
    }
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, Error>;
