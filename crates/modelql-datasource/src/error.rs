//! Error types for data-source operations.

/// Errors that can occur while describing or accessing the data source.
#[derive(Debug, thiserror::Error)]
pub enum DatasourceError {
    /// The requested record was not found.
    #[error("Record not found: {entity}/{id}")]
    NotFound {
        /// The entity the record belongs to.
        entity: String,
        /// The primary key of the missing record.
        id: String,
    },

    /// The named entity is not part of the data model.
    #[error("Unknown entity: {entity}")]
    UnknownEntity {
        /// The unknown entity name.
        entity: String,
    },

    /// The write payload was rejected by the backend.
    #[error("Invalid payload: {message}")]
    InvalidPayload {
        /// Description of why the payload is invalid.
        message: String,
    },

    /// The backend could not be reached.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection failure.
        message: String,
    },

    /// An internal backend error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl DatasourceError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a new `UnknownEntity` error.
    #[must_use]
    pub fn unknown_entity(entity: impl Into<String>) -> Self {
        Self::UnknownEntity {
            entity: entity.into(),
        }
    }

    /// Creates a new `InvalidPayload` error.
    #[must_use]
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns whether the error indicates a missing record rather than a
    /// backend failure.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
