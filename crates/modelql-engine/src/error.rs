//! Error types for the engine.
//!
//! Two layers of errors exist. [`EngineError`] and [`SchemaError`] are Rust
//! errors returned from engine APIs; [`FieldError`] is the wire-level error
//! attached to a response tree at the narrowest possible path, so sibling
//! fields can still resolve.

use serde::Serialize;

/// Fatal errors raised while compiling the data model into a schema.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    /// Two entities produced the same generated type or root name.
    #[error("Type name collision: {name} generated by both {first} and {second}")]
    TypeNameCollision {
        /// The colliding name.
        name: String,
        /// Entity that produced the name first.
        first: String,
        /// Entity that produced it again.
        second: String,
    },

    /// A relation points at an entity that does not exist.
    #[error("Relation {relation} on {entity} references unknown entity {target}")]
    UnknownRelationTarget {
        /// Entity declaring the relation.
        entity: String,
        /// Relation name.
        relation: String,
        /// The unknown target.
        target: String,
    },

    /// A field and a relation on the same entity share a name.
    #[error("Name {name} on {entity} is used by both a field and a relation")]
    FieldRelationCollision {
        /// Entity with the collision.
        entity: String,
        /// The shared name.
        name: String,
    },

    /// An entity declares the same field twice.
    #[error("Duplicate field {name} on {entity}")]
    DuplicateField {
        /// Entity with the duplicate.
        entity: String,
        /// The duplicated field name.
        name: String,
    },

    /// A name is not a valid type or field name.
    #[error("Invalid name: {name}")]
    InvalidName {
        /// The offending name.
        name: String,
    },

    /// The declared primary key does not name a field.
    #[error("Primary key {key} on {entity} does not name a field")]
    UnknownPrimaryKey {
        /// Entity with the bad primary key.
        entity: String,
        /// The declared key.
        key: String,
    },

    /// A to-many relation is missing its inverse field.
    #[error("Relation {relation} on {entity} requires an inverse field")]
    MissingInverse {
        /// Entity declaring the relation.
        entity: String,
        /// Relation name.
        relation: String,
    },

    /// A visibility override names a field the entity does not have, or
    /// excludes the primary key.
    #[error("Visibility override on {entity} is invalid: {message}")]
    InvalidVisibility {
        /// Entity with the bad override.
        entity: String,
        /// What is wrong with it.
        message: String,
    },

    /// The metadata provider failed.
    #[error("Metadata provider error: {0}")]
    Provider(String),
}

/// Errors that abort a request or the engine as a whole.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Schema compilation failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The engine configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The query document could not be parsed or bound.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Query complexity exceeded the configured maximum.
    #[error("Query complexity {actual} exceeds maximum allowed {max}")]
    ComplexityExceeded {
        /// Computed complexity.
        actual: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Query depth exceeded the configured maximum.
    #[error("Query depth {actual} exceeds maximum allowed {max}")]
    DepthExceeded {
        /// Computed depth.
        actual: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The caller abandoned the request.
    #[error("Request cancelled")]
    Cancelled,

    /// Unexpected failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns the stable error code for this error.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Schema(_) => "SCHEMA_GENERATION_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidQuery(_) => "INVALID_QUERY",
            Self::ComplexityExceeded { .. } => "COMPLEXITY_EXCEEDED",
            Self::DepthExceeded { .. } => "DEPTH_EXCEEDED",
            Self::Cancelled => "CANCELLED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// One step in a response path: a field name or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// An object field.
    Field(String),
    /// A list index.
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(value: &str) -> Self {
        Self::Field(value.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(value: String) -> Self {
        Self::Field(value)
    }
}

impl From<usize> for PathSegment {
    fn from(value: usize) -> Self {
        Self::Index(value)
    }
}

/// Classification of a per-field error, serialized as its wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Input failed a field-level constraint.
    #[serde(rename = "ValidationError")]
    Validation,
    /// The caller is not allowed to see or do this.
    #[serde(rename = "PermissionError")]
    Permission,
    /// The target instance is missing.
    #[serde(rename = "NotFoundError")]
    NotFound,
    /// The whole request was rejected before execution.
    #[serde(rename = "ComplexityExceededError")]
    ComplexityExceeded,
    /// Schema compilation failed.
    #[serde(rename = "SchemaGenerationError")]
    SchemaGeneration,
    /// Unexpected failure.
    #[serde(rename = "InternalError")]
    Internal,
}

impl ErrorKind {
    /// Returns the wire code for this kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation => "ValidationError",
            Self::Permission => "PermissionError",
            Self::NotFound => "NotFoundError",
            Self::ComplexityExceeded => "ComplexityExceededError",
            Self::SchemaGeneration => "SchemaGenerationError",
            Self::Internal => "InternalError",
        }
    }
}

/// An error attached to the response tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    /// Path to the affected field, empty for request-level errors.
    pub path: Vec<PathSegment>,
    /// Human-readable message.
    pub message: String,
    /// Error classification.
    pub kind: ErrorKind,
}

impl FieldError {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, path: Vec<PathSegment>, message: impl Into<String>) -> Self {
        Self {
            path,
            message: message.into(),
            kind,
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(path: Vec<PathSegment>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, path, message)
    }

    /// Creates a permission error.
    #[must_use]
    pub fn permission(path: Vec<PathSegment>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, path, message)
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(path: Vec<PathSegment>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, path, message)
    }

    /// Creates an internal error, redacting detail unless in development mode.
    #[must_use]
    pub fn internal(path: Vec<PathSegment>, detail: impl Into<String>, development_mode: bool) -> Self {
        let message = if development_mode {
            detail.into()
        } else {
            "internal error".to_string()
        };
        Self::new(ErrorKind::Internal, path, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            EngineError::ComplexityExceeded { actual: 1200, max: 1000 }.error_code(),
            "COMPLEXITY_EXCEEDED"
        );
        assert_eq!(
            EngineError::DepthExceeded { actual: 11, max: 10 }.error_code(),
            "DEPTH_EXCEEDED"
        );
        assert_eq!(EngineError::Cancelled.error_code(), "CANCELLED");
        let schema_err: EngineError = SchemaError::Provider("boom".into()).into();
        assert_eq!(schema_err.error_code(), "SCHEMA_GENERATION_ERROR");
    }

    #[test]
    fn test_display() {
        let err = EngineError::DepthExceeded { actual: 11, max: 10 };
        assert_eq!(err.to_string(), "Query depth 11 exceeds maximum allowed 10");

        let err = SchemaError::TypeNameCollision {
            name: "User".into(),
            first: "User".into(),
            second: "user".into(),
        };
        assert!(err.to_string().contains("collision"));
    }

    #[test]
    fn test_path_serialization() {
        let err = FieldError::permission(
            vec!["user".into(), "email".into()],
            "field access denied",
        );
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["path"], serde_json::json!(["user", "email"]));
        assert_eq!(json["kind"], "PermissionError");
    }

    #[test]
    fn test_index_path_segment() {
        let err = FieldError::validation(
            vec!["createManyUsers".into(), 2.into()],
            "username is required",
        );
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["path"], serde_json::json!(["createManyUsers", 2]));
    }

    #[test]
    fn test_internal_redaction() {
        let prod = FieldError::internal(vec![], "connection refused to 10.0.0.1", false);
        assert_eq!(prod.message, "internal error");

        let dev = FieldError::internal(vec![], "connection refused to 10.0.0.1", true);
        assert!(dev.message.contains("10.0.0.1"));
    }
}
