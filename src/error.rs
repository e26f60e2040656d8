// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types surfaced by the engine.
//!
//! Everything public returns [`OrmError`]. Backend failures are wrapped in
//! [`OrmError::Io`] with a [`BackendError`] describing which tier failed.
//! Duplicate-key and foreign-key rejections get their own variants because
//! callers can recover from them at the flush boundary.

use thiserror::Error;

/// Failure inside one of the storage tiers.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("database error{}: {message}", code_suffix(.code))]
    Database { code: Option<u16>, message: String },
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("pool error: {0}")]
    Pool(String),
}

fn code_suffix(code: &Option<u16>) -> String {
    code.map(|c| format!(" {c}")).unwrap_or_default()
}

#[derive(Error, Debug)]
pub enum OrmError {
    #[error("entity '{0}' is not registered")]
    NotRegistered(String),

    #[error("unknown field '{field}' in entity '{entity}'")]
    UnknownField { entity: String, field: String },

    #[error("unknown index '{index}' in entity '{entity}'")]
    UnknownIndex { entity: String, index: String },

    #[error("invalid schema for '{entity}': {reason}")]
    SchemaInvariant { entity: String, reason: String },

    #[error("duplicate key on index '{index}': {message}")]
    DuplicateKey { index: String, message: String },

    #[error("foreign key violation on '{constraint}': {message}")]
    ForeignKey { constraint: String, message: String },

    #[error("cached image has structure hash {found}, schema expects {expected}")]
    CodecHashMismatch { expected: u64, found: u64 },

    #[error("malformed row image: {0}")]
    CodecIo(String),

    #[error("value '{value}' is not declared for enum field '{field}'")]
    EnumUnknown { field: String, value: String },

    #[error("tracked entity limit of {limit} exceeded")]
    TrackLimitExceeded { limit: usize },

    #[error("I/O failure: {source}")]
    Io {
        #[source]
        source: BackendError,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("lock '{0}' could not be obtained")]
    LockTimeout(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrmError {
    pub(crate) fn database(code: Option<u16>, message: impl Into<String>) -> Self {
        OrmError::Io {
            source: BackendError::Database {
                code,
                message: message.into(),
            },
        }
    }

    pub(crate) fn pool(message: impl Into<String>) -> Self {
        OrmError::Io {
            source: BackendError::Pool(message.into()),
        }
    }

    /// MySQL error number behind this failure, if it came from the database.
    ///
    /// Duplicate and foreign-key rejections report 1062 and 1452.
    pub fn db_code(&self) -> Option<u16> {
        match self {
            OrmError::Io {
                source: BackendError::Database { code, .. },
            } => *code,
            OrmError::DuplicateKey { .. } => Some(1062),
            OrmError::ForeignKey { .. } => Some(1452),
            _ => None,
        }
    }

    /// Whether the flush boundary may hand this error back to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, OrmError::DuplicateKey { .. } | OrmError::ForeignKey { .. })
    }
}

impl From<redis::RedisError> for OrmError {
    fn from(err: redis::RedisError) -> Self {
        OrmError::Io {
            source: BackendError::Redis(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_error_renders_code() {
        let err = OrmError::database(Some(1146), "Table 'x' doesn't exist");
        assert_eq!(
            err.to_string(),
            "I/O failure: database error 1146: Table 'x' doesn't exist"
        );
        assert_eq!(err.db_code(), Some(1146));
    }

    #[test]
    fn test_recoverable_kinds() {
        let dup = OrmError::DuplicateKey {
            index: "Name".into(),
            message: "Duplicate entry 'B'".into(),
        };
        assert!(dup.is_recoverable());
        assert_eq!(dup.db_code(), Some(1062));
        assert!(!OrmError::Cancelled.is_recoverable());
        assert!(!OrmError::pool("closed").is_recoverable());
    }
}
