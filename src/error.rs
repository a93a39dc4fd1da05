//! Error types for the Storage Topology Controller
//!
//! Provides structured error types for the access layer, the transaction
//! protocol, the entity graph and the persistence layer. Expected outcomes
//! (access denied, not found, range violations) and defects (corrupt
//! persisted state, partial commits) share one enum but are told apart by
//! [`Error::class`].

use crate::domain::ValueKind;
use crate::security::AccessType;
use std::fmt;
use thiserror::Error;

/// Unified error type for the controller core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Access Errors
    // =========================================================================
    #[error("Access denied: {role} requested {requested} on {path}")]
    AccessDenied {
        path: String,
        role: String,
        requested: AccessType,
    },

    #[error("Access to deleted {kind}: {key}")]
    AccessToDeleted { kind: &'static str, key: String },

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("{kind} already exists: {key}")]
    DataAlreadyExists { kind: &'static str, key: String },

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    // =========================================================================
    // Domain Errors
    // =========================================================================
    #[error("{0}")]
    ValueOutOfRange(RangeViolation),

    #[error("Invalid {kind} '{name}': {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("Invalid property key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Number pool exhausted: no free number in [{min}, {max}]")]
    PoolExhausted { min: i64, max: i64 },

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("{kind} {key} is still in use: {reason}")]
    StillInUse {
        kind: &'static str,
        key: String,
        reason: String,
    },

    // =========================================================================
    // Transaction Errors
    // =========================================================================
    #[error("Transaction conflict: object is staged by transaction {owner}, not {requester}")]
    TransactionConflict { owner: u64, requester: u64 },

    #[error("Persistence failure: {0}")]
    Persistence(#[from] DbError),

    #[error("Partial commit of transaction {tx_id}: {reason}")]
    PartialCommit { tx_id: u64, reason: String },

    // =========================================================================
    // Defects
    // =========================================================================
    #[error("Corrupt persisted state in {table}/{key}: {reason}")]
    CorruptPersistedState {
        table: &'static str,
        key: String,
        reason: String,
    },

    #[error("Implementation error: {0}")]
    Implementation(String),

    // =========================================================================
    // Configuration and IO Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // Metrics and Server Errors
    // =========================================================================
    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Server error: {0}")]
    Server(String),
}

// =============================================================================
// Range Violations
// =============================================================================

/// Which bound of a checked domain was violated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    TooLow,
    TooHigh,
}

/// A numeric value outside of its valid domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeViolation {
    pub kind: ValueKind,
    pub value: i128,
    pub min: i128,
    pub max: i128,
    pub bound: Bound,
}

impl RangeViolation {
    /// Checks `value` against the inclusive range and reports the violated bound
    pub fn check(kind: ValueKind, value: i128, min: i128, max: i128) -> std::result::Result<(), Self> {
        let bound = if value < min {
            Bound::TooLow
        } else if value > max {
            Bound::TooHigh
        } else {
            return Ok(());
        };
        Err(Self {
            kind,
            value,
            min,
            max,
            bound,
        })
    }
}

impl fmt::Display for RangeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bound {
            Bound::TooLow => write!(
                f,
                "{} {} is below the minimum of {}",
                self.kind, self.value, self.min
            ),
            Bound::TooHigh => write!(
                f,
                "{} {} exceeds the maximum of {}",
                self.kind, self.value, self.max
            ),
        }
    }
}

impl From<RangeViolation> for Error {
    fn from(violation: RangeViolation) -> Self {
        Error::ValueOutOfRange(violation)
    }
}

// =============================================================================
// Persistence Engine Errors
// =============================================================================

/// Errors raised by a backing store engine or a persistence driver
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Duplicate key {key} in table {table}")]
    DuplicateKey { table: String, key: String },

    #[error("Missing row {key} in table {table}")]
    MissingRow { table: String, key: String },

    #[error("Row {key} in table {table} is not a record")]
    MissingColumn { table: String, key: String },

    #[error("Object for row {key} in table {table} is no longer alive")]
    Detached { table: String, key: String },

    #[error("Write rejected by backing store: {0}")]
    Rejected(String),

    #[error("Backing store applied {applied} of {total} writes before failing")]
    PartialApply { applied: usize, total: usize },

    #[error("Row serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backing store IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for persistence engines and drivers
pub type DbResult<T> = std::result::Result<T, DbError>;

// =============================================================================
// Classification
// =============================================================================

/// How a caller is expected to treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Ordinary control flow outcome, surfaced to the caller
    Expected,
    /// May succeed when the operation is retried
    Transient,
    /// Invariant violation; must be logged and never masked
    Defect,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::CorruptPersistedState { .. }
            | Error::PartialCommit { .. }
            | Error::Implementation(_) => ErrorClass::Defect,

            Error::TransactionConflict { .. } | Error::Persistence(_) | Error::Io(_) | Error::Server(_) => {
                ErrorClass::Transient
            }

            _ => ErrorClass::Expected,
        }
    }

    /// Check if this error is an invariant violation
    pub fn is_defect(&self) -> bool {
        self.class() == ErrorClass::Defect
    }

    /// Check if retrying the operation may succeed
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Build a corrupt state error and log it where it is raised
    pub fn corrupt(table: &'static str, key: impl Into<String>, reason: impl fmt::Display) -> Self {
        let key = key.into();
        let reason = reason.to_string();
        tracing::error!(table, key = %key, "corrupt persisted state: {}", reason);
        Error::CorruptPersistedState { table, key, reason }
    }

    /// Build an implementation error and log it where it is raised
    pub fn implementation(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("implementation error: {}", message);
        Error::Implementation(message)
    }
}

/// Result type alias for the controller core
pub type Result<T> = std::result::Result<T, Error>;
