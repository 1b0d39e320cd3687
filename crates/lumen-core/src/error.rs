// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for Lumen-PG
//!
//! Every fallible operation in the workspace returns a [`LumenError`]. Each
//! variant belongs to exactly one [`ErrorKind`] and carries a stable machine
//! code, a human message, and (where the server supplied one) the underlying
//! diagnostic as its cause.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error families used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Connection,
    Authentication,
    Authorization,
    Session,
    Transaction,
    Query,
    Security,
    NotFound,
    Conflict,
    Internal,
}

/// Unified error type for all Lumen-PG operations
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum LumenError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Invalid connection string: {message}")]
    InvalidConnectionString { message: String },

    #[error("Unsupported statement: {message}")]
    UnsupportedStatement { message: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
        cause: Option<String>,
    },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Authentication failed for role {username}")]
    AuthenticationFailed {
        username: String,
        cause: Option<String>,
    },

    #[error("No accessible database for role {username}")]
    NoAccessibleDb { username: String },

    #[error("Access denied to table {table}")]
    TableAccessDenied { table: String },

    #[error("Permission denied: {message}")]
    PermissionDenied {
        message: String,
        cause: Option<String>,
    },

    #[error("Invalid session")]
    InvalidSession,

    #[error("Session expired")]
    SessionExpired,

    #[error("Session not found")]
    SessionNotFound,

    #[error("No active transaction for {username}")]
    NoActiveTransaction { username: String },

    #[error("Transaction expired for {username}")]
    TransactionExpired { username: String },

    #[error("A transaction is already active for {username}")]
    ActiveTransactionExists { username: String },

    #[error("Commit failed: {message}")]
    CommitFailed {
        message: String,
        cause: Option<String>,
    },

    #[error("Query failed: {message}")]
    QueryFailed {
        message: String,
        cause: Option<String>,
    },

    #[error("SQL injection detected: {message}")]
    SqlInjectionDetected { message: String },

    #[error("Ciphertext failed authentication")]
    CryptoTampered,

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LumenError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput { message: msg.into() }
    }

    pub fn invalid_connection_string(msg: impl Into<String>) -> Self {
        Self::InvalidConnectionString { message: msg.into() }
    }

    pub fn unsupported_statement(msg: impl Into<String>) -> Self {
        Self::UnsupportedStatement { message: msg.into() }
    }

    pub fn connection_failed(msg: impl Into<String>, cause: Option<String>) -> Self {
        Self::ConnectionFailed {
            message: msg.into(),
            cause,
        }
    }

    pub fn auth_failed(username: impl Into<String>, cause: Option<String>) -> Self {
        Self::AuthenticationFailed {
            username: username.into(),
            cause,
        }
    }

    pub fn no_accessible_db(username: impl Into<String>) -> Self {
        Self::NoAccessibleDb {
            username: username.into(),
        }
    }

    pub fn table_access_denied(table: impl Into<String>) -> Self {
        Self::TableAccessDenied { table: table.into() }
    }

    pub fn permission_denied(msg: impl Into<String>, cause: Option<String>) -> Self {
        Self::PermissionDenied {
            message: msg.into(),
            cause,
        }
    }

    pub fn no_active_transaction(username: impl Into<String>) -> Self {
        Self::NoActiveTransaction {
            username: username.into(),
        }
    }

    pub fn transaction_expired(username: impl Into<String>) -> Self {
        Self::TransactionExpired {
            username: username.into(),
        }
    }

    pub fn active_transaction_exists(username: impl Into<String>) -> Self {
        Self::ActiveTransactionExists {
            username: username.into(),
        }
    }

    pub fn commit_failed(msg: impl Into<String>, cause: Option<String>) -> Self {
        Self::CommitFailed {
            message: msg.into(),
            cause,
        }
    }

    pub fn query_failed(msg: impl Into<String>, cause: Option<String>) -> Self {
        Self::QueryFailed {
            message: msg.into(),
            cause,
        }
    }

    pub fn sql_injection(msg: impl Into<String>) -> Self {
        Self::SqlInjectionDetected { message: msg.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. }
            | Self::InvalidConnectionString { .. }
            | Self::UnsupportedStatement { .. } => ErrorKind::Validation,
            Self::ConnectionFailed { .. } | Self::Timeout { .. } | Self::Cancelled => {
                ErrorKind::Connection
            }
            Self::AuthenticationFailed { .. } | Self::NoAccessibleDb { .. } => {
                ErrorKind::Authentication
            }
            Self::TableAccessDenied { .. } | Self::PermissionDenied { .. } => {
                ErrorKind::Authorization
            }
            Self::InvalidSession | Self::SessionExpired | Self::SessionNotFound => {
                ErrorKind::Session
            }
            Self::NoActiveTransaction { .. }
            | Self::TransactionExpired { .. }
            | Self::CommitFailed { .. } => ErrorKind::Transaction,
            Self::ActiveTransactionExists { .. } => ErrorKind::Conflict,
            Self::QueryFailed { .. } => ErrorKind::Query,
            Self::SqlInjectionDetected { .. } | Self::CryptoTampered => ErrorKind::Security,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::InvalidConnectionString { .. } => "INVALID_CONNECTION_STRING",
            Self::UnsupportedStatement { .. } => "UNSUPPORTED_STATEMENT",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::AuthenticationFailed { .. } => "AUTHENTICATION_FAILED",
            Self::NoAccessibleDb { .. } => "NO_ACCESSIBLE_DB",
            Self::TableAccessDenied { .. } => "TABLE_ACCESS_DENIED",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::InvalidSession => "INVALID_SESSION",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::NoActiveTransaction { .. } => "NO_ACTIVE_TRANSACTION",
            Self::TransactionExpired { .. } => "TRANSACTION_EXPIRED",
            Self::ActiveTransactionExists { .. } => "ACTIVE_TRANSACTION_EXISTS",
            Self::CommitFailed { .. } => "COMMIT_FAILED",
            Self::QueryFailed { .. } => "QUERY_FAILED",
            Self::SqlInjectionDetected { .. } => "SQL_INJECTION_DETECTED",
            Self::CryptoTampered => "CRYPTO_TAMPERED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Underlying diagnostic, usually the server's message.
    pub fn cause(&self) -> Option<&str> {
        match self {
            Self::ConnectionFailed { cause, .. }
            | Self::AuthenticationFailed { cause, .. }
            | Self::PermissionDenied { cause, .. }
            | Self::CommitFailed { cause, .. }
            | Self::QueryFailed { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// Flattened form handed to the HTTP collaborator.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            code: self.code(),
            message: self.to_string(),
            cause: self.cause().map(str::to_string),
        }
    }
}

/// Serializable `{kind, code, message, cause?}` view of an error.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Result type alias for Lumen-PG operations
pub type LumenResult<T> = Result<T, LumenError>;
