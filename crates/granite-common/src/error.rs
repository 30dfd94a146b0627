//! Error types for Granite

use thiserror::Error;

/// Result type alias using Granite's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Granite
#[derive(Error, Debug)]
pub enum Error {
    // Transaction errors
    #[error("Transaction error: {0}")]
    Txn(#[from] TxnError),

    // Store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // DDL errors
    #[error("DDL error: {0}")]
    Ddl(#[from] DdlError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    // Not found
    #[error("{0} not found: {1}")]
    NotFound(String, String),

    // Already exists
    #[error("{0} already exists: {1}")]
    AlreadyExists(String, String),

    // Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

#[derive(Error, Debug)]
pub enum TxnError {
    #[error("Transaction not found: {0}")]
    NotFound(u64),

    #[error("Transaction {0} is not active")]
    NotActive(u64),

    #[error("Transaction already committed: {0}")]
    AlreadyCommitted(u64),

    #[error("Transaction already rolled back: {0}")]
    AlreadyRolledBack(u64),

    #[error("Transaction {0} is already nested; cannot nest deeper")]
    NestingDepth(u64),

    #[error("Transaction {0} cannot be elevated to writable")]
    NotElevatable(u64),

    #[error("Savepoint not found: {0}")]
    SavepointNotFound(String),

    #[error("Transaction {0} is not prepared")]
    NotPrepared(u64),

    #[error("Transaction {0} is already prepared")]
    AlreadyPrepared(u64),

    #[error("Too many active transactions")]
    TooManyActive,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Conglomerate not found: {0}")]
    ConglomerateNotFound(i64),

    #[error("Record not found")]
    RecordNotFound,

    #[error("Column {0} out of range")]
    ColumnOutOfRange(usize),

    #[error("Lock timeout on conglomerate {0}")]
    LockTimeout(i64),

    #[error("Deadlock detected on conglomerate {0}")]
    Deadlock(i64),

    #[error("Scan is closed")]
    ScanClosed,

    #[error("Controller is closed")]
    ControllerClosed,

    #[error("Conglomerate {0} is not open for update")]
    NotOpenForUpdate(i64),
}

#[derive(Error, Debug)]
pub enum DdlError {
    #[error("Operation cannot proceed: transaction {blocking} is still active")]
    ActiveTransactions { blocking: u64 },

    #[error("Drain cancelled")]
    DrainCancelled,

    #[error("Metadata change {0} was not acknowledged by all nodes")]
    Unacknowledged(u64),

    #[error("Metadata change notification failed: {0}")]
    NotifyFailed(String),

    #[error("Unknown metadata change: {0}")]
    UnknownChange(u64),
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound(kind.into(), name.into())
    }

    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::AlreadyExists(kind.into(), name.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Returns true if retrying the failed operation later can succeed.
    ///
    /// A schema change refused because of in-flight transactions is the
    /// canonical retryable case. Contract violations such as exceeding the
    /// nesting depth never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Ddl(DdlError::ActiveTransactions { .. })
                | Error::Store(StoreError::LockTimeout(_))
                | Error::Store(StoreError::Deadlock(_))
                | Error::Txn(TxnError::TooManyActive)
                | Error::Timeout(_)
        )
    }

    /// Return a PostgreSQL-compatible SQLSTATE code for this error.
    ///
    /// Codes follow the PostgreSQL convention:
    /// <https://www.postgresql.org/docs/current/errcodes-appendix.html>
    pub fn sqlstate(&self) -> &'static str {
        match self {
            // Transaction errors
            Error::Txn(te) => match te {
                TxnError::NotFound(_) => "25P01",          // no_active_sql_transaction
                TxnError::NotActive(_) => "25000",         // invalid_transaction_state
                TxnError::AlreadyCommitted(_) => "25000",
                TxnError::AlreadyRolledBack(_) => "25P02", // in_failed_sql_transaction
                TxnError::NestingDepth(_) => "XX000",      // internal_error
                TxnError::NotElevatable(_) => "25006",     // read_only_sql_transaction
                TxnError::SavepointNotFound(_) => "3B001", // invalid_savepoint_specification
                TxnError::NotPrepared(_) => "25000",
                TxnError::AlreadyPrepared(_) => "25000",
                TxnError::TooManyActive => "53000",        // insufficient_resources
            },
            // Store errors
            Error::Store(se) => match se {
                StoreError::ConglomerateNotFound(_) => "42704", // undefined_object
                StoreError::RecordNotFound => "02000",          // no_data
                StoreError::ColumnOutOfRange(_) => "42703",     // undefined_column
                StoreError::LockTimeout(_) => "55P03",          // lock_not_available
                StoreError::Deadlock(_) => "40P01",             // deadlock_detected
                StoreError::ScanClosed => "24000",              // invalid_cursor_state
                StoreError::ControllerClosed => "24000",
                StoreError::NotOpenForUpdate(_) => "25006",     // read_only_sql_transaction
            },
            // DDL errors
            Error::Ddl(de) => match de {
                DdlError::ActiveTransactions { .. } => "55006", // object_in_use
                DdlError::DrainCancelled => "57014",            // query_canceled
                DdlError::Unacknowledged(_) => "08006",         // connection_failure
                DdlError::NotifyFailed(_) => "08006",
                DdlError::UnknownChange(_) => "42704",
            },
            // Top-level error variants
            Error::Io(_) => "58030",               // io_error
            Error::Serialization(_) => "XX000",
            Error::Config(_) => "F0000",           // config_file_error
            Error::Internal(_) => "XX000",         // internal_error
            Error::NotFound(_, _) => "42704",      // undefined_object
            Error::AlreadyExists(_, _) => "42710", // duplicate_object
            Error::InvalidArgument(_) => "22023",  // invalid_parameter_value
            Error::Timeout(_) => "57014",          // query_canceled
            Error::Cancelled(_) => "57014",
        }
    }

    /// Return the PostgreSQL-compatible error severity.
    ///
    /// Nesting and elevation violations are contract breaches by the caller
    /// and terminate the session rather than the statement.
    pub fn severity(&self) -> &'static str {
        match self {
            Error::Txn(TxnError::NestingDepth(_)) => "FATAL",
            Error::Txn(TxnError::NotElevatable(_)) => "FATAL",
            _ => "ERROR",
        }
    }
}
