//! Shared foundation for the Granite transactional core.
//!
//! This crate holds the types that every other Granite crate speaks:
//! identifier newtypes, the SQL value model, the error hierarchy with
//! its SQLSTATE mapping, and the runtime configuration.

pub mod config;
pub mod error;
pub mod testing;
pub mod types;

pub use config::{CoreConfig, DdlConfig, TxnConfig};
pub use error::{DdlError, Error, Result, StoreError, TxnError};
pub use types::{
    ChangeId, ConglomId, DataType, IsolationLevel, NodeId, ObjectId, Row, RowId, SessionId,
    SortOrder, TxnId, Value,
};

/// Convenience re-exports for downstream crates.
pub mod prelude {
    pub use crate::config::{CoreConfig, DdlConfig, TxnConfig};
    pub use crate::error::{DdlError, Error, Result, StoreError, TxnError};
    pub use crate::types::{
        ChangeId, ConglomId, DataType, IsolationLevel, NodeId, ObjectId, Row, RowId, SessionId,
        SortOrder, TxnId, Value,
    };
    pub use async_trait::async_trait;
    pub use bytes::Bytes;
    pub use tracing::{debug, error, info, instrument, trace, warn};
}
