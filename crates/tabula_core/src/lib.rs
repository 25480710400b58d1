//! Transactional record storage on SQLite.
//!
//! Typed entities declare their columns once; `Storage` hands out generic
//! record stores that run inside nested, explicitly resolved transactions.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod query;
pub mod schema;
pub mod storage;

pub use config::{DatabaseLocation, StorageConfig};
pub use context::{CancelHandle, Context, Signal};
pub use error::{ErrorCode, StorageError, StorageResult};
pub use logging::{default_log_level, init_logging, init_logging_from_env, logging_status};
pub use model::search::{
    FieldFilter, PageInfo, Pagination, Paging, SearchCondition, SearchPage, SearchParams,
    SortOrder,
};
pub use model::user::User;
pub use schema::{Entity, FieldSpec, Record, Schema};
pub use storage::{
    CrudStore, DeletedRecord, MetadataStore, Session, Storage, TableColumns, UserStore,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
