//! Storage facade: sessions, transactions and typed stores.
//!
//! # Responsibility
//! - Own the database location and open one connection per session.
//! - Resolve the session a call runs in (context, bound view, or fresh).
//! - Run closures atomically and dispatch delete hooks.
//!
//! # Invariants
//! - A `Storage` bound to a session routes every store it hands out through
//!   that session.
//! - `atomic` resolves the transaction it begins exactly once, on success,
//!   error and panic alike.
//! - An in-memory database lives as long as its `Storage` (and clones).

pub mod crud;
pub mod metadata;
pub mod session;
pub mod user;

use crate::config::{DatabaseLocation, StorageConfig};
use crate::context::Context;
use crate::db::{open_db_with, open_shared_memory_db, DbOptions};
use crate::error::{StorageError, StorageResult};
use crate::schema::Entity;
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use rusqlite::Connection;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use uuid::Uuid;

pub use crud::CrudStore;
pub use metadata::MetadataStore;
pub use session::Session;
pub use user::UserStore;

/// Callback run for every entity about to be deleted.
pub type DeleteHook = dyn Fn(&Storage, &DeletedRecord<'_>) -> StorageResult<()> + Send + Sync;

/// Table name mapped to its column names.
pub type TableColumns = BTreeMap<String, Vec<String>>;

/// Entity about to be deleted, as seen by delete hooks.
#[derive(Clone, Copy)]
pub struct DeletedRecord<'a> {
    pub table: &'a str,
    pub id: i64,
    entity: &'a dyn Any,
}

impl<'a> DeletedRecord<'a> {
    pub(crate) fn new<M: Entity>(table: &'a str, entity: &'a M) -> Self {
        Self {
            table,
            id: entity.id(),
            entity,
        }
    }

    /// The deleted entity, when it is an `M`.
    pub fn downcast_ref<M: 'static>(&self) -> Option<&'a M> {
        self.entity.downcast_ref::<M>()
    }
}

impl Debug for DeletedRecord<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletedRecord")
            .field("table", &self.table)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Entry point of the storage layer.
///
/// Cheap to clone; clones share the database, hooks and metadata cache.
#[derive(Clone)]
pub struct Storage {
    shared: Arc<StorageShared>,
    bound: Option<Session>,
}

struct StorageShared {
    source: ConnectionSource,
    options: DbOptions,
    delete_hooks: RwLock<Vec<Arc<DeleteHook>>>,
    table_columns: OnceCell<TableColumns>,
}

enum ConnectionSource {
    File(PathBuf),
    SharedMemory {
        name: String,
        // Keeps the in-memory database alive between sessions.
        _keeper: Mutex<Connection>,
    },
}

impl Storage {
    /// Opens the configured database and applies pending migrations.
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        let options = config.db_options();
        let source = match &config.location {
            DatabaseLocation::File(path) => {
                open_db_with(path, &options)?;
                ConnectionSource::File(path.clone())
            }
            DatabaseLocation::Memory => {
                let name = format!("tabula-{}", Uuid::new_v4().simple());
                let keeper = open_shared_memory_db(&name, &options)?;
                ConnectionSource::SharedMemory {
                    name,
                    _keeper: Mutex::new(keeper),
                }
            }
        };

        info!(
            "event=storage_open module=storage status=ok location={}",
            source.describe()
        );
        Ok(Self {
            shared: Arc::new(StorageShared {
                source,
                options,
                delete_hooks: RwLock::new(Vec::new()),
                table_columns: OnceCell::new(),
            }),
            bound: None,
        })
    }

    pub fn open_file(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open(&StorageConfig::file(path.as_ref()))
    }

    /// Opens a fresh in-memory database private to this `Storage`.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::open(&StorageConfig::in_memory())
    }

    /// Session this view is bound to, if any.
    pub fn bound_session(&self) -> Option<&Session> {
        self.bound.as_ref()
    }

    /// Returns a view of this storage bound to the session `ctx` resolves to.
    pub fn with_context(&self, ctx: &Context) -> StorageResult<Storage> {
        Ok(self.bind(self.session(ctx)?))
    }

    /// Resolves the session for `ctx`.
    ///
    /// The context's session wins, then the session this view is bound to;
    /// otherwise a new autocommit session is opened on its own connection.
    pub fn session(&self, ctx: &Context) -> StorageResult<Session> {
        if let Some(session) = ctx.session() {
            return Ok(session.clone());
        }
        if let Some(session) = &self.bound {
            return Ok(session.clone());
        }
        ctx.err()?;
        let conn = self.connect()?;
        Ok(Session::new(conn, ctx.signal().clone()))
    }

    /// Begins a transaction in the session of `ctx` and returns a context
    /// carrying it, plus the transaction handle to resolve.
    pub fn begin(&self, ctx: &Context) -> StorageResult<(Context, Session)> {
        let tx = self.session(ctx)?.begin()?;
        Ok((ctx.with_session(tx.clone()), tx))
    }

    /// Runs `f` in a transaction: committed when `f` succeeds, rolled back
    /// when it fails or panics.
    ///
    /// On a view bound to a transaction this nests a savepoint; otherwise a
    /// new session with a root transaction is used. Panics are re-raised
    /// after rollback.
    pub fn atomic<T>(&self, f: impl FnOnce(&Storage) -> StorageResult<T>) -> StorageResult<T> {
        self.atomic_in(&Context::background(), f)
    }

    /// `atomic` with an explicit context for cancellation and session.
    pub fn atomic_in<T>(
        &self,
        ctx: &Context,
        f: impl FnOnce(&Storage) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let tx = self.session(ctx)?.begin()?;
        let scoped = self.bind(tx.clone());

        match panic::catch_unwind(AssertUnwindSafe(|| f(&scoped))) {
            Ok(Ok(value)) => {
                tx.commit()?;
                Ok(value)
            }
            Ok(Err(err)) => match tx.rollback() {
                Ok(()) => Err(err),
                Err(rollback_err) => Err(err.with_rollback_failure(rollback_err)),
            },
            Err(payload) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(
                        "event=atomic_panic module=storage status=error error_code=rollback_failed error={}",
                        rollback_err
                    );
                }
                panic::resume_unwind(payload)
            }
        }
    }

    /// Registers `hook` to run for every entity deleted through this
    /// storage, before the row is removed. A failing hook aborts the delete.
    pub fn register_delete_hook<F>(&self, hook: F)
    where
        F: Fn(&Storage, &DeletedRecord<'_>) -> StorageResult<()> + Send + Sync + 'static,
    {
        let mut hooks = self
            .shared
            .delete_hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        hooks.push(Arc::new(hook));
        debug!(
            "event=delete_hook_register module=storage status=ok hooks={}",
            hooks.len()
        );
    }

    /// Generic record store for `M`, running in the session of `ctx`.
    pub fn crud<M: Entity>(&self, ctx: &Context) -> StorageResult<CrudStore<M>> {
        let session = self.session(ctx)?;
        Ok(CrudStore::new(self.bind(session.clone()), session))
    }

    pub fn user(&self, ctx: &Context) -> StorageResult<UserStore> {
        Ok(UserStore::new(self.crud(ctx)?))
    }

    pub fn metadata(&self, ctx: &Context) -> StorageResult<MetadataStore> {
        let session = self.session(ctx)?;
        Ok(MetadataStore::new(self.bind(session.clone()), session))
    }

    pub(crate) fn has_delete_hooks(&self) -> bool {
        !self
            .shared
            .delete_hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub(crate) fn run_delete_hooks(&self, record: &DeletedRecord<'_>) -> StorageResult<()> {
        let hooks = self
            .shared
            .delete_hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            hook(self, record).map_err(|err| {
                warn!(
                    "event=delete_hook module=storage status=error table={} id={} error_code={} error={}",
                    record.table,
                    record.id,
                    err.code(),
                    err
                );
                err
            })?;
        }
        Ok(())
    }

    fn bind(&self, session: Session) -> Storage {
        Storage {
            shared: Arc::clone(&self.shared),
            bound: Some(session),
        }
    }

    fn connect(&self) -> StorageResult<Connection> {
        let conn = match &self.shared.source {
            ConnectionSource::File(path) => open_db_with(path, &self.shared.options),
            ConnectionSource::SharedMemory { name, .. } => {
                open_shared_memory_db(name, &self.shared.options)
            }
        };
        conn.map_err(|err| StorageError::from(err).wrap("failed to open session connection"))
    }
}

impl Debug for Storage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("location", &self.shared.source.describe())
            .field("bound", &self.bound)
            .finish()
    }
}

impl ConnectionSource {
    fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::SharedMemory { name, .. } => format!("memory:{name}"),
        }
    }
}
