//! Nested transactional sessions over one SQLite connection.
//!
//! # Responsibility
//! - Own one connection and the stack of transactions opened on it: a root
//!   `BEGIN` at depth 0 and one savepoint per deeper level.
//! - Serialize begin/commit/rollback and statement execution for callers
//!   sharing the session across threads.
//! - Bind the caller's cancellation/deadline to running statements.
//!
//! # Invariants
//! - Only the innermost open transaction may be resolved; resolving pops it.
//! - Resolving an already resolved transaction is a no-op; running statements
//!   through its handle is rejected.
//! - A failed write marks the innermost open transaction as failed;
//!   committing a failed transaction rolls it back and reports the failure.
//! - Lock order is frames, then connection. Statement execution takes the
//!   connection lock alone.

use crate::context::Signal;
use crate::error::{ErrorCode, StorageError, StorageResult};
use log::{debug, error, warn};
use rusqlite::Connection;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// VM instructions between two cancellation checks of a running statement.
const PROGRESS_CHECK_OPS: i32 = 1_000;
const BATCH_SAVEPOINT: &str = "tabula_batch";

/// Handle to a session, optionally pointing at one of its transactions.
///
/// Clones share the connection and the transaction stack. A handle created
/// by `Storage` without `begin` runs statements in autocommit mode.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    frame: Option<FrameRef>,
}

struct Shared {
    frames: Mutex<Vec<Frame>>,
    conn: Mutex<Connection>,
    signal: Signal,
    next_token: AtomicU64,
}

#[derive(Debug)]
struct Frame {
    id: usize,
    token: u64,
    failure: Option<Failure>,
}

#[derive(Debug)]
struct Failure {
    code: ErrorCode,
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameRef {
    id: usize,
    token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Commit,
    Rollback,
}

impl Resolution {
    fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

impl Session {
    /// Wraps `conn`; statements are interrupted once `signal` is done.
    pub(crate) fn new(conn: Connection, signal: Signal) -> Self {
        install_progress_handler(&conn, &signal);
        Self {
            shared: Arc::new(Shared {
                frames: Mutex::new(Vec::new()),
                conn: Mutex::new(conn),
                signal,
                next_token: AtomicU64::new(1),
            }),
            frame: None,
        }
    }

    /// Sequence number of this handle's transaction: 0 for the root, one
    /// more per nesting level. `None` for an autocommit handle.
    pub fn id(&self) -> Option<usize> {
        self.frame.map(|frame| frame.id)
    }

    pub fn in_transaction(&self) -> bool {
        self.frame.is_some()
    }

    /// True once this handle's transaction was committed or rolled back.
    pub fn is_resolved(&self) -> bool {
        match self.frame {
            Some(frame) => !is_open(&lock(&self.shared.frames), frame),
            None => false,
        }
    }

    /// True when both handles share one connection and transaction stack.
    pub fn same_session(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Starts a transaction nested in this handle's transaction.
    ///
    /// On an autocommit handle this opens the root transaction; otherwise a
    /// savepoint named after the new depth.
    ///
    /// # Errors
    /// - `Internal` when this handle's transaction already has an open
    ///   child, is resolved, or when an autocommit handle is used while the
    ///   session already has a transaction open.
    pub fn begin(&self) -> StorageResult<Session> {
        let mut frames = lock(&self.shared.frames);
        self.shared.signal.check()?;

        let id = match self.frame {
            None if frames.is_empty() => 0,
            None => {
                return Err(StorageError::internal(
                    "session already has an open transaction; begin from its handle",
                ))
            }
            Some(frame) if !is_open(&frames, frame) => {
                return Err(StorageError::internal(
                    "cannot begin inside a resolved transaction",
                ))
            }
            Some(frame) if frames.len() > frame.id + 1 => {
                return Err(StorageError::internal(
                    "next txn needs to be resolved first",
                ))
            }
            Some(frame) => frame.id + 1,
        };

        if id == 0 {
            self.shared.execute("BEGIN IMMEDIATE")?;
        } else {
            self.shared.ensure_transaction_alive()?;
            self.shared
                .execute(&format!("SAVEPOINT {}", savepoint_name(id)))?;
        }

        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        frames.push(Frame {
            id,
            token,
            failure: None,
        });
        debug!("event=txn_begin module=session status=ok id={id}");

        Ok(Session {
            shared: Arc::clone(&self.shared),
            frame: Some(FrameRef { id, token }),
        })
    }

    /// Commits this handle's transaction.
    ///
    /// The root commits for real; a nested transaction releases its
    /// savepoint, folding its changes into the parent.
    pub fn commit(&self) -> StorageResult<()> {
        self.resolve(Resolution::Commit)
    }

    /// Rolls back this handle's transaction.
    pub fn rollback(&self) -> StorageResult<()> {
        self.resolve(Resolution::Rollback)
    }

    /// Session lifetime is governed by commit/rollback; closing does nothing.
    pub fn close(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Runs a read on the session connection.
    pub(crate) fn read<T>(
        &self,
        op: impl FnOnce(&Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        self.ensure_open()?;
        self.shared.signal.check()?;
        let conn = lock(&self.shared.conn);
        op(&conn).map_err(|err| self.shared.signal.refine(err))
    }

    /// Runs a write on the session connection, recording storage failures
    /// on the innermost open transaction.
    pub(crate) fn write<T>(
        &self,
        op: impl FnOnce(&Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        self.ensure_open()?;
        self.shared.signal.check()?;
        let (result, transaction_lost) = {
            let conn = lock(&self.shared.conn);
            let result = op(&conn);
            (result, conn.is_autocommit())
        };

        result.map_err(|err| {
            let err = self.shared.signal.refine(err);
            self.shared.record_failure(&err, transaction_lost);
            err
        })
    }

    /// Like `write`, but all statements of `op` apply together or not at all.
    pub(crate) fn write_batch<T>(
        &self,
        op: impl FnOnce(&Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let signal = self.shared.signal.clone();
        self.write(|conn| {
            let opens_transaction = conn.is_autocommit();
            conn.execute_batch(&format!("SAVEPOINT {BATCH_SAVEPOINT}"))?;
            let err = match op(conn).and_then(|value| {
                conn.execute_batch(&format!("RELEASE SAVEPOINT {BATCH_SAVEPOINT}"))?;
                Ok(value)
            }) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !conn.is_autocommit() {
                // A failed outermost release leaves the transaction open.
                let undo = if opens_transaction {
                    "ROLLBACK".to_string()
                } else {
                    format!(
                        "ROLLBACK TO SAVEPOINT {BATCH_SAVEPOINT}; RELEASE SAVEPOINT {BATCH_SAVEPOINT};"
                    )
                };
                if let Err(undo_err) = execute_uninterruptible(conn, &signal, &undo) {
                    return Err(err.with_rollback_failure(undo_err.into()));
                }
            }
            Err(err)
        })
    }

    /// Rejects statements through a handle whose transaction is resolved.
    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_resolved() {
            return Err(StorageError::internal("transaction already resolved"));
        }
        Ok(())
    }

    fn resolve(&self, resolution: Resolution) -> StorageResult<()> {
        let Some(frame_ref) = self.frame else {
            return Err(StorageError::internal(format!(
                "cannot {} a session without a transaction",
                resolution.as_str()
            )));
        };

        let mut frames = lock(&self.shared.frames);
        if !is_open(&frames, frame_ref) {
            debug!(
                "event=txn_{} module=session status=skipped id={} reason=already_resolved",
                resolution.as_str(),
                frame_ref.id
            );
            return Ok(());
        }
        if frames.len() > frame_ref.id + 1 {
            return Err(StorageError::internal(
                "next txn needs to be resolved first",
            ));
        }
        let Some(frame) = frames.pop() else {
            return Ok(());
        };

        let outcome = match (resolution, frame.failure) {
            (Resolution::Commit, Some(failure)) => {
                let failure_err = StorageError::new(
                    failure.code,
                    format!("transaction rolled back after a failed write: {}", failure.message),
                );
                match self.shared.undo(frame.id) {
                    Ok(()) => Err(failure_err),
                    Err(undo_err) => Err(failure_err.with_rollback_failure(undo_err)),
                }
            }
            (Resolution::Commit, None) => self.shared.finish(frame.id),
            (Resolution::Rollback, _) => self.shared.undo(frame.id),
        };

        match &outcome {
            Ok(()) => debug!(
                "event=txn_{} module=session status=ok id={}",
                resolution.as_str(),
                frame.id
            ),
            Err(err) => warn!(
                "event=txn_{} module=session status=error id={} error_code={} error={}",
                resolution.as_str(),
                frame.id,
                err.code(),
                err
            ),
        }
        outcome
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn execute(&self, sql: &str) -> StorageResult<()> {
        let conn = lock(&self.conn);
        conn.execute_batch(sql)
            .map_err(|err| self.signal.refine(err.into()))
    }

    /// Commits the root or releases a savepoint.
    fn finish(&self, id: usize) -> StorageResult<()> {
        let conn = lock(&self.conn);
        if conn.is_autocommit() {
            return Err(StorageError::internal(
                "transaction was aborted by the database before commit",
            ));
        }
        if id > 0 {
            return execute_uninterruptible(&conn, &self.signal, &format!(
                "RELEASE SAVEPOINT {}",
                savepoint_name(id)
            ))
            .map_err(StorageError::from);
        }

        match conn.execute_batch("COMMIT") {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = self.signal.refine(err.into());
                if !conn.is_autocommit() {
                    if let Err(rollback_err) = execute_uninterruptible(&conn, &self.signal, "ROLLBACK")
                    {
                        error!(
                            "event=txn_commit module=session status=error error_code=rollback_after_commit_failed error={}",
                            rollback_err
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Rolls back the root, or rolls back to and releases a savepoint.
    fn undo(&self, id: usize) -> StorageResult<()> {
        let conn = lock(&self.conn);
        if conn.is_autocommit() {
            // The database already discarded the whole transaction.
            return Ok(());
        }
        let sql = if id == 0 {
            "ROLLBACK".to_string()
        } else {
            let name = savepoint_name(id);
            format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name};")
        };
        execute_uninterruptible(&conn, &self.signal, &sql).map_err(StorageError::from)
    }

    fn ensure_transaction_alive(&self) -> StorageResult<()> {
        if lock(&self.conn).is_autocommit() {
            return Err(StorageError::internal(
                "transaction was aborted by the database; resolve it before nesting",
            ));
        }
        Ok(())
    }

    fn record_failure(&self, err: &StorageError, transaction_lost: bool) {
        if matches!(err.code(), ErrorCode::NotFound | ErrorCode::InvalidArgument) {
            return;
        }
        let mut frames = lock(&self.frames);
        if frames.is_empty() {
            return;
        }

        if transaction_lost {
            for frame in frames.iter_mut() {
                frame.failure.get_or_insert_with(|| Failure {
                    code: err.code(),
                    message: format!("transaction aborted by the database: {err}"),
                });
            }
        } else if let Some(top) = frames.last_mut() {
            top.failure.get_or_insert_with(|| Failure {
                code: err.code(),
                message: err.to_string(),
            });
        }
        debug!(
            "event=txn_mark_failed module=session status=ok depth={} error_code={}",
            frames.len() - 1,
            err.code()
        );
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let frames = self.frames.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !frames.is_empty() {
            warn!(
                "event=session_drop module=session status=unresolved open_transactions={}",
                frames.len()
            );
        }
    }
}

fn is_open(frames: &[Frame], frame: FrameRef) -> bool {
    frames
        .get(frame.id)
        .is_some_and(|open| open.token == frame.token)
}

fn savepoint_name(id: usize) -> String {
    format!("sp{id}")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn install_progress_handler(conn: &Connection, signal: &Signal) {
    let probe = signal.clone();
    conn.progress_handler(PROGRESS_CHECK_OPS, Some(move || probe.is_done()));
}

/// Runs cleanup statements that must not be interrupted by a done signal.
fn execute_uninterruptible(
    conn: &Connection,
    signal: &Signal,
    sql: &str,
) -> rusqlite::Result<()> {
    conn.progress_handler(0, None::<fn() -> bool>);
    let result = conn.execute_batch(sql);
    install_progress_handler(conn, signal);
    result
}
