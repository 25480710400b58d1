//! Explicit execution context for storage calls.
//!
//! # Responsibility
//! - Carry cancellation and deadline from the caller down to the connection.
//! - Carry the currently bound `Session`, so nested calls reuse one
//!   transaction instead of opening another.
//!
//! # Invariants
//! - A derived context observes every cancellation of its ancestors.
//! - A derived deadline never extends the parent deadline.

use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::storage::session::Session;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation and deadline state, detached from any session.
///
/// Sessions keep a `Signal` (never a full `Context`) so the progress handler
/// installed on their connection does not hold the session alive.
#[derive(Debug, Clone, Default)]
pub struct Signal {
    cancel_flags: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl Signal {
    pub fn is_cancelled(&self) -> bool {
        self.cancel_flags
            .iter()
            .any(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// True once the signal is cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline_passed()
    }

    /// Fails with `Canceled` or `DeadlineExceeded` once the signal is done.
    pub fn check(&self) -> StorageResult<()> {
        if self.is_cancelled() {
            return Err(StorageError::canceled());
        }
        if self.deadline_passed() {
            return Err(StorageError::deadline_exceeded());
        }
        Ok(())
    }

    /// Reclassifies an interrupted statement by the reason it was interrupted.
    pub(crate) fn refine(&self, err: StorageError) -> StorageError {
        match err.code() {
            ErrorCode::Canceled if !self.is_cancelled() && self.deadline_passed() => {
                StorageError::deadline_exceeded().with_source(err)
            }
            _ => err,
        }
    }
}

/// Handle that cancels the context it was created with.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Request-scoped execution context.
#[derive(Debug, Clone, Default)]
pub struct Context {
    signal: Signal,
    session: Option<Session>,
}

impl Context {
    /// Root context: never cancelled, no deadline, no session.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context that can be cancelled through the returned handle.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let mut derived = self.clone();
        derived.signal.cancel_flags.push(Arc::clone(&flag));
        (derived, CancelHandle { flag })
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut derived = self.clone();
        derived.signal.deadline = Some(match self.signal.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        derived
    }

    /// Derives a context carrying `session`.
    pub fn with_session(&self, session: Session) -> Self {
        Self {
            signal: self.signal.clone(),
            session: Some(session),
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn err(&self) -> StorageResult<()> {
        self.signal.check()
    }
}

#[cfg(test)]
mod tests {
    use super::Context;
    use crate::error::ErrorCode;
    use std::time::{Duration, Instant};

    #[test]
    fn background_context_is_live() {
        assert!(Context::background().err().is_ok());
    }

    #[test]
    fn cancellation_reaches_derived_contexts() {
        let (parent, handle) = Context::background().with_cancel();
        let (child, _child_handle) = parent.with_cancel();
        handle.cancel();

        let err = child.err().expect_err("child must observe parent cancellation");
        assert_eq!(err.code(), ErrorCode::Canceled);
    }

    #[test]
    fn elapsed_deadline_is_reported() {
        let ctx = Context::background().with_deadline(Instant::now() - Duration::from_millis(1));
        let err = ctx.err().expect_err("deadline in the past must fail");
        assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
    }

    #[test]
    fn derived_deadline_never_extends_parent() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.signal().deadline(), parent.signal().deadline());
    }
}
