//! The pending-error indicator seen by native code.
//!
//! Native callers learn about failures from a sentinel return value plus a
//! per-thread "error pending" indicator. Each context owns an [`ErrorState`]
//! that keys into a thread-local registry, so two contexts never observe each
//! other's errors and two threads never observe each other's errors.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::Error;
use crate::host::{HostException, HostRuntime, Singleton};

struct Pending {
    owner: Weak<()>,
    exc: HostException,
}

thread_local! {
    static PENDING: RefCell<HashMap<u64, Pending>> = RefCell::new(HashMap::new());
}

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-context view of the thread-local error indicator.
///
/// Dropping the state clears its entry on the dropping thread only. An
/// error left pending on another thread is released the next time that
/// thread sets an error for any context, or when the thread exits.
#[derive(Debug)]
pub struct ErrorState {
    id: u64,
    token: Arc<()>,
}

impl ErrorState {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            token: Arc::new(()),
        }
    }

    /// Make `exc` the pending error of the calling thread, replacing any
    /// previous one.
    pub fn set(&self, exc: HostException) {
        PENDING.with(|p| {
            let mut pending = p.borrow_mut();
            pending.retain(|_, e| e.owner.strong_count() > 0);
            pending.insert(
                self.id,
                Pending {
                    owner: Arc::downgrade(&self.token),
                    exc,
                },
            );
        });
    }

    /// Whether an error is pending on the calling thread.
    pub fn occurred(&self) -> bool {
        PENDING.with(|p| p.borrow().contains_key(&self.id))
    }

    /// The pending error, left in place.
    pub fn peek(&self) -> Option<HostException> {
        PENDING.with(|p| p.borrow().get(&self.id).map(|e| e.exc.clone()))
    }

    /// The pending error, cleared.
    pub fn take(&self) -> Option<HostException> {
        PENDING.with(|p| p.borrow_mut().remove(&self.id).map(|e| e.exc))
    }

    /// Clear the pending error.
    pub fn clear(&self) {
        self.take();
    }
}

impl Drop for ErrorState {
    fn drop(&mut self) {
        // Entries on other threads are dropped with those threads.
        let _ = PENDING.try_with(|p| p.borrow_mut().remove(&self.id));
    }
}

/// Turn a bridge error into a pending host exception.
///
/// Host exceptions are relayed as raised; bridge failures become
/// MemoryError (exhaustion) or SystemError (everything else).
pub fn raise_bridge_error(errors: &ErrorState, host: &dyn HostRuntime, err: &Error) {
    errors.set(host_exception_for(host, err));
}

/// The host exception a bridge error is reported as.
pub fn host_exception_for(host: &dyn HostRuntime, err: &Error) -> HostException {
    match err {
        Error::Host(exc) => exc.clone(),
        Error::HandleTableFull { .. } => host.raise(Singleton::MemoryError, &err.to_string()),
        Error::InvalidArgument(msg) => host.raise(Singleton::ValueError, msg),
        _ => host.raise(Singleton::SystemError, &err.to_string()),
    }
}

/// Check a native callback's result against the error indicator.
///
/// A failed result must come with a pending error and a good result must
/// come without one. The pending error is consumed either way.
pub fn check_function_result(
    errors: &ErrorState,
    host: &dyn HostRuntime,
    name: &str,
    failed: bool,
) -> Result<(), HostException> {
    let pending = errors.take();
    match (failed, pending) {
        (true, Some(exc)) => Err(exc),
        (true, None) => Err(host.raise(
            Singleton::SystemError,
            &format!("{name} returned NULL without setting an error"),
        )),
        (false, Some(_)) => Err(host.raise(
            Singleton::SystemError,
            &format!("{name} returned a result with an error set"),
        )),
        (false, None) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;

    #[test]
    fn test_states_are_independent() {
        let host = MemoryHost::new();
        let a = ErrorState::new();
        let b = ErrorState::new();
        a.set(host.raise(Singleton::ValueError, "boom"));
        assert!(a.occurred());
        assert!(!b.occurred());
        a.clear();
        assert!(!a.occurred());
    }

    #[test]
    fn test_error_is_per_thread() {
        let host = MemoryHost::new();
        let state = std::sync::Arc::new(ErrorState::new());
        state.set(host.raise(Singleton::TypeError, "here"));
        let remote = std::sync::Arc::clone(&state);
        let seen = std::thread::spawn(move || remote.occurred()).join().unwrap();
        assert!(!seen);
        assert!(state.occurred());
    }

    fn pending_entries() -> usize {
        PENDING.with(|p| p.borrow().len())
    }

    #[test]
    fn test_errors_of_dropped_states_are_released_on_other_threads() {
        let host = MemoryHost::new();
        let dropped = std::sync::Arc::new(ErrorState::new());
        let live = ErrorState::new();
        let (set_tx, set_rx) = std::sync::mpsc::channel();
        let (drop_tx, drop_rx) = std::sync::mpsc::channel();

        std::thread::scope(|s| {
            let remote = std::sync::Arc::clone(&dropped);
            let (host, live) = (&host, &live);
            s.spawn(move || {
                remote.set(host.raise(Singleton::ValueError, "left behind"));
                let token = std::sync::Arc::downgrade(&remote.token);
                drop(remote);
                set_tx.send(()).unwrap();
                drop_rx.recv().unwrap();

                assert_eq!(pending_entries(), 1);
                assert_eq!(token.strong_count(), 0, "the state is gone");
                live.set(host.raise(Singleton::TypeError, "fresh"));
                assert_eq!(pending_entries(), 1, "the orphaned entry was pruned");
                assert!(live.occurred());
            });
            set_rx.recv().unwrap();
            drop(dropped);
            drop_tx.send(()).unwrap();
        });
    }

    #[test]
    fn test_null_result_without_error_is_system_error() {
        let host = MemoryHost::new();
        let state = ErrorState::new();
        let err = check_function_result(&state, &host, "f", true).unwrap_err();
        assert!(err.exc_type.ptr_eq(&host.singleton(Singleton::SystemError)));
        assert_eq!(
            host.exception_message(&err.value).unwrap(),
            "f returned NULL without setting an error"
        );
    }

    #[test]
    fn test_result_with_error_set_is_rejected() {
        let host = MemoryHost::new();
        let state = ErrorState::new();
        state.set(host.raise(Singleton::ValueError, "late"));
        assert!(check_function_result(&state, &host, "g", false).is_err());
        assert!(!state.occurred());
    }
}
