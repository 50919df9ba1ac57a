//! Guest closures wrapped as host-callable values.
//!
//! A guest closure is an opaque two-word capability `(a, b)` plus two
//! guest routines: a trampoline that runs the closure body and a destructor
//! that frees its environment. The host keeps a reference count on top:
//!
//! ```text
//!            invoke                    return (count > 0)
//!  Live(n) ─────────► Live(n + 1) ───────────────────────► Live(n)
//!     │                    │
//!     │ release (n == 1)   │ return (count == 0): destructor runs
//!     ▼                    ▼
//!  Destroyed ◄─────────────┘
//! ```
//!
//! While an invocation is running `a` is parked in the call frame and the
//! stored word reads zero, so a nested call of the same closure is rejected
//! rather than handing the guest an environment it is already mutating.
//! The destructor runs exactly once, when the count reaches zero.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{BridgeError, Result};

/// Guest routines the closure bridge calls into.
pub trait GuestClosures {
    /// Run `trampoline(a, b, arg)` in the guest.
    fn call_trampoline(&mut self, trampoline: u32, a: u32, b: u32, arg: u32) -> Result<()>;

    /// Run `dtor(a, b)` in the guest, freeing the closure environment.
    fn call_destructor(&mut self, dtor: u32, a: u32, b: u32) -> Result<()>;
}

/// Snapshot of a closure's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosureState {
    /// First capability word; zero while running or once consumed
    pub a: u32,
    /// Second capability word
    pub b: u32,
    /// Outstanding references, including in-flight invocations
    pub refcount: u32,
    /// Guest destructor id
    pub dtor: u32,
    /// Guest trampoline id
    pub trampoline: u32,
}

/// Where a closure is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureLifecycle {
    /// Callable, with this many references
    Live(u32),
    /// Environment freed; any further use is a protocol violation
    Destroyed,
}

/// Shared handle to a wrapped closure.
pub type ClosureRef = Arc<GuestClosure>;

/// Host-side wrapper around a guest closure.
#[derive(Debug)]
pub struct GuestClosure {
    state: Mutex<ClosureState>,
}

impl GuestClosure {
    /// Wrap a closure handed out by the guest. It starts with one reference,
    /// owned by the guest-side closure object.
    pub fn wrap(a: u32, b: u32, dtor: u32, trampoline: u32) -> ClosureRef {
        tracing::debug!(a, b, dtor, trampoline, "wrapping guest closure");
        Arc::new(Self {
            state: Mutex::new(ClosureState {
                a,
                b,
                refcount: 1,
                dtor,
                trampoline,
            }),
        })
    }

    fn load(&self) -> ClosureState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, state: ClosureState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Current bookkeeping.
    pub fn state(&self) -> ClosureState {
        self.load()
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> ClosureLifecycle {
        match self.load().refcount {
            0 => ClosureLifecycle::Destroyed,
            n => ClosureLifecycle::Live(n),
        }
    }

    /// Whether an invocation is currently running.
    pub fn is_running(&self) -> bool {
        let state = self.load();
        state.refcount > 0 && state.a == 0
    }

    /// Fail with the error `invoke` would return without calling the guest.
    pub fn check_callable(&self) -> Result<()> {
        let state = self.load();
        if state.refcount == 0 {
            return Err(BridgeError::ClosureDestroyed);
        }
        if state.a == 0 {
            return Err(BridgeError::ClosureBusy);
        }
        Ok(())
    }

    /// Invoke the closure with an argument handle.
    ///
    /// The reference taken for the call keeps the environment alive even if
    /// the closure is released while its body runs; in that case the
    /// destructor runs as soon as the body returns.
    pub fn invoke<G: GuestClosures + ?Sized>(&self, guest: &mut G, arg: u32) -> Result<()> {
        self.check_callable()?;
        let mut state = self.load();

        let a = state.a;
        state.a = 0;
        state.refcount += 1;
        self.store(state);

        let result = guest.call_trampoline(state.trampoline, a, state.b, arg);

        // re-read: the body may have released references meanwhile
        let mut state = self.load();
        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount == 0 {
            self.store(state);
            tracing::debug!(a, b = state.b, "last reference gone after call, destroying closure");
            let destroyed = guest.call_destructor(state.dtor, a, state.b);
            return result.and(destroyed);
        }
        state.a = a;
        self.store(state);
        result
    }

    /// Drop one reference on behalf of the guest.
    ///
    /// Returns `true` when that was the last reference: the closure is now
    /// consumed and the guest must free the environment itself. While an
    /// invocation runs, its own reference cannot be released; the destructor
    /// runs when the body returns instead.
    pub fn release(&self) -> Result<bool> {
        let mut state = self.load();
        if state.refcount > 0 && state.a == 0 {
            if state.refcount <= 1 {
                return Err(BridgeError::ClosureDestroyed);
            }
            state.refcount -= 1;
            self.store(state);
            return Ok(false);
        }
        match state.refcount {
            0 => Err(BridgeError::ClosureDestroyed),
            1 => {
                state.refcount = 0;
                state.a = 0;
                self.store(state);
                Ok(true)
            }
            _ => {
                state.refcount -= 1;
                self.store(state);
                Ok(false)
            }
        }
    }

    /// Drop one reference on behalf of the host, running the guest destructor
    /// if that was the last one. Returns whether the destructor ran.
    pub fn release_and_finalize<G: GuestClosures + ?Sized>(&self, guest: &mut G) -> Result<bool> {
        let ClosureState { a, b, dtor, .. } = self.load();
        if !self.release()? {
            return Ok(false);
        }
        tracing::debug!(a, b, "host released last reference, destroying closure");
        guest.call_destructor(dtor, a, b)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::VecGuest;
    use std::cell::Cell;
    use std::rc::Rc;

    const TRAMPOLINE: u32 = 1;
    const DTOR: u32 = 2;

    #[test]
    fn test_wrap_starts_live() {
        let c = GuestClosure::wrap(100, 200, DTOR, TRAMPOLINE);
        assert_eq!(c.lifecycle(), ClosureLifecycle::Live(1));
        assert_eq!(c.state().a, 100);
    }

    #[test]
    fn test_invoke_forwards_capability() {
        let mut guest = VecGuest::new(64);
        let c = GuestClosure::wrap(100, 200, DTOR, TRAMPOLINE);
        c.invoke(&mut guest, 7).unwrap();
        assert_eq!(guest.calls, vec![(TRAMPOLINE, 100, 200, 7)]);
        assert_eq!(c.lifecycle(), ClosureLifecycle::Live(1));
        assert_eq!(c.state().a, 100);
        assert!(guest.destroyed.is_empty());
    }

    #[test]
    fn test_three_invocations_one_destructor_after_release() {
        let mut guest = VecGuest::new(64);
        let c = GuestClosure::wrap(100, 200, DTOR, TRAMPOLINE);
        for _ in 0..3 {
            c.invoke(&mut guest, 0).unwrap();
        }
        assert!(guest.destroyed.is_empty());

        assert!(c.release_and_finalize(&mut guest).unwrap());
        assert_eq!(guest.destroyed, vec![(DTOR, 100, 200)]);
        assert_eq!(c.lifecycle(), ClosureLifecycle::Destroyed);
    }

    #[test]
    fn test_invoke_after_destroy_rejected() {
        let mut guest = VecGuest::new(64);
        let c = GuestClosure::wrap(100, 200, DTOR, TRAMPOLINE);
        assert!(c.release().unwrap());
        assert!(matches!(c.invoke(&mut guest, 0), Err(BridgeError::ClosureDestroyed)));
        assert!(matches!(c.release(), Err(BridgeError::ClosureDestroyed)));
        assert!(guest.calls.is_empty());
    }

    #[test]
    fn test_release_during_invocation_defers_destructor() {
        let mut guest = VecGuest::new(64);
        let c = GuestClosure::wrap(100, 200, DTOR, TRAMPOLINE);

        let inner = c.clone();
        guest.on_call = Some(Box::new(move || {
            // listener removed from inside its own callback
            assert!(!inner.release().unwrap());
        }));

        c.invoke(&mut guest, 0).unwrap();
        assert_eq!(guest.destroyed, vec![(DTOR, 100, 200)]);
        assert_eq!(c.lifecycle(), ClosureLifecycle::Destroyed);
    }

    #[test]
    fn test_release_during_invocation_cannot_drop_call_reference() {
        let mut guest = VecGuest::new(64);
        let c = GuestClosure::wrap(100, 200, DTOR, TRAMPOLINE);

        let inner = c.clone();
        let results = Rc::new(Cell::new((None, None)));
        let results_in_hook = results.clone();
        guest.on_call = Some(Box::new(move || {
            let first = inner.release().ok();
            let second = matches!(inner.release(), Err(BridgeError::ClosureDestroyed));
            results_in_hook.set((first, Some(second)));
        }));

        c.invoke(&mut guest, 0).unwrap();
        assert_eq!(results.get(), (Some(false), Some(true)));
        assert_eq!(guest.destroyed, vec![(DTOR, 100, 200)]);
        assert_eq!(c.lifecycle(), ClosureLifecycle::Destroyed);
    }

    #[test]
    fn test_check_callable() {
        let c = GuestClosure::wrap(100, 200, DTOR, TRAMPOLINE);
        assert!(c.check_callable().is_ok());
        assert!(!c.is_running());
        assert!(c.release().unwrap());
        assert!(matches!(c.check_callable(), Err(BridgeError::ClosureDestroyed)));
    }

    #[test]
    fn test_nested_invocation_of_same_closure_rejected() {
        let mut guest = VecGuest::new(64);
        let c = GuestClosure::wrap(100, 200, DTOR, TRAMPOLINE);

        let inner = c.clone();
        let seen = Rc::new(Cell::new(None));
        let seen_in_hook = seen.clone();
        guest.on_call = Some(Box::new(move || {
            let mut nested = VecGuest::new(16);
            seen_in_hook.set(Some(matches!(
                inner.invoke(&mut nested, 0),
                Err(BridgeError::ClosureBusy)
            )));
        }));

        c.invoke(&mut guest, 0).unwrap();
        assert_eq!(seen.get(), Some(true));
        assert_eq!(c.lifecycle(), ClosureLifecycle::Live(1));
    }

    #[test]
    fn test_failed_call_still_cleans_up() {
        let mut guest = VecGuest::new(64);
        guest.fail_calls = true;
        let c = GuestClosure::wrap(100, 200, DTOR, TRAMPOLINE);

        assert!(c.invoke(&mut guest, 0).is_err());
        assert_eq!(c.state().a, 100);
        assert_eq!(c.lifecycle(), ClosureLifecycle::Live(1));
    }

    #[test]
    fn test_shared_references() {
        let mut guest = VecGuest::new(64);
        let c = GuestClosure::wrap(100, 200, DTOR, TRAMPOLINE);
        // a second guest-side owner
        c.store(ClosureState { refcount: 2, ..c.state() });

        assert!(!c.release_and_finalize(&mut guest).unwrap());
        c.invoke(&mut guest, 0).unwrap();
        assert!(guest.destroyed.is_empty());
        assert!(c.release().unwrap());
        assert!(guest.destroyed.is_empty(), "guest-side release leaves freeing to the guest");
    }
}
