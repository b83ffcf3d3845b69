//! Per-thread state of the payloads: the stack of open calls and the reentrancy flag.
//!
//! Both live in thread-locals and are never observed from another thread, so no synchronization
//! is involved. Neither is usable once the thread has started tearing down its thread-locals;
//! callers treat that like an active guard and do nothing.

use core::cell::{Cell, RefCell};
use core::marker::PhantomData;

use crate::interface::OpenCall;

/// LIFO of the instrumented frames currently active on one thread.
#[derive(Debug, Default)]
pub struct RetStack {
    calls: Vec<OpenCall>,
}

impl RetStack {
    pub const fn new() -> RetStack {
        RetStack { calls: Vec::new() }
    }

    #[inline]
    pub fn push(&mut self, call: OpenCall) {
        self.calls.push(call);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<OpenCall> {
        self.calls.pop()
    }

    pub fn depth(&self) -> usize {
        self.calls.len()
    }
}

thread_local! {
    static RETSTACK: RefCell<RetStack> = const { RefCell::new(RetStack::new()) };
    static IN_PAYLOAD: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` on this thread's open-call stack. `None` once the thread-local has been destroyed.
#[inline]
pub(crate) fn with_retstack<R>(f: impl FnOnce(&mut RetStack) -> R) -> Option<R> {
    RETSTACK
        .try_with(|stack| f(&mut stack.borrow_mut()))
        .ok()
}

/// Number of instrumented frames currently active on the calling thread.
pub fn open_call_depth() -> usize {
    with_retstack(|stack| stack.depth()).unwrap_or(0)
}

/// Marks the calling thread as running a payload for as long as it is alive.
///
/// Not `Send`: the flag belongs to the thread that set it.
#[must_use]
#[derive(Debug)]
pub struct ReentrancyGuard {
    nested: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl ReentrancyGuard {
    /// Sets the flag. Returns `None` if it was already set, in which case nothing changes.
    #[inline]
    pub fn try_enter() -> Option<ReentrancyGuard> {
        let guard = ReentrancyGuard::enter();
        if guard.nested {
            None
        } else {
            Some(guard)
        }
    }

    /// Sets the flag unconditionally. Dropping the guard restores the previous value.
    #[inline]
    pub fn enter() -> ReentrancyGuard {
        let nested = IN_PAYLOAD.try_with(|flag| flag.replace(true)).unwrap_or(true);
        ReentrancyGuard {
            nested,
            _thread_bound: PhantomData,
        }
    }

    /// Whether the flag was already set when this guard was taken.
    pub fn is_nested(&self) -> bool {
        self.nested
    }
}

impl Drop for ReentrancyGuard {
    #[inline]
    fn drop(&mut self) {
        if !self.nested {
            let _ = IN_PAYLOAD.try_with(|flag| flag.set(false));
        }
    }
}

/// Suppresses instrumentation on the calling thread until the returned guard is dropped.
///
/// Entry payloads hit while suppressed do nothing. Used by threads that belong to the tracer
/// itself, so its own transport code does not show up in captures.
pub fn suppress_instrumentation() -> ReentrancyGuard {
    ReentrancyGuard::enter()
}

pub fn instrumentation_suppressed() -> bool {
    IN_PAYLOAD.try_with(Cell::get).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(return_address: u64, timestamp_ns: u64) -> OpenCall {
        OpenCall {
            return_address,
            timestamp_ns,
        }
    }

    #[test]
    fn retstack_is_lifo() {
        let mut stack = RetStack::new();
        stack.push(call(0x1000, 1));
        stack.push(call(0x3000, 2));
        stack.push(call(0x5000, 3));
        assert_eq!(stack.depth(), 3);
        assert_eq!(stack.pop(), Some(call(0x5000, 3)));
        stack.push(call(0x7000, 4));
        assert_eq!(stack.pop(), Some(call(0x7000, 4)));
        assert_eq!(stack.pop(), Some(call(0x3000, 2)));
        assert_eq!(stack.pop(), Some(call(0x1000, 1)));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn thread_stacks_are_private() {
        with_retstack(|s| s.push(call(1, 1))).unwrap();
        let other = std::thread::spawn(open_call_depth).join().unwrap();
        assert_eq!(other, 0);
        assert_eq!(open_call_depth(), 1);
        with_retstack(|s| s.pop()).unwrap();
    }

    #[test]
    fn guard_rejects_nested_entry() {
        assert!(!instrumentation_suppressed());
        {
            let outer = ReentrancyGuard::try_enter().expect("flag was clear");
            assert!(!outer.is_nested());
            assert!(instrumentation_suppressed());
            assert!(ReentrancyGuard::try_enter().is_none());

            let forced = ReentrancyGuard::enter();
            assert!(forced.is_nested());
            drop(forced);
            // Dropping a nested guard must not clear the outer one.
            assert!(instrumentation_suppressed());
        }
        assert!(!instrumentation_suppressed());
    }

    #[test]
    fn suppression_scope() {
        let scope = suppress_instrumentation();
        assert!(ReentrancyGuard::try_enter().is_none());
        drop(scope);
        assert!(ReentrancyGuard::try_enter().is_some());
    }
}
