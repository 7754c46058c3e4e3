//! A mutual-exclusion wrapper for state shared between concurrent callers.
//!
//! [`Synchronized`] is the only way the avenue shares mutable bookkeeping between threads. Every
//! access happens inside a closure, which makes it impossible to hold on to the guard past the
//! critical section.
//!
//! # Reentrancy
//!
//! The closures passed to [`Synchronized::read_with`] and [`Synchronized::mutate`] must never
//! access the same container again. The underlying lock is not reentrant, so doing so would
//! deadlock. Debug builds detect this and panic instead.

use std::cell::RefCell;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use crate::utils::defer::{DeferGuard, defer};

thread_local! {
    /// Addresses of the containers the current thread is currently inside of.
    static ENTERED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Gives atomic read and transactional mutate access to a value.
///
/// Readers get a consistent view of the value and wait for a running mutation to finish.
/// Lock poisoning is ignored: a panic inside a closure leaves the value in whatever state the
/// closure produced, and later accesses keep working.
pub struct Synchronized<T> {
    value: RwLock<T>,
}

impl<T> Synchronized<T> {
    /// Wraps `value`.
    pub const fn new(value: T) -> Self {
        Self {
            value: RwLock::new(value),
        }
    }

    /// Returns a snapshot of the guarded value.
    #[track_caller]
    pub fn read(&self) -> T
    where
        T: Clone,
    {
        self.read_with(T::clone)
    }

    /// Runs `f` with shared access to the guarded value.
    #[track_caller]
    pub fn read_with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let _entered = self.enter();
        let value = self.value.read().unwrap_or_else(PoisonError::into_inner);
        f(&value)
    }

    /// Runs `f` with exclusive access to the guarded value and returns its result.
    #[track_caller]
    pub fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _entered = self.enter();
        let mut value = self.value.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut value)
    }

    /// Replaces the guarded value, returning the previous one.
    #[track_caller]
    pub fn replace(&self, value: T) -> T {
        self.mutate(|current| std::mem::replace(current, value))
    }

    /// Consumes the container, returning the guarded value.
    pub fn into_inner(self) -> T {
        self.value.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks this container as entered by the current thread, panicking on reentrant access.
    ///
    /// This is a no-op in release builds.
    #[track_caller]
    fn enter(&self) -> Option<DeferGuard<impl FnOnce()>> {
        if !cfg!(debug_assertions) {
            return None;
        }

        let addr = self as *const Self as usize;
        let reentered = ENTERED.with_borrow_mut(|entered| {
            let reentered = entered.contains(&addr);
            if !reentered {
                entered.push(addr);
            }
            reentered
        });
        if reentered {
            panic!(
                "reentrant access to `Synchronized<{}>`",
                std::any::type_name::<T>()
            );
        }

        Some(defer(move || {
            ENTERED.with_borrow_mut(|entered| {
                if let Some(pos) = entered.iter().rposition(|entry| *entry == addr) {
                    entered.swap_remove(pos);
                }
            })
        }))
    }
}

impl<T: Default> Default for Synchronized<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Synchronized<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Synchronized");
        match self.value.try_read() {
            Ok(value) => d.field("value", &*value),
            Err(_) => d.field("value", &"<locked>"),
        };
        d.finish()
    }
}
