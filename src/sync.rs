//! Synchronization primitives: a non-poisoning [`Mutex`] and the
//! single-holder [`TryLock`] that marks a backend slot busy.
//!
//! [`Mutex`] exposes an API identical to [`std::sync::Mutex`] but **does not
//! return** [`std::sync::PoisonError`] even if a thread panics while holding
//! the lock; a poisoned slot handle would take a healthy backend out of
//! rotation for no reason.
//!
//! [`TryLock`] is deliberately not a queueing lock: a busy slot must be
//! skipped by the dispatcher, not waited on, or every request for a host
//! would serialize onto one upstream connection.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync,
    sync::Arc,
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A [`Mutex`] that never poisons and has the same interface as
/// [`std::sync::Mutex`].
pub struct Mutex<T: ?Sized>(sync::Mutex<T>);

impl<T> Mutex<T> {
    /// Like [`std::sync::Mutex::new`].
    #[inline]
    pub fn new(t: T) -> Mutex<T> {
        Mutex(sync::Mutex::new(t))
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Like [`std::sync::Mutex::lock`].
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        MutexGuard(self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl<T> Default for Mutex<T>
where
    T: Default,
{
    #[inline]
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Like [`std::sync::MutexGuard`].
#[must_use]
pub struct MutexGuard<'a, T: ?Sized + 'a>(sync::MutexGuard<'a, T>);

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.0.deref()
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.0.deref_mut()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Single-holder mutual exclusion with a non-blocking acquire.
///
/// [`try_acquire`][TryLock::try_acquire] never waits: it either returns a
/// guard or reports that another holder exists. The guard is owned
/// (`'static`) so a dispatch can keep the slot busy for as long as the
/// response body is still streaming to the client, well past the stack
/// frame that acquired it. Dropping the guard releases the lock.
pub struct TryLock {
    sem: Arc<Semaphore>,
}

impl TryLock {
    /// Creates an unlocked `TryLock`.
    pub fn new() -> TryLock {
        TryLock {
            sem: Arc::new(Semaphore::new(1)),
        }
    }

    /// Attempts to acquire the lock without waiting.
    ///
    /// Returns `None` if another guard is alive.
    pub fn try_acquire(&self) -> Option<TryLockGuard> {
        Arc::clone(&self.sem)
            .try_acquire_owned()
            .ok()
            .map(|permit| TryLockGuard { _permit: permit })
    }

    /// Acquires the lock, waiting for the current holder to release it.
    ///
    /// The dispatcher never calls this; it exists for callers that do want
    /// exclusive access eventually, such as tests draining a slot.
    pub async fn acquire(&self) -> TryLockGuard {
        let permit = Arc::clone(&self.sem)
            .acquire_owned()
            .await
            .expect("busy-lock semaphore is never closed");
        TryLockGuard { _permit: permit }
    }

    /// Reports whether a guard is currently held.
    pub fn is_locked(&self) -> bool {
        self.sem.available_permits() == 0
    }
}

impl Default for TryLock {
    fn default() -> Self {
        TryLock::new()
    }
}

impl fmt::Debug for TryLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TryLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Guard returned by [`TryLock::try_acquire`] and [`TryLock::acquire`].
///
/// The lock is released when the guard drops.
#[must_use]
pub struct TryLockGuard {
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for TryLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("TryLockGuard")
    }
}
