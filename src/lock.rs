use std::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::Ordering,
};

use linux_futex::{Futex, Private};

/// This futex represents a lock and is unlocked
const FUTEX_UNLOCKED: u32 = 0;

/// This futex represents a lock and is locked, nobody is sleeping on it
const FUTEX_LOCKED: u32 = 1;

/// This futex is locked and at least one thread might be asleep waiting for it
const FUTEX_CONTENDED: u32 = 2;

/// How many times we spin on a relaxed load before going to sleep
const SPIN_LIMIT: u32 = 100;

/// A mutex that never touches the heap. Both the live-allocation registry and
/// the stack trie sit behind one of these, since they are locked from inside
/// `GlobalAlloc::alloc()` and anything that allocates there would recurse.
pub struct FutexMutex<T> {
    futex: Futex<Private>,
    data: UnsafeCell<T>,
}

// SAFETY: The futex ensures only one thread accesses the inner data at a time.
unsafe impl<T: Send> Sync for FutexMutex<T> {}
unsafe impl<T: Send> Send for FutexMutex<T> {}

impl<T> FutexMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            futex: Futex::new(FUTEX_UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning briefly and then sleeping on the futex.
    pub fn lock(&self) -> FutexMutexGuard<'_, T> {
        if self
            .futex
            .value
            .compare_exchange(
                FUTEX_UNLOCKED,
                FUTEX_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            self.lock_contended();
        }
        FutexMutexGuard { lock: self }
    }

    /// Try to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<FutexMutexGuard<'_, T>> {
        self.futex
            .value
            .compare_exchange(
                FUTEX_UNLOCKED,
                FUTEX_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| FutexMutexGuard { lock: self })
    }

    #[cold]
    fn lock_contended(&self) {
        let mut spins = 0;
        while spins < SPIN_LIMIT {
            if self.futex.value.load(Ordering::Relaxed) == FUTEX_UNLOCKED
                && self
                    .futex
                    .value
                    .compare_exchange(
                        FUTEX_UNLOCKED,
                        FUTEX_LOCKED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
            spins += 1;
        }

        // Mark the lock as contended so whoever unlocks it knows to wake us.
        // If the swap hands back UNLOCKED, we just took it.
        while self.futex.value.swap(FUTEX_CONTENDED, Ordering::Acquire) != FUTEX_UNLOCKED {
            _ = self.futex.wait(FUTEX_CONTENDED);
        }
    }

    fn unlock(&self) {
        if self.futex.value.swap(FUTEX_UNLOCKED, Ordering::Release) == FUTEX_CONTENDED {
            self.futex.wake(1);
        }
    }

    /// Get the data without locking, when we can prove nobody else has it.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> fmt::Debug for FutexMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutexMutex")
            .field("state", &self.futex.value.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// RAII guard, `Drop` releases the lock
pub struct FutexMutexGuard<'a, T> {
    lock: &'a FutexMutex<T>,
}

impl<T> Deref for FutexMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The lock is held, granting exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for FutexMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The lock is held, granting exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for FutexMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
