//! Lock wrappers - parking_lot if available, std otherwise.
//!
//! Both flavours expose the parking_lot API: `lock()` returns the guard
//! directly and `Condvar::wait` takes the guard by mutable reference.

#[cfg(feature = "parking_lot")]
pub use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

#[cfg(not(feature = "parking_lot"))]
mod std_lock {
    use std::sync::{
        Condvar as StdCondvar, Mutex as StdMutex, MutexGuard as StdMutexGuard,
        RwLock as StdRwLock, RwLockReadGuard, RwLockWriteGuard,
    };

    /// Thin wrapper around std::sync::Mutex.
    #[derive(Debug, Default)]
    pub struct Mutex<T>(StdMutex<T>);

    impl<T> Mutex<T> {
        /// Create a new mutex.
        pub const fn new(value: T) -> Self {
            Self(StdMutex::new(value))
        }

        /// Lock the mutex.
        pub fn lock(&self) -> MutexGuard<'_, T> {
            MutexGuard(Some(self.0.lock().expect("Mutex poisoned")))
        }

        /// Consume the mutex and return the protected value.
        pub fn into_inner(self) -> T {
            self.0.into_inner().expect("Mutex poisoned")
        }
    }

    /// Guard for std mutex.
    ///
    /// The inner guard is only ever `None` while a [`Condvar`] wait is in
    /// progress on it.
    pub struct MutexGuard<'a, T>(Option<StdMutexGuard<'a, T>>);

    impl<'a, T> std::ops::Deref for MutexGuard<'a, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            self.0.as_deref().expect("guard released")
        }
    }

    impl<'a, T> std::ops::DerefMut for MutexGuard<'a, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            self.0.as_deref_mut().expect("guard released")
        }
    }

    /// Condition variable paired with [`Mutex`].
    #[derive(Debug, Default)]
    pub struct Condvar(StdCondvar);

    impl Condvar {
        /// Create a new condition variable.
        pub const fn new() -> Self {
            Self(StdCondvar::new())
        }

        /// Block until notified, releasing the guard while waiting.
        pub fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) {
            let inner = guard.0.take().expect("guard released");
            guard.0 = Some(self.0.wait(inner).expect("Mutex poisoned"));
        }

        /// Wake one waiter.
        pub fn notify_one(&self) {
            self.0.notify_one();
        }

        /// Wake all waiters.
        pub fn notify_all(&self) {
            self.0.notify_all();
        }
    }

    /// Thin wrapper around std::sync::RwLock.
    #[derive(Debug, Default)]
    pub struct RwLock<T>(StdRwLock<T>);

    impl<T> RwLock<T> {
        /// Create a new lock.
        pub const fn new(value: T) -> Self {
            Self(StdRwLock::new(value))
        }

        /// Shared access.
        pub fn read(&self) -> RwLockReadGuard<'_, T> {
            self.0.read().expect("RwLock poisoned")
        }

        /// Exclusive access.
        pub fn write(&self) -> RwLockWriteGuard<'_, T> {
            self.0.write().expect("RwLock poisoned")
        }
    }
}

#[cfg(not(feature = "parking_lot"))]
pub use std_lock::{Condvar, Mutex, MutexGuard, RwLock};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_condvar_handoff() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let worker = {
            let pair = Arc::clone(&pair);
            thread::spawn(move || {
                let (lock, cvar) = &*pair;
                *lock.lock() = true;
                cvar.notify_all();
            })
        };

        let (lock, cvar) = &*pair;
        let mut ready = lock.lock();
        while !*ready {
            cvar.wait(&mut ready);
        }
        drop(ready);
        worker.join().unwrap();
    }

    #[test]
    fn test_rwlock() {
        let lock = RwLock::new(3u32);
        assert_eq!(*lock.read(), 3);
        *lock.write() += 1;
        assert_eq!(*lock.read(), 4);
    }
}
