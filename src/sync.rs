use std::cell::RefCell;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;

/// A read-mostly lock for copy-on-write style caches (routing tables, pool
/// maps): readers take cheap shared locks, writers coordinate through an
/// atomic flag so at most one of several concurrent would-be writers performs
/// the update while the rest re-check under a read lock.
#[derive(Debug)]
pub(crate) struct MostlyReadLock<T: Debug> {
    inner: RwLock<T>,
    updating: AtomicBool,
}

impl<T: Debug> MostlyReadLock<T> {
    pub(crate) fn new(inner: T) -> Self {
        Self {
            inner: RwLock::new(inner),
            updating: AtomicBool::new(false),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    /// Run `updater` exactly once under the write lock, then return a read
    /// guard.
    pub(crate) fn update<'a, U: FnMut(RwLockWriteGuard<'a, T>) -> Result<()>>(
        &'a self,
        mut updater: U,
    ) -> Result<RwLockReadGuard<'a, T>> {
        let done = RefCell::new(false);
        self.maybe_write(
            |_| !*done.borrow(),
            |lock| {
                *done.borrow_mut() = true;
                updater(lock)
            },
        )
    }

    /// Return a read guard once `needs_update` reports `false`, running
    /// `updater` under the write lock as long as it reports `true`.
    pub(crate) fn maybe_write<
        'a,
        C: FnMut(&RwLockReadGuard<'a, T>) -> bool,
        U: FnMut(RwLockWriteGuard<'a, T>) -> Result<()>,
    >(
        &'a self,
        mut needs_update: C,
        mut updater: U,
    ) -> Result<RwLockReadGuard<'a, T>> {
        loop {
            {
                let r_lock = self.inner.read();
                if !needs_update(&r_lock) {
                    return Ok(r_lock);
                }
                // avoid drowning the writer
                RwLockReadGuard::unlock_fair(r_lock);
            }
            let already_updating = self.updating.swap(true, Ordering::SeqCst);
            if !already_updating {
                let w_lock = self.inner.write();
                self.updating.store(false, Ordering::SeqCst);
                updater(w_lock)?;
                return Ok(self.inner.read());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maybe_write_skips_update_when_fresh() {
        let lock = MostlyReadLock::new(1);
        let guard = lock
            .maybe_write(|_| false, |_| panic!("must not update"))
            .unwrap();
        assert_eq!(*guard, 1);
    }

    #[test]
    fn maybe_write_updates_until_fresh() {
        let lock = MostlyReadLock::new(0);
        let guard = lock
            .maybe_write(
                |v| **v < 3,
                |mut v| {
                    *v += 1;
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(*guard, 3);
    }

    #[test]
    fn update_runs_exactly_once() {
        let lock = MostlyReadLock::new(0);
        let guard = lock
            .update(|mut v| {
                *v += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(*guard, 1);
    }
}
