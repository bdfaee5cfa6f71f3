use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

/// A cell written at most once and then shared read-only.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY is only stored after the value was written.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    /// Store `value` unless the cell was already claimed.
    ///
    /// # Errors
    /// Returns `value` back if another writer got there first.
    pub fn set(&self, value: T) -> Result<(), T> {
        if self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        unsafe { (*self.value.get()).write(value) };
        self.state.store(READY, Ordering::Release);
        Ok(())
    }

    /// Initialize at most once and return `&T`.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(v) = self.get() {
            return v;
        }
        // A losing writer drops its value and waits for the winner below.
        let _ = self.set(init());
        while self.state.load(Ordering::Acquire) != READY {
            spin_loop();
        }
        // SAFETY: READY
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

// Safety: shared after READY; initialization is single-writer.
unsafe impl<T: Sync + Send> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_once() {
        let cell = SyncOnceCell::new();
        assert!(cell.get().is_none());
        assert_eq!(cell.set(1u32), Ok(()));
        assert_eq!(cell.set(2u32), Err(2));
        assert_eq!(cell.get(), Some(&1));
    }

    #[test]
    fn get_or_init_runs_once() {
        let cell = SyncOnceCell::new();
        let mut calls = 0;
        let v = *cell.get_or_init(|| {
            calls += 1;
            7u8
        });
        assert_eq!(v, 7);
        assert_eq!(*cell.get_or_init(|| 9), 7);
        assert_eq!(calls, 1);
    }
}
