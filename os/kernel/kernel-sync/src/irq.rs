//! Interrupt masking.

use crate::{SpinLock, SpinLockGuard};
use core::fmt;
use core::ops::{Deref, DerefMut};

/// `IF` bit of `RFLAGS`.
const RFLAGS_IF: u64 = 1 << 9;

/// Disables hardware interrupts (`cli`).
///
/// # Safety
/// Must only be called at CPL 0.
#[cfg(feature = "asm")]
#[inline]
unsafe fn disable_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety
/// Must only be called at CPL 0.
#[cfg(feature = "asm")]
#[inline]
unsafe fn enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

#[cfg(feature = "asm")]
#[inline]
fn interrupts_enabled() -> bool {
    let r: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    r & RFLAGS_IF != 0
}

#[cfg(not(feature = "asm"))]
#[inline]
const fn interrupts_enabled() -> bool {
    let _ = RFLAGS_IF;
    false
}

/// RAII guard that disables interrupts on creation and restores the
/// previous state on drop.
///
/// Nests correctly: only the outermost guard re-enables interrupts.
pub struct IrqGuard {
    were_enabled: bool,
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = interrupts_enabled();
        #[cfg(feature = "asm")]
        if were_enabled {
            unsafe { disable_interrupts() };
        }
        Self { were_enabled }
    }

    /// Whether interrupts were on when this guard was taken.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        #[cfg(feature = "asm")]
        if self.were_enabled {
            unsafe { enable_interrupts() };
        }
    }
}

/// A [`SpinLock`] that is only ever held with interrupts disabled.
///
/// Use this for data an interrupt handler on the same CPU may touch;
/// otherwise the handler could spin forever on a lock its own CPU holds.
pub struct IrqSpinLock<T> {
    inner: SpinLock<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.inner.lock();
        IrqSpinLockGuard { guard, _irq: irq }
    }

    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T> fmt::Debug for IrqSpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqSpinLock")
            .field("locked", &self.inner.is_locked())
            .finish_non_exhaustive()
    }
}

/// Releases the lock first, then restores interrupts (field drop order).
pub struct IrqSpinLockGuard<'a, T> {
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_guard_is_inert() {
        let g = IrqGuard::new();
        assert!(!g.were_enabled());
    }

    #[test]
    fn irq_lock_excludes() {
        let l = IrqSpinLock::new(5u32);
        {
            let mut g = l.lock();
            *g += 1;
            assert!(l.inner.try_lock().is_none());
        }
        assert_eq!(l.with_lock(|v| *v), 6);
    }
}
