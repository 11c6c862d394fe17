use crate::CpuOps;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spinlock that masks interrupts on the local core while held.
///
/// The allocator's structures are not reentrant: an interrupt handler that
/// allocates while the same core holds the heap lock would deadlock. Masking
/// interrupts for the duration of the critical section rules that out, the
/// atomic flag serialises the other cores.
pub struct SpinLockIrq<T: ?Sized, CPU: CpuOps> {
    lock: AtomicBool,
    _phantom: PhantomData<CPU>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send, CPU: CpuOps> Send for SpinLockIrq<T, CPU> {}
unsafe impl<T: ?Sized + Send, CPU: CpuOps> Sync for SpinLockIrq<T, CPU> {}

impl<T, CPU: CpuOps> SpinLockIrq<T, CPU> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: AtomicBool::new(false),
            _phantom: PhantomData,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized, CPU: CpuOps> SpinLockIrq<T, CPU> {
    /// Masks interrupts and spins until the lock is acquired. Interrupts are
    /// restored to their previous state when the guard is dropped.
    pub fn lock_save_irq(&self) -> SpinLockIrqGuard<'_, T, CPU> {
        let flags = CPU::disable_interrupts();

        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) {
                spin_loop();
            }
        }

        SpinLockIrqGuard { lock: self, flags }
    }

    /// Like [`Self::lock_save_irq`], but gives up instead of spinning.
    pub fn try_lock_save_irq(&self) -> Option<SpinLockIrqGuard<'_, T, CPU>> {
        let flags = CPU::disable_interrupts();

        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockIrqGuard { lock: self, flags })
        } else {
            CPU::restore_interrupt_state(flags);
            None
        }
    }
}

#[must_use = "if unused, the SpinLockIrq will immediately unlock"]
pub struct SpinLockIrqGuard<'a, T: ?Sized, CPU: CpuOps> {
    lock: &'a SpinLockIrq<T, CPU>,
    flags: usize,
}

impl<T: ?Sized, CPU: CpuOps> Deref for SpinLockIrqGuard<'_, T, CPU> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Holding the guard means we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized, CPU: CpuOps> DerefMut for SpinLockIrqGuard<'_, T, CPU> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Holding the guard means we hold the lock exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized, CPU: CpuOps> Drop for SpinLockIrqGuard<'_, T, CPU> {
    fn drop(&mut self) {
        self.lock.lock.store(false, Ordering::Release);
        CPU::restore_interrupt_state(self.flags);
    }
}
