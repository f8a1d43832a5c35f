use crate::cpu;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

// Interrupt-disabling mutual exclusion.
//
// On this single-CPU kernel a lock can never be contended once
// interrupts are off, so "spinning" degenerates into a held-twice
// check: attempting to re-acquire a held lock is a deadlock and
// panics instead of hanging silently.
#[derive(Debug)]
pub struct Mutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
    name: &'static str,
}

unsafe impl<T: Send> Sync for Mutex<T> {}
unsafe impl<T: Send> Send for Mutex<T> {}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
            name,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        cpu::push_cli();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            panic!("acquire {}: already held", self.name);
        }
        MutexGuard { mutex: self }
    }

    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    // consume the guard, returning the lock for a later re-acquire.
    pub fn unlock(guard: MutexGuard<'_, T>) -> &'_ Mutex<T> {
        let mutex = guard.mutex;
        drop(guard);
        mutex
    }

    // bypass the lock. Only for the panic path, where the printer
    // may be held by the code that just panicked.
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut *self.data.get()
    }
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        assert!(self.mutex.holding(), "release {}", self.mutex.name);
        self.mutex.locked.store(false, Ordering::Release);
        cpu::pop_cli();
    }
}
