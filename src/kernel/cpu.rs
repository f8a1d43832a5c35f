use crate::x86;
use core::cell::UnsafeCell;

pub static CPU: Cpu = Cpu::new();

// Per-CPU state. There is exactly one CPU in this kernel, but the
// interrupt-nesting bookkeeping still lives here the way it would on
// a bigger machine.
pub struct Cpu {
    inner: UnsafeCell<CpuInner>,
}

unsafe impl Sync for Cpu {}

struct CpuInner {
    ncli: isize,        // depth of push_cli()
    int_enabled: bool,  // were interrupts on before the first push_cli()?
}

// push_cli/pop_cli are like cli/sti except that they are matched:
// it takes two pop_cli()s to undo two push_cli()s. Also, if interrupts
// are initially off, then push_cli, pop_cli leaves them off.
pub fn push_cli() {
    let old = x86::intr_get();
    // disable first; checking and then clearing would be a race.
    x86::intr_off();
    let inner = unsafe { &mut *CPU.inner.get() };
    if inner.ncli == 0 {
        inner.int_enabled = old;
    }
    inner.ncli += 1;
}

pub fn pop_cli() {
    assert!(!x86::intr_get(), "pop_cli - interruptible");
    let inner = unsafe { &mut *CPU.inner.get() };
    assert!(inner.ncli >= 1, "pop_cli without push_cli");
    inner.ncli -= 1;
    if inner.ncli == 0 && inner.int_enabled {
        x86::intr_on();
    }
}

// The push_cli nesting belongs to a kernel stack, not to the CPU:
// the scheduler saves it on the outgoing stack and restores it when
// that stack is resumed. Interrupts must be off around all of these.
pub fn save_nesting() -> (isize, bool) {
    let inner = unsafe { &*CPU.inner.get() };
    (inner.ncli, inner.int_enabled)
}

pub fn restore_nesting((ncli, intena): (isize, bool)) {
    let inner = unsafe { &mut *CPU.inner.get() };
    inner.ncli = ncli;
    inner.int_enabled = intena;
}

// a fresh task owns no push_cli history at all.
pub fn reset_nesting() {
    let inner = unsafe { &mut *CPU.inner.get() };
    inner.ncli = 0;
    inner.int_enabled = true;
}

// RAII flavor of push_cli/pop_cli for short critical sections.
pub struct IntrLock {
    _private: (),
}

pub fn intr_lock() -> IntrLock {
    push_cli();
    IntrLock { _private: () }
}

impl Drop for IntrLock {
    fn drop(&mut self) {
        pop_cli();
    }
}

impl Cpu {
    const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(CpuInner {
                ncli: 0,
                int_enabled: false,
            }),
        }
    }
}
