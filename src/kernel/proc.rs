use crate::param::KSTACKSIZE;
use alloc::boxed::Box;
use core::ptr;

// Task records and, on bare metal, the scheduler built on them.
//
// Every process is in exactly one place at any moment: the running
// slot, one ready queue, the blocked list or the terminated list.
// The scheduler owns the records; only the idle task frees them.

// what context_switch leaves on a suspended stack, lowest address
// first. The last field is the return address the final `ret` pops.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchedStack {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub eflags: u32,
    pub ret: u32,
}

// fresh tasks start with a clean flags word; the reserved bit always
// reads as one. Interrupts come on explicitly in the trampoline.
pub const FRESH_EFLAGS: u32 = 0x2;

// the synthesized frame sits this far below the stack top, leaving
// the trampoline a little scratch space above it.
const STACK_HEADROOM: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Sleeping,
    Semaphore,
    KeyWait,
}

#[repr(C, align(16))]
pub struct Stack(pub [u8; KSTACKSIZE]);

pub struct Process {
    pub pid: u32,
    pub name: &'static str,
    pub priority: u8,
    pub state: ProcState,
    pub block_reason: Option<BlockReason>,
    pub block_channel: usize,
    pub wake_up_time: u64,
    pub sp: usize,
    pub stack: Option<Box<Stack>>,
    pub entry: Option<fn()>,
    pub cpu_ticks_total: u64,
    pub cpu_ticks_last: u64,
    pub exit_code: u8,
    pub next: *mut Process,
}

impl Process {
    // a blank record; the scheduler fills in the interesting parts.
    pub fn bare(pid: u32) -> Process {
        Process {
            pid,
            name: "",
            priority: 0,
            state: ProcState::Ready,
            block_reason: None,
            block_channel: 0,
            wake_up_time: 0,
            sp: 0,
            stack: None,
            entry: None,
            cpu_ticks_total: 0,
            cpu_ticks_last: 0,
            exit_code: 0,
            next: ptr::null_mut(),
        }
    }
}

// write a switch frame onto a fresh stack so that the first dispatch
// "returns" to `ret`. Returns the stack pointer to store in the task.
pub fn prepare_switch_frame(stack: &mut Stack, ret: u32) -> usize {
    let top = stack.0.as_mut_ptr() as usize + KSTACKSIZE - STACK_HEADROOM;
    let frame_addr = top - core::mem::size_of::<SwitchedStack>();
    let frame = SwitchedStack {
        eflags: FRESH_EFLAGS,
        ret,
        ..Default::default()
    };
    unsafe { ptr::write(frame_addr as *mut SwitchedStack, frame) };
    frame_addr
}

#[cfg(target_os = "none")]
mod sched {
    use super::*;
    use crate::param::{IDLE_PRIORITY, NPRIO, TIMESLICE_MSECS};
    use crate::proclist::ProcList;
    use crate::swtch::context_switch;
    use crate::{cpu, defs::{Err, KResult}, timer, x86};
    use alloc::alloc::{alloc_zeroed, handle_alloc_error, Layout};
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicU32, Ordering};

    struct Sched {
        running: *mut Process,
        ready: [ProcList; NPRIO],
        blocked: ProcList,
        terminated: ProcList,
        postpone_depth: u32,
        switch_pending: bool,
        switching_enabled: bool,
        next_switching_time: u64,
        next_wake_up_time: u64,
    }

    struct SchedCell(UnsafeCell<Sched>);

    unsafe impl Sync for SchedCell {}

    static SCHED: SchedCell = SchedCell(UnsafeCell::new(Sched {
        running: ptr::null_mut(),
        ready: [
            ProcList::new(),
            ProcList::new(),
            ProcList::new(),
            ProcList::new(),
            ProcList::new(),
        ],
        blocked: ProcList::new(),
        terminated: ProcList::new(),
        postpone_depth: 0,
        switch_pending: false,
        switching_enabled: false,
        next_switching_time: 0,
        next_wake_up_time: 0,
    }));

    // the scheduler lock must be held (interrupts off, postpone
    // counter raised) whenever this reference is alive.
    unsafe fn sched() -> &'static mut Sched {
        &mut *SCHED.0.get()
    }

    pub fn lock_scheduler() {
        cpu::push_cli();
        unsafe { sched().postpone_depth += 1 };
    }

    pub fn unlock_scheduler() {
        unsafe {
            let s = sched();
            assert!(s.postpone_depth > 0, "unlock_scheduler without lock");
            s.postpone_depth -= 1;
            if s.postpone_depth == 0 && s.switch_pending {
                // a switch was requested while postponed; do it before
                // interrupts can come back on.
                s.switch_pending = false;
                switch_now(s);
            }
        }
        cpu::pop_cli();
    }

    // only legal with the scheduler lock held. With the lock held the
    // postpone counter is non-zero, so this always defers to the
    // matching unlock, which performs the actual switch.
    pub fn schedule() {
        let s = unsafe { sched() };
        if s.postpone_depth > 0 {
            s.switch_pending = true;
            return;
        }
        switch_now(s);
    }

    fn switch_now(s: &mut Sched) {
        let next = match s.ready.iter_mut().find_map(|q| {
            let p = q.dequeue();
            if p.is_null() {
                None
            } else {
                Some(p)
            }
        }) {
            Some(next) => next,
            None => return, // nothing else runnable; keep going
        };

        let prev = s.running;
        unsafe {
            if (*prev).state == ProcState::Running {
                (*prev).state = ProcState::Ready;
                s.ready[(*prev).priority as usize].append(prev);
            }

            let now = timer::uptime_msecs();
            (*prev).cpu_ticks_total += now.saturating_sub((*prev).cpu_ticks_last);

            s.running = next;
            (*next).state = ProcState::Running;
            s.next_switching_time = now + TIMESLICE_MSECS;

            // ------------------------------------------------------
            // after this call we are on a different stack: every
            // local above, prev and next included, describes the
            // task that was switched out into our slot, not us.
            // ------------------------------------------------------
            let nesting = cpu::save_nesting();
            context_switch(&mut (*prev).sp, &(*next).sp);
            cpu::restore_nesting(nesting);

            let s = sched();
            (*s.running).cpu_ticks_last = timer::uptime_msecs();
        }
    }

    static NEXT_PID: AtomicU32 = AtomicU32::new(1);

    fn alloc_stack() -> Box<Stack> {
        unsafe {
            let layout = Layout::new::<Stack>();
            let p = alloc_zeroed(layout) as *mut Stack;
            if p.is_null() {
                handle_alloc_error(layout);
            }
            Box::from_raw(p)
        }
    }

    // first code a fresh task runs, by way of the synthesized frame.
    extern "C" fn task_entry_trampoline() -> ! {
        // the dispatching switch ran with the scheduler lock held.
        // A fresh task inherits none of that: drop the outgoing
        // stack's push_cli nesting and start interruptible.
        let entry = unsafe { (*sched().running).entry.expect("task with no entry point") };
        cpu::reset_nesting();
        x86::intr_on();

        entry();

        exit(0);
    }

    pub fn create_process(entry: fn(), name: &'static str, priority: u8) -> KResult<Box<Process>> {
        if priority as usize >= NPRIO {
            return Err(Err::InvalidArgument);
        }

        let mut stack = alloc_stack();
        let sp = prepare_switch_frame(&mut stack, task_entry_trampoline as usize as u32);

        let mut p = Box::new(Process::bare(NEXT_PID.fetch_add(1, Ordering::Relaxed)));
        p.name = name;
        p.priority = priority;
        p.state = ProcState::Ready;
        p.sp = sp;
        p.stack = Some(stack);
        p.entry = Some(entry);
        Ok(p)
    }

    // hand a process over to the scheduler and make it runnable.
    pub fn spawn(p: Box<Process>) {
        let proc = Box::into_raw(p);
        lock_scheduler();
        unsafe {
            let s = sched();
            s.ready[(*proc).priority as usize].append(proc);
            // preempt a lower-priority running task right away
            if !s.running.is_null() && (*proc).priority < (*s.running).priority {
                schedule();
            }
        }
        unlock_scheduler();
    }

    pub fn running_process() -> *mut Process {
        let _lock = cpu::intr_lock();
        unsafe { sched().running }
    }

    pub fn getpid() -> u32 {
        unsafe { (*running_process()).pid }
    }

    // this is how the running task blocks itself.
    pub fn block_me(reason: BlockReason, channel: usize) {
        lock_scheduler();
        unsafe {
            let s = sched();
            let p = s.running;
            (*p).state = ProcState::Blocked;
            (*p).block_reason = Some(reason);
            (*p).block_channel = channel;
            s.blocked.append(p);
        }
        schedule(); // let someone else run
        unlock_scheduler();
    }

    fn make_ready(s: &mut Sched, proc: *mut Process) {
        unsafe {
            (*proc).state = ProcState::Ready;
            (*proc).block_reason = None;
            (*proc).block_channel = 0;
            (*proc).wake_up_time = 0;
            // head of the line among its priority peers
            s.ready[(*proc).priority as usize].prepend(proc);
        }
    }

    // this is how someone else unblocks a process.
    pub fn unblock_process(proc: *mut Process) {
        lock_scheduler();
        unsafe {
            let s = sched();
            if (*proc).state == ProcState::Blocked && s.blocked.unlist(proc) {
                make_ready(s, proc);
                // a higher-priority wakeup preempts the running task;
                // equals wait for the timeslice to expire.
                if (*proc).priority < (*s.running).priority {
                    schedule();
                }
            }
        }
        unlock_scheduler();
    }

    // wake the earliest-blocked process matching (reason, channel).
    pub fn unblock_process_that(reason: BlockReason, channel: usize) {
        lock_scheduler();
        unsafe {
            let s = sched();
            let found = s
                .blocked
                .iter()
                .find(|&p| (*p).block_reason == Some(reason) && (*p).block_channel == channel);
            if let Some(proc) = found {
                s.blocked.unlist(proc);
                make_ready(s, proc);
                if (*proc).priority < (*s.running).priority {
                    schedule();
                }
            }
        }
        unlock_scheduler();
    }

    pub fn sleep(msecs: u64) {
        if msecs == 0 {
            return;
        }
        lock_scheduler();
        unsafe {
            let s = sched();
            let p = s.running;
            (*p).wake_up_time = timer::uptime_msecs() + msecs;
            (*p).state = ProcState::Blocked;
            (*p).block_reason = Some(BlockReason::Sleeping);
            (*p).block_channel = 0;

            // keep the earliest wake-up time for a fast tick check
            s.next_wake_up_time = if s.next_wake_up_time == 0 {
                (*p).wake_up_time
            } else {
                s.next_wake_up_time.min((*p).wake_up_time)
            };
            s.blocked.append(p);
        }
        schedule();
        unlock_scheduler();
    }

    pub fn yielding() {
        lock_scheduler();
        schedule();
        unlock_scheduler();
    }

    pub fn exit(code: u8) -> ! {
        lock_scheduler();
        unsafe {
            let s = sched();
            let p = s.running;
            (*p).state = ProcState::Terminated;
            (*p).exit_code = code;
            s.terminated.append(p);
        }
        schedule();
        unlock_scheduler();
        panic!("exit: terminated task resumed");
    }

    // move expired sleepers to their ready queues; runs off the tick.
    fn wake_sleeping_tasks(s: &mut Sched, now: u64) {
        let mut still_blocked = ProcList::new();
        s.next_wake_up_time = 0;
        loop {
            let p = s.blocked.dequeue();
            if p.is_null() {
                break;
            }
            unsafe {
                let asleep = (*p).block_reason == Some(BlockReason::Sleeping);
                if asleep && (*p).wake_up_time > 0 && now >= (*p).wake_up_time {
                    make_ready(s, p);
                } else {
                    if asleep {
                        s.next_wake_up_time = if s.next_wake_up_time == 0 {
                            (*p).wake_up_time
                        } else {
                            s.next_wake_up_time.min((*p).wake_up_time)
                        };
                    }
                    still_blocked.append(p);
                }
            }
        }
        s.blocked = still_blocked;
    }

    // called from the timer interrupt, once per tick.
    pub fn timer_ticked() {
        unsafe {
            if !sched().switching_enabled {
                return;
            }
        }
        lock_scheduler();
        unsafe {
            let s = sched();
            let now = timer::uptime_msecs();
            if s.next_wake_up_time > 0 && now >= s.next_wake_up_time {
                wake_sleeping_tasks(s, now);
            }
            if s.next_switching_time > 0 && now >= s.next_switching_time {
                schedule();
            }
        }
        unlock_scheduler();
    }

    fn idle_main() {
        // never blocks, never sleeps. Reaps terminated tasks, then
        // waits for the next interrupt.
        loop {
            loop {
                lock_scheduler();
                let p = unsafe { sched().terminated.dequeue() };
                unlock_scheduler();
                if p.is_null() {
                    break;
                }
                // records and stacks come back to the heap here, and
                // nowhere else.
                drop(unsafe { Box::from_raw(p) });
            }
            x86::hlt();
        }
    }

    // set up the bootstrap task (the code running right now) and the
    // idle task. Call once, before any spawn().
    pub fn init() {
        let mut initial = Box::new(Process::bare(NEXT_PID.fetch_add(1, Ordering::Relaxed)));
        initial.name = "initial";
        initial.priority = 1;
        initial.state = ProcState::Running;

        let idle = create_process(idle_main, "idle", IDLE_PRIORITY).expect("idle task");

        lock_scheduler();
        unsafe {
            let s = sched();
            assert!(s.running.is_null(), "proc::init called twice");
            s.running = Box::into_raw(initial);
            s.ready[IDLE_PRIORITY as usize].append(Box::into_raw(idle));
        }
        unlock_scheduler();
    }

    // let the timer start preempting. The bootstrap task keeps
    // running as a normal task from here on.
    pub fn start_multitasking() {
        unsafe {
            let _lock = cpu::intr_lock();
            sched().switching_enabled = true;
        }
    }

    pub fn dump() {
        lock_scheduler();
        unsafe {
            let s = sched();
            println!("pid name       pri state      cpu");
            let dump_one = |p: *mut Process| {
                println!(
                    "{:<3} {:<10} {:<3} {:<10} {}ms",
                    (*p).pid,
                    (*p).name,
                    (*p).priority,
                    match (*p).state {
                        ProcState::Ready => "ready",
                        ProcState::Running => "running",
                        ProcState::Blocked => "blocked",
                        ProcState::Terminated => "terminated",
                    },
                    (*p).cpu_ticks_total,
                );
            };
            dump_one(s.running);
            for q in s.ready.iter() {
                for p in q.iter() {
                    dump_one(p);
                }
            }
            for p in s.blocked.iter() {
                dump_one(p);
            }
            for p in s.terminated.iter() {
                dump_one(p);
            }
        }
        unlock_scheduler();
    }
}

#[cfg(target_os = "none")]
pub use sched::{
    block_me, create_process, dump, exit, getpid, init, lock_scheduler, running_process,
    schedule, sleep, spawn, start_multitasking, timer_ticked, unblock_process,
    unblock_process_that, unlock_scheduler, yielding,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_frame_matches_the_pop_order() {
        let mut stack = Box::new(Stack([0; KSTACKSIZE]));
        let sp = prepare_switch_frame(&mut stack, 0xdead_beef);

        let base = stack.0.as_ptr() as usize;
        assert!(sp > base && sp < base + KSTACKSIZE);
        // frame ends STACK_HEADROOM below the top of the stack
        assert_eq!(
            sp + core::mem::size_of::<SwitchedStack>(),
            base + KSTACKSIZE - 64
        );

        let frame = unsafe { &*(sp as *const SwitchedStack) };
        assert_eq!(frame.ret, 0xdead_beef);
        assert_eq!(frame.eflags, FRESH_EFLAGS);
        assert_eq!(frame.edi, 0);
        assert_eq!(frame.eax, 0);
    }

    #[test]
    fn switched_stack_is_nine_words() {
        assert_eq!(core::mem::size_of::<SwitchedStack>(), 9 * 4);
    }
}
