use crate::proc::{self, BlockReason};
use crate::spinlock::Mutex;
use crate::x86::inb;

// PS/2 keyboard, reduced to its role in the core: an interrupt-driven
// producer of raw scancodes that blocked readers wait on. Scancode
// translation and line discipline live with the console, not here.

const DATA_PORT: u16 = 0x60;
const STATUS_PORT: u16 = 0x64;
const STATUS_OUT_FULL: u8 = 0x01;

const QUEUE_SIZE: usize = 64;

struct Queue {
    buf: [u8; QUEUE_SIZE],
    head: usize, // next slot to read
    tail: usize, // next slot to write
}

impl Queue {
    const fn new() -> Self {
        Self {
            buf: [0; QUEUE_SIZE],
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, code: u8) {
        let next = (self.tail + 1) % QUEUE_SIZE;
        if next == self.head {
            return; // full; drop the oldest behavior is not worth it
        }
        self.buf[self.tail] = code;
        self.tail = next;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.head == self.tail {
            return None;
        }
        let code = self.buf[self.head];
        self.head = (self.head + 1) % QUEUE_SIZE;
        Some(code)
    }
}

static QUEUE: Mutex<Queue> = Mutex::new(Queue::new(), "kbd");

fn wait_channel() -> usize {
    &QUEUE as *const _ as usize
}

// IRQ1: drain the controller into the queue, then wake one reader.
pub fn interrupt() {
    unsafe {
        while inb(STATUS_PORT) & STATUS_OUT_FULL != 0 {
            let code = inb(DATA_PORT);
            QUEUE.lock().push(code);
        }
    }
    proc::unblock_process_that(BlockReason::KeyWait, wait_channel());
}

// block until a scancode arrives. The scheduler stays locked from the
// empty check through block_me, so a code that lands in between
// cannot slip past a reader that is not yet on the blocked list.
pub fn read_scancode() -> u8 {
    loop {
        proc::lock_scheduler();
        let code = QUEUE.lock().pop();
        match code {
            Some(code) => {
                proc::unlock_scheduler();
                return code;
            }
            None => {
                proc::block_me(BlockReason::KeyWait, wait_channel());
                proc::unlock_scheduler();
            }
        }
    }
}
