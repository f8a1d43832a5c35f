use crate::{clock, kbd, pic, proc, timer};

pub const VEC_TIMER: u32 = 0x20;
pub const VEC_KBD: u32 = 0x21;
pub const VEC_RTC: u32 = 0x28;

// what every idt stub leaves on the stack, lowest address first.
#[repr(C)]
pub struct TrapFrame {
    pub ds: u32,
    // pushed by pusha
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32, // pusha's snapshot, not the live stack pointer
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    // pushed by the stub
    pub vector: u32,
    pub err_code: u32,
    // pushed by the processor
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

#[no_mangle]
pub extern "C" fn isr_handler(frame: &mut TrapFrame) {
    match frame.vector {
        VEC_TIMER => {
            timer::tick();
            // acknowledge before the scheduler hook: it may switch
            // away and not come back for a whole timeslice.
            pic::send_eoi(VEC_TIMER);
            proc::timer_ticked();
        }
        VEC_KBD => {
            kbd::interrupt();
            pic::send_eoi(VEC_KBD);
        }
        VEC_RTC => {
            clock::interrupt();
            pic::send_eoi(VEC_RTC);
        }
        vector if vector < 32 => {
            // a CPU fault with no registered handler is fatal.
            panic!(
                "unhandled fault {} err={:#x} eip={:#x} cs={:#x} eflags={:#x}",
                vector, frame.err_code, frame.eip, frame.cs, frame.eflags
            );
        }
        vector => {
            println!("spurious interrupt {} ({:#x})", vector, vector);
            pic::send_eoi(vector);
        }
    }
}
