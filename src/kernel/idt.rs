use crate::gdt::KCODE_SEL;
use crate::x86;
use core::arch::global_asm;
use core::cell::UnsafeCell;

// Interrupt descriptor table. Every vector gets a stub that pushes a
// uniform trap frame and funnels into trap::isr_handler; vectors
// 0..32 are the CPU exceptions, 32..48 the remapped PIC lines.

pub const NVECTORS: usize = 48;

const ATTR_INTR_GATE: u8 = 0x8e; // present, DPL 0, 32-bit interrupt gate

#[derive(Clone, Copy)]
#[repr(C, packed)]
struct GateDesc {
    off_low: u16,
    selector: u16,
    zero: u8,
    attr: u8,
    off_high: u16,
}

impl GateDesc {
    const fn missing() -> Self {
        Self {
            off_low: 0,
            selector: 0,
            zero: 0,
            attr: 0,
            off_high: 0,
        }
    }

    fn new(handler: u32, selector: u16, attr: u8) -> Self {
        Self {
            off_low: (handler & 0xffff) as u16,
            selector,
            zero: 0,
            attr,
            off_high: (handler >> 16) as u16,
        }
    }
}

struct Idt(UnsafeCell<[GateDesc; 256]>);

unsafe impl Sync for Idt {}

static IDT: Idt = Idt(UnsafeCell::new([GateDesc::missing(); 256]));

extern "C" {
    // built by the assembly below, one stub address per vector.
    static vectors: [u32; NVECTORS];
}

pub fn init() {
    unsafe {
        let idt = &mut *IDT.0.get();
        for (gate, &stub) in idt.iter_mut().zip(vectors.iter()) {
            *gate = GateDesc::new(stub, KCODE_SEL, ATTR_INTR_GATE);
        }
        x86::lidt(
            idt.as_ptr() as u32,
            (core::mem::size_of::<[GateDesc; 256]>() - 1) as u16,
        );
    }
}

// Stubs. The CPU pushes an error code for vectors 8, 10-14 and 17;
// everything else gets a dummy one so the frame layout is uniform.
// alltraps finishes the trap::TrapFrame, calls isr_handler with a
// pointer to it, and unwinds with iretd.
global_asm!(
    r#"
    .section .text
    alltraps:
        pushad
        push ds
        mov ax, 0x10
        mov ds, ax
        mov es, ax
        push esp
        call isr_handler
        add esp, 4
        pop ds
        popad
        add esp, 8
        iretd

    .pushsection .rodata.vectors, "a"
    .global vectors
    vectors:
    .popsection

    .macro vec_noerr n
        vector\n:
            push 0
            push \n
            jmp alltraps
        .pushsection .rodata.vectors, "a"
            .long vector\n
        .popsection
    .endm
    .macro vec_err n
        vector\n:
            push \n
            jmp alltraps
        .pushsection .rodata.vectors, "a"
            .long vector\n
        .popsection
    .endm

    vec_noerr 0
    vec_noerr 1
    vec_noerr 2
    vec_noerr 3
    vec_noerr 4
    vec_noerr 5
    vec_noerr 6
    vec_noerr 7
    vec_err   8
    vec_noerr 9
    vec_err   10
    vec_err   11
    vec_err   12
    vec_err   13
    vec_err   14
    vec_noerr 15
    vec_noerr 16
    vec_err   17
    vec_noerr 18
    vec_noerr 19
    vec_noerr 20
    vec_noerr 21
    vec_noerr 22
    vec_noerr 23
    vec_noerr 24
    vec_noerr 25
    vec_noerr 26
    vec_noerr 27
    vec_noerr 28
    vec_noerr 29
    vec_noerr 30
    vec_noerr 31
    vec_noerr 32
    vec_noerr 33
    vec_noerr 34
    vec_noerr 35
    vec_noerr 36
    vec_noerr 37
    vec_noerr 38
    vec_noerr 39
    vec_noerr 40
    vec_noerr 41
    vec_noerr 42
    vec_noerr 43
    vec_noerr 44
    vec_noerr 45
    vec_noerr 46
    vec_noerr 47
    "#
);
