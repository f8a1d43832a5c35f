use core::arch::asm;
use core::cell::UnsafeCell;

// Flat 32-bit segmentation. The bootloader's GDT lives in memory we do
// not own, so the first thing the kernel does is install its own: a
// null descriptor, one 4 GB code segment and one 4 GB data segment.

pub const KCODE_SEL: u16 = 0x08;
pub const KDATA_SEL: u16 = 0x10;

const CODE_DESC: u64 = 0x00cf_9a00_0000_ffff; // base 0, limit 4 GB, exec/read
const DATA_DESC: u64 = 0x00cf_9200_0000_ffff; // base 0, limit 4 GB, read/write

struct Gdt(UnsafeCell<[u64; 3]>);

unsafe impl Sync for Gdt {}

static GDT: Gdt = Gdt(UnsafeCell::new([0, CODE_DESC, DATA_DESC]));

#[repr(C, packed)]
struct Gdtr {
    limit: u16,
    base: u32,
}

pub fn init() {
    unsafe {
        let gdt = &*GDT.0.get();
        let gdtr = Gdtr {
            limit: (core::mem::size_of::<[u64; 3]>() - 1) as u16,
            base: gdt.as_ptr() as u32,
        };
        asm!(
            "lgdt [{gdtr}]",
            // reload CS with a far return, then the data selectors
            "lea {tmp}, [2f]",
            "push {code}",
            "push {tmp}",
            "retf",
            "2:",
            "mov ds, {data:x}",
            "mov es, {data:x}",
            "mov ss, {data:x}",
            "mov fs, {data:x}",
            "mov gs, {data:x}",
            gdtr = in(reg) &gdtr as *const Gdtr,
            tmp = out(reg) _,
            code = const KCODE_SEL as u32,
            data = in(reg) KDATA_SEL as u32,
        );
    }
}
