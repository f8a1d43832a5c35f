#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

// the kernel image only makes sense on the bare-metal target; a host
// build of this binary exists so `cargo test` can link the workspace.
#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("build the kernel with the i686-hexos target");
}

#[cfg(target_os = "none")]
mod boot {
    extern crate alloc;

    use alloc::boxed::Box;
    use kernel::fs::{FixedClock, MemDisk, SimpleFs, FS};
    use kernel::multiboot::{BootInfo, BOOTLOADER_MAGIC};
    use kernel::semaphore::Semaphore;
    use kernel::{clock, gdt, idt, kalloc, kmain, param, physmem, pic, proc, timer, uart};
    use kernel::{print, println};

    kmain!(main);

    const KHEAP_SIZE: usize = 4 * 1024 * 1024;

    extern "C" fn main(mbi: u32, boot_magic: u32) -> ! {
        uart::init();
        println!("");
        println!("hexos kernel is booting");

        assert!(boot_magic == BOOTLOADER_MAGIC, "not loaded by multiboot");
        let info = unsafe { &*(mbi as *const BootInfo) };

        gdt::init(); // flat 32-bit segments
        idt::init(); // trap gates for faults and irqs
        pic::init(); // remap irqs to 0x20.., unmask timer/kbd/rtc
        timer::init(param::TIMER_FREQ_HZ).expect("pit setup");
        clock::init(15); // rtc periodic tick at 2 Hz

        physmem::init(info);
        let heap = physmem::allocate_contiguous(KHEAP_SIZE).expect("kernel heap region");
        kalloc::init(heap, KHEAP_SIZE);

        proc::init();
        proc::spawn(proc::create_process(fs_demo, "fs-demo", 2).unwrap());
        proc::spawn(proc::create_process(ticker, "ticker", 2).unwrap());
        proc::spawn(proc::create_process(ticker_peer, "ticker-peer", 2).unwrap());

        proc::start_multitasking();
        kernel::x86::intr_on();

        // the boot thread lives on as a normal low-priority task
        loop {
            proc::sleep(10_000);
            println!("uptime {} ms", timer::uptime_msecs());
            proc::dump();
        }
    }

    static SHARED: Semaphore = Semaphore::mutex();

    fn ticker() {
        for i in 0..5 {
            SHARED.acquire();
            println!("ticker: tick {}", i);
            SHARED.release();
            proc::sleep(1000);
        }
        println!("ticker: done");
    }

    fn ticker_peer() {
        for _ in 0..5 {
            let _guard = SHARED.guard();
            proc::sleep(300); // hold the mutex across a sleep
        }
    }

    // put the filesystem through its paces on a ramdisk.
    fn fs_demo() {
        {
            let mut fs = FS.lock();
            *fs = Some(SimpleFs::new(
                Box::new(MemDisk::new(512, 2048)), // 1 MB
                Box::new(FixedClock(0)),
            ));
        }

        let mut guard = FS.lock();
        let fs = guard.as_mut().unwrap();
        fs.mkfs("RAMDISK", 0).expect("mkfs");
        fs.mount(false).expect("mount");
        fs.create("/hello.txt", false).expect("create");
        let fd = fs.open("/hello.txt").expect("open");
        fs.write(fd, b"hello from the ramdisk\n").expect("write");
        fs.close(fd).expect("close");
        fs.sync().expect("sync");
        println!("fs-demo: wrote /hello.txt on volume '{}'", fs.label().unwrap());
    }
}
