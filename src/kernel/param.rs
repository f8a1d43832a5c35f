// kernel tunables

pub const NPRIO: usize = 5; // priority levels, 0 is highest
pub const IDLE_PRIORITY: u8 = (NPRIO - 1) as u8; // idle owns the bottom level
pub const TIMESLICE_MSECS: u64 = 30; // per-task cpu budget between reschedules
pub const KSTACKSIZE: usize = 8192; // per-task kernel stack

pub const TIMER_FREQ_HZ: u32 = 1000; // PIT rate, one tick per msec

pub const PGSIZE: usize = 4096; // physical page size
pub const MAXPHYSPAGES: usize = 1 << 20; // bitmap covers 4 GB of frames

pub const HEAP_MIN_CHUNK: usize = 256; // smallest payload kalloc hands out

pub const NCACHE: usize = 128; // block cache slots
pub const NINODE: usize = 128; // cached inodes (two are pinned)
pub const NHANDLE: usize = 128; // open file handles

pub const MAXNAME: usize = 59; // longest file name, direntry holds name + NUL
pub const RANGES_IN_INODE: usize = 6; // inline extents before the indirect block
