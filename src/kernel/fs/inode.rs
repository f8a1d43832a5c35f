use super::bitmap::BlockBitmap;
use super::cache::BlockCache;
use super::device::{ClockSource, SectorDevice};
use super::ranges::{self, BlockRange, Resolved, RANGE_SIZE};
use crate::defs::{Err, KResult};
use crate::param::RANGES_IN_INODE;
use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

// On-disk inode: a fixed 64-byte record describing one file or
// directory. Six inline extents cover most files; one indirect block
// full of extents takes over when they run out. There is no second
// level, which caps a file at
// (6 + block_size/6) extents * 65535 blocks each - in practice the
// limit that bites first is the extent count on a fragmented volume.

pub const INODE_SIZE: usize = 64;

bitflags! {
    pub struct InodeFlags: u8 {
        const USED = 0x01;
        const FILE = 0x02;
        const DIR  = 0x04;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, PartialEq)]
pub struct DInode {
    pub flags: u8,
    _pad1: [u8; 3],
    pub file_size: u32,
    pub allocated_blocks: u32,
    pub modified_at: u32, // seconds since epoch
    _pad2: [u8; 4],
    pub ranges: [BlockRange; RANGES_IN_INODE],
    pub indirect_ranges_block: u32, // 0 = not allocated
    _reserved: u32, // room for a doubly indirect block that never came
}

const_assert_eq!(core::mem::size_of::<DInode>(), INODE_SIZE);

impl DInode {
    pub fn prepare(clock: &dyn ClockSource, dir: bool) -> DInode {
        let kind = if dir { InodeFlags::DIR } else { InodeFlags::FILE };
        let mut node = DInode::default();
        node.flags = (InodeFlags::USED | kind).bits();
        node.modified_at = clock.seconds_since_epoch();
        node
    }

    pub fn is_used(&self) -> bool {
        InodeFlags::from_bits_truncate(self.flags).contains(InodeFlags::USED)
    }

    pub fn is_file(&self) -> bool {
        InodeFlags::from_bits_truncate(self.flags).contains(InodeFlags::FILE)
    }

    pub fn is_dir(&self) -> bool {
        InodeFlags::from_bits_truncate(self.flags).contains(InodeFlags::DIR)
    }
}

// everything inode I/O needs to reach the volume.
pub struct DiskEnv<'a> {
    pub dev: &'a mut dyn SectorDevice,
    pub cache: &'a mut BlockCache,
    pub bitmap: &'a mut BlockBitmap,
    pub clock: &'a dyn ClockSource,
}

impl<'a> DiskEnv<'a> {
    pub fn block_size(&self) -> u32 {
        self.cache.block_size()
    }

    fn ranges_per_block(&self) -> u32 {
        self.block_size() / RANGE_SIZE as u32
    }
}

fn read_indirect_range(env: &mut DiskEnv<'_>, block_no: u32, i: u32) -> KResult<BlockRange> {
    let mut buf = [0u8; RANGE_SIZE];
    env.cache
        .read(env.dev, block_no, i * RANGE_SIZE as u32, &mut buf)?;
    Ok(BlockRange::read_from(&buf[..]).unwrap())
}

// map a logical block index to its physical block number.
pub fn resolve_block(env: &mut DiskEnv<'_>, node: &DInode, index: u32) -> KResult<u32> {
    if index >= node.allocated_blocks {
        return Err(Err::OutOfBounds);
    }

    let mut rest = match ranges::resolve(&node.ranges, index) {
        Resolved::Block(block_no) => return Ok(block_no),
        Resolved::End => return Err(Err::OutOfBounds),
        Resolved::NotHere(rest) => rest,
    };

    if node.indirect_ranges_block == 0 {
        return Err(Err::OutOfBounds);
    }
    for i in 0..env.ranges_per_block() {
        let range = read_indirect_range(env, node.indirect_ranges_block, i)?;
        if range.is_empty() {
            return Err(Err::OutOfBounds);
        }
        if rest < range.blocks_count as u32 {
            return Ok(range.first_block_no + rest);
        }
        rest -= range.blocks_count as u32;
    }
    Err(Err::OutOfBounds)
}

// Append one data block to the file, preferring to extend the tail
// extent, then a fresh inline slot, then the indirect block (created
// lazily). Fails with OutOfExtents when every extent slot in both
// places is taken.
pub fn extend(env: &mut DiskEnv<'_>, node: &mut DInode) -> KResult<u32> {
    let has_indirect = node.indirect_ranges_block != 0;

    if let Some(block_no) = ranges::append_to_array(
        env.dev,
        env.cache,
        env.bitmap,
        &mut node.ranges,
        !has_indirect, // the file tail is inline until an indirect block exists
    )? {
        node.allocated_blocks += 1;
        return Ok(block_no);
    }

    // fall back to the indirect block, allocating it on first use
    if !has_indirect {
        let block_no = env.bitmap.find_free()?;
        env.bitmap.mark_used(block_no);
        env.cache.wipe(env.dev, block_no)?;
        node.indirect_ranges_block = block_no;
    }

    let rpb = env.ranges_per_block() as usize;
    let mut buf = alloc::vec![0u8; rpb * RANGE_SIZE];
    env.cache
        .read(env.dev, node.indirect_ranges_block, 0, &mut buf)?;
    let mut indirect: alloc::vec::Vec<BlockRange> = buf
        .chunks(RANGE_SIZE)
        .map(|c| BlockRange::read_from(c).unwrap())
        .collect();

    match ranges::append_to_array(env.dev, env.cache, env.bitmap, &mut indirect, true)? {
        Some(block_no) => {
            for (chunk, range) in buf.chunks_mut(RANGE_SIZE).zip(indirect.iter()) {
                chunk.copy_from_slice(range.as_bytes());
            }
            env.cache.write(env.dev, node.indirect_ranges_block, 0, &buf)?;
            node.allocated_blocks += 1;
            Ok(block_no)
        }
        None => Err(Err::OutOfExtents),
    }
}

pub fn read_bytes(
    env: &mut DiskEnv<'_>,
    node: &DInode,
    pos: u32,
    buf: &mut [u8],
) -> KResult<usize> {
    if pos >= node.file_size {
        return Err(Err::EndOfFile);
    }

    let block_size = env.block_size();
    let mut pos = pos;
    let mut done = 0usize;

    while done < buf.len() && pos < node.file_size {
        let block_index = pos / block_size;
        let block_offset = pos % block_size;
        let block_no = resolve_block(env, node, block_index)?;

        let till_block_end = (block_size - block_offset) as usize;
        let till_file_end = (node.file_size - pos) as usize;
        let chunk = (buf.len() - done).min(till_block_end).min(till_file_end);

        env.cache
            .read(env.dev, block_no, block_offset, &mut buf[done..done + chunk])?;
        done += chunk;
        pos += chunk as u32;
    }

    Ok(done)
}

// write at pos, allocating blocks and growing file_size as needed.
// There are no sparse files: a position past the end is clamped to
// the end.
pub fn write_bytes(
    env: &mut DiskEnv<'_>,
    node: &mut DInode,
    pos: u32,
    buf: &[u8],
) -> KResult<usize> {
    let block_size = env.block_size();
    let mut pos = pos.min(node.file_size);
    let mut done = 0usize;

    while done < buf.len() {
        let block_index = pos / block_size;
        let block_offset = pos % block_size;

        let block_no = if block_index >= node.allocated_blocks {
            extend(env, node)?
        } else {
            resolve_block(env, node, block_index)?
        };

        let till_block_end = (block_size - block_offset) as usize;
        let chunk = if pos >= node.file_size {
            // writing fresh bytes at the end; the block is the limit
            (buf.len() - done).min(till_block_end)
        } else {
            let till_file_end = (node.file_size - pos) as usize;
            (buf.len() - done).min(till_block_end).min(till_file_end)
        };

        env.cache
            .write(env.dev, block_no, block_offset, &buf[done..done + chunk])?;

        done += chunk;
        pos += chunk as u32;
        if pos > node.file_size {
            node.file_size = pos;
        }
    }

    if done > 0 {
        node.modified_at = env.clock.seconds_since_epoch();
    }
    Ok(done)
}

// fixed-size record I/O on top of the byte stream. A short transfer
// that is not a clean EOF means the file does not hold whole records
// any more, which is corruption, not a partial result.
pub fn read_rec(
    env: &mut DiskEnv<'_>,
    node: &DInode,
    rec_size: u32,
    rec_no: u32,
    rec: &mut [u8],
) -> KResult<()> {
    let n = read_bytes(env, node, rec_size * rec_no, rec)?;
    if n != rec_size as usize {
        return Err(Err::Corruption);
    }
    Ok(())
}

pub fn write_rec(
    env: &mut DiskEnv<'_>,
    node: &mut DInode,
    rec_size: u32,
    rec_no: u32,
    rec: &[u8],
) -> KResult<()> {
    let n = write_bytes(env, node, rec_size * rec_no, rec)?;
    if n != rec_size as usize {
        return Err(Err::Corruption);
    }
    Ok(())
}

// give back every data block: the indirect extents first, then the
// indirect block itself, then the inline extents.
pub fn truncate(env: &mut DiskEnv<'_>, node: &mut DInode) -> KResult<()> {
    if node.indirect_ranges_block != 0 {
        let rpb = env.ranges_per_block();
        for i in 0..rpb {
            let mut range = read_indirect_range(env, node.indirect_ranges_block, i)?;
            if range.is_empty() {
                break;
            }
            ranges::release_all(core::slice::from_mut(&mut range), env.bitmap);
        }
        env.bitmap.mark_free(node.indirect_ranges_block);
        node.indirect_ranges_block = 0;
    }

    ranges::release_all(&mut node.ranges, env.bitmap);

    node.file_size = 0;
    node.allocated_blocks = 0;
    node.modified_at = env.clock.seconds_since_epoch();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::device::{FixedClock, MemDisk};

    const BS: u32 = 512;

    struct Rig {
        dev: MemDisk,
        cache: BlockCache,
        bitmap: BlockBitmap,
        clock: FixedClock,
    }

    impl Rig {
        fn new() -> Rig {
            let mut bitmap = BlockBitmap::new(1, 1, 2048, BS).unwrap();
            bitmap.mark_used(0);
            bitmap.mark_used(1);
            Rig {
                dev: MemDisk::new(512, 2048),
                cache: BlockCache::new(BS),
                bitmap,
                clock: FixedClock(1_000_000),
            }
        }

        fn env(&mut self) -> DiskEnv<'_> {
            DiskEnv {
                dev: &mut self.dev,
                cache: &mut self.cache,
                bitmap: &mut self.bitmap,
                clock: &self.clock,
            }
        }
    }

    #[test]
    fn on_disk_inode_is_64_bytes() {
        assert_eq!(core::mem::size_of::<DInode>(), 64);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let mut rig = Rig::new();
        let mut env = rig.env();
        let mut node = DInode::prepare(env.clock, false);

        let data: alloc::vec::Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(write_bytes(&mut env, &mut node, 0, &data).unwrap(), 1500);
        assert_eq!(node.file_size, 1500);
        assert_eq!(node.allocated_blocks, 3);

        let mut out = alloc::vec![0u8; 1500];
        assert_eq!(read_bytes(&mut env, &node, 0, &mut out).unwrap(), 1500);
        assert_eq!(out, data);
    }

    #[test]
    fn reads_clamp_at_eof() {
        let mut rig = Rig::new();
        let mut env = rig.env();
        let mut node = DInode::prepare(env.clock, false);
        write_bytes(&mut env, &mut node, 0, b"short file").unwrap();

        let mut out = [0u8; 64];
        assert_eq!(read_bytes(&mut env, &node, 3, &mut out).unwrap(), 7);
        assert_eq!(&out[..7], b"rt file");
        assert_eq!(read_bytes(&mut env, &node, 10, &mut out), Err(Err::EndOfFile));
        assert_eq!(read_bytes(&mut env, &node, 999, &mut out), Err(Err::EndOfFile));
    }

    #[test]
    fn write_past_end_is_clamped_to_append() {
        let mut rig = Rig::new();
        let mut env = rig.env();
        let mut node = DInode::prepare(env.clock, false);
        write_bytes(&mut env, &mut node, 0, b"abc").unwrap();
        // no sparse files: position 100 writes at 3
        write_bytes(&mut env, &mut node, 100, b"def").unwrap();
        assert_eq!(node.file_size, 6);

        let mut out = [0u8; 6];
        read_bytes(&mut env, &node, 0, &mut out).unwrap();
        assert_eq!(&out, b"abcdef");
    }

    #[test]
    fn overwrite_in_the_middle_keeps_size() {
        let mut rig = Rig::new();
        let mut env = rig.env();
        let mut node = DInode::prepare(env.clock, false);
        write_bytes(&mut env, &mut node, 0, &[b'x'; 1000]).unwrap();
        write_bytes(&mut env, &mut node, 400, b"MARK").unwrap();
        assert_eq!(node.file_size, 1000);

        let mut out = [0u8; 8];
        read_bytes(&mut env, &node, 398, &mut out).unwrap();
        assert_eq!(&out, b"xxMARKxx");
    }

    #[test]
    fn contiguous_growth_stays_in_one_range() {
        let mut rig = Rig::new();
        let mut env = rig.env();
        let mut node = DInode::prepare(env.clock, false);
        let block = alloc::vec![7u8; BS as usize];
        for _ in 0..10 {
            let pos = node.file_size;
            write_bytes(&mut env, &mut node, pos, &block).unwrap();
        }
        assert_eq!(node.allocated_blocks, 10);
        assert_eq!({ node.ranges[0].blocks_count }, 10);
        assert!(node.ranges[1].is_empty());
        assert_eq!(node.indirect_ranges_block, 0);
    }

    #[test]
    fn fragmentation_spills_into_the_indirect_block() {
        let mut rig = Rig::new();
        let mut env = rig.env();
        let mut node = DInode::prepare(env.clock, false);
        let block = alloc::vec![9u8; BS as usize];

        // allocate, then poison the neighbor so every extent stays
        // one block long
        for i in 0..(RANGES_IN_INODE as u32 + 3) {
            let pos = node.file_size;
            write_bytes(&mut env, &mut node, pos, &block).unwrap();
            let tail = resolve_block(&mut env, &node, node.allocated_blocks - 1).unwrap();
            env.bitmap.mark_used(tail + 1);
            assert_eq!(node.allocated_blocks, i + 1);
        }
        assert_ne!(node.indirect_ranges_block, 0);
        assert_eq!(ranges::total_blocks(&node.ranges), RANGES_IN_INODE as u32);

        // the data must still read back in order
        let mut out = alloc::vec![0u8; BS as usize];
        for i in 0..(RANGES_IN_INODE as u32 + 3) {
            read_bytes(&mut env, &node, i * BS, &mut out).unwrap();
            assert!(out.iter().all(|&b| b == 9));
        }
    }

    #[test]
    fn truncate_returns_every_block() {
        let mut rig = Rig::new();
        let mut env = rig.env();
        let used_at_start = env.bitmap.count_used();
        let mut node = DInode::prepare(env.clock, false);
        let block = alloc::vec![1u8; BS as usize];

        for _ in 0..(RANGES_IN_INODE as u32 + 4) {
            let pos = node.file_size;
            write_bytes(&mut env, &mut node, pos, &block).unwrap();
            let tail = resolve_block(&mut env, &node, node.allocated_blocks - 1).unwrap();
            env.bitmap.mark_used(tail + 1); // force fragmentation
        }
        let poisoned = RANGES_IN_INODE as u32 + 4; // neighbors we marked by hand

        truncate(&mut env, &mut node).unwrap();
        assert_eq!(node.file_size, 0);
        assert_eq!(node.allocated_blocks, 0);
        assert_eq!(node.indirect_ranges_block, 0);
        assert!(node.ranges.iter().all(|r| r.is_empty()));
        assert_eq!(env.bitmap.count_used(), used_at_start + poisoned);
    }

    #[test]
    fn record_io_detects_short_files() {
        let mut rig = Rig::new();
        let mut env = rig.env();
        let mut node = DInode::prepare(env.clock, false);
        write_bytes(&mut env, &mut node, 0, &[0u8; 100]).unwrap();

        let mut rec = [0u8; 64];
        assert!(read_rec(&mut env, &node, 64, 0, &mut rec).is_ok());
        // record 1 would need bytes 64..128 but the file ends at 100
        assert_eq!(
            read_rec(&mut env, &node, 64, 1, &mut rec),
            Err(Err::Corruption)
        );
        // reading fully past the end is a clean EOF, not corruption
        assert_eq!(
            read_rec(&mut env, &node, 64, 2, &mut rec),
            Err(Err::EndOfFile)
        );
    }

    #[test]
    fn extent_exhaustion_is_reported() {
        let mut rig = Rig::new();
        // tiny "indirect" capacity: use a small device and poison
        // every neighbor so each block needs its own extent. 512-byte
        // blocks hold 85 extents, so fill inline (6) + indirect (85).
        let mut env = rig.env();
        let mut node = DInode::prepare(env.clock, false);
        let block = alloc::vec![2u8; BS as usize];

        let mut failed = None;
        for i in 0..200u32 {
            let pos = node.file_size;
            match write_bytes(&mut env, &mut node, pos, &block) {
                Ok(_) => {
                    let tail =
                        resolve_block(&mut env, &node, node.allocated_blocks - 1).unwrap();
                    env.bitmap.mark_used(tail + 1);
                }
                Err(e) => {
                    failed = Some((i, e));
                    break;
                }
            }
        }
        let (at, err) = failed.expect("the extent table must fill up eventually");
        assert_eq!(err, Err::OutOfExtents);
        let rpb = BS / RANGE_SIZE as u32;
        assert_eq!(at, RANGES_IN_INODE as u32 + rpb);
    }
}
