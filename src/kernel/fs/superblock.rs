use super::inode::{DInode, InodeFlags, INODE_SIZE};
use crate::defs::{Err, KResult};
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

// The superblock occupies the volume's first 512 bytes - one sector -
// so a mount can recognize the filesystem before it knows the block
// size. It also stores the two inodes that cannot live in the inode
// database: the database's own inode and the root directory's.

pub const SUPERBLOCK_SIZE: usize = 512;
pub const DIRENT_SIZE: usize = 64;
pub const MAGIC: [u8; 4] = *b"SFS1";

const MAX_BLOCK_SIZE: u32 = 4096;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, Debug, PartialEq)]
pub struct SuperBlock {
    // offset 0x000
    pub magic: [u8; 4],
    pub direntry_size: u16, // sanity-checked when mounting
    pub inode_size: u16,
    pub inodes_db_rec_count: u32, // records in the db, cleared ones included
    _r0: u32,

    // offset 0x010
    pub sector_size: u32,
    pub sectors_per_block: u32,
    pub block_size: u32,
    pub blocks_in_device: u32,

    // offset 0x020
    pub bitmap_first_block: u32, // block 0 is us
    pub bitmap_blocks_count: u32,
    _r1: u32,
    _r2: u32,

    // offset 0x030
    pub inodes_db_inode: DInode,
    // offset 0x070
    pub root_dir_inode: DInode,
    // offset 0x0b0
    pub volume_label: [u8; 32],

    _tail: [u8; SUPERBLOCK_SIZE - 0xd0],
}

const_assert_eq!(core::mem::size_of::<SuperBlock>(), SUPERBLOCK_SIZE);

/*
    Disk Capacity (up to)          0..2MB   2..8MB    8..32MB   32MB..
    -----------------------------------------------------------------
    Block size (bytes)                512       1K         2K      4K
*/
fn auto_block_size(sector_size: u32, capacity: u64) -> u32 {
    let block_size = if capacity <= 2 * MB {
        512
    } else if capacity <= 8 * MB {
        1024
    } else if capacity <= 32 * MB {
        2048
    } else {
        4096
    };

    if block_size < sector_size {
        sector_size
    } else {
        block_size - block_size % sector_size
    }
}

pub fn populate(
    label: &str,
    sector_size: u32,
    sector_count: u32,
    desired_block_size: u32,
) -> KResult<SuperBlock> {
    let capacity = sector_size as u64 * sector_count as u64;

    let block_size = if desired_block_size > 0 {
        // a caller override stays strictly below the 4 KiB ceiling;
        // only the capacity-driven pick may use it.
        if desired_block_size < sector_size
            || desired_block_size >= MAX_BLOCK_SIZE
            || desired_block_size % sector_size != 0
        {
            return Err(Err::NotSupported);
        }
        desired_block_size
    } else {
        auto_block_size(sector_size, capacity)
    };
    // the superblock must fit in block 0
    if block_size < SUPERBLOCK_SIZE as u32 {
        return Err(Err::NotSupported);
    }

    let blocks_in_device = (capacity / block_size as u64) as u32;
    let bitmap_bytes = (blocks_in_device + 7) / 8;
    let bitmap_blocks = (bitmap_bytes + block_size - 1) / block_size;

    let mut sb = SuperBlock::zeroed();
    sb.magic = MAGIC;
    sb.direntry_size = DIRENT_SIZE as u16;
    sb.inode_size = INODE_SIZE as u16;
    sb.inodes_db_rec_count = 0;
    sb.sector_size = sector_size;
    sb.sectors_per_block = block_size / sector_size;
    sb.block_size = block_size;
    sb.blocks_in_device = blocks_in_device;
    sb.bitmap_first_block = 1;
    sb.bitmap_blocks_count = bitmap_blocks;

    sb.inodes_db_inode.flags = (InodeFlags::USED | InodeFlags::FILE).bits();
    sb.root_dir_inode.flags = (InodeFlags::USED | InodeFlags::DIR).bits();

    let label = label.as_bytes();
    if label.len() > sb.volume_label.len() {
        return Err(Err::InvalidArgument);
    }
    sb.volume_label[..label.len()].copy_from_slice(label);

    Ok(sb)
}

impl SuperBlock {
    pub fn zeroed() -> SuperBlock {
        SuperBlock::read_from(&[0u8; SUPERBLOCK_SIZE][..]).unwrap()
    }

    pub fn is_recognized(&self) -> bool {
        self.magic == MAGIC
            && self.direntry_size == DIRENT_SIZE as u16
            && self.inode_size == INODE_SIZE as u16
    }

    pub fn label(&self) -> &str {
        let end = self
            .volume_label
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.volume_label.len());
        core::str::from_utf8(&self.volume_label[..end]).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_is_one_sector() {
        assert_eq!(core::mem::size_of::<SuperBlock>(), 512);
    }

    #[test]
    fn field_offsets_match_the_layout() {
        let mut sb = SuperBlock::zeroed();
        sb.inodes_db_rec_count = 0x11223344;
        sb.sector_size = 0x55667788;
        sb.bitmap_first_block = 0x99aabbcc;
        sb.volume_label[0] = b'X';

        let bytes = sb.as_bytes();
        assert_eq!(&bytes[8..12], &0x11223344u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &0x55667788u32.to_le_bytes());
        assert_eq!(&bytes[32..36], &0x99aabbccu32.to_le_bytes());
        assert_eq!(bytes[176], b'X');
    }

    #[test]
    fn auto_block_size_follows_capacity() {
        let sb = populate("t", 512, 4096, 0).unwrap(); // 2 MB
        assert_eq!(sb.block_size, 512);
        let sb = populate("t", 512, 16384, 0).unwrap(); // 8 MB
        assert_eq!(sb.block_size, 1024);
        let sb = populate("t", 512, 65536, 0).unwrap(); // 32 MB
        assert_eq!(sb.block_size, 2048);
        let sb = populate("t", 512, 131072, 0).unwrap(); // 64 MB
        assert_eq!(sb.block_size, 4096);
    }

    #[test]
    fn desired_block_size_is_validated() {
        assert!(populate("t", 512, 4096, 1024).is_ok());
        assert!(populate("t", 512, 4096, 2048).is_ok());
        assert_eq!(populate("t", 512, 4096, 256), Err(Err::NotSupported));
        assert_eq!(populate("t", 512, 4096, 768), Err(Err::NotSupported));
        // the ceiling itself is rejected for overrides; only the
        // capacity-driven pick may choose 4096
        assert_eq!(populate("t", 512, 4096, 4096), Err(Err::NotSupported));
        assert_eq!(populate("t", 512, 4096, 8192), Err(Err::NotSupported));
    }

    #[test]
    fn bitmap_sizing_covers_all_blocks() {
        let sb = populate("t", 512, 131072, 0).unwrap(); // 64 MB, 4K blocks
        assert_eq!(sb.blocks_in_device, 16384);
        // 16384 bits = 2048 bytes = one 4K block
        assert_eq!(sb.bitmap_blocks_count, 1);

        let sb = populate("t", 512, 4096, 0).unwrap(); // 2 MB, 512B blocks
        assert_eq!(sb.blocks_in_device, 4096);
        // 4096 bits = 512 bytes = one block
        assert_eq!(sb.bitmap_blocks_count, 1);
    }

    #[test]
    fn labels_survive_and_are_bounded() {
        let sb = populate("MYVOLUME", 512, 4096, 0).unwrap();
        assert_eq!(sb.label(), "MYVOLUME");
        let too_long = "x".repeat(33);
        assert!(populate(&too_long, 512, 4096, 0).is_err());
    }

    #[test]
    fn recognition_checks_magic_and_record_sizes() {
        let sb = populate("t", 512, 4096, 0).unwrap();
        assert!(sb.is_recognized());
        let mut bad = sb;
        bad.magic = *b"EXT2";
        assert!(!bad.is_recognized());
        let mut bad = sb;
        bad.inode_size = 128;
        assert!(!bad.is_recognized());
    }
}
