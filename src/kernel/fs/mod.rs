// Block-oriented filesystem core ("SFS1"). Five layers, leaves first:
//
//   device   - sector read/write, wall clock (traits; ATA and RTC on
//              real hardware, memory and fixed stand-ins elsewhere)
//   cache    - fixed pool of block buffers, hash lookup, LRU eviction
//   bitmap   - used/free bit per block, rotating free-search hint
//   inode    - 64-byte records with inline + indirect extent lists
//   icache   - cached inodes; the inode database file; two pinned
//              inodes (the database's own and the root directory's)
//              living inline in the superblock
//   dir/path - fixed 64-byte (name, inode id) records in an inode,
//              absolute-path walks over them
//
// This module ties them together as the mount state and the outward
// facing operations: mkfs/mount/sync/unmount, file handles with
// open/read/write/seek/tell/close, directory enumeration, and
// create/unlink/rename/stat.

pub mod bitmap;
pub mod cache;
pub mod device;
pub mod dir;
pub mod icache;
pub mod inode;
pub mod path;
pub mod ranges;
pub mod superblock;

pub use device::{ClockSource, FixedClock, MemDisk, SectorDevice};
pub use dir::DirEnt;
pub use superblock::{DIRENT_SIZE, SUPERBLOCK_SIZE};

use crate::defs::{Err, KResult};
use crate::param::{MAXNAME, NHANDLE};
use alloc::boxed::Box;
use alloc::vec;
use array_macro::array;
use bitmap::BlockBitmap;
use cache::BlockCache;
use icache::InodeCache;
use inode::{DInode, DiskEnv};
use superblock::SuperBlock;
use zerocopy::{AsBytes, FromBytes};

// an open file or directory; the index is the caller's handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fd(usize);

#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(u32),
    Current(i32),
    End(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub is_dir: bool,
    pub size: u32,
    pub modified_at: u32,
    pub allocated_blocks: u32,
}

#[derive(Clone, Copy)]
struct OpenHandle {
    in_use: bool,
    slot: usize, // inode cache slot; a handle holds one reference
    pos: u32,
}

impl OpenHandle {
    fn empty() -> OpenHandle {
        OpenHandle {
            in_use: false,
            slot: 0,
            pos: 0,
        }
    }
}

struct Mounted {
    readonly: bool,
    sb: SuperBlock,
    bitmap: BlockBitmap,
    cache: BlockCache,
    icache: InodeCache,
    handles: [OpenHandle; NHANDLE],
}

pub struct SimpleFs {
    dev: Box<dyn SectorDevice>,
    clock: Box<dyn ClockSource>,
    mounted: Option<Mounted>,
}

impl SimpleFs {
    pub fn new(dev: Box<dyn SectorDevice>, clock: Box<dyn ClockSource>) -> SimpleFs {
        SimpleFs {
            dev,
            clock,
            mounted: None,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    pub fn label(&self) -> KResult<&str> {
        let mt = self.mounted.as_ref().ok_or(Err::NotSupported)?;
        Ok(mt.sb.label())
    }

    // split borrows for the layers below; every operation starts here.
    fn parts(
        &mut self,
    ) -> KResult<(
        DiskEnv<'_>,
        &mut SuperBlock,
        &mut InodeCache,
        &mut [OpenHandle; NHANDLE],
        bool,
    )> {
        let mt = self.mounted.as_mut().ok_or(Err::NotSupported)?;
        Ok((
            DiskEnv {
                dev: &mut *self.dev,
                cache: &mut mt.cache,
                bitmap: &mut mt.bitmap,
                clock: &*self.clock,
            },
            &mut mt.sb,
            &mut mt.icache,
            &mut mt.handles,
            mt.readonly,
        ))
    }

    // ---- volume lifecycle ----

    // lay down an empty filesystem: superblock, zeroed block bitmap
    // with the reserved blocks marked used. Block size 0 auto-picks
    // by capacity.
    pub fn mkfs(&mut self, label: &str, desired_block_size: u32) -> KResult<()> {
        if self.mounted.is_some() {
            return Err(Err::NotSupported);
        }

        let sb = superblock::populate(
            label,
            self.dev.sector_size(),
            self.dev.sector_count(),
            desired_block_size,
        )?;

        let mut bitmap = BlockBitmap::new(
            sb.bitmap_first_block,
            sb.bitmap_blocks_count,
            sb.blocks_in_device,
            sb.block_size,
        )?;
        bitmap.mark_used(0);
        for i in 0..sb.bitmap_blocks_count {
            bitmap.mark_used(sb.bitmap_first_block + i);
        }

        let mut cache = BlockCache::new(sb.block_size);
        cache.wipe(&mut *self.dev, 0)?;
        cache.write(&mut *self.dev, 0, 0, sb.as_bytes())?;
        bitmap.save(&mut *self.dev, &mut cache)?;
        cache.flush(&mut *self.dev)
    }

    pub fn mount(&mut self, readonly: bool) -> KResult<()> {
        if self.mounted.is_some() {
            return Err(Err::NotSupported);
        }
        let sector_size = self.dev.sector_size() as usize;
        if sector_size < SUPERBLOCK_SIZE {
            return Err(Err::NotSupported);
        }

        // the superblock fits one sector exactly so it can be read
        // before the block size is known.
        let mut sector = vec![0u8; sector_size];
        self.dev.read_sector(0, &mut sector)?;
        let sb = SuperBlock::read_from_prefix(&sector[..]).unwrap();
        if !sb.is_recognized() {
            return Err(Err::NotRecognized);
        }

        let mut cache = BlockCache::new(sb.block_size);
        let mut bitmap = BlockBitmap::new(
            sb.bitmap_first_block,
            sb.bitmap_blocks_count,
            sb.blocks_in_device,
            sb.block_size,
        )?;
        bitmap.load(&mut *self.dev, &mut cache)?;

        let icache = InodeCache::new(&sb);
        self.mounted = Some(Mounted {
            readonly,
            sb,
            bitmap,
            cache,
            icache,
            handles: array![_ => OpenHandle::empty(); NHANDLE],
        });
        Ok(())
    }

    // push everything volatile back to the device: dirty inodes into
    // the database / superblock copy, then the superblock and bitmap
    // through the cache, then every dirty cache slot.
    pub fn sync(&mut self) -> KResult<()> {
        let (mut env, sb, icache, _, readonly) = self.parts()?;
        if readonly {
            return Err(Err::NotPermitted);
        }
        icache.flush_all(&mut env, sb)?;
        env.cache.write(env.dev, 0, 0, sb.as_bytes())?;
        env.bitmap.save(env.dev, env.cache)?;
        env.cache.flush(env.dev)
    }

    pub fn unmount(&mut self) -> KResult<()> {
        let readonly = match self.mounted.as_ref() {
            None => return Err(Err::NotSupported),
            Some(mt) => mt.readonly,
        };
        if !readonly {
            self.sync()?;
        }
        self.mounted = None;
        Ok(())
    }

    // ---- handles ----

    fn grab_handle(
        icache: &mut InodeCache,
        handles: &mut [OpenHandle; NHANDLE],
        slot: usize,
    ) -> KResult<Fd> {
        let h = handles
            .iter()
            .position(|h| !h.in_use)
            .ok_or(Err::ResourcesExhausted)?;
        handles[h] = OpenHandle {
            in_use: true,
            slot,
            pos: 0,
        };
        icache.slots[slot].ref_count += 1;
        Ok(Fd(h))
    }

    fn handle<'a>(
        handles: &'a mut [OpenHandle; NHANDLE],
        fd: Fd,
    ) -> KResult<&'a mut OpenHandle> {
        let h = handles.get_mut(fd.0).ok_or(Err::InvalidArgument)?;
        if !h.in_use {
            return Err(Err::InvalidArgument);
        }
        Ok(h)
    }

    pub fn open(&mut self, path: &str) -> KResult<Fd> {
        let (mut env, _, icache, handles, _) = self.parts()?;
        let (node, id) = path::resolve(&mut env, icache, path)?;
        if !node.is_file() {
            return Err(Err::WrongType);
        }
        let slot = icache.get(&mut env, id)?;
        Self::grab_handle(icache, handles, slot)
    }

    pub fn opendir(&mut self, path: &str) -> KResult<Fd> {
        let (mut env, _, icache, handles, _) = self.parts()?;
        let (node, id) = path::resolve(&mut env, icache, path)?;
        if !node.is_dir() {
            return Err(Err::WrongType);
        }
        let slot = icache.get(&mut env, id)?;
        Self::grab_handle(icache, handles, slot)
    }

    pub fn close(&mut self, fd: Fd) -> KResult<()> {
        let (mut env, sb, icache, handles, _) = self.parts()?;
        let h = Self::handle(handles, fd)?;
        let slot = h.slot;
        h.in_use = false;

        let cached = &mut icache.slots[slot];
        assert!(cached.ref_count > 0, "close: inode refcount underflow");
        cached.ref_count -= 1;
        if cached.ref_count == 0 {
            // last reference: write back and let the slot go (the two
            // pinned slots stay for the life of the mount)
            icache.flush_slot(&mut env, sb, slot)?;
            if slot != icache::SLOT_DB && slot != icache::SLOT_ROOT {
                icache.slots[slot].in_use = false;
            }
        }
        Ok(())
    }

    pub fn closedir(&mut self, fd: Fd) -> KResult<()> {
        self.close(fd)
    }

    // ---- byte i/o ----

    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> KResult<usize> {
        let (mut env, _, icache, handles, _) = self.parts()?;
        let h = Self::handle(handles, fd)?;
        let node = icache.slots[h.slot].inode;
        let n = inode::read_bytes(&mut env, &node, h.pos, buf)?;
        h.pos += n as u32;
        Ok(n)
    }

    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> KResult<usize> {
        let (mut env, _, icache, handles, readonly) = self.parts()?;
        if readonly {
            return Err(Err::NotPermitted);
        }
        let h = Self::handle(handles, fd)?;
        let mut node = icache.slots[h.slot].inode;
        let n = inode::write_bytes(&mut env, &mut node, h.pos, buf)?;
        if n > 0 {
            icache.slots[h.slot].inode = node;
            icache.slots[h.slot].dirty = true;
            h.pos += n as u32;
        }
        Ok(n)
    }

    pub fn seek(&mut self, fd: Fd, from: SeekFrom) -> KResult<u32> {
        let (_, _, icache, handles, _) = self.parts()?;
        let h = Self::handle(handles, fd)?;
        let size = icache.slots[h.slot].inode.file_size as i64;
        let target = match from {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(d) => h.pos as i64 + d as i64,
            SeekFrom::End(d) => size + d as i64,
        };
        let clamped = target.max(0).min(size) as u32;
        h.pos = clamped;
        Ok(clamped)
    }

    pub fn tell(&mut self, fd: Fd) -> KResult<u32> {
        let (_, _, _, handles, _) = self.parts()?;
        Ok(Self::handle(handles, fd)?.pos)
    }

    // one raw directory record per call; callers skip tombstones if
    // they care. EndOfFile marks the end of the directory.
    pub fn readdir(&mut self, fd: Fd) -> KResult<DirEnt> {
        let (mut env, _, icache, handles, _) = self.parts()?;
        let h = Self::handle(handles, fd)?;
        let node = icache.slots[h.slot].inode;
        if !node.is_dir() {
            return Err(Err::WrongType);
        }
        if h.pos >= node.file_size {
            return Err(Err::EndOfFile);
        }
        let ent = dir::load_entry(&mut env, &node, h.pos / DIRENT_SIZE as u32)?;
        h.pos += DIRENT_SIZE as u32;
        Ok(ent)
    }

    // ---- namespace ----

    fn check_name(name: &str) -> KResult<()> {
        if name.is_empty() || name.len() > MAXNAME || name.contains('/') {
            return Err(Err::InvalidArgument);
        }
        Ok(())
    }

    pub fn create(&mut self, fpath: &str, is_dir: bool) -> KResult<()> {
        let (mut env, sb, icache, _, readonly) = self.parts()?;
        if readonly {
            return Err(Err::NotPermitted);
        }
        let name = path::last_part(fpath);
        Self::check_name(name)?;

        let (parent, parent_id) = path::resolve_parent(&mut env, icache, fpath)?;
        if !parent.is_dir() {
            return Err(Err::WrongType);
        }
        dir::ensure_missing(&mut env, &parent, name)?;

        let node = DInode::prepare(env.clock, is_dir);
        let id = icache.db_append(&mut env, sb, &node)?;

        // grow the directory through its cache slot so every later
        // lookup sees the new entry before it hits the disk
        let pslot = icache.get(&mut env, parent_id)?;
        let mut pnode = icache.slots[pslot].inode;
        dir::append_entry(&mut env, &mut pnode, name, id)?;
        icache.slots[pslot].inode = pnode;
        icache.slots[pslot].dirty = true;
        Ok(())
    }

    // remove a name and its inode. Directories must already be empty;
    // nothing is removed recursively.
    pub fn unlink(&mut self, fpath: &str) -> KResult<()> {
        let (mut env, sb, icache, _, readonly) = self.parts()?;
        if readonly {
            return Err(Err::NotPermitted);
        }
        let name = path::last_part(fpath);
        Self::check_name(name)?;

        let (parent, parent_id) = path::resolve_parent(&mut env, icache, fpath)?;
        if !parent.is_dir() {
            return Err(Err::WrongType);
        }
        let (target_id, rec_no) = dir::find_entry(&mut env, &parent, name)?;

        let tslot = icache.get(&mut env, target_id)?;
        if icache.slots[tslot].ref_count > 0 {
            return Err(Err::NotPermitted); // still open somewhere
        }
        let mut target = icache.slots[tslot].inode;
        if target.is_dir() && !dir::is_empty(&mut env, &target)? {
            return Err(Err::NotPermitted);
        }

        inode::truncate(&mut env, &mut target)?;
        icache.db_delete(&mut env, sb, target_id)?;
        icache.invalidate(target_id);

        let pslot = icache.get(&mut env, parent_id)?;
        let mut pnode = icache.slots[pslot].inode;
        dir::delete_entry(&mut env, &mut pnode, rec_no)?;
        icache.slots[pslot].inode = pnode;
        icache.slots[pslot].dirty = true;
        Ok(())
    }

    // move a name; never overwrites an existing destination. Within
    // one directory the record is rewritten in place.
    pub fn rename(&mut self, from: &str, to: &str) -> KResult<()> {
        let (mut env, _, icache, _, readonly) = self.parts()?;
        if readonly {
            return Err(Err::NotPermitted);
        }
        let old_name = path::last_part(from);
        let new_name = path::last_part(to);
        Self::check_name(old_name)?;
        Self::check_name(new_name)?;

        let (old_parent, old_pid) = path::resolve_parent(&mut env, icache, from)?;
        let (new_parent, new_pid) = path::resolve_parent(&mut env, icache, to)?;
        if !old_parent.is_dir() || !new_parent.is_dir() {
            return Err(Err::WrongType);
        }

        let (target_id, old_rec) = dir::find_entry(&mut env, &old_parent, old_name)?;
        dir::ensure_missing(&mut env, &new_parent, new_name)?;

        if old_pid == new_pid {
            let pslot = icache.get(&mut env, old_pid)?;
            let mut pnode = icache.slots[pslot].inode;
            dir::update_entry(&mut env, &mut pnode, old_rec, new_name, target_id)?;
            icache.slots[pslot].inode = pnode;
            icache.slots[pslot].dirty = true;
        } else {
            let nslot = icache.get(&mut env, new_pid)?;
            let mut nnode = icache.slots[nslot].inode;
            dir::append_entry(&mut env, &mut nnode, new_name, target_id)?;
            icache.slots[nslot].inode = nnode;
            icache.slots[nslot].dirty = true;

            let oslot = icache.get(&mut env, old_pid)?;
            let mut onode = icache.slots[oslot].inode;
            dir::delete_entry(&mut env, &mut onode, old_rec)?;
            icache.slots[oslot].inode = onode;
            icache.slots[oslot].dirty = true;
        }
        Ok(())
    }

    pub fn stat(&mut self, fpath: &str) -> KResult<Stat> {
        let (mut env, _, icache, _, _) = self.parts()?;
        let (node, _) = path::resolve(&mut env, icache, fpath)?;
        Ok(Stat {
            is_dir: node.is_dir(),
            size: node.file_size,
            modified_at: node.modified_at,
            allocated_blocks: node.allocated_blocks,
        })
    }
}

// The kernel's one mounted filesystem. The mutex is the mount-wide
// write lock: every operation, readers included, runs under it.
#[cfg(target_os = "none")]
pub static FS: crate::spinlock::Mutex<Option<SimpleFs>> =
    crate::spinlock::Mutex::new(None, "fs");
