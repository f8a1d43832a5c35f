use super::inode::{self, DiskEnv, DInode, INODE_SIZE};
use super::superblock::SuperBlock;
use crate::defs::{Err, KResult};
use crate::param::NINODE;
use array_macro::array;
use zerocopy::{AsBytes, FromBytes};

// In-memory inode cache, and the inode database that backs it.
//
// The database is itself a file: record index = inode id. Its own
// inode, and the root directory's, cannot live inside it; they sit in
// the superblock and occupy two pinned cache slots for the lifetime
// of the mount. The two top ids stand in for them everywhere an inode
// id is expected.

pub const INODE_DB_ID: u32 = u32::MAX - 1;
pub const ROOT_DIR_ID: u32 = u32::MAX;

pub const SLOT_DB: usize = 0;
pub const SLOT_ROOT: usize = 1;
const PINNED_SLOTS: usize = 2;

#[derive(Clone, Copy)]
pub struct CachedInode {
    pub in_use: bool,
    pub dirty: bool,
    pub ref_count: u32,
    pub inode_id: u32,
    pub inode: DInode,
}

impl CachedInode {
    fn empty() -> CachedInode {
        CachedInode {
            in_use: false,
            dirty: false,
            ref_count: 0,
            inode_id: 0,
            inode: DInode::default(),
        }
    }
}

pub struct InodeCache {
    pub slots: [CachedInode; NINODE],
    next_evict: usize,
}

impl InodeCache {
    pub fn new(sb: &SuperBlock) -> InodeCache {
        let mut cache = InodeCache {
            slots: array![_ => CachedInode::empty(); NINODE],
            next_evict: PINNED_SLOTS,
        };
        cache.slots[SLOT_DB] = CachedInode {
            in_use: true,
            dirty: false,
            ref_count: 0,
            inode_id: INODE_DB_ID,
            inode: sb.inodes_db_inode,
        };
        cache.slots[SLOT_ROOT] = CachedInode {
            in_use: true,
            dirty: false,
            ref_count: 0,
            inode_id: ROOT_DIR_ID,
            inode: sb.root_dir_inode,
        };
        cache
    }

    pub fn lookup(&self, inode_id: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.in_use && s.inode_id == inode_id)
    }

    // slot holding the requested inode, loading and possibly evicting
    // to make room. A fresh slot starts unreferenced and clean.
    pub fn get(&mut self, env: &mut DiskEnv<'_>, inode_id: u32) -> KResult<usize> {
        if let Some(idx) = self.lookup(inode_id) {
            return Ok(idx);
        }

        let idx = match self.slots.iter().position(|s| !s.in_use) {
            Some(idx) => idx,
            None => self.evict_one(env)?,
        };

        let mut node = DInode::default();
        self.db_load(env, inode_id, &mut node)?;
        self.slots[idx] = CachedInode {
            in_use: true,
            dirty: false,
            ref_count: 0,
            inode_id,
            inode: node,
        };
        Ok(idx)
    }

    // round-robin over the non-pinned slots, skipping anything still
    // referenced by an open handle.
    fn evict_one(&mut self, env: &mut DiskEnv<'_>) -> KResult<usize> {
        let span = NINODE - PINNED_SLOTS;
        let start = self.next_evict.max(PINNED_SLOTS);
        for i in 0..span {
            let idx = PINNED_SLOTS + (start - PINNED_SLOTS + i) % span;
            if self.slots[idx].ref_count > 0 {
                continue;
            }
            if self.slots[idx].dirty {
                let (id, node) = (self.slots[idx].inode_id, self.slots[idx].inode);
                self.db_update(env, id, &node)?;
            }
            self.slots[idx].in_use = false;
            self.next_evict = PINNED_SLOTS + (idx - PINNED_SLOTS + 1) % span;
            return Ok(idx);
        }
        Err(Err::ResourcesExhausted)
    }

    // drop a cached copy without writing back; used right after the
    // on-disk inode is deleted.
    pub fn invalidate(&mut self, inode_id: u32) {
        if let Some(idx) = self.lookup(inode_id) {
            if idx >= PINNED_SLOTS {
                self.slots[idx].in_use = false;
                self.slots[idx].dirty = false;
            }
        }
    }

    pub fn flush_slot(
        &mut self,
        env: &mut DiskEnv<'_>,
        sb: &mut SuperBlock,
        idx: usize,
    ) -> KResult<()> {
        if !self.slots[idx].in_use || !self.slots[idx].dirty {
            return Ok(());
        }
        match idx {
            SLOT_DB => sb.inodes_db_inode = self.slots[idx].inode,
            SLOT_ROOT => sb.root_dir_inode = self.slots[idx].inode,
            _ => {
                let (id, node) = (self.slots[idx].inode_id, self.slots[idx].inode);
                self.db_update(env, id, &node)?;
            }
        }
        self.slots[idx].dirty = false;
        Ok(())
    }

    // non-pinned slots first: writing them back goes through the
    // database file and dirties its pinned inode.
    pub fn flush_all(&mut self, env: &mut DiskEnv<'_>, sb: &mut SuperBlock) -> KResult<()> {
        for idx in PINNED_SLOTS..NINODE {
            self.flush_slot(env, sb, idx)?;
        }
        self.flush_slot(env, sb, SLOT_DB)?;
        self.flush_slot(env, sb, SLOT_ROOT)?;
        Ok(())
    }

    // ---- the inode database ----

    pub fn db_rec_count(&self) -> u32 {
        self.slots[SLOT_DB].inode.file_size / INODE_SIZE as u32
    }

    // read an inode record; the cached copy wins over the disk so
    // readers observe not-yet-flushed updates.
    pub fn db_load(&self, env: &mut DiskEnv<'_>, inode_id: u32, node: &mut DInode) -> KResult<()> {
        if let Some(idx) = self.lookup(inode_id) {
            *node = self.slots[idx].inode;
            return Ok(());
        }
        match inode_id {
            INODE_DB_ID | ROOT_DIR_ID => unreachable!("pinned inodes are always cached"),
            _ => {
                let db = self.slots[SLOT_DB].inode;
                let mut rec = [0u8; INODE_SIZE];
                inode::read_rec(env, &db, INODE_SIZE as u32, inode_id, &mut rec)?;
                *node = DInode::read_from(&rec[..]).unwrap();
                Ok(())
            }
        }
    }

    // append a fresh inode record; its index becomes the inode id.
    pub fn db_append(
        &mut self,
        env: &mut DiskEnv<'_>,
        sb: &mut SuperBlock,
        node: &DInode,
    ) -> KResult<u32> {
        let recs = self.db_rec_count();
        if recs >= INODE_DB_ID {
            return Err(Err::ResourcesExhausted);
        }

        let mut db = self.slots[SLOT_DB].inode;
        inode::write_rec(env, &mut db, INODE_SIZE as u32, recs, node.as_bytes())?;
        self.slots[SLOT_DB].inode = db;
        self.slots[SLOT_DB].dirty = true;

        sb.inodes_db_rec_count = recs + 1;
        Ok(recs)
    }

    pub fn db_update(
        &mut self,
        env: &mut DiskEnv<'_>,
        inode_id: u32,
        node: &DInode,
    ) -> KResult<()> {
        match inode_id {
            INODE_DB_ID => {
                self.slots[SLOT_DB].inode = *node;
                self.slots[SLOT_DB].dirty = true;
                Ok(())
            }
            ROOT_DIR_ID => {
                self.slots[SLOT_ROOT].inode = *node;
                self.slots[SLOT_ROOT].dirty = true;
                Ok(())
            }
            _ => {
                let mut db = self.slots[SLOT_DB].inode;
                inode::write_rec(env, &mut db, INODE_SIZE as u32, inode_id, node.as_bytes())?;
                self.slots[SLOT_DB].inode = db;
                self.slots[SLOT_DB].dirty = true;
                Ok(())
            }
        }
    }

    // delete a record: the terminal one shortens the file, anything
    // else becomes a zeroed hole that is not reclaimed.
    pub fn db_delete(
        &mut self,
        env: &mut DiskEnv<'_>,
        sb: &mut SuperBlock,
        inode_id: u32,
    ) -> KResult<()> {
        if inode_id == INODE_DB_ID || inode_id == ROOT_DIR_ID {
            return Err(Err::NotPermitted);
        }
        let recs = self.db_rec_count();
        if inode_id >= recs {
            return Err(Err::NotFound);
        }
        if inode_id == recs - 1 {
            // shorten the file; its blocks stay allocated for reuse
            self.slots[SLOT_DB].inode.file_size = (recs - 1) * INODE_SIZE as u32;
            self.slots[SLOT_DB].dirty = true;
            sb.inodes_db_rec_count = recs - 1;
        } else {
            let blank = DInode::default();
            self.db_update(env, inode_id, &blank)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::bitmap::BlockBitmap;
    use crate::fs::cache::BlockCache;
    use crate::fs::device::{FixedClock, MemDisk};
    use crate::fs::superblock;

    struct Rig {
        dev: MemDisk,
        cache: BlockCache,
        bitmap: BlockBitmap,
        clock: FixedClock,
        sb: SuperBlock,
    }

    impl Rig {
        fn new() -> Rig {
            let sb = superblock::populate("t", 512, 2048, 0).unwrap();
            let mut bitmap = BlockBitmap::new(1, 1, 2048, 512).unwrap();
            bitmap.mark_used(0);
            bitmap.mark_used(1);
            Rig {
                dev: MemDisk::new(512, 2048),
                cache: BlockCache::new(512),
                bitmap,
                clock: FixedClock(7),
                sb,
            }
        }
    }

    #[test]
    fn pinned_slots_are_primed() {
        let rig = Rig::new();
        let icache = InodeCache::new(&rig.sb);
        assert_eq!(icache.lookup(INODE_DB_ID), Some(SLOT_DB));
        assert_eq!(icache.lookup(ROOT_DIR_ID), Some(SLOT_ROOT));
        assert!(icache.slots[SLOT_ROOT].inode.is_dir());
    }

    #[test]
    fn append_load_update_roundtrip() {
        let mut rig = Rig::new();
        let mut icache = InodeCache::new(&rig.sb);
        let mut sb = rig.sb;
        let mut env = DiskEnv {
            dev: &mut rig.dev,
            cache: &mut rig.cache,
            bitmap: &mut rig.bitmap,
            clock: &rig.clock,
        };

        let node = DInode::prepare(env.clock, false);
        let id = icache.db_append(&mut env, &mut sb, &node).unwrap();
        assert_eq!(id, 0);
        assert_eq!(icache.db_rec_count(), 1);
        assert_eq!(sb.inodes_db_rec_count, 1);

        let mut out = DInode::default();
        icache.db_load(&mut env, id, &mut out).unwrap();
        assert!(out.is_used() && out.is_file());

        let mut changed = out;
        changed.file_size = 777;
        icache.db_update(&mut env, id, &changed).unwrap();
        icache.db_load(&mut env, id, &mut out).unwrap();
        assert_eq!(out.file_size, 777);
    }

    #[test]
    fn delete_terminal_record_shortens_the_db() {
        let mut rig = Rig::new();
        let mut icache = InodeCache::new(&rig.sb);
        let mut sb = rig.sb;
        let mut env = DiskEnv {
            dev: &mut rig.dev,
            cache: &mut rig.cache,
            bitmap: &mut rig.bitmap,
            clock: &rig.clock,
        };

        let node = DInode::prepare(env.clock, false);
        let a = icache.db_append(&mut env, &mut sb, &node).unwrap();
        let b = icache.db_append(&mut env, &mut sb, &node).unwrap();

        icache.db_delete(&mut env, &mut sb, b).unwrap();
        assert_eq!(icache.db_rec_count(), 1);
        assert_eq!(sb.inodes_db_rec_count, 1);

        // deleting a non-terminal record leaves a zeroed hole
        let c = icache.db_append(&mut env, &mut sb, &node).unwrap();
        assert_eq!(c, 1);
        icache.db_delete(&mut env, &mut sb, a).unwrap();
        assert_eq!(icache.db_rec_count(), 2);
        let mut out = DInode::default();
        icache.db_load(&mut env, a, &mut out).unwrap();
        assert!(!out.is_used());
    }

    #[test]
    fn pinned_records_cannot_be_deleted() {
        let mut rig = Rig::new();
        let mut icache = InodeCache::new(&rig.sb);
        let mut sb = rig.sb;
        let mut env = DiskEnv {
            dev: &mut rig.dev,
            cache: &mut rig.cache,
            bitmap: &mut rig.bitmap,
            clock: &rig.clock,
        };
        assert_eq!(
            icache.db_delete(&mut env, &mut sb, ROOT_DIR_ID),
            Err(Err::NotPermitted)
        );
    }

    #[test]
    fn eviction_skips_pinned_and_referenced_slots() {
        let mut rig = Rig::new();
        let mut icache = InodeCache::new(&rig.sb);
        let mut sb = rig.sb;
        let mut env = DiskEnv {
            dev: &mut rig.dev,
            cache: &mut rig.cache,
            bitmap: &mut rig.bitmap,
            clock: &rig.clock,
        };

        // enough inodes to exceed the cache
        let node = DInode::prepare(env.clock, false);
        for _ in 0..(NINODE as u32 + 10) {
            icache.db_append(&mut env, &mut sb, &node).unwrap();
        }

        // fill every non-pinned slot, pinning the first one with a ref
        let first = icache.get(&mut env, 0).unwrap();
        icache.slots[first].ref_count = 1;
        for id in 1..(NINODE as u32 - PINNED_SLOTS as u32) {
            icache.get(&mut env, id).unwrap();
        }

        // the next get must evict something, but never the pinned
        // slots or the referenced one
        let idx = icache.get(&mut env, 130).unwrap();
        assert!(idx >= PINNED_SLOTS);
        assert_ne!(idx, first);
        assert_eq!(icache.lookup(INODE_DB_ID), Some(SLOT_DB));
        assert_eq!(icache.lookup(ROOT_DIR_ID), Some(SLOT_ROOT));
        assert_eq!(icache.slots[first].inode_id, 0);

        icache.slots[first].ref_count = 0;
    }

    #[test]
    fn dirty_evictee_is_written_back() {
        let mut rig = Rig::new();
        let mut icache = InodeCache::new(&rig.sb);
        let mut sb = rig.sb;
        let mut env = DiskEnv {
            dev: &mut rig.dev,
            cache: &mut rig.cache,
            bitmap: &mut rig.bitmap,
            clock: &rig.clock,
        };

        let node = DInode::prepare(env.clock, false);
        for _ in 0..(NINODE as u32 + 10) {
            icache.db_append(&mut env, &mut sb, &node).unwrap();
        }

        let idx = icache.get(&mut env, 5).unwrap();
        icache.slots[idx].inode.file_size = 4242;
        icache.slots[idx].dirty = true;

        // churn through enough other inodes to force 5 out
        for id in 10..(10 + NINODE as u32) {
            icache.get(&mut env, id).unwrap();
        }
        assert_eq!(icache.lookup(5), None, "inode 5 should have been evicted");

        let mut out = DInode::default();
        icache.db_load(&mut env, 5, &mut out).unwrap();
        assert_eq!(out.file_size, 4242);
    }

    #[test]
    fn append_id_reuses_shortened_tail() {
        let mut rig = Rig::new();
        let mut icache = InodeCache::new(&rig.sb);
        let mut sb = rig.sb;
        let mut env = DiskEnv {
            dev: &mut rig.dev,
            cache: &mut rig.cache,
            bitmap: &mut rig.bitmap,
            clock: &rig.clock,
        };
        let node = DInode::prepare(env.clock, false);
        let a = icache.db_append(&mut env, &mut sb, &node).unwrap();
        icache.db_delete(&mut env, &mut sb, a).unwrap();
        let b = icache.db_append(&mut env, &mut sb, &node).unwrap();
        assert_eq!(a, b);
    }
}
