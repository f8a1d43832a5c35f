use super::inode::{self, DiskEnv, DInode};
use super::superblock::DIRENT_SIZE;
use crate::defs::{Err, KResult};
use crate::param::MAXNAME;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

// A directory is a file whose content is a packed array of fixed
// 64-byte records. A record with an empty name and inode id 0 is a
// tombstone left by a deletion between live entries; the terminal
// record is reclaimed by shortening the file instead.

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes)]
pub struct DirEnt {
    pub name: [u8; MAXNAME + 1], // NUL terminated
    pub inode_id: u32,
}

const_assert_eq!(core::mem::size_of::<DirEnt>(), DIRENT_SIZE);

impl DirEnt {
    pub fn new(name: &str, inode_id: u32) -> KResult<DirEnt> {
        let bytes = name.as_bytes();
        if bytes.is_empty() && inode_id != 0 {
            return Err(Err::InvalidArgument);
        }
        if bytes.len() > MAXNAME {
            return Err(Err::InvalidArgument);
        }
        let mut ent = DirEnt {
            name: [0; MAXNAME + 1],
            inode_id,
        };
        ent.name[..bytes.len()].copy_from_slice(bytes);
        Ok(ent)
    }

    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(MAXNAME);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    pub fn is_tombstone(&self) -> bool {
        self.name[0] == 0 && self.inode_id == 0
    }
}

pub fn entries_count(dir: &DInode) -> u32 {
    dir.file_size / DIRENT_SIZE as u32
}

pub fn load_entry(env: &mut DiskEnv<'_>, dir: &DInode, rec_no: u32) -> KResult<DirEnt> {
    let mut rec = [0u8; DIRENT_SIZE];
    inode::read_rec(env, dir, DIRENT_SIZE as u32, rec_no, &mut rec)?;
    Ok(DirEnt::read_from(&rec[..]).unwrap())
}

// linear scan by name; tombstones never match a real name.
pub fn find_entry(
    env: &mut DiskEnv<'_>,
    dir: &DInode,
    name: &str,
) -> KResult<(u32, u32)> {
    for rec_no in 0..entries_count(dir) {
        let ent = match load_entry(env, dir, rec_no) {
            Ok(ent) => ent,
            Err(Err::EndOfFile) => break,
            Err(e) => return Err(e),
        };
        if !ent.is_tombstone() && ent.name() == name {
            return Ok((ent.inode_id, rec_no));
        }
    }
    Err(Err::NotFound)
}

pub fn ensure_missing(env: &mut DiskEnv<'_>, dir: &DInode, name: &str) -> KResult<()> {
    match find_entry(env, dir, name) {
        Ok(_) => Err(Err::AlreadyExists),
        Err(Err::NotFound) => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn append_entry(
    env: &mut DiskEnv<'_>,
    dir: &mut DInode,
    name: &str,
    inode_id: u32,
) -> KResult<()> {
    let ent = DirEnt::new(name, inode_id)?;
    let rec_no = entries_count(dir);
    inode::write_rec(env, dir, DIRENT_SIZE as u32, rec_no, ent.as_bytes())
}

// in-place overwrite; rename within a directory uses this.
pub fn update_entry(
    env: &mut DiskEnv<'_>,
    dir: &mut DInode,
    rec_no: u32,
    name: &str,
    inode_id: u32,
) -> KResult<()> {
    let ent = DirEnt::new(name, inode_id)?;
    inode::write_rec(env, dir, DIRENT_SIZE as u32, rec_no, ent.as_bytes())
}

// delete by shortening when possible, tombstone otherwise.
pub fn delete_entry(env: &mut DiskEnv<'_>, dir: &mut DInode, rec_no: u32) -> KResult<()> {
    let recs = entries_count(dir);
    if rec_no >= recs {
        return Err(Err::OutOfBounds);
    }
    if rec_no == recs - 1 {
        // the blocks stay with the directory for its next growth
        dir.file_size = (recs - 1) * DIRENT_SIZE as u32;
        dir.modified_at = env.clock.seconds_since_epoch();
        return Ok(());
    }
    update_entry(env, dir, rec_no, "", 0)
}

// a directory is removable only when every record is a tombstone.
pub fn is_empty(env: &mut DiskEnv<'_>, dir: &DInode) -> KResult<bool> {
    for rec_no in 0..entries_count(dir) {
        let ent = load_entry(env, dir, rec_no)?;
        if !ent.is_tombstone() {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::bitmap::BlockBitmap;
    use crate::fs::cache::BlockCache;
    use crate::fs::device::{FixedClock, MemDisk};

    struct Rig {
        dev: MemDisk,
        cache: BlockCache,
        bitmap: BlockBitmap,
        clock: FixedClock,
    }

    impl Rig {
        fn new() -> Rig {
            let mut bitmap = BlockBitmap::new(1, 1, 2048, 512).unwrap();
            bitmap.mark_used(0);
            bitmap.mark_used(1);
            Rig {
                dev: MemDisk::new(512, 2048),
                cache: BlockCache::new(512),
                bitmap,
                clock: FixedClock(99),
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
    fn dirent_is_64_bytes() {
        assert_eq!(core::mem::size_of::<DirEnt>(), 64);
    }

    #[test]
    fn names_are_bounded_and_nul_terminated() {
        let ent = DirEnt::new("hello.txt", 5).unwrap();
        assert_eq!(ent.name(), "hello.txt");
        assert!(DirEnt::new(&"y".repeat(59), 5).is_ok());
        assert!(DirEnt::new(&"x".repeat(60), 5).is_err());
    }

    #[test]
    fn append_find_delete() {
        let mut rig = Rig::new();
        let mut env = rig.env();
        let mut dir = DInode::prepare(env.clock, true);

        append_entry(&mut env, &mut dir, "one", 10).unwrap();
        append_entry(&mut env, &mut dir, "two", 20).unwrap();
        append_entry(&mut env, &mut dir, "three", 30).unwrap();
        assert_eq!(entries_count(&dir), 3);

        assert_eq!(find_entry(&mut env, &dir, "two").unwrap(), (20, 1));
        assert_eq!(find_entry(&mut env, &dir, "nope"), Err(Err::NotFound));
        assert_eq!(
            ensure_missing(&mut env, &dir, "one"),
            Err(Err::AlreadyExists)
        );
        assert!(ensure_missing(&mut env, &dir, "four").is_ok());

        // middle deletion leaves a tombstone, record count unchanged
        delete_entry(&mut env, &mut dir, 1).unwrap();
        assert_eq!(entries_count(&dir), 3);
        assert!(load_entry(&mut env, &dir, 1).unwrap().is_tombstone());
        assert_eq!(find_entry(&mut env, &dir, "two"), Err(Err::NotFound));

        // terminal deletion shortens the file
        delete_entry(&mut env, &mut dir, 2).unwrap();
        assert_eq!(entries_count(&dir), 2);
    }

    #[test]
    fn update_renames_in_place() {
        let mut rig = Rig::new();
        let mut env = rig.env();
        let mut dir = DInode::prepare(env.clock, true);
        append_entry(&mut env, &mut dir, "old", 7).unwrap();
        update_entry(&mut env, &mut dir, 0, "new", 7).unwrap();
        assert_eq!(find_entry(&mut env, &dir, "old"), Err(Err::NotFound));
        assert_eq!(find_entry(&mut env, &dir, "new").unwrap(), (7, 0));
    }

    #[test]
    fn emptiness_sees_through_tombstones() {
        let mut rig = Rig::new();
        let mut env = rig.env();
        let mut dir = DInode::prepare(env.clock, true);
        assert!(is_empty(&mut env, &dir).unwrap());

        append_entry(&mut env, &mut dir, "a", 1).unwrap();
        append_entry(&mut env, &mut dir, "b", 2).unwrap();
        assert!(!is_empty(&mut env, &dir).unwrap());

        delete_entry(&mut env, &mut dir, 0).unwrap(); // tombstone
        delete_entry(&mut env, &mut dir, 1).unwrap(); // shorten
        // one tombstone record remains but no live entries
        assert_eq!(entries_count(&dir), 1);
        assert!(is_empty(&mut env, &dir).unwrap());
    }
}
