use super::dir;
use super::icache::{InodeCache, ROOT_DIR_ID};
use super::inode::{DiskEnv, DInode};
use crate::defs::{Err, KResult};

// Absolute-path resolution: walk /-separated components down from the
// root directory. Repeated slashes collapse; there is no cwd, no "."
// and no "..".

// first component and the remainder: "usr/bin/ls" -> ("usr", "bin/ls")
pub fn first_part(path: &str) -> (&str, &str) {
    let path = path.trim_start_matches('/');
    match path.split_once('/') {
        Some((name, rest)) => (name, rest.trim_start_matches('/')),
        None => (path, ""),
    }
}

// final component: "/bin/sh" -> "sh"
pub fn last_part(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

fn walk(
    env: &mut DiskEnv<'_>,
    icache: &InodeCache,
    path: &str,
    parent_only: bool,
) -> KResult<(DInode, u32)> {
    if !path.starts_with('/') {
        return Err(Err::InvalidArgument);
    }

    let root = icache.slots[super::icache::SLOT_ROOT].inode;
    let mut rest = path.trim_start_matches('/');

    if rest.is_empty() {
        // the path was "/" itself; it has no parent to resolve
        if parent_only {
            return Err(Err::InvalidArgument);
        }
        return Ok((root, ROOT_DIR_ID));
    }

    let mut cur = root;
    let mut cur_id = ROOT_DIR_ID;
    loop {
        let (name, tail) = first_part(rest);
        let finished = tail.is_empty();

        if parent_only && finished {
            return Ok((cur, cur_id));
        }

        let (entry_id, _) = dir::find_entry(env, &cur, name)?;
        let mut entry = DInode::default();
        icache.db_load(env, entry_id, &mut entry)?;

        if finished {
            return Ok((entry, entry_id));
        }
        if !entry.is_dir() {
            return Err(Err::WrongType);
        }
        cur = entry;
        cur_id = entry_id;
        rest = tail;
    }
}

// resolve a path to its target inode.
pub fn resolve(
    env: &mut DiskEnv<'_>,
    icache: &InodeCache,
    path: &str,
) -> KResult<(DInode, u32)> {
    walk(env, icache, path, false)
}

// resolve a path to the directory that holds its final component;
// used by create/unlink/rename to find the directory to mutate.
pub fn resolve_parent(
    env: &mut DiskEnv<'_>,
    icache: &InodeCache,
    path: &str,
) -> KResult<(DInode, u32)> {
    walk(env, icache, path, true)
}
