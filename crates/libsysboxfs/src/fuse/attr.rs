//! Conversion from handler stats to FUSE attributes, stable inode
//! assignment, and the per-container uid/gid remapping rule.

use std::time::{Duration, SystemTime};

use fuser::{FileAttr, FileType};

use crate::handler::{MAX_GID, MAX_UID};
use crate::io::NodeStat;

/// Overflow ids: what the kernel shows for ids with no mapping in the
/// caller's user namespace.
pub const NOBODY_UID: u32 = 65534;
pub const NOBODY_GID: u32 = 65534;

/// Inodes are a stable function of the virtual path (FNV-1a), so a node
/// keeps its identity across Forget/Lookup cycles without the cache having
/// to pin every entry forever. The root is always 1.
pub fn path_inode(path: &str) -> u64 {
    if path == "/" {
        return fuser::FUSE_ROOT_ID;
    }
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in path.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    // Never collide with the root id.
    if hash == fuser::FUSE_ROOT_ID {
        hash = hash.wrapping_add(1);
    }
    hash
}

pub fn file_kind(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

pub fn stat_to_attr(stat: &NodeStat, ino: u64) -> FileAttr {
    let now = SystemTime::now();
    FileAttr {
        ino,
        size: stat.size,
        blocks: (stat.size + 511) / 512,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind: file_kind(stat.mode),
        perm: (stat.mode & 0o7777) as u16,
        nlink: 1,
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// The host owns emulated nodes as host-root; the container expects its
/// user-ns root to own them. The reserved MAX sentinel opts a node out and
/// exposes the overflow ids instead.
pub fn remap_attr_ids(attr: &mut FileAttr, userns_root_uid: u32, userns_root_gid: u32) {
    attr.uid = if attr.uid == MAX_UID {
        NOBODY_UID
    } else {
        userns_root_uid
    };
    attr.gid = if attr.gid == MAX_GID {
        NOBODY_GID
    } else {
        userns_root_gid
    };
}

/// Attribute validity handed to the kernel: effectively-forever once the
/// container is fully registered, zero before (the uid/gid map is not yet
/// known during startup and interim values must not be remembered).
pub fn attr_ttl(registration_completed: bool) -> Duration {
    if registration_completed {
        Duration::new(u32::MAX as u64, 0)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_inode_stable_and_distinct() {
        assert_eq!(path_inode("/"), fuser::FUSE_ROOT_ID);
        let a = path_inode("/proc/uptime");
        assert_eq!(a, path_inode("/proc/uptime"));
        assert_ne!(a, path_inode("/proc/swaps"));
        assert_ne!(a, fuser::FUSE_ROOT_ID);
    }

    #[test]
    fn test_remap_rules() {
        let stat = NodeStat {
            ino: 9,
            mode: libc::S_IFREG | 0o644,
            uid: 0,
            gid: 0,
            size: 10,
        };
        let mut attr = stat_to_attr(&stat, 9);
        remap_attr_ids(&mut attr, 165536, 165536);
        assert_eq!(attr.uid, 165536);
        assert_eq!(attr.gid, 165536);

        let mut attr = stat_to_attr(
            &NodeStat {
                uid: MAX_UID,
                gid: MAX_GID,
                ..stat
            },
            9,
        );
        remap_attr_ids(&mut attr, 165536, 165536);
        assert_eq!(attr.uid, NOBODY_UID);
        assert_eq!(attr.gid, NOBODY_GID);
    }

    #[test]
    fn test_ttl_gated_on_registration() {
        assert_eq!(attr_ttl(false), Duration::ZERO);
        assert!(attr_ttl(true) > Duration::from_secs(1 << 30));
    }
}
