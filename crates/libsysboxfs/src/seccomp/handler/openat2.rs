//! openat2(2) processing. The kernel's RESOLVE_* path walk does not
//! cooperate with the FUSE-backed portions of the tree, so calls that land
//! under a sysbox-fs mount are re-executed inside the container with the
//! resolve restrictions stripped, and the resulting fd is injected into the
//! tracee.

use std::path::Path;

use nix::errno::Errno;

use super::{sanitize_path, SyscallCtx};
use crate::mount::MountInfoSnapshot;
use crate::nsenter::message::{NsRequest, NsResponse};
use crate::process::NS_ALL;
use crate::seccomp::{
    SyscallResult, RESOLVE_BENEATH, RESOLVE_NO_MAGICLINKS, RESOLVE_NO_SYMLINKS, RESOLVE_NO_XDEV,
};

/// Restrictions the FUSE walk cannot satisfy.
const STRIPPED_RESOLVE: u64 =
    RESOLVE_NO_MAGICLINKS | RESOLVE_NO_XDEV | RESOLVE_NO_SYMLINKS | RESOLVE_BENEATH;

// open_how layout: three u64s (flags, mode, resolve).
const OPEN_HOW_SIZE: usize = 24;

pub(super) fn process(ctx: &SyscallCtx<'_>) -> SyscallResult {
    match run(ctx) {
        Ok(result) => result,
        Err(errno) => SyscallResult::Error(errno),
    }
}

fn run(ctx: &SyscallCtx<'_>) -> Result<SyscallResult, Errno> {
    let dirfd = ctx.arg(0) as i32;
    let raw_path = ctx.path_arg(1)?;
    let how = ctx.mem.read_bytes(ctx.arg(2), OPEN_HOW_SIZE)?;
    if how.len() < OPEN_HOW_SIZE {
        return Err(Errno::EFAULT);
    }
    let flags = u64::from_ne_bytes(how[0..8].try_into().unwrap());
    let mode = u64::from_ne_bytes(how[8..16].try_into().unwrap());
    let resolve = u64::from_ne_bytes(how[16..24].try_into().unwrap());

    if resolve & STRIPPED_RESOLVE == 0 {
        return Ok(SyscallResult::Continue);
    }

    let path = if raw_path.is_relative() {
        let base = if dirfd == libc::AT_FDCWD {
            ctx.process.cwd().map_err(|_| Errno::EINVAL)?
        } else {
            ctx.process.fd_path(dirfd).map_err(|_| Errno::EBADF)?
        };
        base.join(raw_path)
    } else {
        sanitize_path(&ctx.process, &raw_path)?
    };

    let snap = MountInfoSnapshot::for_pid(ctx.process.pid()).map_err(|_| Errno::EINVAL)?;
    if !under_sysboxfs_mount(&snap, &path) {
        return Ok(SyscallResult::Continue);
    }

    // Strip what the FUSE walk cannot satisfy; O_PATH would hand back a fd
    // useless for the injected read.
    let flags = flags & !(libc::O_PATH as u64);
    let resolve = resolve & !STRIPPED_RESOLVE;

    let (resp, fds) = ctx.nsexec_with_fds(
        NS_ALL,
        NsRequest::Openat2 {
            path,
            flags,
            mode,
            resolve,
        },
    )?;
    if !matches!(resp, NsResponse::Fd) {
        return Err(Errno::EINVAL);
    }
    let fd = fds.into_iter().next().ok_or(Errno::EINVAL)?;

    // Inject into the tracee with O_CLOEXEC; our copy closes on drop, the
    // tracee keeps an independent one.
    let injected = ctx
        .notify_fd
        .addfd(ctx.notif.id, std::os::fd::AsRawFd::as_raw_fd(&fd))
        .map_err(|errno| {
            tracing::warn!(pid = ctx.process.pid(), ?errno, "seccomp addfd failed");
            Errno::EINVAL
        })?;
    Ok(SyscallResult::Success(i64::from(injected)))
}

/// Does the path land on a sysbox-fs managed mount (the fuse tree itself or
/// a submount bound from it)?
pub(crate) fn under_sysboxfs_mount(snap: &MountInfoSnapshot, path: &Path) -> bool {
    match snap.covering_mount(path) {
        Some(entry) => {
            entry.fs_type.starts_with("fuse")
                && entry.source.as_deref() == Some("sysboxfs")
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountEntry;
    use std::path::PathBuf;

    fn fuse_entry(mnt_id: i32, parent_id: i32, mount_point: &str) -> MountEntry {
        MountEntry {
            mnt_id,
            parent_id,
            root: "/".to_string(),
            mount_point: PathBuf::from(mount_point),
            mount_options: "rw,nosuid,nodev".to_string(),
            super_options: String::new(),
            fs_type: "fuse".to_string(),
            source: Some("sysboxfs".to_string()),
            inode: None,
        }
    }

    fn plain_entry(mnt_id: i32, parent_id: i32, mount_point: &str, fs_type: &str) -> MountEntry {
        MountEntry {
            mnt_id,
            parent_id,
            root: "/".to_string(),
            mount_point: PathBuf::from(mount_point),
            mount_options: "rw".to_string(),
            super_options: String::new(),
            fs_type: fs_type.to_string(),
            source: Some(fs_type.to_string()),
            inode: None,
        }
    }

    #[test]
    fn test_under_sysboxfs_mount() {
        let snap = MountInfoSnapshot::from_entries(vec![
            plain_entry(11, 1, "/", "ext4"),
            plain_entry(20, 11, "/proc", "proc"),
            fuse_entry(21, 20, "/proc/sys"),
        ]);

        assert!(under_sysboxfs_mount(
            &snap,
            Path::new("/proc/sys/net/netfilter/nf_conntrack_max")
        ));
        assert!(!under_sysboxfs_mount(&snap, Path::new("/proc/meminfo")));
        assert!(!under_sysboxfs_mount(&snap, Path::new("/etc/passwd")));
    }

    #[test]
    fn test_resolve_flag_gate() {
        assert_eq!(STRIPPED_RESOLVE & RESOLVE_NO_SYMLINKS, RESOLVE_NO_SYMLINKS);
        assert_eq!(STRIPPED_RESOLVE & crate::seccomp::RESOLVE_IN_ROOT, 0);
    }
}
