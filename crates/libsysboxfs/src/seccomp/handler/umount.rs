//! umount2(2) processing. Base procfs/sysfs mounts unwind through the
//! bridge (submounts first), managed submounts unmount as silent no-ops to
//! pair with bind-to-self, and immutable mounts are protected.

use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::MntFlags;

use super::{path_adjust, sanitize_path, SyscallCtx};
use crate::mount::{MountEntry, MountInfoSnapshot, MountService};
use crate::nsenter::message::{NsRequest, UmountArgs};
use crate::process::{NsKind, NS_ALL};
use crate::seccomp::SyscallResult;

pub(super) fn process(ctx: &SyscallCtx<'_>) -> SyscallResult {
    match run(ctx) {
        Ok(result) => result,
        Err(errno) => SyscallResult::Error(errno),
    }
}

fn run(ctx: &SyscallCtx<'_>) -> Result<SyscallResult, Errno> {
    if !ctx
        .process
        .is_capable(caps::Capability::CAP_SYS_ADMIN)
        .map_err(|_| Errno::EINVAL)?
    {
        return Ok(SyscallResult::Error(Errno::EPERM));
    }

    let target = sanitize_path(&ctx.process, &ctx.path_arg(0)?)?;
    let flags = ctx.arg(1) as i32;

    let snap = MountInfoSnapshot::for_pid(ctx.process.pid()).map_err(|_| Errno::EINVAL)?;
    let svc = &ctx.services.mounts;

    let entry = match snap.by_mountpoint(&target) {
        Some(entry) => entry,
        None => return Ok(SyscallResult::Continue),
    };

    if svc.is_sysboxfs_base_mount(entry) {
        return base_umount(ctx, &snap, svc, entry, flags);
    }

    // A managed submount pairs with the silently-ignored bind-to-self:
    // "bind-to-self; umount" must be symmetric.
    if svc.is_sysboxfs_submount(&snap, entry, Some(ctx.cntr.as_ref())) {
        return Ok(SyscallResult::Success(0));
    }

    if svc.is_immutable_mount(&ctx.cntr, entry) && !ctx.services.allow_immutable_unmounts {
        // The host administrator retains control: a caller outside the
        // container's mount-ns may proceed.
        if !caller_in_container_mnt_ns(ctx) {
            return Ok(SyscallResult::Continue);
        }
        tracing::info!(
            cntr = ctx.cntr.id(),
            target = %target.display(),
            "denying unmount of immutable mount"
        );
        return Ok(SyscallResult::Error(Errno::EPERM));
    }

    Ok(SyscallResult::Continue)
}

fn base_umount(
    ctx: &SyscallCtx<'_>,
    snap: &MountInfoSnapshot,
    svc: &MountService,
    entry: &MountEntry,
    flags: i32,
) -> Result<SyscallResult, Errno> {
    // The container's own /proc and /sys feed the inner bind-mounts; they
    // stay while the caller's root is "/".
    let root = ctx.process.root_path().map_err(|_| Errno::EINVAL)?;
    let top_level =
        entry.mount_point == Path::new("/proc") || entry.mount_point == Path::new("/sys");
    if top_level && root == Path::new("/") {
        return Ok(SyscallResult::Error(Errno::EBUSY));
    }

    let children = snap.children_of(entry.mnt_id);
    if children
        .iter()
        .any(|child| !svc.is_sysboxfs_submount(snap, child, Some(ctx.cntr.as_ref())))
    {
        // Foreign mounts under the base must be unmounted first.
        return Ok(SyscallResult::Error(Errno::EBUSY));
    }

    let umounts = base_umount_payload(entry, &children, flags);
    let umounts = umounts
        .into_iter()
        .map(|mut u| {
            u.target = path_adjust(&ctx.process, &u.target).unwrap_or(u.target);
            u
        })
        .collect();
    ctx.nsexec(NS_ALL, NsRequest::Umount { umounts })?;
    Ok(SyscallResult::Success(0))
}

/// Submounts first, the base last.
pub(crate) fn base_umount_payload(
    base: &MountEntry,
    submounts: &[&MountEntry],
    flags: i32,
) -> Vec<UmountArgs> {
    let mut umounts: Vec<UmountArgs> = submounts
        .iter()
        .map(|sub| UmountArgs {
            target: sub.mount_point.clone(),
            flags,
        })
        .collect();
    umounts.push(UmountArgs {
        target: base.mount_point.clone(),
        flags,
    });
    umounts
}

/// Is the caller inside the container's mount namespace? Immutable-mount
/// protection only applies there.
fn caller_in_container_mnt_ns(ctx: &SyscallCtx<'_>) -> bool {
    let init_pid = ctx.cntr.init_pid();
    if init_pid == 0 {
        return true;
    }
    let init = crate::process::Process::new(init_pid, ctx.services.io.clone());
    match (
        ctx.process.ns_inode(NsKind::Mnt),
        init.ns_inode(NsKind::Mnt),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => true,
    }
}

// MNT_DETACH etc. pass through numerically; referenced here so the flag
// semantics stay visible at the call sites above.
#[allow(dead_code)]
fn detach_requested(flags: i32) -> bool {
    MntFlags::from_bits_truncate(flags).contains(MntFlags::MNT_DETACH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(mnt_id: i32, parent_id: i32, mount_point: &str, fs_type: &str) -> MountEntry {
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
    fn test_payload_orders_submounts_before_base() {
        let base = entry(20, 11, "/proc", "proc");
        let sys = entry(21, 20, "/proc/sys", "fuse");
        let uptime = entry(22, 20, "/proc/uptime", "fuse");

        let umounts = base_umount_payload(&base, &[&sys, &uptime], 0);
        let targets: Vec<&Path> = umounts.iter().map(|u| u.target.as_path()).collect();
        assert_eq!(
            targets,
            vec![
                Path::new("/proc/sys"),
                Path::new("/proc/uptime"),
                Path::new("/proc")
            ]
        );
    }

    #[test]
    fn test_payload_carries_flags() {
        let base = entry(20, 11, "/proc", "proc");
        let umounts = base_umount_payload(&base, &[], libc::MNT_DETACH);
        assert_eq!(umounts.len(), 1);
        assert!(detach_requested(umounts[0].flags));
    }
}
