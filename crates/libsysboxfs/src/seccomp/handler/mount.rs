//! mount(2) processing. New procfs/sysfs mounts are expanded into the base
//! mount plus the sysbox-fs submount layer; remounts and non-recursive
//! binds over managed mounts are rewritten; everything else passes through.

use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::mount::MsFlags;

use super::{path_adjust, sanitize_path, SyscallCtx};
use crate::container::Container;
use crate::mount::flags::ro_submount_extra_flags;
use crate::mount::{MountEntry, MountInfoSnapshot};
use crate::nsenter::message::{MountArgs, NsRequest};
use crate::process::{AccessMode, NS_ALL, NS_ALL_BUT_USER};
use crate::seccomp::SyscallResult;

const PROPAGATION_FLAGS: MsFlags = MsFlags::MS_SHARED
    .union(MsFlags::MS_PRIVATE)
    .union(MsFlags::MS_SLAVE)
    .union(MsFlags::MS_UNBINDABLE);

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

    let source = ctx.opt_str_arg(0)?.map(PathBuf::from).unwrap_or_default();
    let target = ctx.path_arg(1)?;
    let fs_type = ctx.opt_str_arg(2)?;
    let flags = MsFlags::from_bits_truncate(ctx.arg(3));
    let data = ctx.opt_str_arg(4)?;

    let source = if source.as_os_str().is_empty() {
        source
    } else {
        sanitize_path(&ctx.process, &source)?
    };
    let target = sanitize_path(&ctx.process, &target)?;

    if let Err(err) = ctx.process.path_access(&target, AccessMode::R) {
        if let crate::process::ProcessError::Access { errno, .. } = err {
            return Ok(SyscallResult::Error(errno));
        }
        return Err(Errno::EINVAL);
    }

    if flags.contains(MsFlags::MS_REMOUNT) {
        return remount(ctx, &target, flags, data);
    }
    if flags.contains(MsFlags::MS_MOVE) || flags.intersects(PROPAGATION_FLAGS) {
        return Ok(SyscallResult::Continue);
    }
    if flags.contains(MsFlags::MS_BIND) {
        return bind(ctx, &source, &target, flags);
    }

    match fs_type.as_deref() {
        Some("proc") => new_base_mount(ctx, "proc", &target, flags, data),
        Some("sysfs") => new_base_mount(ctx, "sysfs", &target, flags, data),
        // Unprivileged containers cannot mount these; the helper carries
        // host credentials by staying out of the user-ns.
        Some("overlay") | Some("nfs") | Some("nfs4") => {
            let adjusted = path_adjust(&ctx.process, &target)?;
            let mounts = vec![MountArgs {
                source,
                target: adjusted,
                fs_type,
                flags: flags.bits(),
                data,
            }];
            ctx.nsexec(NS_ALL_BUT_USER, NsRequest::Mount { mounts })?;
            Ok(SyscallResult::Success(0))
        }
        _ => Ok(SyscallResult::Continue),
    }
}

fn new_base_mount(
    ctx: &SyscallCtx<'_>,
    fs_type: &str,
    target: &Path,
    flags: MsFlags,
    data: Option<String>,
) -> Result<SyscallResult, Errno> {
    let adjusted = path_adjust(&ctx.process, target)?;
    let fuse_dir = ctx.services.fuse_mountpoint.join(ctx.cntr.id());

    let mounts = if fs_type == "proc" {
        let io = ctx.services.io.clone();
        proc_mount_payload(
            &fuse_dir,
            &ctx.services.mounts.proc_bind_paths(),
            &ctx.cntr.proc_ro_paths(),
            &ctx.cntr.proc_mask_paths(),
            &adjusted,
            flags,
            data,
            &|virtual_path| {
                io.new_node("", virtual_path, OFlag::O_RDONLY, 0)
                    .stat()
                    .is_ok()
            },
        )
    } else {
        sysfs_mount_payload(
            &fuse_dir,
            &ctx.services.mounts.sys_bind_paths(),
            &adjusted,
            flags,
            data,
        )
    };

    ctx.nsexec(NS_ALL, NsRequest::Mount { mounts })?;

    // A read-write mount is chowned to the caller so it does not show up as
    // nobody:nogroup. Read-only mounts keep the nobody owner: fixing them
    // up would take three nested re-execs and is deferred.
    if !flags.contains(MsFlags::MS_RDONLY) {
        let uid = ctx.process.uid().map_err(|_| Errno::EINVAL)?;
        let gid = ctx.process.gid().map_err(|_| Errno::EINVAL)?;
        if let Err(errno) = ctx.nsexec(
            NS_ALL_BUT_USER,
            NsRequest::Chown {
                path: adjusted,
                uid: Some(uid),
                gid: Some(gid),
                follow: true,
            },
        ) {
            tracing::warn!(cntr = ctx.cntr.id(), ?errno, "failed to chown new mount");
        }
    }
    Ok(SyscallResult::Success(0))
}

/// Payload for a fresh procfs mount: the base mount, one bind per
/// registered submount, the container's ro and mask overlays, and the
/// read-only remount chain when the caller asked for MS_RDONLY.
#[allow(clippy::too_many_arguments)]
pub(crate) fn proc_mount_payload(
    fuse_cntr_dir: &Path,
    bind_paths: &[PathBuf],
    ro_paths: &[PathBuf],
    mask_paths: &[PathBuf],
    target: &Path,
    flags: MsFlags,
    data: Option<String>,
    ro_path_exists: &dyn Fn(&Path) -> bool,
) -> Vec<MountArgs> {
    let mut mounts = vec![MountArgs {
        source: PathBuf::from("proc"),
        target: target.to_path_buf(),
        fs_type: Some("proc".to_string()),
        flags: flags.bits(),
        data,
    }];

    let mut managed_targets = vec![];
    for path in bind_paths {
        let rel = match path.strip_prefix("/proc") {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let bind_target = target.join(rel);
        mounts.push(MountArgs {
            source: fuse_cntr_dir.join("proc").join(rel),
            target: bind_target.clone(),
            fs_type: None,
            flags: MsFlags::MS_BIND.bits(),
            data: None,
        });
        managed_targets.push(bind_target);
    }

    for path in ro_paths {
        if !ro_path_exists(path) {
            continue;
        }
        let rel = match path.strip_prefix("/proc") {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let ro_target = target.join(rel);
        mounts.push(MountArgs {
            source: ro_target.clone(),
            target: ro_target.clone(),
            fs_type: None,
            flags: MsFlags::MS_BIND.bits(),
            data: None,
        });
        mounts.push(MountArgs {
            source: ro_target.clone(),
            target: ro_target,
            fs_type: None,
            flags: (MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY).bits(),
            data: None,
        });
    }

    for path in mask_paths {
        let rel = match path.strip_prefix("/proc") {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        mounts.push(MountArgs {
            source: PathBuf::from("/dev/null"),
            target: target.join(rel),
            fs_type: None,
            flags: MsFlags::MS_BIND.bits(),
            data: None,
        });
    }

    if flags.contains(MsFlags::MS_RDONLY) {
        for bind_target in managed_targets {
            mounts.push(MountArgs {
                source: bind_target.clone(),
                target: bind_target,
                fs_type: None,
                flags: (MsFlags::MS_BIND
                    | MsFlags::MS_REMOUNT
                    | MsFlags::MS_RDONLY
                    | ro_submount_extra_flags())
                .bits(),
                data: None,
            });
        }
    }
    mounts
}

pub(crate) fn sysfs_mount_payload(
    fuse_cntr_dir: &Path,
    bind_paths: &[PathBuf],
    target: &Path,
    flags: MsFlags,
    data: Option<String>,
) -> Vec<MountArgs> {
    let mut mounts = vec![MountArgs {
        source: PathBuf::from("sysfs"),
        target: target.to_path_buf(),
        fs_type: Some("sysfs".to_string()),
        flags: flags.bits(),
        data,
    }];
    let mut managed_targets = vec![];
    for path in bind_paths {
        let rel = match path.strip_prefix("/sys") {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let bind_target = target.join(rel);
        mounts.push(MountArgs {
            source: fuse_cntr_dir.join("sys").join(rel),
            target: bind_target.clone(),
            fs_type: None,
            flags: MsFlags::MS_BIND.bits(),
            data: None,
        });
        managed_targets.push(bind_target);
    }
    if flags.contains(MsFlags::MS_RDONLY) {
        for bind_target in managed_targets {
            mounts.push(MountArgs {
                source: bind_target.clone(),
                target: bind_target,
                fs_type: None,
                flags: (MsFlags::MS_BIND
                    | MsFlags::MS_REMOUNT
                    | MsFlags::MS_RDONLY
                    | ro_submount_extra_flags())
                .bits(),
                data: None,
            });
        }
    }
    mounts
}

fn remount(
    ctx: &SyscallCtx<'_>,
    target: &Path,
    flags: MsFlags,
    data: Option<String>,
) -> Result<SyscallResult, Errno> {
    let snap = MountInfoSnapshot::for_pid(ctx.process.pid()).map_err(|_| Errno::EINVAL)?;
    let entry = match snap.by_mountpoint(target) {
        Some(entry) => entry,
        None => return Ok(SyscallResult::Continue),
    };
    let svc = &ctx.services.mounts;

    let wants_rw = !flags.contains(MsFlags::MS_RDONLY);
    if wants_rw
        && svc.is_immutable_ro_mount(&ctx.cntr, entry)
        && !ctx.services.allow_immutable_remounts
    {
        tracing::info!(
            cntr = ctx.cntr.id(),
            target = %target.display(),
            "denying read-write remount of immutable mount"
        );
        return Ok(SyscallResult::Error(Errno::EPERM));
    }

    let mounts = if svc.is_sysboxfs_base_mount(entry) {
        let submounts: Vec<&MountEntry> = snap
            .children_of(entry.mnt_id)
            .into_iter()
            .filter(|child| svc.is_sysboxfs_submount(&snap, child, Some(ctx.cntr.as_ref())))
            .collect();
        remount_payload(entry, &submounts, flags, data, &ctx.cntr)
    } else {
        vec![MountArgs {
            source: PathBuf::new(),
            target: entry.mount_point.clone(),
            fs_type: None,
            flags: flags.bits(),
            data,
        }]
    };

    // Host credentials are required for the kernel to honour the remount,
    // so the helper stays out of the user-ns.
    ctx.nsexec(NS_ALL_BUT_USER, NsRequest::Mount { mounts })?;
    Ok(SyscallResult::Success(0))
}

/// Expand a remount of a base mount over the base and every managed
/// submount. Submounts keep their own flags, gain MS_REMOUNT|MS_BIND, and
/// inherit the base's new ro bit; submounts that are read-only by origin
/// (the container's ro overlays) keep ro regardless.
pub(crate) fn remount_payload(
    base: &MountEntry,
    submounts: &[&MountEntry],
    req_flags: MsFlags,
    data: Option<String>,
    cntr: &Container,
) -> Vec<MountArgs> {
    let mut mounts = vec![MountArgs {
        source: PathBuf::new(),
        target: base.mount_point.clone(),
        fs_type: None,
        flags: (req_flags | MsFlags::MS_REMOUNT).bits(),
        data,
    }];

    let virtual_root = if base.fs_type == "proc" { "/proc" } else { "/sys" };
    let ro_paths = cntr.proc_ro_paths();
    for sub in submounts {
        let mut sub_flags = sub.mount_flags() | MsFlags::MS_REMOUNT | MsFlags::MS_BIND;
        let originally_ro = sub
            .mount_point
            .strip_prefix(&base.mount_point)
            .ok()
            .map(|rel| Path::new(virtual_root).join(rel))
            .map(|v| ro_paths.contains(&v))
            .unwrap_or(false);
        if req_flags.contains(MsFlags::MS_RDONLY) || originally_ro {
            sub_flags |= MsFlags::MS_RDONLY;
        } else {
            sub_flags &= !MsFlags::MS_RDONLY;
        }
        mounts.push(MountArgs {
            source: sub.mount_point.clone(),
            target: sub.mount_point.clone(),
            fs_type: None,
            flags: sub_flags.bits(),
            data: None,
        });
    }
    mounts
}

fn bind(
    ctx: &SyscallCtx<'_>,
    source: &Path,
    target: &Path,
    flags: MsFlags,
) -> Result<SyscallResult, Errno> {
    // Recursive binds are the kernel's business: it copies submounts.
    if flags.contains(MsFlags::MS_REC) {
        return Ok(SyscallResult::Continue);
    }
    let snap = MountInfoSnapshot::for_pid(ctx.process.pid()).map_err(|_| Errno::EINVAL)?;
    let svc = &ctx.services.mounts;

    // Bind-to-self over a managed submount: it already is a bind.
    if source == target {
        if let Some(entry) = snap.by_mountpoint(target) {
            if svc.is_sysboxfs_submount(&snap, entry, Some(ctx.cntr.as_ref())) {
                return Ok(SyscallResult::Success(0));
            }
        }
    }

    // Masking an already-masked submount is likewise a no-op.
    if source == Path::new("/dev/null") {
        if let Some(entry) = snap.by_mountpoint(target) {
            if svc.is_sysboxfs_masked_submount(&snap, entry, Some(ctx.cntr.as_ref())) {
                return Ok(SyscallResult::Success(0));
            }
        }
    }

    // A non-recursive bind of a base mount will not copy the fuse
    // submounts, so replicate them at the new location ourselves.
    if let Some(src_entry) = snap.by_mountpoint(source) {
        if svc.is_sysboxfs_base_mount(src_entry) {
            let rels: Vec<PathBuf> = svc
                .managed_submount_paths(src_entry, Some(ctx.cntr.as_ref()))
                .iter()
                .filter_map(|p| p.strip_prefix(&src_entry.mount_point).map(Path::to_path_buf).ok())
                .collect();
            let adjusted_target = path_adjust(&ctx.process, target)?;
            let adjusted_source = path_adjust(&ctx.process, source)?;
            let mounts = bind_payload(&rels, &adjusted_source, &adjusted_target, flags);
            ctx.nsexec(NS_ALL, NsRequest::Mount { mounts })?;
            return Ok(SyscallResult::Success(0));
        }
    }

    Ok(SyscallResult::Continue)
}

pub(crate) fn bind_payload(
    rels: &[PathBuf],
    source: &Path,
    target: &Path,
    flags: MsFlags,
) -> Vec<MountArgs> {
    let mut mounts = vec![MountArgs {
        source: source.to_path_buf(),
        target: target.to_path_buf(),
        fs_type: None,
        flags: flags.bits(),
        data: None,
    }];
    for rel in rels {
        mounts.push(MountArgs {
            source: source.join(rel),
            target: target.join(rel),
            fs_type: None,
            flags: MsFlags::MS_BIND.bits(),
            data: None,
        });
    }
    mounts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount_entry(
        mnt_id: i32,
        parent_id: i32,
        mount_point: &str,
        fs_type: &str,
        opts: &str,
    ) -> MountEntry {
        MountEntry {
            mnt_id,
            parent_id,
            root: "/".to_string(),
            mount_point: PathBuf::from(mount_point),
            mount_options: opts.to_string(),
            super_options: String::new(),
            fs_type: fs_type.to_string(),
            source: Some(fs_type.to_string()),
            inode: None,
        }
    }

    #[test]
    fn test_proc_payload_layout() {
        let mounts = proc_mount_payload(
            Path::new("/var/lib/sysboxfs/c1"),
            &[PathBuf::from("/proc/sys"), PathBuf::from("/proc/uptime")],
            &[PathBuf::from("/proc/sys/kernel/core_pattern")],
            &[PathBuf::from("/proc/kcore")],
            Path::new("/root/proc"),
            MsFlags::empty(),
            None,
            &|_| true,
        );

        // Base first.
        assert_eq!(mounts[0].fs_type.as_deref(), Some("proc"));
        assert_eq!(mounts[0].target, Path::new("/root/proc"));

        // Registered binds come from the container's fuse tree.
        assert_eq!(mounts[1].source, Path::new("/var/lib/sysboxfs/c1/proc/sys"));
        assert_eq!(mounts[1].target, Path::new("/root/proc/sys"));
        assert_eq!(mounts[2].target, Path::new("/root/proc/uptime"));

        // Ro path: bind-to-self then ro remount.
        assert_eq!(mounts[3].target, Path::new("/root/proc/sys/kernel/core_pattern"));
        assert_eq!(mounts[3].flags, MsFlags::MS_BIND.bits());
        let ro = MsFlags::from_bits_truncate(mounts[4].flags);
        assert!(ro.contains(MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY));

        // Mask path: /dev/null bind.
        assert_eq!(mounts[5].source, Path::new("/dev/null"));
        assert_eq!(mounts[5].target, Path::new("/root/proc/kcore"));

        // Not read-only: no trailing ro chain.
        assert_eq!(mounts.len(), 6);
    }

    #[test]
    fn test_proc_payload_ro_chain() {
        let mounts = proc_mount_payload(
            Path::new("/var/lib/sysboxfs/c1"),
            &[PathBuf::from("/proc/sys")],
            &[],
            &[],
            Path::new("/root/proc"),
            MsFlags::MS_RDONLY,
            None,
            &|_| true,
        );
        let last = mounts.last().unwrap();
        assert_eq!(last.target, Path::new("/root/proc/sys"));
        let flags = MsFlags::from_bits_truncate(last.flags);
        assert!(flags.contains(
            MsFlags::MS_REMOUNT
                | MsFlags::MS_BIND
                | MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV
                | MsFlags::MS_NOEXEC
        ));
    }

    #[test]
    fn test_proc_payload_skips_missing_ro_paths() {
        let mounts = proc_mount_payload(
            Path::new("/var/lib/sysboxfs/c1"),
            &[],
            &[PathBuf::from("/proc/sys/kernel/core_pattern")],
            &[],
            Path::new("/proc"),
            MsFlags::empty(),
            None,
            &|_| false,
        );
        assert_eq!(mounts.len(), 1);
    }

    #[test]
    fn test_remount_payload_expansion() {
        let cntr = Container::new("c1");
        let base = mount_entry(20, 11, "/proc", "proc", "rw,nosuid,nodev,noexec");
        let sys = mount_entry(21, 20, "/proc/sys", "fuse", "rw,nosuid,nodev,noexec");
        let core = mount_entry(22, 20, "/proc/sys/kernel/core_pattern", "fuse", "ro,nosuid");

        // Remount the base read-only: everything inherits ro.
        let mounts = remount_payload(
            &base,
            &[&sys, &core],
            MsFlags::MS_RDONLY | MsFlags::MS_NOSUID,
            None,
            &cntr,
        );
        assert_eq!(mounts.len(), 3);
        let base_flags = MsFlags::from_bits_truncate(mounts[0].flags);
        assert!(base_flags.contains(MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY));
        assert!(!base_flags.contains(MsFlags::MS_BIND));
        for sub in &mounts[1..] {
            let flags = MsFlags::from_bits_truncate(sub.flags);
            assert!(flags.contains(MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY));
        }
    }

    #[test]
    fn test_remount_payload_rw_keeps_original_ro() {
        use crate::container::ContainerData;
        let cntr = Container::new("c1");
        let data = ContainerData {
            id: "c1".to_string(),
            init_pid: 1,
            ctime: chrono::Utc::now(),
            uid_first: 0,
            uid_size: 65536,
            gid_first: 0,
            gid_size: 65536,
            proc_ro_paths: vec![PathBuf::from("/proc/sys/kernel/core_pattern")],
            proc_mask_paths: vec![],
        };
        cntr.fill(&data, None, 1);

        let base = mount_entry(20, 11, "/proc", "proc", "ro,nosuid");
        let sys = mount_entry(21, 20, "/proc/sys", "fuse", "ro,nosuid");
        let core = mount_entry(22, 20, "/proc/sys/kernel/core_pattern", "fuse", "ro,nosuid");

        // Remount back to rw: the ordinary submount flips, the ro overlay
        // keeps its bit.
        let mounts = remount_payload(&base, &[&sys, &core], MsFlags::empty(), None, &cntr);
        let sys_flags = MsFlags::from_bits_truncate(mounts[1].flags);
        assert!(!sys_flags.contains(MsFlags::MS_RDONLY));
        let core_flags = MsFlags::from_bits_truncate(mounts[2].flags);
        assert!(core_flags.contains(MsFlags::MS_RDONLY));
    }

    #[test]
    fn test_bind_payload_replicates_submounts() {
        let mounts = bind_payload(
            &[PathBuf::from("sys"), PathBuf::from("uptime")],
            Path::new("/proc"),
            Path::new("/mnt/proc2"),
            MsFlags::MS_BIND,
        );
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[0].source, Path::new("/proc"));
        assert_eq!(mounts[0].target, Path::new("/mnt/proc2"));
        assert_eq!(mounts[1].source, Path::new("/proc/sys"));
        assert_eq!(mounts[1].target, Path::new("/mnt/proc2/sys"));
        assert_eq!(mounts[2].target, Path::new("/mnt/proc2/uptime"));
    }
}
