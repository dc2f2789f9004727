//! Dispatch of trapped syscalls to their per-syscall processors.

mod chown;
mod mount;
mod openat2;
mod umount;
mod xattr;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;

use super::notify::{NotifyFd, SeccompNotif};
use super::tracee::TraceeMem;
use super::{Services, SyscallResult};
use crate::container::Container;
use crate::nsenter::message::{NsRequest, NsResponse};
use crate::nsenter::NsenterEvent;
use crate::process::{NsKind, Process};

/// Everything a processor needs about one notification.
pub struct SyscallCtx<'a> {
    pub notif: SeccompNotif,
    pub services: &'a Services,
    pub process: Process,
    pub cntr: Arc<Container>,
    pub mem: TraceeMem,
    pub notify_fd: &'a NotifyFd,
}

impl SyscallCtx<'_> {
    pub fn arg(&self, n: usize) -> u64 {
        self.notif.data.args[n]
    }

    /// Path argument at `args[n]`.
    pub fn path_arg(&self, n: usize) -> Result<PathBuf, Errno> {
        Ok(PathBuf::from(self.mem.read_cstring(self.arg(n))?))
    }

    /// Optional string argument; NULL reads as None.
    pub fn opt_str_arg(&self, n: usize) -> Result<Option<String>, Errno> {
        if self.arg(n) == 0 {
            return Ok(None);
        }
        Ok(Some(self.mem.read_cstring(self.arg(n))?))
    }

    /// Run an nsenter event against the tracee's namespaces, mapping
    /// infrastructure failures to EINVAL per the error policy.
    pub fn nsexec(&self, namespaces: &[NsKind], req: NsRequest) -> Result<NsResponse, Errno> {
        let mut event = NsenterEvent::new(self.process.pid(), namespaces, req);
        match event.send() {
            Ok(NsResponse::Error { errno }) => Err(Errno::from_raw(errno)),
            Ok(resp) => Ok(resp),
            Err(err) => {
                tracing::warn!(
                    pid = self.process.pid(),
                    cntr = self.cntr.id(),
                    ?err,
                    "nsenter round-trip failed"
                );
                Err(Errno::EINVAL)
            }
        }
    }

    /// Like `nsexec` but the event's passed-back fds are wanted.
    pub fn nsexec_with_fds(
        &self,
        namespaces: &[NsKind],
        req: NsRequest,
    ) -> Result<(NsResponse, Vec<std::os::fd::OwnedFd>), Errno> {
        let mut event = NsenterEvent::new(self.process.pid(), namespaces, req);
        match event.send() {
            Ok(NsResponse::Error { errno }) => Err(Errno::from_raw(errno)),
            Ok(resp) => Ok((resp, event.take_received_fds())),
            Err(err) => {
                tracing::warn!(
                    pid = self.process.pid(),
                    cntr = self.cntr.id(),
                    ?err,
                    "nsenter round-trip failed"
                );
                Err(Errno::EINVAL)
            }
        }
    }
}

/// Rewrite `/proc/self`, make the path absolute against the caller's cwd,
/// and prefix the caller's root when it is chroot'ed away from `/`.
pub fn sanitize_path(process: &Process, raw: &Path) -> Result<PathBuf, Errno> {
    let path = process.resolve_proc_self(raw);
    let path = if path.is_relative() {
        let cwd = process.cwd().map_err(|_| Errno::EINVAL)?;
        cwd.join(path)
    } else {
        path
    };
    Ok(path)
}

/// The caller's root prefix, for operations the helper performs from
/// outside a chroot.
pub fn path_adjust(process: &Process, path: &Path) -> Result<PathBuf, Errno> {
    let root = process.root_path().map_err(|_| Errno::EINVAL)?;
    if root == Path::new("/") {
        return Ok(path.to_path_buf());
    }
    let rel = path.strip_prefix("/").unwrap_or(path);
    Ok(root.join(rel))
}

/// Route one notification to its processor. Syscalls not listed here are
/// never trapped by the filter the runtime installs.
pub fn process_syscall(ctx: &SyscallCtx<'_>) -> SyscallResult {
    let nr = i64::from(ctx.notif.data.nr);
    match nr {
        n if n == libc::SYS_mount => mount::process(ctx),
        n if n == libc::SYS_umount2 => umount::process(ctx),
        n if n == libc::SYS_fchownat => chown::process_fchownat(ctx),
        n if n == libc::SYS_fchown => chown::process_fchown(ctx),
        #[cfg(target_arch = "x86_64")]
        n if n == libc::SYS_chown => chown::process_chown(ctx, true),
        #[cfg(target_arch = "x86_64")]
        n if n == libc::SYS_lchown => chown::process_chown(ctx, false),
        n if n == libc::SYS_setxattr => xattr::process_set(ctx, true),
        n if n == libc::SYS_lsetxattr => xattr::process_set(ctx, false),
        n if n == libc::SYS_fsetxattr => xattr::process_fset(ctx),
        n if n == libc::SYS_getxattr => xattr::process_get(ctx, true),
        n if n == libc::SYS_lgetxattr => xattr::process_get(ctx, false),
        n if n == libc::SYS_fgetxattr => xattr::process_fget(ctx),
        n if n == libc::SYS_removexattr => xattr::process_remove(ctx, true),
        n if n == libc::SYS_lremovexattr => xattr::process_remove(ctx, false),
        n if n == libc::SYS_fremovexattr => xattr::process_fremove(ctx),
        n if n == libc::SYS_listxattr => xattr::process_list(ctx, true),
        n if n == libc::SYS_llistxattr => xattr::process_list(ctx, false),
        n if n == libc::SYS_flistxattr => xattr::process_flist(ctx),
        n if n == libc::SYS_openat2 => openat2::process(ctx),
        n if n == libc::SYS_reboot => process_reboot(ctx),
        n if n == libc::SYS_swapon || n == libc::SYS_swapoff => SyscallResult::Error(Errno::EPERM),
        _ => {
            tracing::warn!(nr, pid = ctx.process.pid(), "unexpected trapped syscall");
            SyscallResult::Continue
        }
    }
}

/// Rebooting the host from a container is never meaningful; capable callers
/// get a silent success (systemd expects it), everyone else EPERM.
fn process_reboot(ctx: &SyscallCtx<'_>) -> SyscallResult {
    match ctx.process.is_capable(caps::Capability::CAP_SYS_BOOT) {
        Ok(true) => SyscallResult::Success(0),
        Ok(false) => SyscallResult::Error(Errno::EPERM),
        Err(_) => SyscallResult::Error(Errno::EINVAL),
    }
}
