//! *xattr* processing. The kernel refuses `trusted.*` from a non-initial
//! user-ns; sysbox-fs knows the container is confined by its mount tree, so
//! `trusted.overlay.opaque` is re-executed as root in the container's
//! namespaces (minus the user-ns). Everything else passes through, except
//! that listxattr results are filtered by the caller's capabilities.

use std::path::PathBuf;

use nix::errno::Errno;

use super::{sanitize_path, SyscallCtx};
use crate::nsenter::message::{NsRequest, NsResponse};
use crate::process::NS_ALL_BUT_USER;
use crate::seccomp::SyscallResult;

const ALLOWED_NAME: &str = "trusted.overlay.opaque";
const LIST_PROBE_SIZE: usize = 64 * 1024;

pub(super) fn process_set(ctx: &SyscallCtx<'_>, follow: bool) -> SyscallResult {
    let (path, name) = match path_and_name(ctx, 0, 1) {
        Ok(parsed) => parsed,
        Err(errno) => return SyscallResult::Error(errno),
    };
    if name != ALLOWED_NAME {
        return SyscallResult::Continue;
    }
    if let Err(result) = require_sys_admin(ctx) {
        return result;
    }

    let value = match ctx.mem.read_bytes(ctx.arg(2), ctx.arg(3) as usize) {
        Ok(value) => value,
        Err(errno) => return SyscallResult::Error(errno),
    };
    let flags = ctx.arg(4) as i32;
    match ctx.nsexec(
        NS_ALL_BUT_USER,
        NsRequest::SetXattr {
            path,
            name,
            value,
            flags,
            follow,
        },
    ) {
        Ok(_) => SyscallResult::Success(0),
        Err(errno) => SyscallResult::Error(errno),
    }
}

pub(super) fn process_fset(ctx: &SyscallCtx<'_>) -> SyscallResult {
    with_fd_path(ctx, |path| {
        let name = match ctx.mem.read_cstring(ctx.arg(1)) {
            Ok(name) => name,
            Err(errno) => return SyscallResult::Error(errno),
        };
        if name != ALLOWED_NAME {
            return SyscallResult::Continue;
        }
        if let Err(result) = require_sys_admin(ctx) {
            return result;
        }
        let value = match ctx.mem.read_bytes(ctx.arg(2), ctx.arg(3) as usize) {
            Ok(value) => value,
            Err(errno) => return SyscallResult::Error(errno),
        };
        let flags = ctx.arg(4) as i32;
        match ctx.nsexec(
            NS_ALL_BUT_USER,
            NsRequest::SetXattr {
                path,
                name,
                value,
                flags,
                follow: true,
            },
        ) {
            Ok(_) => SyscallResult::Success(0),
            Err(errno) => SyscallResult::Error(errno),
        }
    })
}

pub(super) fn process_get(ctx: &SyscallCtx<'_>, follow: bool) -> SyscallResult {
    let (path, name) = match path_and_name(ctx, 0, 1) {
        Ok(parsed) => parsed,
        Err(errno) => return SyscallResult::Error(errno),
    };
    if name != ALLOWED_NAME {
        return SyscallResult::Continue;
    }
    get_common(ctx, path, name, follow)
}

pub(super) fn process_fget(ctx: &SyscallCtx<'_>) -> SyscallResult {
    with_fd_path(ctx, |path| {
        let name = match ctx.mem.read_cstring(ctx.arg(1)) {
            Ok(name) => name,
            Err(errno) => return SyscallResult::Error(errno),
        };
        if name != ALLOWED_NAME {
            return SyscallResult::Continue;
        }
        get_common(ctx, path, name, true)
    })
}

fn get_common(ctx: &SyscallCtx<'_>, path: PathBuf, name: String, follow: bool) -> SyscallResult {
    if let Err(result) = require_sys_admin(ctx) {
        return result;
    }
    let buf_addr = ctx.arg(2);
    let size = ctx.arg(3) as usize;

    let resp = match ctx.nsexec(
        NS_ALL_BUT_USER,
        NsRequest::GetXattr {
            path,
            name,
            size,
            follow,
        },
    ) {
        Ok(resp) => resp,
        Err(errno) => return SyscallResult::Error(errno),
    };
    match resp {
        NsResponse::XattrLen { len } => SyscallResult::Success(len as i64),
        NsResponse::Bytes { data } => {
            // Clamp to the caller's buffer and write the bytes back into
            // the tracee at the user-supplied pointer.
            let n = data.len().min(size);
            if n > 0 {
                if let Err(errno) = ctx.mem.write_bytes(buf_addr, &data[..n]) {
                    return SyscallResult::Error(errno);
                }
            }
            SyscallResult::Success(data.len() as i64)
        }
        _ => SyscallResult::Error(Errno::EINVAL),
    }
}

pub(super) fn process_remove(ctx: &SyscallCtx<'_>, follow: bool) -> SyscallResult {
    let (path, name) = match path_and_name(ctx, 0, 1) {
        Ok(parsed) => parsed,
        Err(errno) => return SyscallResult::Error(errno),
    };
    if name != ALLOWED_NAME {
        return SyscallResult::Continue;
    }
    if let Err(result) = require_sys_admin(ctx) {
        return result;
    }
    match ctx.nsexec(
        NS_ALL_BUT_USER,
        NsRequest::RemoveXattr { path, name, follow },
    ) {
        Ok(_) => SyscallResult::Success(0),
        Err(errno) => SyscallResult::Error(errno),
    }
}

pub(super) fn process_fremove(ctx: &SyscallCtx<'_>) -> SyscallResult {
    with_fd_path(ctx, |path| {
        let name = match ctx.mem.read_cstring(ctx.arg(1)) {
            Ok(name) => name,
            Err(errno) => return SyscallResult::Error(errno),
        };
        if name != ALLOWED_NAME {
            return SyscallResult::Continue;
        }
        if let Err(result) = require_sys_admin(ctx) {
            return result;
        }
        match ctx.nsexec(
            NS_ALL_BUT_USER,
            NsRequest::RemoveXattr {
                path,
                name,
                follow: true,
            },
        ) {
            Ok(_) => SyscallResult::Success(0),
            Err(errno) => SyscallResult::Error(errno),
        }
    })
}

pub(super) fn process_list(ctx: &SyscallCtx<'_>, follow: bool) -> SyscallResult {
    let path = match ctx.path_arg(0).and_then(|p| sanitize_path(&ctx.process, &p)) {
        Ok(path) => path,
        Err(errno) => return SyscallResult::Error(errno),
    };
    list_common(ctx, path, follow)
}

pub(super) fn process_flist(ctx: &SyscallCtx<'_>) -> SyscallResult {
    with_fd_path(ctx, |path| list_common(ctx, path, true))
}

fn list_common(ctx: &SyscallCtx<'_>, path: PathBuf, follow: bool) -> SyscallResult {
    let buf_addr = ctx.arg(1);
    let size = ctx.arg(2) as usize;

    let resp = match ctx.nsexec(
        NS_ALL_BUT_USER,
        NsRequest::ListXattr {
            path,
            size: LIST_PROBE_SIZE,
            follow,
        },
    ) {
        Ok(resp) => resp,
        Err(errno) => return SyscallResult::Error(errno),
    };
    let raw = match resp {
        NsResponse::Bytes { data } => data,
        NsResponse::XattrLen { len } => return SyscallResult::Success(len as i64),
        _ => return SyscallResult::Error(Errno::EINVAL),
    };

    let sys_admin = ctx
        .process
        .is_capable(caps::Capability::CAP_SYS_ADMIN)
        .unwrap_or(false);
    let setfcap = ctx
        .process
        .is_capable(caps::Capability::CAP_SETFCAP)
        .unwrap_or(false);
    let filtered = filter_names(&raw, sys_admin, setfcap);

    if size == 0 {
        return SyscallResult::Success(filtered.len() as i64);
    }
    if filtered.len() > size {
        return SyscallResult::Error(Errno::ERANGE);
    }
    if !filtered.is_empty() {
        if let Err(errno) = ctx.mem.write_bytes(buf_addr, &filtered) {
            return SyscallResult::Error(errno);
        }
    }
    SyscallResult::Success(filtered.len() as i64)
}

/// Drop `trusted.*` names the caller may not see and `security.capability`
/// when it cannot manage file capabilities.
pub(crate) fn filter_names(raw: &[u8], cap_sys_admin: bool, cap_setfcap: bool) -> Vec<u8> {
    let mut out = vec![];
    for name in raw.split(|b| *b == 0).filter(|n| !n.is_empty()) {
        let text = String::from_utf8_lossy(name);
        if text.starts_with("trusted.") && !cap_sys_admin {
            continue;
        }
        if text.starts_with("security.capability") && !cap_setfcap {
            continue;
        }
        out.extend_from_slice(name);
        out.push(0);
    }
    out
}

fn path_and_name(
    ctx: &SyscallCtx<'_>,
    path_arg: usize,
    name_arg: usize,
) -> Result<(PathBuf, String), Errno> {
    let path = sanitize_path(&ctx.process, &ctx.path_arg(path_arg)?)?;
    let name = ctx.mem.read_cstring(ctx.arg(name_arg))?;
    Ok((path, name))
}

fn with_fd_path<F>(ctx: &SyscallCtx<'_>, f: F) -> SyscallResult
where
    F: FnOnce(PathBuf) -> SyscallResult,
{
    let fd = ctx.arg(0) as i32;
    match ctx.process.fd_path(fd) {
        Ok(path) => f(path),
        Err(_) => SyscallResult::Continue,
    }
}

fn require_sys_admin(ctx: &SyscallCtx<'_>) -> Result<(), SyscallResult> {
    match ctx.process.is_capable(caps::Capability::CAP_SYS_ADMIN) {
        Ok(true) => Ok(()),
        Ok(false) => Err(SyscallResult::Error(Errno::EPERM)),
        Err(_) => Err(SyscallResult::Error(Errno::EINVAL)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<u8> {
        let mut out = vec![];
        for name in list {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        out
    }

    #[test]
    fn test_filter_drops_trusted_without_sys_admin() {
        let raw = names(&["user.foo", "trusted.overlay.opaque", "system.posix_acl_access"]);
        let filtered = filter_names(&raw, false, true);
        assert_eq!(filtered, names(&["user.foo", "system.posix_acl_access"]));
    }

    #[test]
    fn test_filter_keeps_trusted_with_sys_admin() {
        let raw = names(&["trusted.overlay.opaque", "user.foo"]);
        let filtered = filter_names(&raw, true, true);
        assert_eq!(filtered, raw);
    }

    #[test]
    fn test_filter_security_capability_needs_setfcap() {
        let raw = names(&["security.capability", "security.selinux"]);
        let filtered = filter_names(&raw, true, false);
        assert_eq!(filtered, names(&["security.selinux"]));
    }

    #[test]
    fn test_filter_empty_input() {
        assert!(filter_names(&[], false, false).is_empty());
    }
}
