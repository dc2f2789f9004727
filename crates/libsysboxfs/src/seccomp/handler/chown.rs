//! chown/fchown/fchownat processing. The single rewritten case: chowning
//! `/sys` inside the container reports success without touching anything.
//! `/sys` is host-root owned and shows as nobody:nogroup, and package
//! managers (RPM notably) chown it to root:root at startup and would
//! otherwise fail with EPERM.

use std::path::{Path, PathBuf};

use nix::errno::Errno;

use super::{sanitize_path, SyscallCtx};
use crate::seccomp::SyscallResult;

pub(super) fn process_chown(ctx: &SyscallCtx<'_>, _follow: bool) -> SyscallResult {
    let path = match ctx.path_arg(0) {
        Ok(path) => path,
        Err(errno) => return SyscallResult::Error(errno),
    };
    decide(ctx, Some(&path), None)
}

pub(super) fn process_fchown(ctx: &SyscallCtx<'_>) -> SyscallResult {
    let fd = ctx.arg(0) as i32;
    decide(ctx, None, Some(fd))
}

pub(super) fn process_fchownat(ctx: &SyscallCtx<'_>) -> SyscallResult {
    let dirfd = ctx.arg(0) as i32;
    let path = match ctx.opt_str_arg(1) {
        Ok(path) => path.map(PathBuf::from),
        Err(errno) => return SyscallResult::Error(errno),
    };
    let at_flags = ctx.arg(4) as i32;

    match path {
        // AT_EMPTY_PATH with an empty (or NULL) path operates on the dirfd
        // itself, like fchown.
        None => decide(ctx, None, Some(dirfd)),
        Some(path) if path.as_os_str().is_empty() => {
            if at_flags & libc::AT_EMPTY_PATH != 0 {
                decide(ctx, None, Some(dirfd))
            } else {
                SyscallResult::Error(Errno::ENOENT)
            }
        }
        Some(path) if path.is_relative() => {
            let base = if dirfd == libc::AT_FDCWD {
                ctx.process.cwd()
            } else {
                ctx.process.fd_path(dirfd)
            };
            match base {
                Ok(base) => decide(ctx, Some(&base.join(path)), None),
                Err(_) => SyscallResult::Error(Errno::EINVAL),
            }
        }
        Some(path) => decide(ctx, Some(&path), None),
    }
}

fn decide(ctx: &SyscallCtx<'_>, path: Option<&Path>, fd: Option<i32>) -> SyscallResult {
    let resolved = match (path, fd) {
        (Some(path), _) => match resolve(ctx, path) {
            Ok(resolved) => resolved,
            Err(errno) => return SyscallResult::Error(errno),
        },
        (None, Some(fd)) => match ctx.process.fd_path(fd) {
            Ok(resolved) => resolved,
            // Pipes, sockets: nothing sysbox-fs cares about.
            Err(_) => return SyscallResult::Continue,
        },
        (None, None) => return SyscallResult::Continue,
    };

    if resolved == Path::new("/sys") {
        return SyscallResult::Success(0);
    }
    SyscallResult::Continue
}

fn resolve(ctx: &SyscallCtx<'_>, path: &Path) -> Result<PathBuf, Errno> {
    let path = sanitize_path(&ctx.process, path)?;
    // `/proc/<pid>/fd/N` forms dereference to the open file.
    let fd_prefix = PathBuf::from(format!("/proc/{}/fd", ctx.process.pid()));
    if let Ok(rest) = path.strip_prefix(&fd_prefix) {
        if let Some(fd) = rest.to_str().and_then(|s| s.parse::<i32>().ok()) {
            return ctx.process.fd_path(fd).map_err(|_| Errno::EBADF);
        }
    }
    Ok(normalize(&path))
}

/// Lexical cleanup: "/sys/" and "/sys/." must compare equal to "/sys".
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for comp in path.components() {
        match comp {
            std::path::Component::RootDir | std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/sys/")), Path::new("/sys"));
        assert_eq!(normalize(Path::new("/sys/.")), Path::new("/sys"));
        assert_eq!(normalize(Path::new("/a/b/../c")), Path::new("/a/c"));
        assert_eq!(normalize(Path::new("/../sys")), Path::new("/sys"));
    }
}
