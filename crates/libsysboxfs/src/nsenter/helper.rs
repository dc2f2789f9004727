//! Helper-side of the re-exec bridge. Runs after `/proc/self/exe nsenter`:
//! joins the requested namespaces, forks so the payload lands in the target
//! pid-ns, performs exactly one operation and reports the result on fd 3.

use std::ffi::CString;
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::mount::{umount2, MntFlags, MsFlags};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};

use super::channel::Channel;
use super::event::HELPER_FD;
use super::message::{DaemonMsg, HelperInit, MountArgs, NsRequest, NsResponse, UmountArgs};
use crate::io::{NodeEntry, NodeStat};
use crate::mount::MountInfoSnapshot;
use crate::process::NS_JOIN_ORDER;

type HelperChannel = Channel<NsResponse, DaemonMsg>;

/// Entrypoint for the `nsenter` subcommand. Never returns control to the
/// caller's logic; the returned code is the process exit status.
pub fn run() -> i32 {
    let channel: HelperChannel = unsafe { Channel::from_raw_fd(HELPER_FD) };

    let init = match channel.recv() {
        Ok(DaemonMsg::Init(init)) => init,
        Ok(other) => {
            tracing::error!(?other, "expected init message");
            return 1;
        }
        Err(err) => {
            tracing::error!(?err, "failed to read init message");
            return 1;
        }
    };

    if let Err(errno) = join_namespaces(&init) {
        let _ = channel.send(&NsResponse::from_errno(errno));
        return 1;
    }

    // Fork so the payload runs inside the freshly joined pid-ns; this
    // process stays outside it and only reaps.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => code,
            _ => 1,
        },
        Ok(ForkResult::Child) => {
            let code = payload(&channel);
            std::process::exit(code);
        }
        Err(err) => {
            let _ = channel.send(&NsResponse::from_errno(err));
            1
        }
    }
}

fn join_namespaces(init: &HelperInit) -> Result<(), Errno> {
    for kind in NS_JOIN_ORDER {
        if !init.namespaces.contains(kind) {
            continue;
        }
        let path = format!("/proc/{}/ns/{}", init.pid, kind.proc_name());
        let fd = nix::fcntl::open(Path::new(&path), OFlag::O_RDONLY, Mode::empty())
            .map_err(|errno| {
                tracing::error!(%path, ?errno, "failed to open namespace");
                errno
            })?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        nix::sched::setns(&fd, kind.clone_flag()).map_err(|errno| {
            tracing::error!(%path, ?errno, "setns failed");
            errno
        })?;
    }
    Ok(())
}

fn payload(channel: &HelperChannel) -> i32 {
    if channel.send_with_creds(&NsResponse::Ready).is_err() {
        return 1;
    }
    let req = match channel.recv() {
        Ok(DaemonMsg::Request(req)) => req,
        _ => return 1,
    };

    match dispatch(req) {
        Ok((resp, Some(fd))) => {
            let result = channel.send_with_fds(&resp, &[fd.as_raw_fd()]);
            drop(fd);
            i32::from(result.is_err())
        }
        Ok((resp, None)) => i32::from(channel.send(&resp).is_err()),
        Err(errno) => i32::from(channel.send(&NsResponse::from_errno(errno)).is_err()),
    }
}

fn dispatch(req: NsRequest) -> Result<(NsResponse, Option<OwnedFd>), Errno> {
    let resp = match req {
        NsRequest::Lookup { path } => NsResponse::Stat {
            stat: stat_path(&path)?,
        },
        NsRequest::Open { path, flags, mode } => {
            let oflags = OFlag::from_bits_truncate(flags);
            open_path(&path, oflags, mode)?;
            NsResponse::Ok
        }
        NsRequest::Read { path, offset, len } => {
            let file = fs::File::open(&path).map_err(io_errno)?;
            let mut buf = vec![0u8; len];
            let n = file.read_at(&mut buf, offset).map_err(io_errno)?;
            buf.truncate(n);
            NsResponse::Bytes { data: buf }
        }
        NsRequest::Write { path, offset, data } => {
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(io_errno)?;
            let n = file.write_at(&data, offset).map_err(io_errno)?;
            NsResponse::Written { count: n }
        }
        NsRequest::ReadDir { path } => {
            let mut entries = vec![];
            for dent in fs::read_dir(&path).map_err(io_errno)? {
                let dent = dent.map_err(io_errno)?;
                let meta = match dent.path().symlink_metadata() {
                    Ok(meta) => meta,
                    Err(_) => continue,
                };
                entries.push(NodeEntry {
                    name: dent.file_name().to_string_lossy().into_owned(),
                    stat: meta_to_stat(&meta),
                });
            }
            NsResponse::Entries { entries }
        }
        NsRequest::ReadLink { path } => NsResponse::Link {
            target: fs::read_link(&path).map_err(io_errno)?,
        },
        NsRequest::Mount { mounts } => {
            for m in &mounts {
                do_mount(m)?;
            }
            NsResponse::Ok
        }
        NsRequest::Umount { umounts } => {
            for u in &umounts {
                do_umount(u)?;
            }
            NsResponse::Ok
        }
        NsRequest::Chown {
            path,
            uid,
            gid,
            follow,
        } => {
            do_chown(&path, uid, gid, follow)?;
            NsResponse::Ok
        }
        NsRequest::SetXattr {
            path,
            name,
            value,
            flags,
            follow,
        } => {
            xattr::set(&path, &name, &value, flags, follow)?;
            NsResponse::Ok
        }
        NsRequest::GetXattr {
            path,
            name,
            size,
            follow,
        } => {
            if size == 0 {
                NsResponse::XattrLen {
                    len: xattr::get_len(&path, &name, follow)?,
                }
            } else {
                NsResponse::Bytes {
                    data: xattr::get(&path, &name, size, follow)?,
                }
            }
        }
        NsRequest::RemoveXattr { path, name, follow } => {
            xattr::remove(&path, &name, follow)?;
            NsResponse::Ok
        }
        NsRequest::ListXattr { path, size, follow } => {
            if size == 0 {
                NsResponse::XattrLen {
                    len: xattr::list_len(&path, follow)?,
                }
            } else {
                NsResponse::Bytes {
                    data: xattr::list(&path, size, follow)?,
                }
            }
        }
        NsRequest::Openat2 {
            path,
            flags,
            mode,
            resolve,
        } => {
            let fd = openat2(&path, flags, mode, resolve)?;
            return Ok((NsResponse::Fd, Some(fd)));
        }
        NsRequest::MountInfo => {
            let snap = MountInfoSnapshot::for_pid(std::process::id() as i32)
                .map_err(|_| Errno::EINVAL)?;
            NsResponse::MountInfo {
                entries: snap.entries().to_vec(),
            }
        }
        NsRequest::MountInode { paths } => NsResponse::MountInodes {
            inodes: paths
                .iter()
                .map(|p| p.symlink_metadata().ok().map(|m| m.ino()))
                .collect(),
        },
        NsRequest::UidInfo { user } => {
            let user = nix::unistd::User::from_name(&user)
                .map_err(|_| Errno::EINVAL)?
                .ok_or(Errno::ENOENT)?;
            NsResponse::UidInfo {
                uid: user.uid.as_raw(),
            }
        }
        NsRequest::GidInfo { group } => {
            let group = nix::unistd::Group::from_name(&group)
                .map_err(|_| Errno::EINVAL)?
                .ok_or(Errno::ENOENT)?;
            NsResponse::GidInfo {
                gid: group.gid.as_raw(),
            }
        }
        NsRequest::Sleep { ms } => {
            std::thread::sleep(std::time::Duration::from_millis(ms));
            NsResponse::Ok
        }
    };
    Ok((resp, None))
}

fn io_errno(err: std::io::Error) -> Errno {
    err.raw_os_error()
        .map(Errno::from_raw)
        .unwrap_or(Errno::EIO)
}

fn meta_to_stat(meta: &fs::Metadata) -> NodeStat {
    NodeStat {
        ino: meta.ino(),
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
    }
}

fn stat_path(path: &Path) -> Result<NodeStat, Errno> {
    let meta = path.symlink_metadata().map_err(io_errno)?;
    Ok(meta_to_stat(&meta))
}

fn open_path(path: &Path, flags: OFlag, mode: u32) -> Result<(), Errno> {
    let acc = flags & OFlag::O_ACCMODE;
    fs::OpenOptions::new()
        .read(acc == OFlag::O_RDONLY || acc == OFlag::O_RDWR)
        .write(acc == OFlag::O_WRONLY || acc == OFlag::O_RDWR)
        .create(flags.contains(OFlag::O_CREAT))
        .truncate(flags.contains(OFlag::O_TRUNC))
        .mode(mode)
        .open(path)
        .map(|_| ())
        .map_err(io_errno)
}

fn do_mount(m: &MountArgs) -> Result<(), Errno> {
    let flags = MsFlags::from_bits_truncate(m.flags);
    tracing::debug!(source = ?m.source, target = ?m.target, ?flags, "mounting");
    nix::mount::mount(
        Some(m.source.as_path()),
        m.target.as_path(),
        m.fs_type.as_deref(),
        flags,
        m.data.as_deref(),
    )
}

fn do_umount(u: &UmountArgs) -> Result<(), Errno> {
    tracing::debug!(target = ?u.target, flags = u.flags, "unmounting");
    umount2(u.target.as_path(), MntFlags::from_bits_truncate(u.flags))
}

fn do_chown(path: &Path, uid: Option<u32>, gid: Option<u32>, follow: bool) -> Result<(), Errno> {
    let cpath = cstring(path)?;
    let uid = uid.unwrap_or(u32::MAX);
    let gid = gid.unwrap_or(u32::MAX);
    let ret = if follow {
        unsafe { libc::chown(cpath.as_ptr(), uid, gid) }
    } else {
        unsafe { libc::lchown(cpath.as_ptr(), uid, gid) }
    };
    Errno::result(ret).map(|_| ())
}

// open_how, from linux/openat2.h.
#[repr(C)]
#[derive(Debug, Default)]
struct OpenHow {
    flags: u64,
    mode: u64,
    resolve: u64,
}

fn openat2(path: &Path, flags: u64, mode: u64, resolve: u64) -> Result<OwnedFd, Errno> {
    let cpath = cstring(path)?;
    let how = OpenHow {
        flags,
        mode,
        resolve,
    };
    let fd = unsafe {
        libc::syscall(
            libc::SYS_openat2,
            libc::AT_FDCWD,
            cpath.as_ptr(),
            &how as *const OpenHow,
            std::mem::size_of::<OpenHow>(),
        )
    };
    Errno::result(fd)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

fn cstring(path: &Path) -> Result<CString, Errno> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

/// Thin wrappers over the xattr syscall family; `follow` selects the
/// symlink-dereferencing variant.
mod xattr {
    use super::{cstring, Errno};
    use std::ffi::CString;
    use std::path::Path;

    fn name_cstr(name: &str) -> Result<CString, Errno> {
        CString::new(name).map_err(|_| Errno::EINVAL)
    }

    pub fn set(
        path: &Path,
        name: &str,
        value: &[u8],
        flags: i32,
        follow: bool,
    ) -> Result<(), Errno> {
        let cpath = cstring(path)?;
        let cname = name_cstr(name)?;
        let ret = unsafe {
            let setter = if follow {
                libc::setxattr
            } else {
                libc::lsetxattr
            };
            setter(
                cpath.as_ptr(),
                cname.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags,
            )
        };
        Errno::result(ret).map(|_| ())
    }

    pub fn get_len(path: &Path, name: &str, follow: bool) -> Result<usize, Errno> {
        let cpath = cstring(path)?;
        let cname = name_cstr(name)?;
        let ret = unsafe {
            let getter = if follow {
                libc::getxattr
            } else {
                libc::lgetxattr
            };
            getter(cpath.as_ptr(), cname.as_ptr(), std::ptr::null_mut(), 0)
        };
        Errno::result(ret).map(|len| len as usize)
    }

    pub fn get(path: &Path, name: &str, size: usize, follow: bool) -> Result<Vec<u8>, Errno> {
        let cpath = cstring(path)?;
        let cname = name_cstr(name)?;
        let mut buf = vec![0u8; size];
        let ret = unsafe {
            let getter = if follow {
                libc::getxattr
            } else {
                libc::lgetxattr
            };
            getter(
                cpath.as_ptr(),
                cname.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        let len = Errno::result(ret)? as usize;
        buf.truncate(len);
        Ok(buf)
    }

    pub fn remove(path: &Path, name: &str, follow: bool) -> Result<(), Errno> {
        let cpath = cstring(path)?;
        let cname = name_cstr(name)?;
        let ret = unsafe {
            let remover = if follow {
                libc::removexattr
            } else {
                libc::lremovexattr
            };
            remover(cpath.as_ptr(), cname.as_ptr())
        };
        Errno::result(ret).map(|_| ())
    }

    pub fn list_len(path: &Path, follow: bool) -> Result<usize, Errno> {
        let cpath = cstring(path)?;
        let ret = unsafe {
            let lister = if follow {
                libc::listxattr
            } else {
                libc::llistxattr
            };
            lister(cpath.as_ptr(), std::ptr::null_mut(), 0)
        };
        Errno::result(ret).map(|len| len as usize)
    }

    pub fn list(path: &Path, size: usize, follow: bool) -> Result<Vec<u8>, Errno> {
        let cpath = cstring(path)?;
        let mut buf = vec![0u8; size];
        let ret = unsafe {
            let lister = if follow {
                libc::listxattr
            } else {
                libc::llistxattr
            };
            lister(cpath.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
        };
        let len = Errno::result(ret)? as usize;
        buf.truncate(len);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::path::PathBuf;

    #[test]
    fn test_dispatch_read_write_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("value");
        fs::write(&path, b"stale")?;

        let resp = dispatch(NsRequest::Write {
            path: path.clone(),
            offset: 0,
            data: b"fresh".to_vec(),
        })
        .map_err(|e| anyhow::anyhow!("write failed: {e}"))?;
        assert!(matches!(resp.0, NsResponse::Written { count: 5 }));

        let resp = dispatch(NsRequest::Read {
            path: path.clone(),
            offset: 0,
            len: 32,
        })
        .map_err(|e| anyhow::anyhow!("read failed: {e}"))?;
        match resp.0 {
            NsResponse::Bytes { data } => assert_eq!(data, b"fresh"),
            other => panic!("unexpected response: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_dispatch_lookup_missing() {
        let err = dispatch(NsRequest::Lookup {
            path: PathBuf::from("/nonexistent/sysboxfs/helper"),
        })
        .unwrap_err();
        assert_eq!(err, Errno::ENOENT);
    }

    #[test]
    fn test_openat2_beneath_scopes_resolution() -> Result<()> {
        // RESOLVE_BENEATH rejects absolute paths outright.
        let err = openat2(
            Path::new("/etc/passwd"),
            libc::O_RDONLY as u64,
            0,
            crate::seccomp::RESOLVE_BENEATH,
        )
        .unwrap_err();
        assert!(err == Errno::EXDEV || err == Errno::ENOSYS);
        Ok(())
    }
}
