//! Inspection of a target process through its `/proc/<pid>` entries:
//! namespace inodes, uid/gid mappings, capability and path-permission
//! checks. All file access goes through the IO service so most of this is
//! testable against the memory backend.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sched::CloneFlags;
use nix::sys::stat::fstat;
use nix::unistd;

use crate::io::{IoBackend, IoService};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Io(#[from] crate::io::IoError),
    #[error("unix syscall failed")]
    Nix(#[from] nix::Error),
    #[error("failed to read capabilities of pid {pid}")]
    Caps {
        pid: i32,
        #[source]
        source: caps::errors::CapsError,
    },
    #[error("malformed id map line: {0}")]
    MalformedIdMap(String),
    #[error("pid {pid} has no mapping for id 0")]
    NoRootMapping { pid: i32 },
    #[error("access to {path} denied")]
    Access { path: PathBuf, errno: Errno },
}

type Result<T> = std::result::Result<T, ProcessError>;

/// Namespaces a process can be entered through, in the order the re-exec
/// helper must join them (user first so later joins use in-container
/// credentials).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum NsKind {
    User,
    Pid,
    Net,
    Mnt,
    Ipc,
    Cgroup,
    Uts,
}

pub const NS_JOIN_ORDER: &[NsKind] = &[
    NsKind::User,
    NsKind::Pid,
    NsKind::Net,
    NsKind::Mnt,
    NsKind::Ipc,
    NsKind::Cgroup,
    NsKind::Uts,
];

/// The full set, for operations that must run entirely inside the container.
pub const NS_ALL: &[NsKind] = NS_JOIN_ORDER;

/// Everything but the user namespace: operations that need in-container
/// views but host credentials.
pub const NS_ALL_BUT_USER: &[NsKind] = &[
    NsKind::Pid,
    NsKind::Net,
    NsKind::Mnt,
    NsKind::Ipc,
    NsKind::Cgroup,
    NsKind::Uts,
];

impl NsKind {
    pub fn proc_name(&self) -> &'static str {
        match self {
            NsKind::User => "user",
            NsKind::Pid => "pid",
            NsKind::Net => "net",
            NsKind::Mnt => "mnt",
            NsKind::Ipc => "ipc",
            NsKind::Cgroup => "cgroup",
            NsKind::Uts => "uts",
        }
    }

    pub fn clone_flag(&self) -> CloneFlags {
        match self {
            NsKind::User => CloneFlags::CLONE_NEWUSER,
            NsKind::Pid => CloneFlags::CLONE_NEWPID,
            NsKind::Net => CloneFlags::CLONE_NEWNET,
            NsKind::Mnt => CloneFlags::CLONE_NEWNS,
            NsKind::Ipc => CloneFlags::CLONE_NEWIPC,
            NsKind::Cgroup => CloneFlags::CLONE_NEWCGROUP,
            NsKind::Uts => CloneFlags::CLONE_NEWUTS,
        }
    }
}

/// One line of `/proc/<pid>/uid_map` / `gid_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub inside: u32,
    pub outside: u32,
    pub size: u32,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMode: u32 {
        const R = 0b100;
        const W = 0b010;
        const X = 0b001;
    }
}

// ioctls on /proc/<pid>/ns/* fds, from linux/nsfs.h.
const NSIO: u8 = 0xb7;
nix::ioctl_none!(ns_get_userns, NSIO, 0x1);
nix::ioctl_none!(ns_get_parent, NSIO, 0x2);

/// A target process, identified by pid, inspected through procfs.
pub struct Process {
    pid: i32,
    io: Arc<dyn IoService>,
}

impl Process {
    pub fn new(pid: i32, io: Arc<dyn IoService>) -> Self {
        Process { pid, io }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    fn proc_path(&self, rest: &str) -> PathBuf {
        PathBuf::from(format!("/proc/{}/{}", self.pid, rest))
    }

    pub fn ns_inode(&self, kind: NsKind) -> Result<u64> {
        let path = self.proc_path(&format!("ns/{}", kind.proc_name()));
        let node = self
            .io
            .new_node(kind.proc_name(), &path, OFlag::O_RDONLY, 0);
        Ok(node.ns_inode()?)
    }

    pub fn user_ns_inode(&self) -> Result<u64> {
        self.ns_inode(NsKind::User)
    }

    /// Inode of the parent of this process' user namespace. Lets a lookup
    /// ascend one level so L2 containers resolve to their enclosing system
    /// container.
    pub fn parent_user_ns_inode(&self) -> Result<u64> {
        if self.io.backend() == IoBackend::Mem {
            let path = self.proc_path("ns/user_parent");
            let node = self.io.new_node("user_parent", &path, OFlag::O_RDONLY, 0);
            return Ok(node.ns_inode()?);
        }

        let path = self.proc_path("ns/user");
        let ns_fd = nix::fcntl::open(&path, OFlag::O_RDONLY, nix::sys::stat::Mode::empty())?;
        let ns_fd = unsafe { OwnedFd::from_raw_fd(ns_fd) };
        let parent_fd = unsafe { ns_get_parent(std::os::fd::AsRawFd::as_raw_fd(&ns_fd))? };
        let parent_fd = unsafe { OwnedFd::from_raw_fd(parent_fd) };
        let st = fstat(std::os::fd::AsRawFd::as_raw_fd(&parent_fd))?;
        Ok(st.st_ino)
    }

    pub fn fd_path(&self, fd: RawFd) -> Result<PathBuf> {
        let path = self.proc_path(&format!("fd/{}", fd));
        let node = self.io.new_node("fd", &path, OFlag::O_RDONLY, 0);
        Ok(node.read_link()?)
    }

    /// Root of the process as seen from the host. `/` unless the process is
    /// chroot'ed (or we are looking across a mount namespace).
    pub fn root_path(&self) -> Result<PathBuf> {
        let path = self.proc_path("root");
        let node = self.io.new_node("root", &path, OFlag::O_RDONLY, 0);
        Ok(node.read_link()?)
    }

    pub fn cwd(&self) -> Result<PathBuf> {
        let path = self.proc_path("cwd");
        let node = self.io.new_node("cwd", &path, OFlag::O_RDONLY, 0);
        Ok(node.read_link()?)
    }

    fn status_ids(&self, key: &str) -> Result<(u32, u32)> {
        let path = self.proc_path("status");
        let node = self.io.new_node("status", &path, OFlag::O_RDONLY, 0);
        let content = node.read_file()?;
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix(key) {
                let mut fields = rest.split_whitespace();
                let real = fields.next().and_then(|f| f.parse().ok());
                let effective = fields.next().and_then(|f| f.parse().ok());
                if let (Some(real), Some(effective)) = (real, effective) {
                    return Ok((real, effective));
                }
            }
        }
        Err(ProcessError::MalformedIdMap(format!(
            "no {} line in {}",
            key,
            path.display()
        )))
    }

    /// Effective uid of the process.
    pub fn uid(&self) -> Result<u32> {
        Ok(self.status_ids("Uid:")?.1)
    }

    /// Effective gid of the process.
    pub fn gid(&self) -> Result<u32> {
        Ok(self.status_ids("Gid:")?.1)
    }

    pub fn is_capable(&self, cap: caps::Capability) -> Result<bool> {
        caps::has_cap(Some(self.pid), caps::CapSet::Effective, cap).map_err(|source| {
            ProcessError::Caps {
                pid: self.pid,
                source,
            }
        })
    }

    fn id_map(&self, file: &str) -> Result<Vec<IdMapping>> {
        let path = self.proc_path(file);
        let node = self.io.new_node(file, &path, OFlag::O_RDONLY, 0);
        let content = node.read_file()?;
        let mut mappings = vec![];
        for line in content.lines() {
            let fields: Vec<u32> = line
                .split_whitespace()
                .map(|f| f.parse())
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| ProcessError::MalformedIdMap(line.to_string()))?;
            if fields.len() != 3 {
                return Err(ProcessError::MalformedIdMap(line.to_string()));
            }
            mappings.push(IdMapping {
                inside: fields[0],
                outside: fields[1],
                size: fields[2],
            });
        }
        Ok(mappings)
    }

    pub fn uid_map(&self) -> Result<Vec<IdMapping>> {
        self.id_map("uid_map")
    }

    pub fn gid_map(&self) -> Result<Vec<IdMapping>> {
        self.id_map("gid_map")
    }

    /// Host uid that maps to uid 0 inside the process' user namespace.
    pub fn userns_root_uid(&self) -> Result<u32> {
        Self::root_mapping(&self.uid_map()?).ok_or(ProcessError::NoRootMapping { pid: self.pid })
    }

    pub fn userns_root_gid(&self) -> Result<u32> {
        Self::root_mapping(&self.gid_map()?).ok_or(ProcessError::NoRootMapping { pid: self.pid })
    }

    fn root_mapping(mappings: &[IdMapping]) -> Option<u32> {
        mappings
            .iter()
            .find(|m| m.inside == 0 && m.size > 0)
            .map(|m| m.outside)
    }

    /// Rewrite a leading `/proc/self` to the absolute pid form so the daemon
    /// does not resolve "self" to itself.
    pub fn resolve_proc_self(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/proc/self") {
            Ok(rest) if rest.as_os_str().is_empty() => PathBuf::from(format!("/proc/{}", self.pid)),
            Ok(rest) => PathBuf::from(format!("/proc/{}", self.pid)).join(rest),
            Err(_) => path.to_path_buf(),
        }
    }

    /// Can the process access `path` with `mode`? Walks every component
    /// checking search permission, then the final component against `mode`,
    /// using the process' effective uid/gid. Root passes unconditionally.
    pub fn path_access(&self, path: &Path, mode: AccessMode) -> Result<()> {
        let uid = self.uid()?;
        let gid = self.gid()?;
        if uid == 0 {
            return Ok(());
        }

        let denied = |errno| ProcessError::Access {
            path: path.to_path_buf(),
            errno,
        };

        let mut cur = PathBuf::from("/");
        let components: Vec<_> = path.components().skip(1).collect();
        for (i, comp) in components.iter().enumerate() {
            cur.push(comp);
            let node = self.io.new_node("", &cur, OFlag::O_RDONLY, 0);
            let stat = match node.stat() {
                Ok(stat) => stat,
                Err(_) => return Err(denied(Errno::ENOENT)),
            };
            let last = i == components.len() - 1;
            let want = if last {
                mode
            } else if stat.is_dir() {
                AccessMode::X
            } else {
                return Err(denied(Errno::ENOTDIR));
            };
            if !Self::perm_allows(&stat, uid, gid, want) {
                return Err(denied(Errno::EACCES));
            }
        }
        Ok(())
    }

    fn perm_allows(stat: &crate::io::NodeStat, uid: u32, gid: u32, want: AccessMode) -> bool {
        let shift = if stat.uid == uid {
            6
        } else if stat.gid == gid {
            3
        } else {
            0
        };
        let granted = (stat.mode >> shift) & 0o7;
        granted & want.bits() == want.bits()
    }

    /// Race-free handle on the process, usable for liveness checks and
    /// `setns(2)` with a pidfd.
    pub fn pidfd_open(&self) -> Result<OwnedFd> {
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, self.pid, 0) };
        Errno::result(fd)?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
    }

    /// True while `/proc/<pid>` exists.
    pub fn alive(&self) -> bool {
        nix::sys::signal::kill(unistd::Pid::from_raw(self.pid), None).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{create_io_service, IoBackend, MemIo};
    use anyhow::Result;

    fn seed_process(mem: &MemIo, pid: i32) {
        let base = format!("/proc/{}", pid);
        mem.insert_dir(&base, 0o555, 0, 0);
        mem.insert_file(
            format!("{}/status", base),
            0o444,
            0,
            0,
            b"Name:\tpayload\nUid:\t1000\t1000\t1000\t1000\nGid:\t1000\t1000\t1000\t1000\n",
        );
        mem.insert_file(
            format!("{}/uid_map", base),
            0o444,
            0,
            0,
            b"         0     165536      65536\n",
        );
        mem.insert_file(
            format!("{}/gid_map", base),
            0o444,
            0,
            0,
            b"         0     165536      65536\n",
        );
        mem.insert_dir(format!("{}/ns", base), 0o555, 0, 0);
        mem.insert_file(format!("{}/ns/user", base), 0o444, 0, 0, b"");
    }

    #[test]
    fn test_userns_root_ids() -> Result<()> {
        let io = create_io_service(IoBackend::Mem);
        let mem = io.as_any().downcast_ref::<MemIo>().unwrap();
        seed_process(mem, 1234);

        let proc = Process::new(1234, io.clone());
        assert_eq!(proc.uid()?, 1000);
        assert_eq!(proc.userns_root_uid()?, 165536);
        assert_eq!(proc.userns_root_gid()?, 165536);
        Ok(())
    }

    #[test]
    fn test_resolve_proc_self() {
        let io = create_io_service(IoBackend::Mem);
        let proc = Process::new(77, io);
        assert_eq!(
            proc.resolve_proc_self(Path::new("/proc/self/mounts")),
            Path::new("/proc/77/mounts")
        );
        assert_eq!(
            proc.resolve_proc_self(Path::new("/etc/passwd")),
            Path::new("/etc/passwd")
        );
    }

    #[test]
    fn test_path_access() -> Result<()> {
        let io = create_io_service(IoBackend::Mem);
        let mem = io.as_any().downcast_ref::<MemIo>().unwrap();
        seed_process(mem, 55);
        mem.insert_dir("/data", 0o755, 0, 0);
        mem.insert_file("/data/world", 0o644, 0, 0, b"x");
        mem.insert_file("/data/secret", 0o600, 0, 0, b"x");

        let proc = Process::new(55, io);
        assert!(proc.path_access(Path::new("/data/world"), AccessMode::R).is_ok());
        let err = proc
            .path_access(Path::new("/data/secret"), AccessMode::R)
            .unwrap_err();
        match err {
            ProcessError::Access { errno, .. } => assert_eq!(errno, Errno::EACCES),
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    #[test]
    fn test_ns_inode_identity() -> Result<()> {
        let io = create_io_service(IoBackend::Mem);
        let mem = io.as_any().downcast_ref::<MemIo>().unwrap();
        seed_process(mem, 400);
        seed_process(mem, 401);

        let a = Process::new(400, io.clone()).user_ns_inode()?;
        let b = Process::new(401, io.clone()).user_ns_inode()?;
        assert_ne!(a, b);
        assert_eq!(Process::new(400, io).user_ns_inode()?, a);
        Ok(())
    }
}
