//! Seccomp-notify syscall interposition: accepts notification fds from the
//! runtime, polls them, and rewrites the semantics of the trapped syscalls.

pub mod handler;
pub mod notify;
mod server;
pub mod tracee;

pub use server::{FdReleasePolicy, SeccompServer, DEFAULT_SECCOMP_SOCKET};

use std::path::PathBuf;
use std::sync::Arc;

use crate::container::ContainerRegistry;
use crate::io::IoService;
use crate::mount::MountService;

// linux/openat2.h resolve flags.
pub const RESOLVE_NO_XDEV: u64 = 0x01;
pub const RESOLVE_NO_MAGICLINKS: u64 = 0x02;
pub const RESOLVE_NO_SYMLINKS: u64 = 0x04;
pub const RESOLVE_BENEATH: u64 = 0x08;
pub const RESOLVE_IN_ROOT: u64 = 0x10;

/// Shared handles the syscall processors work with; constructed once in
/// main and passed down, never global.
pub struct Services {
    pub io: Arc<dyn IoService>,
    pub containers: Arc<ContainerRegistry>,
    pub mounts: Arc<MountService>,
    /// Base directory of the per-container FUSE mounts; bind-mount sources
    /// are taken from `<base>/<id>`.
    pub fuse_mountpoint: PathBuf,
    pub allow_immutable_remounts: bool,
    pub allow_immutable_unmounts: bool,
}

/// Outcome of processing one trapped syscall.
#[derive(Debug, PartialEq, Eq)]
pub enum SyscallResult {
    /// Let the kernel execute the call.
    Continue,
    /// Answer the tracee with a success value.
    Success(i64),
    /// Answer the tracee with an errno.
    Error(nix::errno::Errno),
}
