//! Per-node behaviour for the emulated procfs/sysfs tree. Every emulated
//! node is backed by a handler implementing the six-operation contract; the
//! registry maps virtual paths to handlers with longest-prefix semantics.

mod base;
mod proc;
mod registry;
mod root;
mod sys;

pub use base::PassthroughHandler;
pub use registry::HandlerRegistry;

use std::path::PathBuf;
use std::sync::Arc;

use bitflags::bitflags;
use nix::errno::Errno;

use crate::container::Container;
use crate::io::{IoNode, NodeEntry, NodeStat};

/// Uid/gid sentinel: an attribute carrying this value is not remapped to the
/// caller's user-ns root and shows up as nobody inside the container.
pub const MAX_UID: u32 = u32::MAX;
pub const MAX_GID: u32 = u32::MAX;

bitflags! {
    /// Behaviour of one registered node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        /// Contents are produced by the handler, not the kernel.
        const EMULATED = 1 << 0;
        /// Bind-mounted over the base mount when the container mounts
        /// procfs/sysfs.
        const BINDMOUNT = 1 << 1;
        /// Propagated into procfs/sysfs mounts done by nested containers.
        const PROPAGATE = 1 << 2;
        /// The FUSE node cache may keep this node's attributes.
        const CACHEABLE = 1 << 3;
        /// Writes reach the kernel node, not only the per-container store.
        const KERNEL_SYNC = 1 << 4;
        /// Directory listing substitutes handler output for the host's.
        const SUBSTITUTION = 1 << 5;
        const DIR = 1 << 6;
        const FILE = 1 << 7;
    }
}

/// Context of one FUSE or syscall-originated operation.
#[derive(Debug)]
pub struct HandlerRequest {
    /// Kernel-assigned request id (FUSE unique or seccomp cookie).
    pub id: u64,
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
    pub offset: u64,
    /// Read: caller-sized buffer the handler fills. Write: payload.
    pub data: Vec<u8>,
    pub container: Arc<Container>,
}

pub type HandlerResult<T> = std::result::Result<T, Errno>;

/// The fixed contract every emulated node implements. Handlers run
/// concurrently and must be idempotent.
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;
    fn path(&self) -> &str;
    fn flags(&self) -> NodeFlags;

    fn lookup(&self, node: &dyn IoNode, req: &HandlerRequest) -> HandlerResult<NodeStat>;

    /// Returns whether the node must be served non-seekable.
    fn open(&self, node: &mut dyn IoNode, req: &HandlerRequest) -> HandlerResult<bool>;

    fn read(&self, node: &mut dyn IoNode, req: &mut HandlerRequest) -> HandlerResult<usize>;

    fn write(&self, node: &mut dyn IoNode, req: &mut HandlerRequest) -> HandlerResult<usize>;

    fn read_dir_all(
        &self,
        node: &dyn IoNode,
        req: &HandlerRequest,
    ) -> HandlerResult<Vec<NodeEntry>>;

    fn read_link(&self, node: &dyn IoNode, req: &HandlerRequest) -> HandlerResult<PathBuf>;
}

/// Copy out of `content[offset..]`, short reads allowed.
pub(crate) fn read_at_offset(content: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    let offset = offset as usize;
    if offset >= content.len() {
        return 0;
    }
    let n = std::cmp::min(buf.len(), content.len() - offset);
    buf[..n].copy_from_slice(&content[offset..offset + n]);
    n
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::container::Container;

    pub fn request(container: Arc<Container>) -> HandlerRequest {
        HandlerRequest {
            id: 1,
            pid: 100,
            uid: 0,
            gid: 0,
            offset: 0,
            data: vec![],
            container,
        }
    }

    pub fn read_request(container: Arc<Container>, len: usize) -> HandlerRequest {
        HandlerRequest {
            data: vec![0; len],
            ..request(container)
        }
    }
}
