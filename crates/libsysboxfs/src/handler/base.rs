//! Default handler: relays every operation to the host node at the same
//! absolute path. Serves all paths the registry has no exact entry for.

use std::path::PathBuf;

use nix::errno::Errno;
use nix::fcntl::OFlag;

use super::{Handler, HandlerRequest, HandlerResult, NodeFlags};
use crate::io::{IoNode, NodeEntry, NodeStat};

pub struct PassthroughHandler {
    name: String,
    path: String,
    flags: NodeFlags,
}

impl PassthroughHandler {
    pub fn new(name: &str, path: &str, flags: NodeFlags) -> Self {
        PassthroughHandler {
            name: name.to_string(),
            path: path.to_string(),
            flags,
        }
    }
}

impl Handler for PassthroughHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn flags(&self) -> NodeFlags {
        self.flags
    }

    fn lookup(&self, node: &dyn IoNode, _req: &HandlerRequest) -> HandlerResult<NodeStat> {
        node.stat().map_err(|e| e.errno())
    }

    fn open(&self, node: &mut dyn IoNode, _req: &HandlerRequest) -> HandlerResult<bool> {
        let flags = node.open_flags();
        if flags.contains(OFlag::O_CREAT | OFlag::O_DIRECTORY) {
            node.mkdir_all(0o755).map_err(|e| e.errno())?;
            return Ok(false);
        }
        node.open().map_err(|e| e.errno())?;
        Ok(false)
    }

    fn read(&self, node: &mut dyn IoNode, req: &mut HandlerRequest) -> HandlerResult<usize> {
        let offset = req.offset;
        node.read_at(&mut req.data, offset).map_err(|e| e.errno())
    }

    fn write(&self, node: &mut dyn IoNode, req: &mut HandlerRequest) -> HandlerResult<usize> {
        node.write(&req.data).map_err(|e| e.errno())
    }

    fn read_dir_all(
        &self,
        node: &dyn IoNode,
        _req: &HandlerRequest,
    ) -> HandlerResult<Vec<NodeEntry>> {
        node.read_dir_all().map_err(|e| e.errno())
    }

    fn read_link(&self, node: &dyn IoNode, _req: &HandlerRequest) -> HandlerResult<PathBuf> {
        node.read_link().map_err(|e| e.errno())
    }
}

/// Convenience for handlers that never serve links.
pub(crate) fn no_link() -> HandlerResult<PathBuf> {
    Err(Errno::EINVAL)
}
