//! Handlers under `/sys`.

use std::path::PathBuf;

use nix::errno::Errno;

use super::base::no_link;
use super::proc::emu_file_stat;
use super::{read_at_offset, Handler, HandlerRequest, HandlerResult, NodeFlags};
use crate::io::{IoNode, NodeEntry, NodeStat};

/// `/sys` itself: plain passthrough directory.
pub struct SysHandler;

impl Handler for SysHandler {
    fn name(&self) -> &str {
        "sys"
    }

    fn path(&self) -> &str {
        "/sys"
    }

    fn flags(&self) -> NodeFlags {
        NodeFlags::DIR
    }

    fn lookup(&self, node: &dyn IoNode, _req: &HandlerRequest) -> HandlerResult<NodeStat> {
        node.stat().map_err(|e| e.errno())
    }

    fn open(&self, _node: &mut dyn IoNode, _req: &HandlerRequest) -> HandlerResult<bool> {
        Ok(false)
    }

    fn read(&self, _node: &mut dyn IoNode, _req: &mut HandlerRequest) -> HandlerResult<usize> {
        Err(Errno::EISDIR)
    }

    fn write(&self, _node: &mut dyn IoNode, _req: &mut HandlerRequest) -> HandlerResult<usize> {
        Err(Errno::EISDIR)
    }

    fn read_dir_all(
        &self,
        node: &dyn IoNode,
        _req: &HandlerRequest,
    ) -> HandlerResult<Vec<NodeEntry>> {
        node.read_dir_all().map_err(|e| e.errno())
    }

    fn read_link(&self, _node: &dyn IoNode, _req: &HandlerRequest) -> HandlerResult<PathBuf> {
        no_link()
    }
}

/// `/sys/module/nf_conntrack/parameters/hashsize`. The kernel value is
/// global; each container gets its own sticky copy so nested runtimes can
/// tune it without fighting each other.
pub struct NfConntrackHashsizeHandler;

impl NfConntrackHashsizeHandler {
    const PATH: &'static str = "/sys/module/nf_conntrack/parameters/hashsize";
}

impl Handler for NfConntrackHashsizeHandler {
    fn name(&self) -> &str {
        "nfConntrackHashsize"
    }

    fn path(&self) -> &str {
        Self::PATH
    }

    fn flags(&self) -> NodeFlags {
        NodeFlags::FILE | NodeFlags::EMULATED | NodeFlags::BINDMOUNT
    }

    fn lookup(&self, _node: &dyn IoNode, _req: &HandlerRequest) -> HandlerResult<NodeStat> {
        Ok(emu_file_stat(0o600))
    }

    fn open(&self, _node: &mut dyn IoNode, _req: &HandlerRequest) -> HandlerResult<bool> {
        Ok(true)
    }

    fn read(&self, node: &mut dyn IoNode, req: &mut HandlerRequest) -> HandlerResult<usize> {
        let content = match req.container.data(Self::PATH) {
            Some(value) => value,
            None => node.read_file().map_err(|e| e.errno())?,
        };
        Ok(read_at_offset(content.as_bytes(), req.offset, &mut req.data))
    }

    fn write(&self, _node: &mut dyn IoNode, req: &mut HandlerRequest) -> HandlerResult<usize> {
        let value = String::from_utf8_lossy(&req.data).into_owned();
        if value.trim().parse::<u64>().is_err() {
            return Err(Errno::EINVAL);
        }
        req.container.set_data(Self::PATH, &value);
        Ok(req.data.len())
    }

    fn read_dir_all(
        &self,
        _node: &dyn IoNode,
        _req: &HandlerRequest,
    ) -> HandlerResult<Vec<NodeEntry>> {
        Err(Errno::ENOTDIR)
    }

    fn read_link(&self, _node: &dyn IoNode, _req: &HandlerRequest) -> HandlerResult<PathBuf> {
        no_link()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::handler::testutil;
    use crate::io::{create_io_service, IoBackend, MemIo};
    use anyhow::Result;
    use nix::fcntl::OFlag;
    use std::path::Path;
    use std::sync::Arc;

    #[test]
    fn test_hashsize_sticky_per_container() -> Result<()> {
        let io = create_io_service(IoBackend::Mem);
        let mem = io.as_any().downcast_ref::<MemIo>().unwrap();
        mem.insert_file(NfConntrackHashsizeHandler::PATH, 0o600, 0, 0, b"65536\n");

        let handler = NfConntrackHashsizeHandler;
        let path = Path::new(NfConntrackHashsizeHandler::PATH);
        let c1 = Arc::new(Container::new("c1"));
        let c2 = Arc::new(Container::new("c2"));

        let mut node = io.new_node("hashsize", path, OFlag::O_WRONLY, 0);
        let mut req = testutil::request(c1.clone());
        req.data = b"131072\n".to_vec();
        handler.write(node.as_mut(), &mut req)?;

        // c1 sees its write, c2 still sees the kernel value.
        let mut node = io.new_node("hashsize", path, OFlag::O_RDONLY, 0);
        let mut req = testutil::read_request(c1, 32);
        let n = handler.read(node.as_mut(), &mut req)?;
        assert_eq!(&req.data[..n], b"131072\n");

        let mut req = testutil::read_request(c2, 32);
        let n = handler.read(node.as_mut(), &mut req)?;
        assert_eq!(&req.data[..n], b"65536\n");
        Ok(())
    }

    #[test]
    fn test_hashsize_rejects_garbage() {
        let io = create_io_service(IoBackend::Mem);
        let path = Path::new(NfConntrackHashsizeHandler::PATH);
        let mut node = io.new_node("hashsize", path, OFlag::O_WRONLY, 0);
        let mut req = testutil::request(Arc::new(Container::new("c1")));
        req.data = b"not-a-number\n".to_vec();
        assert_eq!(
            NfConntrackHashsizeHandler.write(node.as_mut(), &mut req),
            Err(Errno::EINVAL)
        );
    }
}
