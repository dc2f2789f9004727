//! The mountpoint root. Keeps the per-container mount minimal: only `proc`,
//! `sys` and `testing` are enumerated.

use std::path::PathBuf;

use nix::errno::Errno;

use super::base::no_link;
use super::{Handler, HandlerRequest, HandlerResult, NodeFlags};
use crate::io::{IoNode, NodeEntry, NodeStat};

const ROOT_ENTRIES: &[&str] = &["proc", "sys", "testing"];

pub struct RootHandler;

impl Handler for RootHandler {
    fn name(&self) -> &str {
        "root"
    }

    fn path(&self) -> &str {
        "/"
    }

    fn flags(&self) -> NodeFlags {
        NodeFlags::DIR | NodeFlags::EMULATED
    }

    fn lookup(&self, _node: &dyn IoNode, _req: &HandlerRequest) -> HandlerResult<NodeStat> {
        Ok(NodeStat {
            ino: 0,
            mode: libc::S_IFDIR | 0o555,
            uid: 0,
            gid: 0,
            size: 4096,
        })
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
        _node: &dyn IoNode,
        _req: &HandlerRequest,
    ) -> HandlerResult<Vec<NodeEntry>> {
        Ok(ROOT_ENTRIES
            .iter()
            .map(|name| NodeEntry {
                name: name.to_string(),
                stat: NodeStat {
                    ino: 0,
                    mode: libc::S_IFDIR | 0o555,
                    uid: 0,
                    gid: 0,
                    size: 4096,
                },
            })
            .collect())
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
    use crate::io::{create_io_service, IoBackend};
    use nix::fcntl::OFlag;
    use std::path::Path;
    use std::sync::Arc;

    #[test]
    fn test_root_enumerates_fixed_entries() {
        let io = create_io_service(IoBackend::Mem);
        let node = io.new_node("/", Path::new("/"), OFlag::O_RDONLY, 0);
        let req = testutil::request(Arc::new(Container::new("c1")));

        let handler = RootHandler;
        let names: Vec<_> = handler
            .read_dir_all(node.as_ref(), &req)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["proc", "sys", "testing"]);
    }
}
