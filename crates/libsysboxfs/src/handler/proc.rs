//! Handlers under `/proc`.

use std::path::PathBuf;

use chrono::Utc;
use nix::errno::Errno;

use super::base::no_link;
use super::{read_at_offset, Handler, HandlerRequest, HandlerResult, NodeFlags};
use crate::io::{IoNode, NodeEntry, NodeStat};

/// Size advertised for emulated files. Reads are served with direct-io, so
/// the value only has to be large enough for the kernel to keep asking.
pub(crate) const EMU_FILE_SIZE: u64 = 1024;

pub(crate) fn emu_file_stat(mode: u32) -> NodeStat {
    NodeStat {
        ino: 0,
        mode: libc::S_IFREG | mode,
        uid: 0,
        gid: 0,
        size: EMU_FILE_SIZE,
    }
}

/// `/proc` itself: a plain directory view of the host's procfs. Emulated
/// children show up in the host listing already, so no substitution is
/// needed at this level.
pub struct ProcHandler;

impl Handler for ProcHandler {
    fn name(&self) -> &str {
        "proc"
    }

    fn path(&self) -> &str {
        "/proc"
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

/// `/proc/sys` subtree. Bind-mounted into the container's procfs; reads and
/// writes are relayed to the kernel's sysctl tree (kernel-sync), with writes
/// also recorded in the per-container store so values observed by the
/// container stay put even if the host value later changes.
pub struct ProcSysHandler;

impl ProcSysHandler {
    fn is_exact(node: &dyn IoNode) -> bool {
        node.path() == std::path::Path::new("/proc/sys")
    }
}

impl Handler for ProcSysHandler {
    fn name(&self) -> &str {
        "procSys"
    }

    fn path(&self) -> &str {
        "/proc/sys"
    }

    fn flags(&self) -> NodeFlags {
        NodeFlags::DIR | NodeFlags::BINDMOUNT | NodeFlags::KERNEL_SYNC | NodeFlags::PROPAGATE
    }

    fn lookup(&self, node: &dyn IoNode, _req: &HandlerRequest) -> HandlerResult<NodeStat> {
        node.stat().map_err(|e| e.errno())
    }

    fn open(&self, node: &mut dyn IoNode, _req: &HandlerRequest) -> HandlerResult<bool> {
        if Self::is_exact(node) {
            return Ok(false);
        }
        let stat = node.stat().map_err(|e| e.errno())?;
        if stat.is_dir() {
            return Ok(false);
        }
        node.open().map_err(|e| e.errno())?;
        // Sysctl reads must not be assembled from concurrent partial reads.
        Ok(true)
    }

    fn read(&self, node: &mut dyn IoNode, req: &mut HandlerRequest) -> HandlerResult<usize> {
        let path = node.path().to_string_lossy().into_owned();
        if let Some(value) = req.container.data(&path) {
            return Ok(read_at_offset(value.as_bytes(), req.offset, &mut req.data));
        }
        let offset = req.offset;
        node.read_at(&mut req.data, offset).map_err(|e| e.errno())
    }

    fn write(&self, node: &mut dyn IoNode, req: &mut HandlerRequest) -> HandlerResult<usize> {
        let path = node.path().to_string_lossy().into_owned();
        let value = String::from_utf8_lossy(&req.data).into_owned();
        let written = node.write(&req.data).map_err(|e| e.errno())?;
        req.container.set_data(&path, &value);
        Ok(written)
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

/// `/proc/uptime`, measured from the container's creation time so the
/// container does not see the host's boot.
pub struct ProcUptimeHandler;

impl Handler for ProcUptimeHandler {
    fn name(&self) -> &str {
        "procUptime"
    }

    fn path(&self) -> &str {
        "/proc/uptime"
    }

    fn flags(&self) -> NodeFlags {
        NodeFlags::FILE | NodeFlags::EMULATED | NodeFlags::BINDMOUNT | NodeFlags::PROPAGATE
    }

    fn lookup(&self, _node: &dyn IoNode, _req: &HandlerRequest) -> HandlerResult<NodeStat> {
        Ok(emu_file_stat(0o444))
    }

    fn open(&self, _node: &mut dyn IoNode, _req: &HandlerRequest) -> HandlerResult<bool> {
        Ok(true)
    }

    fn read(&self, _node: &mut dyn IoNode, req: &mut HandlerRequest) -> HandlerResult<usize> {
        let uptime = match req.container.ctime() {
            Some(ctime) => (Utc::now() - ctime).num_milliseconds().max(0) as f64 / 1000.0,
            None => 0.0,
        };
        // Idle time is reported equal to uptime: the container has no view
        // of the host's idle accounting.
        let content = format!("{:.2} {:.2}\n", uptime, uptime);
        Ok(read_at_offset(content.as_bytes(), req.offset, &mut req.data))
    }

    fn write(&self, _node: &mut dyn IoNode, _req: &mut HandlerRequest) -> HandlerResult<usize> {
        Err(Errno::EACCES)
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

/// `/proc/swaps`: swapon/swapoff are denied inside the container, so the
/// table is always empty.
pub struct ProcSwapsHandler;

const SWAPS_HEADER: &str = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n";

impl Handler for ProcSwapsHandler {
    fn name(&self) -> &str {
        "procSwaps"
    }

    fn path(&self) -> &str {
        "/proc/swaps"
    }

    fn flags(&self) -> NodeFlags {
        NodeFlags::FILE | NodeFlags::EMULATED | NodeFlags::BINDMOUNT | NodeFlags::PROPAGATE
    }

    fn lookup(&self, _node: &dyn IoNode, _req: &HandlerRequest) -> HandlerResult<NodeStat> {
        Ok(emu_file_stat(0o444))
    }

    fn open(&self, _node: &mut dyn IoNode, _req: &HandlerRequest) -> HandlerResult<bool> {
        Ok(true)
    }

    fn read(&self, _node: &mut dyn IoNode, req: &mut HandlerRequest) -> HandlerResult<usize> {
        Ok(read_at_offset(
            SWAPS_HEADER.as_bytes(),
            req.offset,
            &mut req.data,
        ))
    }

    fn write(&self, _node: &mut dyn IoNode, _req: &mut HandlerRequest) -> HandlerResult<usize> {
        Err(Errno::EACCES)
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
    fn test_uptime_counts_from_container_start() -> Result<()> {
        let io = create_io_service(IoBackend::Mem);
        let cntr = Arc::new(Container::new("c1"));
        cntr.set_ctime(Utc::now() - chrono::Duration::seconds(90));

        let mut node = io.new_node("uptime", Path::new("/proc/uptime"), OFlag::O_RDONLY, 0);
        let mut req = testutil::read_request(cntr, 64);
        let n = ProcUptimeHandler.read(node.as_mut(), &mut req)?;
        let text = String::from_utf8_lossy(&req.data[..n]).into_owned();
        let uptime: f64 = text.split_whitespace().next().unwrap().parse()?;
        assert!((90.0..95.0).contains(&uptime), "uptime was {uptime}");
        Ok(())
    }

    #[test]
    fn test_swaps_is_header_only() -> Result<()> {
        let io = create_io_service(IoBackend::Mem);
        let cntr = Arc::new(Container::new("c1"));
        let mut node = io.new_node("swaps", Path::new("/proc/swaps"), OFlag::O_RDONLY, 0);

        let mut req = testutil::read_request(cntr.clone(), 256);
        let n = ProcSwapsHandler.read(node.as_mut(), &mut req)?;
        assert_eq!(&req.data[..n], SWAPS_HEADER.as_bytes());

        // Offset past the header: EOF.
        let mut req = testutil::read_request(cntr, 256);
        req.offset = SWAPS_HEADER.len() as u64;
        assert_eq!(ProcSwapsHandler.read(node.as_mut(), &mut req)?, 0);
        Ok(())
    }

    #[test]
    fn test_proc_sys_sticky_write() -> Result<()> {
        let io = create_io_service(IoBackend::Mem);
        let mem = io.as_any().downcast_ref::<MemIo>().unwrap();
        mem.insert_dir("/proc", 0o555, 0, 0);
        mem.insert_dir("/proc/sys", 0o555, 0, 0);
        mem.insert_dir("/proc/sys/kernel", 0o755, 0, 0);
        mem.insert_file("/proc/sys/kernel/shmmax", 0o644, 0, 0, b"1000\n");

        let cntr = Arc::new(Container::new("c1"));
        let path = Path::new("/proc/sys/kernel/shmmax");
        let handler = ProcSysHandler;

        let mut node = io.new_node("shmmax", path, OFlag::O_WRONLY, 0);
        let mut req = testutil::request(cntr.clone());
        req.data = b"2000\n".to_vec();
        handler.write(node.as_mut(), &mut req)?;

        // Host value diverges afterwards; the container keeps seeing its own.
        mem.insert_file("/proc/sys/kernel/shmmax", 0o644, 0, 0, b"9999\n");
        let mut node = io.new_node("shmmax", path, OFlag::O_RDONLY, 0);
        let mut req = testutil::read_request(cntr, 32);
        let n = handler.read(node.as_mut(), &mut req)?;
        assert_eq!(&req.data[..n], b"2000\n");
        Ok(())
    }
}
