//! The per-container FUSE filesystem. Routes kernel requests to the handler
//! registry, maintains the node cache, and applies the uid/gid remapping
//! rule on every returned attribute.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use fuser::{
    consts::{FOPEN_DIRECT_IO, FOPEN_NONSEEKABLE},
    FileAttr, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use nix::errno::Errno;
use nix::fcntl::OFlag;

use super::attr::{attr_ttl, file_kind, path_inode, remap_attr_ids, stat_to_attr};
use crate::container::Container;
use crate::handler::{Handler, HandlerRequest, HandlerRegistry};
use crate::io::IoService;
use crate::process::Process;

/// Node cache: inode -> virtual path, filled by Lookup, drained by Forget.
/// Inodes are a stable function of the path, so eviction never changes a
/// node's identity.
#[derive(Default)]
struct NodeCache {
    by_ino: HashMap<u64, PathBuf>,
}

pub struct SysboxFs {
    cntr: Arc<Container>,
    registry: Arc<HandlerRegistry>,
    io: Arc<dyn IoService>,
    nodes: Mutex<NodeCache>,
}

impl SysboxFs {
    pub fn new(cntr: Arc<Container>, registry: Arc<HandlerRegistry>, io: Arc<dyn IoService>) -> Self {
        let mut cache = NodeCache::default();
        cache.by_ino.insert(fuser::FUSE_ROOT_ID, PathBuf::from("/"));
        SysboxFs {
            cntr,
            registry,
            io,
            nodes: Mutex::new(cache),
        }
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.nodes.lock().unwrap().by_ino.get(&ino).cloned()
    }

    fn remember(&self, ino: u64, path: &Path) {
        self.nodes
            .lock()
            .unwrap()
            .by_ino
            .insert(ino, path.to_path_buf());
    }

    fn handler_request(&self, req: &Request<'_>) -> HandlerRequest {
        HandlerRequest {
            id: req.unique(),
            pid: req.pid(),
            uid: req.uid(),
            gid: req.gid(),
            offset: 0,
            data: vec![],
            container: self.cntr.clone(),
        }
    }

    /// Caller's user-ns root ids, used to remap every attribute we hand the
    /// kernel. Falls back to the overflow ids when the caller's map cannot
    /// be read (e.g. it exited mid-request).
    fn caller_root_ids(&self, req: &Request<'_>) -> (u32, u32) {
        let process = Process::new(req.pid() as i32, self.io.clone());
        match (process.userns_root_uid(), process.userns_root_gid()) {
            (Ok(uid), Ok(gid)) => (uid, gid),
            _ => (super::attr::NOBODY_UID, super::attr::NOBODY_GID),
        }
    }

    /// Full lookup pipeline for one virtual path: handler dispatch, attr
    /// conversion, id remapping, cache insertion.
    fn lookup_path(&self, path: &Path, req: &Request<'_>) -> Result<FileAttr, Errno> {
        let handler = self.registry.handler_for(path).ok_or(Errno::ENOENT)?;
        let node = self
            .io
            .new_node(name_of(path), path, OFlag::O_RDONLY, 0);
        let hreq = self.handler_request(req);
        let stat = handler.lookup(node.as_ref(), &hreq)?;

        let ino = path_inode(&path.to_string_lossy());
        let mut attr = stat_to_attr(&stat, ino);
        let (root_uid, root_gid) = self.caller_root_ids(req);
        remap_attr_ids(&mut attr, root_uid, root_gid);

        self.remember(ino, path);
        Ok(attr)
    }

    fn handler_and_node(
        &self,
        ino: u64,
        flags: OFlag,
    ) -> Result<(Arc<dyn Handler>, Box<dyn crate::io::IoNode>), Errno> {
        let path = self.path_of(ino).ok_or(Errno::ENOENT)?;
        let handler = self.registry.handler_for(&path).ok_or(Errno::ENOENT)?;
        let node = self.io.new_node(name_of(&path), &path, flags, 0);
        Ok((handler, node))
    }

    fn ttl(&self) -> std::time::Duration {
        attr_ttl(self.cntr.registration_completed())
    }

    /// The kernel sends Forget exactly when it drops its last reference; no
    /// refcounting needed on our side. The root stays pinned.
    fn forget_node(&self, ino: u64) {
        if ino != fuser::FUSE_ROOT_ID {
            self.nodes.lock().unwrap().by_ino.remove(&ino);
        }
    }
}

fn name_of(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("/")
}

fn reply_errno<R: ReplyError>(reply: R, errno: Errno) {
    reply.error(errno as i32)
}

/// The fuser reply types share an `error` method but no trait; give them one.
trait ReplyError {
    fn error(self, errno: i32);
}

macro_rules! impl_reply_error {
    ($($ty:ty),*) => {
        $(impl ReplyError for $ty {
            fn error(self, errno: i32) {
                <$ty>::error(self, errno)
            }
        })*
    };
}

impl_reply_error!(
    ReplyEntry,
    ReplyAttr,
    ReplyOpen,
    ReplyData,
    ReplyWrite,
    ReplyDirectory,
    ReplyEmpty,
    ReplyCreate
);

impl Filesystem for SysboxFs {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_path = match self.path_of(parent) {
            Some(path) => path,
            None => return reply_errno(reply, Errno::ENOENT),
        };
        let path = parent_path.join(name);
        match self.lookup_path(&path, req) {
            Ok(attr) => reply.entry(&self.ttl(), &attr, 0),
            Err(errno) => reply_errno(reply, errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, _nlookup: u64) {
        self.forget_node(ino);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply_errno(reply, Errno::ENOENT),
        };
        match self.lookup_path(&path, req) {
            Ok(attr) => reply.attr(&self.ttl(), &attr),
            Err(errno) => reply_errno(reply, errno),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // Only size changes are honoured (truncate before write on emulated
        // files); everything else is refused.
        if mode.is_some() || uid.is_some() || gid.is_some() {
            return reply_errno(reply, Errno::EPERM);
        }
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply_errno(reply, Errno::ENOENT),
        };
        match self.lookup_path(&path, req) {
            Ok(mut attr) => {
                if let Some(size) = size {
                    attr.size = size;
                }
                reply.attr(&self.ttl(), &attr)
            }
            Err(errno) => reply_errno(reply, errno),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let result = self
            .handler_and_node(ino, OFlag::O_RDONLY)
            .and_then(|(handler, node)| {
                let hreq = self.handler_request(req);
                handler.read_link(node.as_ref(), &hreq)
            });
        match result {
            Ok(target) => {
                use std::os::unix::ffi::OsStrExt;
                reply.data(target.as_os_str().as_bytes())
            }
            Err(errno) => reply_errno(reply, errno),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let parent_path = match self.path_of(parent) {
            Some(path) => path,
            None => return reply_errno(reply, Errno::ENOENT),
        };
        let path = parent_path.join(name);
        let result = self.registry.handler_for(&path).ok_or(Errno::ENOENT).and_then(|handler| {
            let mut node = self.io.new_node(
                name_of(&path),
                &path,
                OFlag::O_CREAT | OFlag::O_DIRECTORY,
                mode,
            );
            let hreq = self.handler_request(req);
            handler.open(node.as_mut(), &hreq).map(|_| ())
        });
        match result {
            Ok(()) => match self.lookup_path(&path, req) {
                Ok(attr) => reply.entry(&self.ttl(), &attr, 0),
                Err(errno) => reply_errno(reply, errno),
            },
            Err(errno) => reply_errno(reply, errno),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let oflags = OFlag::from_bits_truncate(flags);
        let result = self
            .handler_and_node(ino, oflags)
            .and_then(|(handler, mut node)| {
                let hreq = self.handler_request(req);
                handler.open(node.as_mut(), &hreq)
            });
        match result {
            Ok(nonseekable) => {
                // Direct-io so every read reaches us regardless of the
                // advertised size; nonseekable additionally permits short
                // reads on emulated content.
                let mut open_flags = FOPEN_DIRECT_IO;
                if nonseekable {
                    open_flags |= FOPEN_NONSEEKABLE;
                }
                reply.opened(0, open_flags)
            }
            Err(errno) => reply_errno(reply, errno),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let parent_path = match self.path_of(parent) {
            Some(path) => path,
            None => return reply_errno(reply, Errno::ENOENT),
        };
        let path = parent_path.join(name);
        let oflags = OFlag::from_bits_truncate(flags) | OFlag::O_CREAT;
        let result = self.registry.handler_for(&path).ok_or(Errno::ENOENT).and_then(|handler| {
            let mut node = self.io.new_node(name_of(&path), &path, oflags, mode);
            let hreq = self.handler_request(req);
            handler.open(node.as_mut(), &hreq)
        });
        match result {
            Ok(nonseekable) => match self.lookup_path(&path, req) {
                Ok(attr) => {
                    let mut open_flags = FOPEN_DIRECT_IO;
                    if nonseekable {
                        open_flags |= FOPEN_NONSEEKABLE;
                    }
                    reply.created(&self.ttl(), &attr, 0, 0, open_flags)
                }
                Err(errno) => reply_errno(reply, errno),
            },
            Err(errno) => reply_errno(reply, errno),
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self
            .handler_and_node(ino, OFlag::O_RDONLY)
            .and_then(|(handler, mut node)| {
                let mut hreq = self.handler_request(req);
                hreq.offset = offset.max(0) as u64;
                hreq.data = vec![0u8; size as usize];
                let n = handler.read(node.as_mut(), &mut hreq)?;
                hreq.data.truncate(n);
                Ok(hreq.data)
            });
        match result {
            Ok(data) => reply.data(&data),
            Err(errno) => reply_errno(reply, errno),
        }
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let oflags = OFlag::from_bits_truncate(flags);
        let result = self
            .handler_and_node(ino, oflags)
            .and_then(|(handler, mut node)| {
                let mut hreq = self.handler_request(req);
                hreq.offset = offset.max(0) as u64;
                hreq.data = data.to_vec();
                handler.write(node.as_mut(), &mut hreq)
            });
        match result {
            Ok(n) => reply.written(n as u32),
            Err(errno) => reply_errno(reply, errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // Nodes are opened and closed per request so nsenter'ed operations
        // always observe fresh host state; nothing to do here.
        reply.ok();
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply_errno(reply, Errno::ENOENT),
        };
        let result = self
            .handler_and_node(ino, OFlag::O_RDONLY)
            .and_then(|(handler, node)| {
                let hreq = self.handler_request(req);
                handler.read_dir_all(node.as_ref(), &hreq)
            });
        let entries = match result {
            Ok(entries) => entries,
            Err(errno) => return reply_errno(reply, errno),
        };

        let parent = path.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| path.clone());
        let mut listing: Vec<(u64, fuser::FileType, String)> = vec![
            (ino, fuser::FileType::Directory, ".".to_string()),
            (
                path_inode(&parent.to_string_lossy()),
                fuser::FileType::Directory,
                "..".to_string(),
            ),
        ];
        for entry in entries {
            let child = path.join(&entry.name);
            listing.push((
                path_inode(&child.to_string_lossy()),
                file_kind(entry.stat.mode),
                entry.name,
            ));
        }

        for (i, (ino, kind, name)) in listing.into_iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{create_io_service, IoBackend, MemIo};

    fn filesystem() -> SysboxFs {
        let io = create_io_service(IoBackend::Mem);
        let mem = io.as_any().downcast_ref::<MemIo>().unwrap();
        mem.insert_dir("/proc", 0o555, 0, 0);
        mem.insert_file("/proc/uptime", 0o444, 0, 0, b"");
        let registry = Arc::new(HandlerRegistry::new(io.clone()));
        SysboxFs::new(Arc::new(Container::new("c1")), registry, io)
    }

    #[test]
    fn test_cache_root_preseeded() {
        let fs = filesystem();
        assert_eq!(fs.path_of(fuser::FUSE_ROOT_ID).unwrap(), Path::new("/"));
    }

    #[test]
    fn test_forget_then_relookup_keeps_identity() {
        let fs = filesystem();
        let path = Path::new("/proc/uptime");
        let ino = path_inode(&path.to_string_lossy());
        fs.remember(ino, path);
        assert_eq!(fs.path_of(ino).unwrap(), path);

        // Forget drops the mapping; the inode of a later lookup is unchanged
        // because it is derived from the path.
        fs.nodes.lock().unwrap().by_ino.remove(&ino);
        assert!(fs.path_of(ino).is_none());
        assert_eq!(ino, path_inode(&path.to_string_lossy()));
    }

    #[test]
    fn test_forget_never_evicts_root() {
        let fs = filesystem();
        fs.forget_node(fuser::FUSE_ROOT_ID);
        assert!(fs.path_of(fuser::FUSE_ROOT_ID).is_some());

        let ino = path_inode("/proc/uptime");
        fs.remember(ino, Path::new("/proc/uptime"));
        fs.forget_node(ino);
        assert!(fs.path_of(ino).is_none());
    }
}
