//! Uniform I/O layer for the rest of the daemon.
//!
//! Every component that touches a file does so through an [`IoNode`] obtained
//! from an [`IoService`]. The service is backed either by the host filesystem
//! or by an in-memory tree, so everything above this layer can be exercised
//! in unit tests without root privileges.

use std::any::Any;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nix::fcntl::OFlag;

#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("i/o failure on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} not found")]
    NotFound(PathBuf),
    #[error("{0} is not open")]
    NotOpen(PathBuf),
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("{0} is not a symlink")]
    NotALink(PathBuf),
}

type Result<T> = std::result::Result<T, IoError>;

impl IoError {
    pub fn errno(&self) -> nix::errno::Errno {
        match self {
            IoError::Io { source, .. } => source
                .raw_os_error()
                .map(nix::errno::Errno::from_raw)
                .unwrap_or(nix::errno::Errno::EIO),
            IoError::NotFound(_) => nix::errno::Errno::ENOENT,
            IoError::NotOpen(_) => nix::errno::Errno::EBADF,
            IoError::NotADirectory(_) => nix::errno::Errno::ENOTDIR,
            IoError::NotALink(_) => nix::errno::Errno::EINVAL,
        }
    }
}

/// Owned stat record. The memory backend fabricates these, so we do not
/// expose the raw `libc::stat`. Serializable because the re-exec helper
/// reports stats across the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeStat {
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

impl NodeStat {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}

/// One directory entry as returned by `read_dir_all`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub stat: NodeStat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoBackend {
    /// Real host filesystem.
    Host,
    /// In-memory tree for tests.
    Mem,
}

/// A single potential I/O target: virtual identity plus a lazily acquired
/// backing handle.
pub trait IoNode: Send {
    fn name(&self) -> &str;
    fn path(&self) -> &Path;
    fn open_flags(&self) -> OFlag;
    fn set_open_flags(&mut self, flags: OFlag);

    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn read_file(&self) -> Result<String>;
    fn read_line(&self) -> Result<String>;
    fn read_dir_all(&self) -> Result<Vec<NodeEntry>>;
    fn read_link(&self) -> Result<PathBuf>;
    fn stat(&self) -> Result<NodeStat>;
    fn seek_reset(&mut self) -> Result<()>;
    fn mkdir_all(&self, mode: u32) -> Result<()>;

    /// Inode of the node itself; used on `/proc/<pid>/ns/*` entries where the
    /// inode identifies the namespace.
    fn ns_inode(&self) -> Result<u64>;
}

pub trait IoService: Send + Sync {
    fn backend(&self) -> IoBackend;
    fn new_node(&self, name: &str, path: &Path, flags: OFlag, mode: u32) -> Box<dyn IoNode>;
    fn as_any(&self) -> &dyn Any;
}

pub fn create_io_service(backend: IoBackend) -> Arc<dyn IoService> {
    match backend {
        IoBackend::Host => Arc::new(HostIo),
        IoBackend::Mem => Arc::new(MemIo::new()),
    }
}

fn io_err(path: &Path, source: std::io::Error) -> IoError {
    IoError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// Host backend

struct HostIo;

impl IoService for HostIo {
    fn backend(&self) -> IoBackend {
        IoBackend::Host
    }

    fn new_node(&self, name: &str, path: &Path, flags: OFlag, mode: u32) -> Box<dyn IoNode> {
        Box::new(HostNode {
            name: name.to_string(),
            path: path.to_path_buf(),
            flags,
            mode,
            file: None,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct HostNode {
    name: String,
    path: PathBuf,
    flags: OFlag,
    mode: u32,
    file: Option<File>,
}

impl HostNode {
    fn file(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            self.open()?;
        }
        self.file
            .as_mut()
            .ok_or_else(|| IoError::NotOpen(self.path.clone()))
    }
}

impl IoNode for HostNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn open_flags(&self) -> OFlag {
        self.flags
    }

    fn set_open_flags(&mut self, flags: OFlag) {
        self.flags = flags;
    }

    fn open(&mut self) -> Result<()> {
        let mut opts = OpenOptions::new();
        let acc = self.flags & OFlag::O_ACCMODE;
        opts.read(acc == OFlag::O_RDONLY || acc == OFlag::O_RDWR)
            .write(acc == OFlag::O_WRONLY || acc == OFlag::O_RDWR)
            .append(self.flags.contains(OFlag::O_APPEND))
            .truncate(self.flags.contains(OFlag::O_TRUNC))
            .create(self.flags.contains(OFlag::O_CREAT))
            .mode(self.mode)
            .custom_flags((self.flags & !(OFlag::O_ACCMODE | OFlag::O_CREAT | OFlag::O_TRUNC)).bits());
        let file = opts.open(&self.path).map_err(|e| io_err(&self.path, e))?;
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let path = self.path.clone();
        self.file()?.read(buf).map_err(|e| io_err(&path, e))
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let path = self.path.clone();
        self.file()?.read_at(buf, offset).map_err(|e| io_err(&path, e))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let path = self.path.clone();
        self.file()?.write(buf).map_err(|e| io_err(&path, e))
    }

    fn read_file(&self) -> Result<String> {
        fs::read_to_string(&self.path).map_err(|e| io_err(&self.path, e))
    }

    fn read_line(&self) -> Result<String> {
        let content = self.read_file()?;
        Ok(content.lines().next().unwrap_or_default().to_string())
    }

    fn read_dir_all(&self) -> Result<Vec<NodeEntry>> {
        let mut entries = vec![];
        for dent in fs::read_dir(&self.path).map_err(|e| io_err(&self.path, e))? {
            let dent = dent.map_err(|e| io_err(&self.path, e))?;
            let meta = match dent.path().symlink_metadata() {
                Ok(meta) => meta,
                // Procfs entries come and go while we walk them.
                Err(_) => continue,
            };
            entries.push(NodeEntry {
                name: dent.file_name().to_string_lossy().into_owned(),
                stat: NodeStat {
                    ino: meta.ino(),
                    mode: meta.mode(),
                    uid: meta.uid(),
                    gid: meta.gid(),
                    size: meta.size(),
                },
            });
        }
        Ok(entries)
    }

    fn read_link(&self) -> Result<PathBuf> {
        fs::read_link(&self.path).map_err(|e| io_err(&self.path, e))
    }

    fn stat(&self) -> Result<NodeStat> {
        let meta = self
            .path
            .symlink_metadata()
            .map_err(|e| io_err(&self.path, e))?;
        Ok(NodeStat {
            ino: meta.ino(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
        })
    }

    fn seek_reset(&mut self) -> Result<()> {
        let path = self.path.clone();
        self.file()?
            .seek(SeekFrom::Start(0))
            .map(|_| ())
            .map_err(|e| io_err(&path, e))
    }

    fn mkdir_all(&self, mode: u32) -> Result<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(&self.path)
            .map_err(|e| io_err(&self.path, e))
    }

    fn ns_inode(&self) -> Result<u64> {
        // Follows the magic link: the inode of the namespace, not the link.
        let meta = fs::metadata(&self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(meta.ino())
    }
}

// Memory backend

#[derive(Debug, Clone)]
struct MemEntry {
    ino: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    data: Vec<u8>,
    link: Option<PathBuf>,
}

pub struct MemIo {
    store: Arc<Mutex<HashMap<PathBuf, MemEntry>>>,
    next_ino: AtomicU64,
}

impl MemIo {
    fn new() -> Self {
        let io = MemIo {
            store: Arc::new(Mutex::new(HashMap::new())),
            next_ino: AtomicU64::new(2),
        };
        io.insert_dir("/", 0o555, 0, 0);
        io
    }

    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert_file<P: AsRef<Path>>(&self, path: P, mode: u32, uid: u32, gid: u32, data: &[u8]) {
        let ino = self.alloc_ino();
        self.store.lock().unwrap().insert(
            path.as_ref().to_path_buf(),
            MemEntry {
                ino,
                mode: libc::S_IFREG | mode,
                uid,
                gid,
                data: data.to_vec(),
                link: None,
            },
        );
    }

    pub fn insert_dir<P: AsRef<Path>>(&self, path: P, mode: u32, uid: u32, gid: u32) {
        let ino = self.alloc_ino();
        self.store.lock().unwrap().insert(
            path.as_ref().to_path_buf(),
            MemEntry {
                ino,
                mode: libc::S_IFDIR | mode,
                uid,
                gid,
                data: vec![],
                link: None,
            },
        );
    }

    pub fn insert_link<P: AsRef<Path>, T: AsRef<Path>>(&self, path: P, target: T) {
        let ino = self.alloc_ino();
        self.store.lock().unwrap().insert(
            path.as_ref().to_path_buf(),
            MemEntry {
                ino,
                mode: libc::S_IFLNK | 0o777,
                uid: 0,
                gid: 0,
                data: vec![],
                link: Some(target.as_ref().to_path_buf()),
            },
        );
    }

    pub fn contents<P: AsRef<Path>>(&self, path: P) -> Option<Vec<u8>> {
        self.store
            .lock()
            .unwrap()
            .get(path.as_ref())
            .map(|e| e.data.clone())
    }
}

impl IoService for MemIo {
    fn backend(&self) -> IoBackend {
        IoBackend::Mem
    }

    fn new_node(&self, name: &str, path: &Path, flags: OFlag, mode: u32) -> Box<dyn IoNode> {
        Box::new(MemNode {
            name: name.to_string(),
            path: path.to_path_buf(),
            flags,
            store: self.store.clone(),
            cursor: 0,
            open: false,
            mode,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct MemNode {
    name: String,
    path: PathBuf,
    flags: OFlag,
    mode: u32,
    store: Arc<Mutex<HashMap<PathBuf, MemEntry>>>,
    cursor: usize,
    open: bool,
}

impl MemNode {
    fn entry(&self) -> Result<MemEntry> {
        self.store
            .lock()
            .unwrap()
            .get(&self.path)
            .cloned()
            .ok_or_else(|| IoError::NotFound(self.path.clone()))
    }

    fn to_stat(entry: &MemEntry) -> NodeStat {
        NodeStat {
            ino: entry.ino,
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            size: entry.data.len() as u64,
        }
    }
}

impl IoNode for MemNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn open_flags(&self) -> OFlag {
        self.flags
    }

    fn set_open_flags(&mut self, flags: OFlag) {
        self.flags = flags;
    }

    fn open(&mut self) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        if !store.contains_key(&self.path) {
            if !self.flags.contains(OFlag::O_CREAT) {
                return Err(IoError::NotFound(self.path.clone()));
            }
            let ino = store.len() as u64 + 1000;
            store.insert(
                self.path.clone(),
                MemEntry {
                    ino,
                    mode: libc::S_IFREG | self.mode,
                    uid: 0,
                    gid: 0,
                    data: vec![],
                    link: None,
                },
            );
        }
        self.open = true;
        self.cursor = 0;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.cursor = 0;
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.open {
            self.open()?;
        }
        let entry = self.entry()?;
        if self.cursor >= entry.data.len() {
            return Ok(0);
        }
        let n = std::cmp::min(buf.len(), entry.data.len() - self.cursor);
        buf[..n].copy_from_slice(&entry.data[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let entry = self.entry()?;
        let offset = offset as usize;
        if offset >= entry.data.len() {
            return Ok(0);
        }
        let n = std::cmp::min(buf.len(), entry.data.len() - offset);
        buf[..n].copy_from_slice(&entry.data[offset..offset + n]);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.open {
            self.open()?;
        }
        let mut store = self.store.lock().unwrap();
        let entry = store
            .get_mut(&self.path)
            .ok_or_else(|| IoError::NotFound(self.path.clone()))?;
        if self.flags.contains(OFlag::O_TRUNC) || self.cursor == 0 {
            entry.data = buf.to_vec();
        } else {
            entry.data.truncate(self.cursor);
            entry.data.extend_from_slice(buf);
        }
        self.cursor += buf.len();
        Ok(buf.len())
    }

    fn read_file(&self) -> Result<String> {
        let entry = self.entry()?;
        Ok(String::from_utf8_lossy(&entry.data).into_owned())
    }

    fn read_line(&self) -> Result<String> {
        let content = self.read_file()?;
        Ok(content.lines().next().unwrap_or_default().to_string())
    }

    fn read_dir_all(&self) -> Result<Vec<NodeEntry>> {
        let store = self.store.lock().unwrap();
        let dir = store
            .get(&self.path)
            .ok_or_else(|| IoError::NotFound(self.path.clone()))?;
        if dir.mode & libc::S_IFMT != libc::S_IFDIR {
            return Err(IoError::NotADirectory(self.path.clone()));
        }
        let mut entries = vec![];
        for (path, entry) in store.iter() {
            if path.parent() == Some(&self.path) {
                entries.push(NodeEntry {
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    stat: MemNode::to_stat(entry),
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read_link(&self) -> Result<PathBuf> {
        let entry = self.entry()?;
        entry.link.ok_or_else(|| IoError::NotALink(self.path.clone()))
    }

    fn stat(&self) -> Result<NodeStat> {
        let entry = self.entry()?;
        Ok(MemNode::to_stat(&entry))
    }

    fn seek_reset(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn mkdir_all(&self, mode: u32) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        let mut cur = PathBuf::from("/");
        let mut ino = store.len() as u64 + 5000;
        for comp in self.path.components().skip(1) {
            cur.push(comp);
            store.entry(cur.clone()).or_insert_with(|| {
                ino += 1;
                MemEntry {
                    ino,
                    mode: libc::S_IFDIR | mode,
                    uid: 0,
                    gid: 0,
                    data: vec![],
                    link: None,
                }
            });
        }
        Ok(())
    }

    fn ns_inode(&self) -> Result<u64> {
        // Like the host backend, follow the link to the namespace itself.
        let store = self.store.lock().unwrap();
        let entry = store
            .get(&self.path)
            .ok_or_else(|| IoError::NotFound(self.path.clone()))?;
        if let Some(target) = &entry.link {
            let target_entry = store
                .get(target)
                .ok_or_else(|| IoError::NotFound(target.clone()))?;
            return Ok(target_entry.ino);
        }
        Ok(entry.ino)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_mem_round_trip() -> Result<()> {
        let io = create_io_service(IoBackend::Mem);
        let mem = io.as_any().downcast_ref::<MemIo>().unwrap();
        mem.insert_dir("/proc", 0o555, 0, 0);
        mem.insert_file("/proc/uptime", 0o444, 0, 0, b"5705.13 9945.12\n");

        let mut node = io.new_node("uptime", Path::new("/proc/uptime"), OFlag::O_RDONLY, 0);
        let mut buf = [0u8; 7];
        assert_eq!(node.read(&mut buf)?, 7);
        assert_eq!(&buf, b"5705.13");

        let stat = node.stat()?;
        assert_eq!(stat.mode & libc::S_IFMT, libc::S_IFREG);
        assert_eq!(stat.size, 16);
        Ok(())
    }

    #[test]
    fn test_mem_dir_listing() -> Result<()> {
        let io = create_io_service(IoBackend::Mem);
        let mem = io.as_any().downcast_ref::<MemIo>().unwrap();
        mem.insert_dir("/sys", 0o555, 0, 0);
        mem.insert_file("/sys/b", 0o444, 0, 0, b"");
        mem.insert_file("/sys/a", 0o444, 0, 0, b"");
        mem.insert_dir("/sys/kernel", 0o555, 0, 0);
        mem.insert_file("/sys/kernel/deep", 0o444, 0, 0, b"");

        let node = io.new_node("sys", Path::new("/sys"), OFlag::O_RDONLY, 0);
        let names: Vec<_> = node.read_dir_all()?.into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a", "b", "kernel"]);
        Ok(())
    }

    #[test]
    fn test_mem_write_replaces() -> Result<()> {
        let io = create_io_service(IoBackend::Mem);
        let mem = io.as_any().downcast_ref::<MemIo>().unwrap();
        mem.insert_file("/proc/sys/net/ipv4/ip_forward", 0o644, 0, 0, b"0\n");

        let mut node = io.new_node(
            "ip_forward",
            Path::new("/proc/sys/net/ipv4/ip_forward"),
            OFlag::O_WRONLY,
            0,
        );
        node.write(b"1\n")?;
        assert_eq!(
            mem.contents("/proc/sys/net/ipv4/ip_forward").unwrap(),
            b"1\n"
        );
        Ok(())
    }

    #[test]
    fn test_host_missing_file() {
        let io = create_io_service(IoBackend::Host);
        let mut node = io.new_node(
            "gone",
            Path::new("/nonexistent/sysboxfs/file"),
            OFlag::O_RDONLY,
            0,
        );
        let err = node.open().unwrap_err();
        assert_eq!(err.errno(), nix::errno::Errno::ENOENT);
    }
}
