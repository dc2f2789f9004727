//! Mountpoint intelligence: mountinfo snapshots, classification of the
//! mounts sysbox-fs manages inside a container, and option/flag conversion.

pub mod flags;
mod info;

pub use info::{MountEntry, MountInfoSnapshot};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::container::Container;
use crate::handler::HandlerRegistry;
use crate::io::IoService;

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("failed to parse mountinfo")]
    Procfs(#[from] procfs::ProcError),
    #[error(transparent)]
    Io(#[from] crate::io::IoError),
    #[error("{0} is not a mountpoint")]
    NotAMountpoint(PathBuf),
}

type Result<T> = std::result::Result<T, MountError>;

/// Classification of a mountpoint relative to the sysbox-fs overlay.
pub struct MountService {
    io: Arc<dyn IoService>,
    registry: Arc<HandlerRegistry>,
}

impl MountService {
    pub fn new(io: Arc<dyn IoService>, registry: Arc<HandlerRegistry>) -> Self {
        MountService { io, registry }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Live mountinfo of `pid`.
    pub fn snapshot(&self, pid: i32) -> Result<MountInfoSnapshot> {
        MountInfoSnapshot::for_pid(pid)
    }

    /// Snapshot with mountpoint inodes resolved, as stored on a container
    /// record at registration to decide immutability later.
    pub fn snapshot_with_inodes(&self, pid: i32) -> Result<MountInfoSnapshot> {
        let mut snap = MountInfoSnapshot::for_pid(pid)?;
        snap.resolve_inodes(&self.io);
        Ok(snap)
    }

    /// Bind-mounts the handler registry declares under `/proc`.
    pub fn proc_bind_paths(&self) -> Vec<PathBuf> {
        self.registry.bind_mount_paths("/proc")
    }

    /// Bind-mounts the handler registry declares under `/sys`.
    pub fn sys_bind_paths(&self) -> Vec<PathBuf> {
        self.registry.bind_mount_paths("/sys")
    }

    fn is_base_fs_type(fs_type: &str) -> bool {
        fs_type == "proc" || fs_type == "sysfs"
    }

    fn base_virtual_root(fs_type: &str) -> &'static Path {
        if fs_type == "proc" {
            Path::new("/proc")
        } else {
            Path::new("/sys")
        }
    }

    /// A procfs/sysfs mount serviced primarily by the kernel, over which
    /// sysbox-fs layers its submounts.
    pub fn is_sysboxfs_base_mount(&self, entry: &MountEntry) -> bool {
        Self::is_base_fs_type(&entry.fs_type)
    }

    /// Paths that must appear as sysbox-fs submounts of `base` for the given
    /// container: the registry's bind-mounts plus the container's ro and
    /// mask overlays.
    pub fn managed_submount_paths(
        &self,
        base: &MountEntry,
        cntr: Option<&Container>,
    ) -> Vec<PathBuf> {
        let virtual_root = Self::base_virtual_root(&base.fs_type);
        let mut rels: Vec<PathBuf> = self
            .registry
            .bind_mount_paths(&virtual_root.to_string_lossy())
            .into_iter()
            .filter_map(|p| p.strip_prefix(virtual_root).map(Path::to_path_buf).ok())
            .collect();
        if let Some(cntr) = cntr {
            if base.fs_type == "proc" {
                for path in cntr.proc_ro_paths().iter().chain(cntr.proc_mask_paths().iter()) {
                    if let Ok(rel) = path.strip_prefix("/proc") {
                        rels.push(rel.to_path_buf());
                    }
                }
            }
        }
        rels.sort();
        rels.dedup();
        rels.iter().map(|rel| base.mount_point.join(rel)).collect()
    }

    /// Is `entry` a submount sysbox-fs placed over a base mount?
    pub fn is_sysboxfs_submount(
        &self,
        snap: &MountInfoSnapshot,
        entry: &MountEntry,
        cntr: Option<&Container>,
    ) -> bool {
        let parent = match snap.by_id(entry.parent_id) {
            Some(parent) => parent,
            None => return false,
        };
        if !self.is_sysboxfs_base_mount(parent) {
            return false;
        }
        self.managed_submount_paths(parent, cntr)
            .iter()
            .any(|p| p == &entry.mount_point)
    }

    pub fn is_sysboxfs_ro_submount(
        &self,
        snap: &MountInfoSnapshot,
        entry: &MountEntry,
        cntr: Option<&Container>,
    ) -> bool {
        self.is_sysboxfs_submount(snap, entry, cntr) && entry.is_read_only()
    }

    /// A masking submount: a bind of `/dev/null` placed over a node the
    /// container must not see.
    pub fn is_sysboxfs_masked_submount(
        &self,
        snap: &MountInfoSnapshot,
        entry: &MountEntry,
        cntr: Option<&Container>,
    ) -> bool {
        self.is_sysboxfs_submount(snap, entry, cntr) && entry.root.ends_with("/null")
    }

    /// The container's start-of-life mountinfo, snapshotted on first use.
    /// These mounts are the immutable set.
    fn init_mounts(&self, cntr: &Container) -> Option<std::sync::Arc<MountInfoSnapshot>> {
        if let Some(snap) = cntr.init_mounts() {
            return Some(snap);
        }
        let init_pid = cntr.init_pid();
        if init_pid == 0 {
            return None;
        }
        match self.snapshot_with_inodes(init_pid) {
            Ok(snap) => {
                cntr.set_init_mounts(snap);
                cntr.init_mounts()
            }
            Err(err) => {
                tracing::warn!(cntr = cntr.id(), ?err, "failed to snapshot init mounts");
                None
            }
        }
    }

    /// A mount that existed when the container started. Matched by mount id
    /// with a (mountpoint, inode) fallback.
    pub fn is_immutable_mount(&self, cntr: &Container, entry: &MountEntry) -> bool {
        match self.init_mounts(cntr) {
            Some(init) => init.contains(entry),
            None => false,
        }
    }

    pub fn is_immutable_ro_mount(&self, cntr: &Container, entry: &MountEntry) -> bool {
        if !entry.is_read_only() {
            return false;
        }
        match self.init_mounts(cntr) {
            Some(init) => match init.by_id(entry.mnt_id) {
                Some(orig) => orig.is_read_only(),
                None => init
                    .by_mountpoint(&entry.mount_point)
                    .map(|orig| orig.is_read_only())
                    .unwrap_or(false),
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerRegistry;
    use crate::io::{create_io_service, IoBackend};

    fn service() -> MountService {
        let io = create_io_service(IoBackend::Mem);
        let registry = Arc::new(HandlerRegistry::new(io.clone()));
        MountService::new(io, registry)
    }

    fn entry(mnt_id: i32, parent_id: i32, mount_point: &str, fs_type: &str, opts: &str) -> MountEntry {
        MountEntry {
            mnt_id,
            parent_id,
            root: "/".to_string(),
            mount_point: PathBuf::from(mount_point),
            mount_options: opts.to_string(),
            super_options: String::new(),
            fs_type: fs_type.to_string(),
            source: Some(fs_type.to_string()),
            inode: None,
        }
    }

    fn masked_entry(mnt_id: i32, parent_id: i32, mount_point: &str) -> MountEntry {
        MountEntry {
            root: "/null".to_string(),
            source: Some("udev".to_string()),
            ..entry(mnt_id, parent_id, mount_point, "devtmpfs", "rw")
        }
    }

    #[test]
    fn test_submount_classification() {
        let svc = service();
        let snap = MountInfoSnapshot::from_entries(vec![
            entry(11, 1, "/", "ext4", "rw"),
            entry(20, 11, "/proc", "proc", "rw,nosuid"),
            entry(21, 20, "/proc/sys", "fuse", "rw,nosuid"),
            entry(22, 20, "/proc/uptime", "fuse", "rw,nosuid"),
            entry(23, 20, "/proc/foo", "tmpfs", "rw"),
            masked_entry(24, 20, "/proc/kcore"),
        ]);

        let base = snap.by_id(20).unwrap();
        assert!(svc.is_sysboxfs_base_mount(base));

        assert!(svc.is_sysboxfs_submount(&snap, snap.by_id(21).unwrap(), None));
        assert!(svc.is_sysboxfs_submount(&snap, snap.by_id(22).unwrap(), None));
        // Not a registered bind path and no container context: foreign mount.
        assert!(!svc.is_sysboxfs_submount(&snap, snap.by_id(23).unwrap(), None));

        // The kcore mask is ours only for a container that declares it.
        let cntr = Container::new("c1");
        assert!(!svc.is_sysboxfs_submount(&snap, snap.by_id(24).unwrap(), Some(&cntr)));
    }

    #[test]
    fn test_mask_paths_count_as_managed() {
        use crate::container::ContainerData;
        let svc = service();
        let cntr = Container::new("c1");
        let data = ContainerData {
            id: "c1".to_string(),
            init_pid: 1,
            ctime: chrono::Utc::now(),
            uid_first: 0,
            uid_size: 65536,
            gid_first: 0,
            gid_size: 65536,
            proc_ro_paths: vec![PathBuf::from("/proc/sys/kernel/core_pattern")],
            proc_mask_paths: vec![PathBuf::from("/proc/kcore")],
        };
        cntr.fill(&data, None, 7);

        let snap = MountInfoSnapshot::from_entries(vec![
            entry(20, 1, "/proc", "proc", "rw"),
            masked_entry(24, 20, "/proc/kcore"),
        ]);
        let kcore = snap.by_id(24).unwrap();
        assert!(svc.is_sysboxfs_submount(&snap, kcore, Some(&cntr)));
        assert!(svc.is_sysboxfs_masked_submount(&snap, kcore, Some(&cntr)));
    }

    #[test]
    fn test_immutable_ro_detection() {
        let svc = service();
        let cntr = Container::new("c1");
        cntr.set_init_mounts(MountInfoSnapshot::from_entries(vec![
            entry(30, 1, "/etc/resolv.conf", "ext4", "ro,relatime"),
            entry(31, 1, "/tmp", "tmpfs", "rw"),
        ]));

        let now_ro = entry(30, 1, "/etc/resolv.conf", "ext4", "ro,relatime");
        assert!(svc.is_immutable_mount(&cntr, &now_ro));
        assert!(svc.is_immutable_ro_mount(&cntr, &now_ro));

        // Originally rw: remount-to-ro later does not make it immutable-ro.
        let tmp_ro = entry(31, 1, "/tmp", "tmpfs", "ro");
        assert!(svc.is_immutable_mount(&cntr, &tmp_ro));
        assert!(!svc.is_immutable_ro_mount(&cntr, &tmp_ro));

        // Mounted after the container started: not immutable.
        let late = entry(90, 1, "/mnt/new", "tmpfs", "rw");
        assert!(!svc.is_immutable_mount(&cntr, &late));
    }
}
