use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::mount::MountInfoSnapshot;

/// Registration payload, as delivered by the runtime when the container's
/// init process is up.
#[derive(Debug, Clone)]
pub struct ContainerData {
    pub id: String,
    pub init_pid: i32,
    pub ctime: DateTime<Utc>,
    pub uid_first: u32,
    pub uid_size: u32,
    pub gid_first: u32,
    pub gid_size: u32,
    pub proc_ro_paths: Vec<PathBuf>,
    pub proc_mask_paths: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub(crate) struct ContainerInner {
    pub init_pid: i32,
    pub pid_fd: Option<OwnedFd>,
    pub ctime: Option<DateTime<Utc>>,
    pub uid_first: u32,
    pub uid_size: u32,
    pub gid_first: u32,
    pub gid_size: u32,
    pub proc_ro_paths: Vec<PathBuf>,
    pub proc_mask_paths: Vec<PathBuf>,
    pub userns_inode: u64,
    /// Userns inode supplied at pre-registration (pod siblings only).
    pub pending_userns_inode: u64,
    pub reg_completed: bool,
    /// Node values written by the container that stick for its lifetime.
    pub data: HashMap<String, String>,
    /// Mounts present when the container started; these are immutable.
    pub init_mounts: Option<Arc<MountInfoSnapshot>>,
}

/// One live container. The id is fixed at creation; everything else is
/// guarded by the record's own mutex, which must only be taken after (or
/// without) the registry lock, never before it.
#[derive(Debug)]
pub struct Container {
    id: String,
    inner: Mutex<ContainerInner>,
}

impl Container {
    /// Pure constructor: builds a record without registering it anywhere.
    pub fn new(id: &str) -> Self {
        Container {
            id: id.to_string(),
            inner: Mutex::new(ContainerInner::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ContainerInner> {
        self.inner.lock().unwrap()
    }

    pub fn init_pid(&self) -> i32 {
        self.lock().init_pid
    }

    pub fn ctime(&self) -> Option<DateTime<Utc>> {
        self.lock().ctime
    }

    pub fn set_ctime(&self, ctime: DateTime<Utc>) {
        self.lock().ctime = Some(ctime);
    }

    pub fn uid_range(&self) -> (u32, u32) {
        let inner = self.lock();
        (inner.uid_first, inner.uid_size)
    }

    pub fn gid_range(&self) -> (u32, u32) {
        let inner = self.lock();
        (inner.gid_first, inner.gid_size)
    }

    pub fn proc_ro_paths(&self) -> Vec<PathBuf> {
        self.lock().proc_ro_paths.clone()
    }

    pub fn proc_mask_paths(&self) -> Vec<PathBuf> {
        self.lock().proc_mask_paths.clone()
    }

    pub fn userns_inode(&self) -> u64 {
        self.lock().userns_inode
    }

    pub fn registration_completed(&self) -> bool {
        self.lock().reg_completed
    }

    /// Sticky node value previously written by the container, if any.
    pub fn data(&self, path: &str) -> Option<String> {
        self.lock().data.get(path).cloned()
    }

    /// First write wins; later writes still land on the kernel node but the
    /// per-container value does not move.
    pub fn set_data(&self, path: &str, value: &str) {
        self.lock()
            .data
            .entry(path.to_string())
            .or_insert_with(|| value.to_string());
    }

    pub fn init_mounts(&self) -> Option<Arc<MountInfoSnapshot>> {
        self.lock().init_mounts.clone()
    }

    /// Install the start-of-life mountinfo snapshot. Only the first call
    /// sticks; the snapshot defines which mounts are immutable.
    pub fn set_init_mounts(&self, snapshot: MountInfoSnapshot) {
        let mut inner = self.lock();
        if inner.init_mounts.is_none() {
            inner.init_mounts = Some(Arc::new(snapshot));
        }
    }

    pub(crate) fn fill(&self, data: &ContainerData, pid_fd: Option<OwnedFd>, userns_inode: u64) {
        let mut inner = self.lock();
        inner.init_pid = data.init_pid;
        inner.pid_fd = pid_fd;
        inner.ctime = Some(data.ctime);
        inner.uid_first = data.uid_first;
        inner.uid_size = data.uid_size;
        inner.gid_first = data.gid_first;
        inner.gid_size = data.gid_size;
        inner.proc_ro_paths = data.proc_ro_paths.clone();
        inner.proc_mask_paths = data.proc_mask_paths.clone();
        inner.userns_inode = userns_inode;
        inner.reg_completed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sticky_data_first_write_wins() {
        let cntr = Container::new("c1");
        assert_eq!(cntr.data("/sys/x"), None);
        cntr.set_data("/sys/x", "64");
        cntr.set_data("/sys/x", "128");
        assert_eq!(cntr.data("/sys/x").as_deref(), Some("64"));
    }

    #[test]
    fn test_init_mounts_set_once() {
        let cntr = Container::new("c1");
        cntr.set_init_mounts(MountInfoSnapshot::from_entries(vec![]));
        let first = cntr.init_mounts().unwrap();
        cntr.set_init_mounts(MountInfoSnapshot::from_entries(vec![]));
        assert!(Arc::ptr_eq(&first, &cntr.init_mounts().unwrap()));
    }
}
