use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use nix::fcntl::OFlag;

use super::{Container, ContainerData, ContainerError, FuseServerService, Result};
use crate::io::IoService;
use crate::process::Process;

#[derive(Default)]
struct Indexes {
    by_id: HashMap<String, Arc<Container>>,
    // A userns may be shared by several containers (pods); the first entry
    // is the state container whose record the sibling FUSE servers use.
    by_userns: HashMap<u64, Vec<Arc<Container>>>,
}

/// Process-wide table of live containers. One reader-writer lock guards both
/// indexes; record-level mutation goes through the record's own mutex, taken
/// only after (never before) this lock.
pub struct ContainerRegistry {
    io: Arc<dyn IoService>,
    fuse: Arc<dyn FuseServerService>,
    indexes: RwLock<Indexes>,
}

impl ContainerRegistry {
    pub fn new(io: Arc<dyn IoService>, fuse: Arc<dyn FuseServerService>) -> Self {
        ContainerRegistry {
            io,
            fuse,
            indexes: RwLock::new(Indexes::default()),
        }
    }

    /// Allocate the container's FUSE server and mountpoint ahead of its init
    /// process existing. `userns_path`, when given, names the user-ns a pod
    /// sibling shares; the new server then serves the state container's
    /// record.
    pub fn pre_register(&self, id: &str, userns_path: Option<&Path>) -> Result<()> {
        let mut indexes = self.indexes.write().unwrap();
        if indexes.by_id.contains_key(id) {
            return Err(ContainerError::AlreadyExists(id.to_string()));
        }

        let cntr = Arc::new(Container::new(id));

        let mut server_record = cntr.clone();
        if let Some(path) = userns_path {
            let inode = self
                .io
                .new_node("userns", path, OFlag::O_RDONLY, 0)
                .ns_inode()?;
            cntr.lock().pending_userns_inode = inode;
            if let Some(records) = indexes.by_userns.get(&inode) {
                if let Some(state) = records.first() {
                    server_record = state.clone();
                }
            }
        }

        self.fuse
            .create_server(id, &server_record)
            .map_err(|source| ContainerError::Fuse {
                id: id.to_string(),
                source,
            })?;

        indexes.by_id.insert(id.to_string(), cntr);
        tracing::info!(id, "container pre-registered");
        Ok(())
    }

    /// Complete a registration: fill in the record from the runtime's data,
    /// pin the init process with a pidfd, and index the user-ns inode.
    pub fn register(&self, data: &ContainerData) -> Result<()> {
        let mut indexes = self.indexes.write().unwrap();
        let cntr = indexes
            .by_id
            .get(&data.id)
            .cloned()
            .ok_or_else(|| ContainerError::NotFound(data.id.clone()))?;
        if cntr.registration_completed() {
            return Err(ContainerError::AlreadyExists(data.id.clone()));
        }

        let process = Process::new(data.init_pid, self.io.clone());
        let userns_inode = process.user_ns_inode()?;
        let pid_fd = process.pidfd_open().ok();

        cntr.fill(data, pid_fd, userns_inode);

        let records = indexes.by_userns.entry(userns_inode).or_default();
        records.push(cntr.clone());

        tracing::info!(id = %data.id, pid = data.init_pid, userns_inode, "container registered");
        Ok(())
    }

    /// Only the creation time is refreshed after registration.
    pub fn update(&self, data: &ContainerData) -> Result<()> {
        let cntr = self
            .lookup_by_id(&data.id)
            .ok_or_else(|| ContainerError::NotFound(data.id.clone()))?;
        cntr.set_ctime(data.ctime);
        Ok(())
    }

    /// Drop the container from both indexes and tear down its FUSE server.
    pub fn unregister(&self, id: &str) -> Result<()> {
        let mut indexes = self.indexes.write().unwrap();
        let cntr = indexes
            .by_id
            .remove(id)
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))?;

        let inode = cntr.userns_inode();
        if inode != 0 {
            if let Some(records) = indexes.by_userns.get_mut(&inode) {
                records.retain(|c| c.id() != id);
                if records.is_empty() {
                    indexes.by_userns.remove(&inode);
                }
            }
        }

        if let Err(source) = self.fuse.destroy_server(id) {
            tracing::warn!(id, ?source, "failed to tear down fuse server");
        }
        tracing::info!(id, "container unregistered");
        Ok(())
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<Arc<Container>> {
        self.indexes.read().unwrap().by_id.get(id).cloned()
    }

    /// The state container registered with this user-ns inode.
    pub fn lookup_by_inode(&self, userns_inode: u64) -> Option<Arc<Container>> {
        self.indexes
            .read()
            .unwrap()
            .by_userns
            .get(&userns_inode)
            .and_then(|records| records.first())
            .cloned()
    }

    pub fn lookup_all_by_inode(&self, userns_inode: u64) -> Vec<Arc<Container>> {
        self.indexes
            .read()
            .unwrap()
            .by_userns
            .get(&userns_inode)
            .cloned()
            .unwrap_or_default()
    }

    /// Resolve the container a process belongs to. Tries the process' own
    /// user-ns first, then ascends exactly one level so processes in a
    /// nested (L2) container resolve to the enclosing system container.
    pub fn lookup_by_process(&self, process: &Process) -> Option<Arc<Container>> {
        let inode = match process.user_ns_inode() {
            Ok(inode) => inode,
            Err(err) => {
                tracing::warn!(pid = process.pid(), ?err, "failed to read user-ns inode");
                return None;
            }
        };
        if let Some(cntr) = self.lookup_by_inode(inode) {
            return Some(cntr);
        }

        match process.parent_user_ns_inode() {
            Ok(parent) => self.lookup_by_inode(parent),
            Err(err) => {
                tracing::warn!(pid = process.pid(), ?err, "failed to read parent user-ns inode");
                None
            }
        }
    }

    /// Ids of every container currently present (any lifecycle stage).
    pub fn ids(&self) -> Vec<String> {
        self.indexes.read().unwrap().by_id.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{create_io_service, IoBackend, MemIo};
    use anyhow::Result;
    use chrono::Utc;

    struct NullFuse;

    impl FuseServerService for NullFuse {
        fn create_server(&self, _id: &str, _cntr: &Arc<Container>) -> std::io::Result<()> {
            Ok(())
        }
        fn destroy_server(&self, _id: &str) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn seed_init_process(mem: &MemIo, pid: i32) {
        let base = format!("/proc/{}", pid);
        mem.insert_dir(&base, 0o555, 0, 0);
        mem.insert_dir(format!("{}/ns", base), 0o555, 0, 0);
        mem.insert_file(format!("{}/ns/user", base), 0o444, 0, 0, b"");
        mem.insert_file(format!("{}/ns/user_parent", base), 0o444, 0, 0, b"");
    }

    fn registry() -> (Arc<ContainerRegistry>, Arc<dyn IoService>) {
        let io = create_io_service(IoBackend::Mem);
        let reg = Arc::new(ContainerRegistry::new(io.clone(), Arc::new(NullFuse)));
        (reg, io)
    }

    fn data(id: &str, pid: i32) -> ContainerData {
        ContainerData {
            id: id.to_string(),
            init_pid: pid,
            ctime: Utc::now(),
            uid_first: 165536,
            uid_size: 65536,
            gid_first: 165536,
            gid_size: 65536,
            proc_ro_paths: vec![],
            proc_mask_paths: vec![],
        }
    }

    #[test]
    fn test_lifecycle_indexes() -> Result<()> {
        let (reg, io) = registry();
        let mem = io.as_any().downcast_ref::<MemIo>().unwrap();
        seed_init_process(mem, 100);

        reg.pre_register("c1", None)?;
        // Pre-registered: visible by id, absent from the userns index.
        let cntr = reg.lookup_by_id("c1").unwrap();
        assert!(!cntr.registration_completed());
        assert_eq!(cntr.userns_inode(), 0);

        reg.register(&data("c1", 100))?;
        let cntr = reg.lookup_by_id("c1").unwrap();
        assert!(cntr.registration_completed());
        let inode = cntr.userns_inode();
        assert!(Arc::ptr_eq(&cntr, &reg.lookup_by_inode(inode).unwrap()));

        reg.unregister("c1")?;
        assert!(reg.lookup_by_id("c1").is_none());
        assert!(reg.lookup_by_inode(inode).is_none());
        Ok(())
    }

    #[test]
    fn test_double_pre_register_fails() -> Result<()> {
        let (reg, _io) = registry();
        reg.pre_register("c1", None)?;
        assert!(matches!(
            reg.pre_register("c1", None),
            Err(ContainerError::AlreadyExists(_))
        ));
        Ok(())
    }

    #[test]
    fn test_register_unknown_id_fails() {
        let (reg, io) = registry();
        let mem = io.as_any().downcast_ref::<MemIo>().unwrap();
        seed_init_process(mem, 100);
        assert!(matches!(
            reg.register(&data("ghost", 100)),
            Err(ContainerError::NotFound(_))
        ));
    }

    #[test]
    fn test_pod_siblings_share_userns_entry() -> Result<()> {
        let (reg, io) = registry();
        let mem = io.as_any().downcast_ref::<MemIo>().unwrap();
        seed_init_process(mem, 100);

        reg.pre_register("state", None)?;
        reg.register(&data("state", 100))?;
        let state = reg.lookup_by_id("state").unwrap();
        let inode = state.userns_inode();

        let userns_path = "/proc/100/ns/user".to_string();
        reg.pre_register("sibling", Some(Path::new(&userns_path)))?;
        // Sibling init shares pid 100's userns in this setup.
        reg.register(&data("sibling", 100))?;

        let records = reg.lookup_all_by_inode(inode);
        assert_eq!(records.len(), 2);
        // The state container stays first: sibling servers use its record.
        assert_eq!(records[0].id(), "state");

        reg.unregister("sibling")?;
        assert_eq!(reg.lookup_all_by_inode(inode).len(), 1);
        reg.unregister("state")?;
        assert!(reg.lookup_by_inode(inode).is_none());
        Ok(())
    }

    #[test]
    fn test_lookup_by_process_ascends_once() -> Result<()> {
        let (reg, io) = registry();
        let mem = io.as_any().downcast_ref::<MemIo>().unwrap();
        seed_init_process(mem, 100);
        reg.pre_register("c1", None)?;
        reg.register(&data("c1", 100))?;
        let cntr = reg.lookup_by_id("c1").unwrap();

        // A nested process: its own userns is not indexed, but its parent
        // userns is the container's.
        let nested = 200;
        let base = format!("/proc/{}", nested);
        mem.insert_dir(&base, 0o555, 0, 0);
        mem.insert_dir(format!("{}/ns", base), 0o555, 0, 0);
        mem.insert_file(format!("{}/ns/user", base), 0o444, 0, 0, b"");
        mem.insert_link(format!("{}/ns/user_parent", base), "/proc/100/ns/user");

        let proc_nested = Process::new(nested, io.clone());
        assert_ne!(proc_nested.user_ns_inode()?, cntr.userns_inode());
        let found = reg.lookup_by_process(&proc_nested).unwrap();
        assert!(Arc::ptr_eq(&found, &cntr));

        // A process in the container's own userns resolves directly.
        let proc_init = Process::new(100, io.clone());
        let found = reg.lookup_by_process(&proc_init).unwrap();
        assert!(Arc::ptr_eq(&found, &cntr));

        // A process known to neither level resolves to nothing.
        let stranger = 300;
        let base = format!("/proc/{}", stranger);
        mem.insert_dir(&base, 0o555, 0, 0);
        mem.insert_dir(format!("{}/ns", base), 0o555, 0, 0);
        mem.insert_file(format!("{}/ns/user", base), 0o444, 0, 0, b"");
        mem.insert_file(format!("{}/ns/user_parent", base), 0o444, 0, 0, b"");
        assert!(reg
            .lookup_by_process(&Process::new(stranger, io.clone()))
            .is_none());
        Ok(())
    }
}
