//! Lifecycle of the per-container FUSE servers: one mountpoint directory
//! and one background session per container, torn down on unregistration
//! and on daemon shutdown.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fuser::{BackgroundSession, MountOption};

use super::server::SysboxFs;
use crate::container::{Container, FuseServerService};
use crate::handler::HandlerRegistry;
use crate::io::{IoBackend, IoService};

pub struct ServerPool {
    io: Arc<dyn IoService>,
    registry: Arc<HandlerRegistry>,
    base_mountpoint: PathBuf,
    sessions: Mutex<HashMap<String, BackgroundSession>>,
}

impl ServerPool {
    pub fn new(io: Arc<dyn IoService>, registry: Arc<HandlerRegistry>, base_mountpoint: &Path) -> Self {
        ServerPool {
            io,
            registry,
            base_mountpoint: base_mountpoint.to_path_buf(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn mountpoint_of(&self, id: &str) -> PathBuf {
        self.base_mountpoint.join(id)
    }

    /// Unmount every server and remove its mountpoint subdirectory; called
    /// on daemon shutdown.
    pub fn shutdown(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        for (id, session) in sessions.drain() {
            tracing::info!(id, "unmounting fuse server");
            drop(session);
            let _ = fs::remove_dir(self.mountpoint_of(&id));
        }
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }
}

impl FuseServerService for ServerPool {
    fn create_server(&self, id: &str, cntr: &Arc<Container>) -> std::io::Result<()> {
        let mountpoint = self.mountpoint_of(id);
        fs::create_dir_all(&mountpoint)?;

        // The memory backend has no kernel to talk to; tests stop at the
        // mountpoint directory.
        if self.io.backend() == IoBackend::Mem {
            return Ok(());
        }

        let filesystem = SysboxFs::new(cntr.clone(), self.registry.clone(), self.io.clone());
        let options = [
            MountOption::FSName("sysboxfs".to_string()),
            MountOption::AllowOther,
            MountOption::DefaultPermissions,
        ];
        let session = fuser::spawn_mount2(filesystem, &mountpoint, &options)?;
        self.sessions.lock().unwrap().insert(id.to_string(), session);
        tracing::info!(id, mountpoint = %mountpoint.display(), "fuse server mounted");
        Ok(())
    }

    fn destroy_server(&self, id: &str) -> std::io::Result<()> {
        if let Some(session) = self.sessions.lock().unwrap().remove(id) {
            drop(session);
        }
        let mountpoint = self.mountpoint_of(id);
        if mountpoint.exists() {
            fs::remove_dir(&mountpoint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::create_io_service;
    use anyhow::Result;

    #[test]
    fn test_pool_creates_and_removes_mountpoints() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let io = create_io_service(IoBackend::Mem);
        let registry = Arc::new(HandlerRegistry::new(io.clone()));
        let pool = ServerPool::new(io, registry, dir.path());

        let cntr = Arc::new(Container::new("c1"));
        pool.create_server("c1", &cntr)?;
        assert!(dir.path().join("c1").is_dir());

        pool.destroy_server("c1")?;
        assert!(!dir.path().join("c1").exists());
        Ok(())
    }
}
