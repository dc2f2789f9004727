use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::base::PassthroughHandler;
use super::proc::{ProcHandler, ProcSwapsHandler, ProcSysHandler, ProcUptimeHandler};
use super::root::RootHandler;
use super::sys::{NfConntrackHashsizeHandler, SysHandler};
use super::{Handler, NodeFlags};
use crate::io::IoService;

/// Immutable map from virtual path to handler, built once at startup.
/// Longest-prefix lookup over absolute paths; never mutated afterwards, so
/// no lock is needed.
pub struct HandlerRegistry {
    io: Arc<dyn IoService>,
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new(io: Arc<dyn IoService>) -> Self {
        let mut registry = HandlerRegistry {
            io,
            handlers: BTreeMap::new(),
        };

        registry.add(Arc::new(RootHandler));
        registry.add(Arc::new(ProcHandler));
        registry.add(Arc::new(ProcSysHandler));
        registry.add(Arc::new(ProcUptimeHandler));
        registry.add(Arc::new(ProcSwapsHandler));
        registry.add(Arc::new(SysHandler));
        registry.add(Arc::new(NfConntrackHashsizeHandler));
        registry
    }

    /// An empty registry to assemble by hand; unit tests use this.
    pub fn with_handlers(io: Arc<dyn IoService>, handlers: Vec<Arc<dyn Handler>>) -> Self {
        let mut registry = HandlerRegistry {
            io,
            handlers: BTreeMap::new(),
        };
        for handler in handlers {
            registry.add(handler);
        }
        registry
    }

    fn add(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.path().to_string(), handler);
    }

    pub fn io(&self) -> &Arc<dyn IoService> {
        &self.io
    }

    /// Longest-prefix match: the handler owning the exact path, or the
    /// nearest registered ancestor. The bool reports an exact hit.
    pub fn lookup(&self, path: &Path) -> Option<(Arc<dyn Handler>, bool)> {
        let mut probe = Some(path);
        let mut exact = true;
        while let Some(cur) = probe {
            let key = cur.to_string_lossy();
            let key: &str = if key.is_empty() { "/" } else { &key };
            if let Some(handler) = self.handlers.get(key) {
                return Some((handler.clone(), exact));
            }
            exact = false;
            probe = cur.parent();
        }
        None
    }

    /// Handler for `path`, falling back to a passthrough wrapper when only a
    /// parent entry matches. The returned handler always serves `path`.
    pub fn handler_for(&self, path: &Path) -> Option<Arc<dyn Handler>> {
        match self.lookup(path)? {
            (handler, true) => Some(handler),
            (parent, false) => {
                // Subtree handlers (kernel-sync dirs) serve their children
                // themselves; anything else degrades to passthrough.
                if parent.flags().contains(NodeFlags::KERNEL_SYNC) {
                    Some(parent)
                } else {
                    Some(Arc::new(PassthroughHandler::new(
                        "passthrough",
                        &path.to_string_lossy(),
                        NodeFlags::FILE,
                    )))
                }
            }
        }
    }

    /// Registered bind-mount paths under `base` ("/proc" or "/sys"), sorted.
    /// These are the submounts layered over a fresh procfs/sysfs mount.
    pub fn bind_mount_paths(&self, base: &str) -> Vec<PathBuf> {
        self.handlers
            .iter()
            .filter(|(path, handler)| {
                path.as_str() != base
                    && Path::new(path).starts_with(base)
                    && handler.flags().contains(NodeFlags::BINDMOUNT)
            })
            .map(|(path, _)| PathBuf::from(path))
            .collect()
    }

    pub fn is_bind_mount_path(&self, path: &Path) -> bool {
        self.lookup(path)
            .map(|(handler, exact)| exact && handler.flags().contains(NodeFlags::BINDMOUNT))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{create_io_service, IoBackend};

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new(create_io_service(IoBackend::Mem))
    }

    #[test]
    fn test_exact_beats_parent() {
        let reg = registry();
        let (handler, exact) = reg.lookup(Path::new("/proc/uptime")).unwrap();
        assert!(exact);
        assert_eq!(handler.name(), "procUptime");

        let (handler, exact) = reg.lookup(Path::new("/proc/uptime/nope")).unwrap();
        assert!(!exact);
        assert_eq!(handler.name(), "procUptime");
    }

    #[test]
    fn test_longest_parent_wins() {
        let reg = registry();
        let (handler, exact) = reg.lookup(Path::new("/proc/sys/kernel/shmmax")).unwrap();
        assert!(!exact);
        assert_eq!(handler.name(), "procSys");

        let (handler, _) = reg.lookup(Path::new("/proc/meminfo")).unwrap();
        assert_eq!(handler.name(), "proc");
    }

    #[test]
    fn test_root_always_matches() {
        let reg = registry();
        let (handler, exact) = reg.lookup(Path::new("/")).unwrap();
        assert!(exact);
        assert_eq!(handler.name(), "root");

        let (handler, exact) = reg.lookup(Path::new("/testing")).unwrap();
        assert!(!exact);
        assert_eq!(handler.name(), "root");
    }

    #[test]
    fn test_bind_mount_paths() {
        let reg = registry();
        let proc_paths = reg.bind_mount_paths("/proc");
        assert_eq!(
            proc_paths,
            vec![PathBuf::from("/proc/swaps"), PathBuf::from("/proc/sys"), PathBuf::from("/proc/uptime")]
        );
        let sys_paths = reg.bind_mount_paths("/sys");
        assert_eq!(
            sys_paths,
            vec![PathBuf::from("/sys/module/nf_conntrack/parameters/hashsize")]
        );
        assert!(reg.is_bind_mount_path(Path::new("/proc/sys")));
        assert!(!reg.is_bind_mount_path(Path::new("/proc")));
    }

    #[test]
    fn test_kernel_sync_subtree_served_by_parent() {
        let reg = registry();
        let handler = reg.handler_for(Path::new("/proc/sys/net/ipv4/ip_forward")).unwrap();
        assert_eq!(handler.name(), "procSys");

        let handler = reg.handler_for(Path::new("/proc/meminfo")).unwrap();
        assert_eq!(handler.name(), "passthrough");
    }
}
