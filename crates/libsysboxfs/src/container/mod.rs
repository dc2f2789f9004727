//! Live container state: per-container records and the process-wide
//! registry that indexes them by id and by user-namespace inode.

mod container;
mod registry;

pub use container::{Container, ContainerData};
pub use registry::ContainerRegistry;

use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("container {0} already registered")]
    AlreadyExists(String),
    #[error("container {0} not found")]
    NotFound(String),
    #[error("container {0} registration incomplete")]
    NotRegistered(String),
    #[error(transparent)]
    Process(#[from] crate::process::ProcessError),
    #[error(transparent)]
    Io(#[from] crate::io::IoError),
    #[error("fuse server for container {id} failed")]
    Fuse {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ContainerError>;

/// Seam between the registry and the per-container FUSE servers. The pool
/// implementing this lives in the fuse module; the registry drives it on
/// pre-registration and unregistration. Servers receive the record they
/// serve (the state container's record for pod siblings) and never a
/// reference back to the registry.
pub trait FuseServerService: Send + Sync {
    fn create_server(&self, id: &str, cntr: &Arc<Container>) -> std::io::Result<()>;
    fn destroy_server(&self, id: &str) -> std::io::Result<()>;
}
