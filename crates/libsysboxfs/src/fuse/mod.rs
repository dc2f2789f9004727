//! Per-container FUSE serving of the emulated procfs/sysfs tree.

pub mod attr;
mod server;
mod service;

pub use server::SysboxFs;
pub use service::ServerPool;
