//! Core engine of sysbox-fs: the user-space daemon that emulates portions
//! of procfs and sysfs for system containers. The library wires together a
//! per-container FUSE server, a seccomp-notify syscall interposer, and a
//! re-exec bridge that performs privileged operations inside a container's
//! namespaces; a container registry and a handler registry glue the three
//! together.

pub mod container;
pub mod fuse;
pub mod handler;
pub mod io;
pub mod mount;
pub mod nsenter;
pub mod process;
pub mod seccomp;
