//! Re-exec bridge: privileged operations inside a container's namespaces
//! are performed by a short-lived helper (`/proc/self/exe nsenter`) that
//! joins the target namespace set and exchanges one request/response pair
//! with the daemon over a socketpair.

pub mod channel;
mod event;
pub mod helper;
pub mod message;

pub use event::{NsenterError, NsenterEvent, HELPER_FD};
