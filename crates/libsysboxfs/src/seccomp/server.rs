//! The interposer's front door: accepts seccomp notification fds from the
//! runtime over a unix socket, then runs one poll loop per tracked process,
//! dispatching every received notification to a concurrent worker.

use std::collections::HashMap;
use std::io::{IoSliceMut, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{self, ControlMessageOwned, MsgFlags, UnixAddr};
use serde::Deserialize;

use super::handler::{process_syscall, SyscallCtx};
use super::notify::{
    check_notify_support, resp_continue, resp_error, resp_success, NotifyFd, SeccompNotif,
};
use super::tracee::TraceeMem;
use super::{Services, SyscallResult};
use crate::process::Process;

pub const DEFAULT_SECCOMP_SOCKET: &str = "/run/sysbox/sysfs-seccomp.sock";

#[derive(Debug, thiserror::Error)]
pub enum SeccompError {
    #[error("kernel lacks the required seccomp notification support")]
    Unsupported(#[source] Errno),
    #[error("socket setup failed")]
    Io(#[from] std::io::Error),
    #[error("unix syscall failed")]
    Nix(#[from] nix::Error),
}

/// When a tracked notification fd is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FdReleasePolicy {
    /// When the traced process exits.
    ProcExit,
    /// When the container is unregistered.
    #[default]
    ContExit,
}

impl FromStr for FdReleasePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proc-exit" => Ok(FdReleasePolicy::ProcExit),
            "cont-exit" => Ok(FdReleasePolicy::ContExit),
            other => Err(format!("unknown seccomp-fd-release policy: {other}")),
        }
    }
}

/// Init message the runtime sends alongside the notification fd.
#[derive(Debug, Deserialize)]
struct SeccompInit {
    pid: i32,
    #[serde(rename = "cntr-id")]
    cntr_id: String,
}

struct Session {
    fd: NotifyFd,
    tracee_pid: i32,
    cntr_id: String,
}

pub struct SeccompServer {
    services: Arc<Services>,
    policy: FdReleasePolicy,
    shutdown: AtomicBool,
    // One lock per tracee thread id: the kernel guarantees a single
    // outstanding notification per thread, and this preserves that
    // ordering through our concurrent workers.
    pid_locks: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl SeccompServer {
    /// Fails fast when the kernel cannot do what the interposer needs.
    pub fn new(services: Arc<Services>, policy: FdReleasePolicy) -> Result<Self, SeccompError> {
        check_notify_support().map_err(SeccompError::Unsupported)?;
        Ok(SeccompServer {
            services,
            policy,
            shutdown: AtomicBool::new(false),
            pid_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Bind the runtime-facing socket and serve until shutdown. Returns the
    /// acceptor thread handle.
    pub fn listen(
        self: &Arc<Self>,
        socket_path: &Path,
    ) -> Result<std::thread::JoinHandle<()>, SeccompError> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        listener.set_nonblocking(true)?;
        tracing::info!(path = %socket_path.display(), "seccomp tracer listening");

        let server = self.clone();
        let handle = std::thread::spawn(move || server.accept_loop(listener));
        Ok(handle)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn accept_loop(self: Arc<Self>, listener: UnixListener) {
        while !self.stopping() {
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = self.clone().accept_session(stream) {
                        tracing::warn!(?err, "failed to accept seccomp session");
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(err) => {
                    tracing::warn!(?err, "seccomp accept failed");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    /// One connection: init message + fd in, one ack byte out, then a
    /// dedicated poll loop for the received notification fd.
    fn accept_session(self: Arc<Self>, mut stream: UnixStream) -> Result<(), SeccompError> {
        let mut buf = vec![0u8; 4096];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
        let (len, fd) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = socket::recvmsg::<UnixAddr>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )?;
            let fd = msg.cmsgs().find_map(|cmsg| match cmsg {
                ControlMessageOwned::ScmRights(fds) => fds.first().copied(),
                _ => None,
            });
            (msg.bytes, fd)
        };

        let init: SeccompInit = serde_json::from_slice(&buf[..len])
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let fd = fd.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "no fd in init message")
        })?;
        let notify_fd = unsafe { NotifyFd::from_raw_fd(fd) };

        stream.write_all(&[1])?;
        tracing::info!(pid = init.pid, cntr = %init.cntr_id, "seccomp session accepted");

        let session = Arc::new(Session {
            fd: notify_fd,
            tracee_pid: init.pid,
            cntr_id: init.cntr_id,
        });
        let server = self.clone();
        std::thread::spawn(move || server.session_loop(session));
        Ok(())
    }

    fn session_released(&self, session: &Session) -> bool {
        match self.policy {
            FdReleasePolicy::ProcExit => {
                !Process::new(session.tracee_pid, self.services.io.clone()).alive()
            }
            FdReleasePolicy::ContExit => self
                .services
                .containers
                .lookup_by_id(&session.cntr_id)
                .is_none(),
        }
    }

    fn session_loop(self: Arc<Self>, session: Arc<Session>) {
        loop {
            if self.stopping() || self.session_released(&session) {
                break;
            }

            let borrowed = unsafe { BorrowedFd::borrow_raw(session.fd.as_raw_fd()) };
            let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(200u16)) {
                Ok(0) => continue,
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                        break;
                    }
                    if !revents.contains(PollFlags::POLLIN) {
                        continue;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    tracing::warn!(?errno, cntr = %session.cntr_id, "seccomp poll failed");
                    break;
                }
            }

            let notif = match session.fd.recv() {
                Ok(notif) => notif,
                // The notification was retired between poll and recv.
                Err(Errno::ENOENT) | Err(Errno::EINTR) => continue,
                Err(errno) => {
                    tracing::debug!(?errno, cntr = %session.cntr_id, "seccomp recv ended");
                    break;
                }
            };

            let server = self.clone();
            let session = session.clone();
            let lock = self.pid_lock(notif.pid);
            std::thread::spawn(move || {
                let _serialized = lock.lock().unwrap();
                server.handle_notification(&session, notif);
            });
        }
        tracing::info!(cntr = %session.cntr_id, pid = session.tracee_pid, "seccomp session closed");
        self.prune_pid_locks();
    }

    fn pid_lock(&self, pid: u32) -> Arc<Mutex<()>> {
        self.pid_locks
            .lock()
            .unwrap()
            .entry(pid)
            .or_default()
            .clone()
    }

    fn prune_pid_locks(&self) {
        self.pid_locks
            .lock()
            .unwrap()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    fn handle_notification(&self, session: &Session, notif: SeccompNotif) {
        let process = Process::new(notif.pid as i32, self.services.io.clone());

        let result = match self.services.containers.lookup_by_process(&process) {
            Some(cntr) => {
                let ctx = SyscallCtx {
                    notif,
                    services: &self.services,
                    process,
                    cntr,
                    mem: TraceeMem::new(notif.pid as i32),
                    notify_fd: &session.fd,
                };
                process_syscall(&ctx)
            }
            None => {
                tracing::warn!(
                    pid = notif.pid,
                    cntr = %session.cntr_id,
                    "syscall from unknown container"
                );
                SyscallResult::Error(Errno::EPERM)
            }
        };

        // TOCTOU guard: the tracee may have died or been signalled while we
        // worked; never answer a retired notification.
        if !session.fd.id_valid(notif.id) {
            tracing::debug!(id = notif.id, "notification retired before response");
            return;
        }

        let mut resp = match result {
            SyscallResult::Continue => resp_continue(notif.id),
            SyscallResult::Success(val) => resp_success(notif.id, val),
            SyscallResult::Error(errno) => resp_error(notif.id, errno),
        };
        if let Err(errno) = session.fd.send(&mut resp) {
            if errno != Errno::ENOENT {
                tracing::warn!(?errno, id = notif.id, "failed to answer notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_release_policy_parse() {
        assert_eq!(
            FdReleasePolicy::from_str("proc-exit").unwrap(),
            FdReleasePolicy::ProcExit
        );
        assert_eq!(
            FdReleasePolicy::from_str("cont-exit").unwrap(),
            FdReleasePolicy::ContExit
        );
        assert!(FdReleasePolicy::from_str("never").is_err());
        assert_eq!(FdReleasePolicy::default(), FdReleasePolicy::ContExit);
    }

    #[test]
    fn test_init_message_format() {
        let init: SeccompInit =
            serde_json::from_str(r#"{"pid": 4711, "cntr-id": "cafebabe"}"#).unwrap();
        assert_eq!(init.pid, 4711);
        assert_eq!(init.cntr_id, "cafebabe");
    }
}
