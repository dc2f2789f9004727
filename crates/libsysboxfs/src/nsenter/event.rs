//! Daemon-side of the re-exec bridge: a one-shot event that launches
//! `/proc/self/exe nsenter`, hands it a socketpair on fd 3, and exchanges a
//! single request/response with the grandchild running inside the target
//! namespaces.

use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use super::channel::{pair, Channel, ChannelError};
use super::message::{DaemonMsg, HelperInit, NsRequest, NsResponse};
use crate::process::NsKind;

/// File descriptor the helper inherits its channel on.
pub const HELPER_FD: RawFd = 3;

#[derive(Debug, thiserror::Error)]
pub enum NsenterError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("failed to launch nsenter helper")]
    Spawn(#[source] std::io::Error),
    #[error("helper protocol violation: {0}")]
    Protocol(String),
    #[error("event misuse: {0}")]
    Misuse(String),
    #[error("unix syscall failed")]
    Nix(#[from] nix::Error),
}

type Result<T> = std::result::Result<T, NsenterError>;

/// One-shot bidirectional envelope. Created, sent, destroyed.
pub struct NsenterEvent {
    pub pid: i32,
    pub namespaces: Vec<NsKind>,
    pub req: NsRequest,
    /// Fire-and-forget: do not wait for the response.
    pub async_event: bool,
    helper: Option<Child>,
    /// Pid of the grandchild as seen in the daemon's pid-ns.
    helper_pid: Option<i32>,
    received_fds: Vec<OwnedFd>,
}

impl NsenterEvent {
    pub fn new(pid: i32, namespaces: &[NsKind], req: NsRequest) -> Self {
        NsenterEvent {
            pid,
            namespaces: namespaces.to_vec(),
            req,
            async_event: false,
            helper: None,
            helper_pid: None,
            received_fds: vec![],
        }
    }

    /// Launch the helper and run the round-trip. Consumes the event's
    /// request; the response (or the error that stands for it) is returned
    /// and the helper is reaped either way.
    pub fn send(&mut self) -> Result<NsResponse> {
        // A helper inside the container's pid-ns but outside its mount-ns
        // would leak the daemon's host mounts into the container's /proc.
        if self.namespaces.contains(&NsKind::Pid) && !self.namespaces.contains(&NsKind::Mnt) {
            return Err(NsenterError::Misuse(
                "pid namespace entry requires the mount namespace".to_string(),
            ));
        }

        let (daemon_end, helper_end) = pair::<DaemonMsg, NsResponse>()?;
        daemon_end.enable_cred_passing()?;

        let helper_raw = helper_end.as_raw_fd();
        let mut cmd = Command::new("/proc/self/exe");
        cmd.arg("nsenter")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        unsafe {
            cmd.pre_exec(move || {
                // dup2 clears O_CLOEXEC on the duplicate.
                nix::unistd::dup2(helper_raw, HELPER_FD)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }
        let child = cmd.spawn().map_err(NsenterError::Spawn)?;
        self.helper = Some(child);
        drop(helper_end);

        let result = self.exchange(&daemon_end);
        if self.async_event {
            // Fire-and-forget: the helper is not waited on for a response.
            self.terminate();
        } else {
            self.reap();
        }
        result
    }

    fn exchange(&mut self, channel: &Channel<DaemonMsg, NsResponse>) -> Result<NsResponse> {
        channel.send(&DaemonMsg::Init(HelperInit {
            pid: self.pid,
            namespaces: self.namespaces.clone(),
        }))?;

        let (ready, creds) = channel.recv_with_creds()?;
        match ready {
            NsResponse::Ready => {}
            NsResponse::Error { errno } => {
                return Ok(NsResponse::Error { errno });
            }
            other => {
                return Err(NsenterError::Protocol(format!(
                    "expected ready, got {other:?}"
                )))
            }
        }
        self.helper_pid = creds.map(|c| c.pid());

        channel.send(&DaemonMsg::Request(self.req.clone()))?;
        if self.async_event {
            return Ok(NsResponse::Ok);
        }

        let (resp, fds) = channel.recv_with_fds()?;
        self.received_fds = fds;
        Ok(resp)
    }

    /// File descriptors the helper passed back with the response.
    pub fn take_received_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.received_fds)
    }

    pub fn helper_pid(&self) -> Option<i32> {
        self.helper_pid
    }

    /// Kill and reap the helper; used on the async path and on errors.
    pub fn terminate(&mut self) {
        if let Some(child) = &self.helper {
            let pid = Pid::from_raw(child.id() as i32);
            let _ = kill(pid, Signal::SIGKILL);
        }
        self.reap();
    }

    fn reap(&mut self) {
        if let Some(mut child) = self.helper.take() {
            match child.wait() {
                Ok(status) if !status.success() => {
                    tracing::debug!(pid = self.pid, ?status, "nsenter helper exited non-zero");
                }
                Err(err) => {
                    tracing::warn!(pid = self.pid, ?err, "failed to reap nsenter helper");
                    let _ = waitpid(Pid::from_raw(child.id() as i32), None);
                }
                _ => {}
            }
        }
    }
}

impl Drop for NsenterEvent {
    fn drop(&mut self) {
        if self.helper.is_some() {
            self.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_pid_without_mnt_rejected() {
        let mut event = NsenterEvent::new(
            1,
            &[NsKind::Pid, NsKind::Net],
            NsRequest::Lookup {
                path: PathBuf::from("/"),
            },
        );
        assert!(matches!(event.send(), Err(NsenterError::Misuse(_))));
    }
}
