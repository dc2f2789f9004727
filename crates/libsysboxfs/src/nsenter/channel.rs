//! Duplex message channel over a socketpair. Messages are length-prefixed
//! JSON; file descriptors ride as SCM_RIGHTS and the peer's identity as
//! SCM_CREDENTIALS (which the kernel translates across pid namespaces).

use std::io::{IoSlice, IoSliceMut};
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr, UnixCredentials};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("unix syscall failed")]
    Nix(#[from] nix::Error),
    #[error("message serialization failed")]
    Serde(#[from] serde_json::Error),
    #[error("peer closed the channel")]
    Disconnected,
}

type Result<T> = std::result::Result<T, ChannelError>;

/// One end of the channel: sends `S`, receives `R`.
pub struct Channel<S, R> {
    fd: OwnedFd,
    phantom: PhantomData<fn(S) -> R>,
}

/// Socketpair with both ends typed to mirror each other.
pub fn pair<S, R>() -> Result<(Channel<S, R>, Channel<R, S>)> {
    let (a, b) = socket::socketpair(
        socket::AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;
    Ok((Channel::from_owned_fd(a), Channel::from_owned_fd(b)))
}

impl<S, R> Channel<S, R> {
    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Channel {
            fd,
            phantom: PhantomData,
        }
    }

    /// Wrap an inherited descriptor (the helper's fd 3).
    ///
    /// # Safety
    /// `fd` must be an open socket this channel may own and close.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Channel::from_owned_fd(OwnedFd::from_raw_fd(fd))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Must be set on the receiving end before SCM_CREDENTIALS arrive.
    pub fn enable_cred_passing(&self) -> Result<()> {
        socket::setsockopt(&self.fd, socket::sockopt::PassCred, &true)?;
        Ok(())
    }
}

impl<S, R> Channel<S, R>
where
    S: Serialize,
    R: DeserializeOwned,
{
    fn send_frame(&self, data: &[u8], cmsgs: &[ControlMessage]) -> Result<()> {
        let len = (data.len() as u64).to_ne_bytes();
        let iov = [IoSlice::new(&len), IoSlice::new(data)];
        socket::sendmsg::<UnixAddr>(self.fd.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)?;
        Ok(())
    }

    pub fn send(&self, msg: &S) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        self.send_frame(&payload, &[])
    }

    pub fn send_with_fds(&self, msg: &S, fds: &[RawFd]) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        self.send_frame(&payload, &[ControlMessage::ScmRights(fds)])
    }

    /// Attach this process' pid/uid/gid; the receiver sees them translated
    /// into its own namespaces.
    pub fn send_with_creds(&self, msg: &S) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        let creds = UnixCredentials::new();
        self.send_frame(&payload, &[ControlMessage::ScmCredentials(&creds)])
    }

    fn peek_len(&self) -> Result<u64> {
        let mut len_bytes = [0u8; 8];
        let mut iov = [IoSliceMut::new(&mut len_bytes)];
        let msg = socket::recvmsg::<UnixAddr>(
            self.fd.as_raw_fd(),
            &mut iov,
            None,
            MsgFlags::MSG_PEEK,
        )?;
        if msg.bytes == 0 {
            return Err(ChannelError::Disconnected);
        }
        Ok(u64::from_ne_bytes(len_bytes))
    }

    fn recv_frame(&self) -> Result<(Vec<u8>, Vec<OwnedFd>, Option<UnixCredentials>)> {
        let len = self.peek_len()?;
        let mut len_bytes = [0u8; 8];
        let mut buf = vec![0u8; len as usize];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 2], UnixCredentials);

        let mut fds = vec![];
        let mut creds = None;
        let bytes = {
            let mut iov = [IoSliceMut::new(&mut len_bytes), IoSliceMut::new(&mut buf)];
            let msg = socket::recvmsg::<UnixAddr>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )?;
            for cmsg in msg.cmsgs() {
                match cmsg {
                    ControlMessageOwned::ScmRights(received) => {
                        fds.extend(
                            received
                                .into_iter()
                                .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                        );
                    }
                    ControlMessageOwned::ScmCredentials(c) => creds = Some(c),
                    _ => {}
                }
            }
            msg.bytes
        };
        if bytes == 0 {
            return Err(ChannelError::Disconnected);
        }
        Ok((buf, fds, creds))
    }

    pub fn recv(&self) -> Result<R> {
        let (buf, _, _) = self.recv_frame()?;
        Ok(serde_json::from_slice(&buf)?)
    }

    pub fn recv_with_fds(&self) -> Result<(R, Vec<OwnedFd>)> {
        let (buf, fds, _) = self.recv_frame()?;
        Ok((serde_json::from_slice(&buf)?, fds))
    }

    pub fn recv_with_creds(&self) -> Result<(R, Option<UnixCredentials>)> {
        let (buf, _, creds) = self.recv_frame()?;
        Ok((serde_json::from_slice(&buf)?, creds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nsenter::message::{NsRequest, NsResponse};
    use anyhow::Result;
    use std::path::PathBuf;

    #[test]
    fn test_round_trip() -> Result<()> {
        let (daemon, helper) = pair::<NsRequest, NsResponse>()?;

        daemon.send(&NsRequest::Lookup {
            path: PathBuf::from("/proc/uptime"),
        })?;
        let req = helper.recv()?;
        match req {
            NsRequest::Lookup { path } => assert_eq!(path, PathBuf::from("/proc/uptime")),
            other => panic!("unexpected request: {other:?}"),
        }

        helper.send(&NsResponse::Written { count: 42 })?;
        match daemon.recv()? {
            NsResponse::Written { count } => assert_eq!(count, 42),
            other => panic!("unexpected response: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_fd_passing() -> Result<()> {
        use std::io::{Read, Seek, SeekFrom, Write};
        use std::os::fd::IntoRawFd;

        let (daemon, helper) = pair::<NsResponse, NsResponse>()?;

        let mut file = tempfile::tempfile()?;
        file.write_all(b"injected")?;
        file.seek(SeekFrom::Start(0))?;
        helper.send_with_fds(&NsResponse::Fd, &[file.into_raw_fd()])?;

        let (resp, fds) = daemon.recv_with_fds()?;
        assert!(matches!(resp, NsResponse::Fd));
        assert_eq!(fds.len(), 1);

        let mut received = std::fs::File::from(fds.into_iter().next().unwrap());
        let mut content = String::new();
        received.read_to_string(&mut content)?;
        assert_eq!(content, "injected");
        Ok(())
    }

    #[test]
    fn test_cred_passing_reports_pid() -> Result<()> {
        let (daemon, helper) = pair::<NsResponse, NsResponse>()?;
        daemon.enable_cred_passing()?;

        helper.send_with_creds(&NsResponse::Ready)?;
        let (resp, creds) = daemon.recv_with_creds()?;
        assert!(matches!(resp, NsResponse::Ready));
        let creds = creds.expect("credentials attached");
        assert_eq!(creds.pid(), std::process::id() as i32);
        Ok(())
    }

    #[test]
    fn test_disconnect_detected() -> Result<()> {
        let (daemon, helper) = pair::<NsRequest, NsResponse>()?;
        drop(helper);
        assert!(matches!(daemon.recv(), Err(ChannelError::Disconnected)));
        Ok(())
    }
}
