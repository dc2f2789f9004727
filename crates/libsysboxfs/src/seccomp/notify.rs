//! Raw seccomp user-notification plumbing: the notification structs from
//! linux/seccomp.h and the four ioctls on a notification fd, plus the
//! startup probe that refuses to run on kernels without the interface.

use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::raw::{c_long, c_uint, c_ulong, c_void};

use nix::errno::Errno;
use nix::{ioctl_readwrite, ioctl_write_ptr};

const SECCOMP_IOC_MAGIC: u8 = b'!';
const SECCOMP_GET_NOTIF_SIZES: c_uint = 3;

/// Response flag: tell the kernel to execute the syscall itself.
pub const NOTIF_FLAG_CONTINUE: u32 = 1;

/// seccomp_data (linux/seccomp.h).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SeccompData {
    pub nr: libc::c_int,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

/// seccomp_notif.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SeccompNotif {
    pub id: u64,
    pub pid: u32,
    pub flags: u32,
    pub data: SeccompData,
}

/// seccomp_notif_resp.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SeccompNotifResp {
    pub id: u64,
    pub val: i64,
    pub error: i32,
    pub flags: u32,
}

/// seccomp_notif_sizes.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SeccompNotifSizes {
    pub seccomp_notif: u16,
    pub seccomp_notif_resp: u16,
    pub seccomp_data: u16,
}

/// seccomp_notif_addfd.
#[repr(C)]
#[derive(Debug)]
pub struct SeccompNotifAddfd {
    pub id: u64,
    pub flags: u32,
    pub srcfd: u32,
    pub newfd: u32,
    pub newfd_flags: u32,
}

ioctl_readwrite!(seccomp_notif_ioctl_recv, SECCOMP_IOC_MAGIC, 0, SeccompNotif);
ioctl_readwrite!(
    seccomp_notif_ioctl_send,
    SECCOMP_IOC_MAGIC,
    1,
    SeccompNotifResp
);
ioctl_write_ptr!(seccomp_notif_ioctl_id_valid, SECCOMP_IOC_MAGIC, 2, u64);
ioctl_write_ptr!(
    seccomp_notif_ioctl_addfd,
    SECCOMP_IOC_MAGIC,
    3,
    SeccompNotifAddfd
);

unsafe fn seccomp(op: c_uint, flags: c_ulong, args: *mut c_void) -> c_long {
    libc::syscall(libc::SYS_seccomp, op, flags, args)
}

/// Fails unless the kernel speaks the notification interface we were built
/// against (fd injection included). Called once at daemon startup; a failure
/// is fatal.
pub fn check_notify_support() -> Result<(), Errno> {
    let mut sizes = SeccompNotifSizes::default();
    let ret = unsafe {
        seccomp(
            SECCOMP_GET_NOTIF_SIZES,
            0,
            &mut sizes as *mut SeccompNotifSizes as *mut c_void,
        )
    };
    Errno::result(ret)?;
    if usize::from(sizes.seccomp_notif) != std::mem::size_of::<SeccompNotif>()
        || usize::from(sizes.seccomp_notif_resp) != std::mem::size_of::<SeccompNotifResp>()
        || usize::from(sizes.seccomp_data) != std::mem::size_of::<SeccompData>()
    {
        tracing::error!(?sizes, "kernel seccomp notification layout mismatch");
        return Err(Errno::ENOSYS);
    }
    Ok(())
}

/// Owned seccomp notification fd, as received from the runtime.
#[derive(Debug)]
pub struct NotifyFd {
    fd: OwnedFd,
}

impl NotifyFd {
    pub fn from_owned(fd: OwnedFd) -> Self {
        NotifyFd { fd }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Block until the next notification.
    pub fn recv(&self) -> nix::Result<SeccompNotif> {
        let mut notif = MaybeUninit::zeroed();
        unsafe {
            seccomp_notif_ioctl_recv(self.fd.as_raw_fd(), notif.as_mut_ptr())?;
            Ok(notif.assume_init())
        }
    }

    pub fn send(&self, resp: &mut SeccompNotifResp) -> nix::Result<()> {
        unsafe {
            seccomp_notif_ioctl_send(self.fd.as_raw_fd(), resp as *mut SeccompNotifResp)?;
        }
        Ok(())
    }

    /// TOCTOU guard: is the notification still live, or has the kernel
    /// retired it (tracee death, signal)?
    pub fn id_valid(&self, id: u64) -> bool {
        unsafe { seccomp_notif_ioctl_id_valid(self.fd.as_raw_fd(), &id as *const u64).is_ok() }
    }

    /// Inject `srcfd` into the tracee with O_CLOEXEC; returns the fd number
    /// the tracee sees. The daemon-side fd stays open (caller closes it).
    pub fn addfd(&self, id: u64, srcfd: RawFd) -> nix::Result<RawFd> {
        let addfd = SeccompNotifAddfd {
            id,
            flags: 0,
            srcfd: srcfd as u32,
            newfd: 0,
            newfd_flags: libc::O_CLOEXEC as u32,
        };
        let newfd =
            unsafe { seccomp_notif_ioctl_addfd(self.fd.as_raw_fd(), &addfd as *const _)? };
        Ok(newfd)
    }
}

impl FromRawFd for NotifyFd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        NotifyFd {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }
}

/// Canned responses.
pub fn resp_continue(id: u64) -> SeccompNotifResp {
    SeccompNotifResp {
        id,
        val: 0,
        error: 0,
        flags: NOTIF_FLAG_CONTINUE,
    }
}

pub fn resp_success(id: u64, val: i64) -> SeccompNotifResp {
    SeccompNotifResp {
        id,
        val,
        error: 0,
        flags: 0,
    }
}

pub fn resp_error(id: u64, errno: Errno) -> SeccompNotifResp {
    SeccompNotifResp {
        id,
        val: 0,
        error: -(errno as i32),
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_layout_matches_kernel() {
        // 64-bit layout of the uapi structs.
        assert_eq!(std::mem::size_of::<SeccompData>(), 64);
        assert_eq!(std::mem::size_of::<SeccompNotif>(), 80);
        assert_eq!(std::mem::size_of::<SeccompNotifResp>(), 24);
        assert_eq!(std::mem::size_of::<SeccompNotifAddfd>(), 24);
    }

    #[test]
    fn test_canned_responses() {
        let c = resp_continue(7);
        assert_eq!((c.id, c.val, c.error, c.flags), (7, 0, 0, NOTIF_FLAG_CONTINUE));

        let e = resp_error(8, Errno::EPERM);
        assert_eq!(e.error, -(libc::EPERM));
        assert_eq!(e.flags, 0);

        let s = resp_success(9, 42);
        assert_eq!((s.val, s.error), (42, 0));
    }
}
