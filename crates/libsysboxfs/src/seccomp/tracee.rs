//! Access to a tracee's memory: syscall path/buffer arguments live in the
//! tracee's address space and must be copied out (and, for getxattr-style
//! results, back in). Prefers process_vm_readv/writev; falls back to
//! `/proc/<pid>/mem` where the vm calls are unavailable.

use std::fs::OpenOptions;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::fs::FileExt;

use nix::errno::Errno;
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;

const PATH_MAX: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct TraceeMem {
    pid: i32,
}

impl TraceeMem {
    pub fn new(pid: i32) -> Self {
        TraceeMem { pid }
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>, Errno> {
        if addr == 0 {
            return Err(Errno::EFAULT);
        }
        let mut buf = vec![0u8; len];
        let remote = [RemoteIoVec {
            base: addr as usize,
            len,
        }];
        let read = {
            let mut local = [IoSliceMut::new(&mut buf)];
            process_vm_readv(Pid::from_raw(self.pid), &mut local, &remote)
        };
        match read {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(Errno::ENOSYS) | Err(Errno::EPERM) => self.read_bytes_proc_mem(addr, len),
            Err(errno) => Err(errno),
        }
    }

    fn read_bytes_proc_mem(&self, addr: u64, len: usize) -> Result<Vec<u8>, Errno> {
        let file = OpenOptions::new()
            .read(true)
            .open(format!("/proc/{}/mem", self.pid))
            .map_err(io_errno)?;
        let mut buf = vec![0u8; len];
        let n = file.read_at(&mut buf, addr).map_err(io_errno)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<usize, Errno> {
        if addr == 0 {
            return Err(Errno::EFAULT);
        }
        let remote = [RemoteIoVec {
            base: addr as usize,
            len: data.len(),
        }];
        let local = [IoSlice::new(data)];
        match process_vm_writev(Pid::from_raw(self.pid), &local, &remote) {
            Ok(n) => Ok(n),
            Err(Errno::ENOSYS) | Err(Errno::EPERM) => self.write_bytes_proc_mem(addr, data),
            Err(errno) => Err(errno),
        }
    }

    fn write_bytes_proc_mem(&self, addr: u64, data: &[u8]) -> Result<usize, Errno> {
        let file = OpenOptions::new()
            .write(true)
            .open(format!("/proc/{}/mem", self.pid))
            .map_err(io_errno)?;
        file.write_at(data, addr).map_err(io_errno)
    }

    /// NUL-terminated string argument (a path, an xattr name). Reads page
    /// by page so a short string at the end of a mapping does not fault.
    pub fn read_cstring(&self, addr: u64) -> Result<String, Errno> {
        const PAGE: usize = 4096;
        let mut out: Vec<u8> = vec![];
        let mut addr = addr;
        while out.len() < PATH_MAX {
            let chunk_len = (PAGE - (addr as usize % PAGE)).min(PATH_MAX - out.len());
            let chunk = self.read_bytes(addr, chunk_len)?;
            if chunk.is_empty() {
                return Err(Errno::EFAULT);
            }
            if let Some(end) = chunk.iter().position(|b| *b == 0) {
                out.extend_from_slice(&chunk[..end]);
                return String::from_utf8(out).map_err(|_| Errno::EINVAL);
            }
            addr += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        Err(Errno::ENAMETOOLONG)
    }
}

fn io_errno(err: std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_own_memory() {
        let data = b"the quick brown fox\0tail";
        let mem = TraceeMem::new(std::process::id() as i32);

        let got = mem.read_bytes(data.as_ptr() as u64, data.len()).unwrap();
        assert_eq!(&got, data);

        let s = mem.read_cstring(data.as_ptr() as u64).unwrap();
        assert_eq!(s, "the quick brown fox");
    }

    #[test]
    fn test_null_pointer_faults() {
        let mem = TraceeMem::new(std::process::id() as i32);
        assert_eq!(mem.read_bytes(0, 8), Err(Errno::EFAULT));
        assert_eq!(mem.write_bytes(0, b"x"), Err(Errno::EFAULT));
    }

    #[test]
    fn test_write_own_memory() {
        let mut target = *b"xxxxxxxx";
        let mem = TraceeMem::new(std::process::id() as i32);
        let n = mem
            .write_bytes(target.as_mut_ptr() as u64, b"replaced")
            .unwrap();
        assert_eq!(n, 8);
        assert_eq!(&target, b"replaced");
    }
}
