//! Wire messages exchanged between the daemon and the re-exec helper.
//! Everything is JSON over the socketpair; file descriptors and the
//! helper's pid travel out-of-band as socket control messages so the kernel
//! translates them across namespace boundaries.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::io::{NodeEntry, NodeStat};
use crate::mount::MountEntry;
use crate::process::NsKind;

/// One mount(2) invocation the helper performs inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountArgs {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fs_type: Option<String>,
    /// Raw MsFlags bits; kept numeric on the wire.
    pub flags: u64,
    pub data: Option<String>,
}

/// One umount2(2) invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UmountArgs {
    pub target: PathBuf,
    pub flags: i32,
}

/// First message on the wire: which process' namespaces to join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperInit {
    pub pid: i32,
    pub namespaces: Vec<NsKind>,
}

/// Everything the daemon sends to the helper, in protocol order: one Init,
/// then one Request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DaemonMsg {
    Init(HelperInit),
    Request(NsRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum NsRequest {
    Lookup {
        path: PathBuf,
    },
    Open {
        path: PathBuf,
        flags: i32,
        mode: u32,
    },
    Read {
        path: PathBuf,
        offset: u64,
        len: usize,
    },
    Write {
        path: PathBuf,
        offset: u64,
        data: Vec<u8>,
    },
    ReadDir {
        path: PathBuf,
    },
    ReadLink {
        path: PathBuf,
    },
    Mount {
        mounts: Vec<MountArgs>,
    },
    Umount {
        umounts: Vec<UmountArgs>,
    },
    Chown {
        path: PathBuf,
        uid: Option<u32>,
        gid: Option<u32>,
        follow: bool,
    },
    SetXattr {
        path: PathBuf,
        name: String,
        value: Vec<u8>,
        flags: i32,
        follow: bool,
    },
    GetXattr {
        path: PathBuf,
        name: String,
        size: usize,
        follow: bool,
    },
    RemoveXattr {
        path: PathBuf,
        name: String,
        follow: bool,
    },
    ListXattr {
        path: PathBuf,
        size: usize,
        follow: bool,
    },
    Openat2 {
        path: PathBuf,
        flags: u64,
        mode: u64,
        resolve: u64,
    },
    MountInfo,
    MountInode {
        paths: Vec<PathBuf>,
    },
    UidInfo {
        user: String,
    },
    GidInfo {
        group: String,
    },
    /// Diagnostic only.
    Sleep {
        ms: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum NsResponse {
    Ok,
    /// Sent by the grandchild once it is inside the namespaces; its pid
    /// arrives as SCM_CREDENTIALS alongside.
    Ready,
    Stat {
        stat: NodeStat,
    },
    Bytes {
        data: Vec<u8>,
    },
    Written {
        count: usize,
    },
    Entries {
        entries: Vec<NodeEntry>,
    },
    Link {
        target: PathBuf,
    },
    /// The operation produced a file descriptor, passed as SCM_RIGHTS.
    Fd,
    MountInfo {
        entries: Vec<MountEntry>,
    },
    MountInodes {
        inodes: Vec<Option<u64>>,
    },
    UidInfo {
        uid: u32,
    },
    GidInfo {
        gid: u32,
    },
    /// Result length of a get/list xattr probe (size == 0 query).
    XattrLen {
        len: usize,
    },
    Error {
        errno: i32,
    },
}

impl NsResponse {
    pub fn from_errno(errno: nix::errno::Errno) -> Self {
        NsResponse::Error {
            errno: errno as i32,
        }
    }
}
