//! Parsed view of `/proc/<pid>/mountinfo`: entries indexed by mount id and
//! by mountpoint, with parent->child edges reconstructed from the parent-id
//! field.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::fcntl::OFlag;
use nix::mount::MsFlags;

use super::flags;
use super::MountError;
use crate::io::IoService;

/// One mountinfo line. Owned (rather than the procfs crate's type) so tests
/// can fabricate entries, the re-exec helper can ship them over the bridge,
/// and the mountpoint inode can ride along.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MountEntry {
    pub mnt_id: i32,
    pub parent_id: i32,
    pub root: String,
    pub mount_point: PathBuf,
    /// Per-mount options ("rw,nosuid,...").
    pub mount_options: String,
    /// Per-superblock options.
    pub super_options: String,
    pub fs_type: String,
    pub source: Option<String>,
    /// Inode of the mountpoint on disk; lets the immutability test survive
    /// bind-mount identity tricks.
    pub inode: Option<u64>,
}

impl MountEntry {
    pub fn is_read_only(&self) -> bool {
        let (f, _) = flags::parse_option_string(&self.mount_options);
        f.contains(MsFlags::MS_RDONLY)
    }

    pub fn mount_flags(&self) -> MsFlags {
        flags::parse_option_string(&self.mount_options).0
    }
}

impl From<procfs::process::MountInfo> for MountEntry {
    fn from(mi: procfs::process::MountInfo) -> Self {
        let join = |opts: HashMap<String, Option<String>>| {
            let mut parts: Vec<String> = opts
                .into_iter()
                .map(|(k, v)| match v {
                    Some(v) => format!("{}={}", k, v),
                    None => k,
                })
                .collect();
            parts.sort();
            parts.join(",")
        };
        MountEntry {
            mnt_id: mi.mnt_id,
            // procfs names the parent-id field "pid".
            parent_id: mi.pid,
            root: mi.root,
            mount_point: mi.mount_point,
            mount_options: join(mi.mount_options),
            super_options: join(mi.super_options),
            fs_type: mi.fs_type,
            source: mi.mount_source,
            inode: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct MountInfoSnapshot {
    entries: Vec<MountEntry>,
    by_id: HashMap<i32, usize>,
    by_mountpoint: HashMap<PathBuf, usize>,
    children: HashMap<i32, Vec<i32>>,
}

impl MountInfoSnapshot {
    pub fn from_entries(entries: Vec<MountEntry>) -> Self {
        let mut snap = MountInfoSnapshot {
            entries,
            ..Default::default()
        };
        for (idx, entry) in snap.entries.iter().enumerate() {
            snap.by_id.insert(entry.mnt_id, idx);
            snap.by_mountpoint.insert(entry.mount_point.clone(), idx);
        }
        for entry in &snap.entries {
            if entry.parent_id != entry.mnt_id && snap.by_id.contains_key(&entry.parent_id) {
                snap.children
                    .entry(entry.parent_id)
                    .or_default()
                    .push(entry.mnt_id);
            }
        }
        snap
    }

    /// Parse the live mountinfo of `pid`.
    pub fn for_pid(pid: i32) -> Result<Self, MountError> {
        let process = procfs::process::Process::new(pid)?;
        let infos = process.mountinfo()?;
        Ok(Self::from_entries(
            infos.0.into_iter().map(MountEntry::from).collect(),
        ))
    }

    /// Attach mountpoint inodes, for snapshots that feed immutability
    /// decisions.
    pub fn resolve_inodes(&mut self, io: &Arc<dyn IoService>) {
        for entry in &mut self.entries {
            let node = io.new_node("", &entry.mount_point, OFlag::O_RDONLY, 0);
            entry.inode = node.stat().ok().map(|s| s.ino);
        }
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    pub fn by_id(&self, mnt_id: i32) -> Option<&MountEntry> {
        self.by_id.get(&mnt_id).map(|&idx| &self.entries[idx])
    }

    pub fn by_mountpoint(&self, path: &Path) -> Option<&MountEntry> {
        self.by_mountpoint.get(path).map(|&idx| &self.entries[idx])
    }

    pub fn children_of(&self, mnt_id: i32) -> Vec<&MountEntry> {
        self.children
            .get(&mnt_id)
            .map(|ids| ids.iter().filter_map(|id| self.by_id(*id)).collect())
            .unwrap_or_default()
    }

    /// The mount covering `path`: the longest mountpoint that is a prefix.
    pub fn covering_mount(&self, path: &Path) -> Option<&MountEntry> {
        self.entries
            .iter()
            .filter(|e| path.starts_with(&e.mount_point))
            .max_by_key(|e| e.mount_point.as_os_str().len())
    }

    /// Does the snapshot contain `entry`, matched by mount id first and by
    /// (mountpoint, inode) as a fallback?
    pub fn contains(&self, entry: &MountEntry) -> bool {
        if self.by_id(entry.mnt_id).is_some() {
            return true;
        }
        match (self.by_mountpoint(&entry.mount_point), entry.inode) {
            (Some(found), Some(inode)) => found.inode == Some(inode),
            (Some(_), None) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn entry(
        mnt_id: i32,
        parent_id: i32,
        mount_point: &str,
        fs_type: &str,
        options: &str,
    ) -> MountEntry {
        MountEntry {
            mnt_id,
            parent_id,
            root: "/".to_string(),
            mount_point: PathBuf::from(mount_point),
            mount_options: options.to_string(),
            super_options: String::new(),
            fs_type: fs_type.to_string(),
            source: Some(fs_type.to_string()),
            inode: None,
        }
    }

    #[test]
    fn test_indexes_and_edges() {
        let snap = MountInfoSnapshot::from_entries(vec![
            entry(11, 1, "/", "ext4", "rw,relatime"),
            entry(20, 11, "/proc", "proc", "rw,nosuid"),
            entry(21, 20, "/proc/sys", "fuse", "rw,nosuid"),
            entry(22, 20, "/proc/uptime", "fuse", "rw,nosuid"),
        ]);

        assert_eq!(snap.by_id(20).unwrap().mount_point, Path::new("/proc"));
        assert_eq!(snap.by_mountpoint(Path::new("/proc/sys")).unwrap().mnt_id, 21);
        let kids: Vec<i32> = snap.children_of(20).iter().map(|e| e.mnt_id).collect();
        assert_eq!(kids, vec![21, 22]);
    }

    #[test]
    fn test_covering_mount_longest_prefix() {
        let snap = MountInfoSnapshot::from_entries(vec![
            entry(11, 1, "/", "ext4", "rw"),
            entry(20, 11, "/proc", "proc", "rw"),
            entry(21, 20, "/proc/sys", "fuse", "rw"),
        ]);
        assert_eq!(
            snap.covering_mount(Path::new("/proc/sys/kernel/shmmax"))
                .unwrap()
                .mnt_id,
            21
        );
        assert_eq!(snap.covering_mount(Path::new("/proc/stat")).unwrap().mnt_id, 20);
        assert_eq!(snap.covering_mount(Path::new("/etc")).unwrap().mnt_id, 11);
    }

    #[test]
    fn test_contains_inode_fallback() {
        let mut a = entry(20, 11, "/proc", "proc", "ro");
        a.inode = Some(42);
        let snap = MountInfoSnapshot::from_entries(vec![a]);

        // Same mountpoint, different id: inode decides.
        let mut probe = entry(99, 11, "/proc", "proc", "ro");
        probe.inode = Some(42);
        assert!(snap.contains(&probe));
        probe.inode = Some(43);
        assert!(!snap.contains(&probe));
    }
}
