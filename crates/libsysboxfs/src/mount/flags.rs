//! Conversion between mount option strings and `MsFlags` bitmasks, in both
//! directions. Mountinfo and the mount(2) data argument speak strings; the
//! syscall and the remount logic speak flags.

use nix::mount::MsFlags;

/// Per-mount options that map to a flag bit. `(clear, flag)` like mount(8):
/// a clear entry removes the bit instead of setting it.
fn option_to_flag(option: &str) -> Option<(bool, MsFlags)> {
    match option {
        "defaults" => Some((false, MsFlags::empty())),
        "ro" => Some((false, MsFlags::MS_RDONLY)),
        "rw" => Some((true, MsFlags::MS_RDONLY)),
        "suid" => Some((true, MsFlags::MS_NOSUID)),
        "nosuid" => Some((false, MsFlags::MS_NOSUID)),
        "dev" => Some((true, MsFlags::MS_NODEV)),
        "nodev" => Some((false, MsFlags::MS_NODEV)),
        "exec" => Some((true, MsFlags::MS_NOEXEC)),
        "noexec" => Some((false, MsFlags::MS_NOEXEC)),
        "sync" => Some((false, MsFlags::MS_SYNCHRONOUS)),
        "async" => Some((true, MsFlags::MS_SYNCHRONOUS)),
        "dirsync" => Some((false, MsFlags::MS_DIRSYNC)),
        "remount" => Some((false, MsFlags::MS_REMOUNT)),
        "mand" => Some((false, MsFlags::MS_MANDLOCK)),
        "nomand" => Some((true, MsFlags::MS_MANDLOCK)),
        "atime" => Some((true, MsFlags::MS_NOATIME)),
        "noatime" => Some((false, MsFlags::MS_NOATIME)),
        "diratime" => Some((true, MsFlags::MS_NODIRATIME)),
        "nodiratime" => Some((false, MsFlags::MS_NODIRATIME)),
        "bind" => Some((false, MsFlags::MS_BIND)),
        "rbind" => Some((false, MsFlags::MS_BIND | MsFlags::MS_REC)),
        "unbindable" => Some((false, MsFlags::MS_UNBINDABLE)),
        "runbindable" => Some((false, MsFlags::MS_UNBINDABLE | MsFlags::MS_REC)),
        "private" => Some((false, MsFlags::MS_PRIVATE)),
        "rprivate" => Some((false, MsFlags::MS_PRIVATE | MsFlags::MS_REC)),
        "shared" => Some((false, MsFlags::MS_SHARED)),
        "rshared" => Some((false, MsFlags::MS_SHARED | MsFlags::MS_REC)),
        "slave" => Some((false, MsFlags::MS_SLAVE)),
        "rslave" => Some((false, MsFlags::MS_SLAVE | MsFlags::MS_REC)),
        "relatime" => Some((false, MsFlags::MS_RELATIME)),
        "norelatime" => Some((true, MsFlags::MS_RELATIME)),
        "strictatime" => Some((false, MsFlags::MS_STRICTATIME)),
        "nostrictatime" => Some((true, MsFlags::MS_STRICTATIME)),
        _ => None,
    }
}

/// Flag bits worth naming when reconstructing an option string. Order
/// matches the kernel's show_mnt_opts so output lines look familiar.
const FLAG_NAMES: &[(MsFlags, &str)] = &[
    (MsFlags::MS_RDONLY, "ro"),
    (MsFlags::MS_NOSUID, "nosuid"),
    (MsFlags::MS_NODEV, "nodev"),
    (MsFlags::MS_NOEXEC, "noexec"),
    (MsFlags::MS_SYNCHRONOUS, "sync"),
    (MsFlags::MS_DIRSYNC, "dirsync"),
    (MsFlags::MS_MANDLOCK, "mand"),
    (MsFlags::MS_NOATIME, "noatime"),
    (MsFlags::MS_NODIRATIME, "nodiratime"),
    (MsFlags::MS_RELATIME, "relatime"),
];

/// Extra protection applied when a managed submount is remounted read-only
/// on behalf of a read-only base mount.
pub fn ro_submount_extra_flags() -> MsFlags {
    MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC
}

/// Parse a comma-separated option string (mountinfo style). Options that do
/// not name a flag bit are returned verbatim as data options.
pub fn parse_option_string(options: &str) -> (MsFlags, Vec<String>) {
    let mut flags = MsFlags::empty();
    let mut data = vec![];
    for opt in options.split(',').filter(|o| !o.is_empty()) {
        match option_to_flag(opt) {
            Some((false, flag)) => flags |= flag,
            Some((true, flag)) => flags &= !flag,
            None => data.push(opt.to_string()),
        }
    }
    (flags, data)
}

/// Same conversion over an already-split option list (mount(2) data).
pub fn options_to_flags(options: &[String]) -> (MsFlags, Vec<String>) {
    parse_option_string(&options.join(","))
}

/// Canonical option string for a flag set; "rw" leads when MS_RDONLY is
/// absent, like the kernel prints it.
pub fn flags_to_option_string(flags: MsFlags) -> String {
    let mut parts = vec![];
    if !flags.contains(MsFlags::MS_RDONLY) {
        parts.push("rw".to_string());
    }
    for (flag, name) in FLAG_NAMES {
        if flags.contains(*flag) {
            parts.push(name.to_string());
        }
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_option_string() {
        let (flags, data) = parse_option_string("ro,nosuid,nodev,noexec,relatime,mode=755");
        assert_eq!(
            flags,
            MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV
                | MsFlags::MS_NOEXEC
                | MsFlags::MS_RELATIME
        );
        assert_eq!(data, vec!["mode=755"]);
    }

    #[test]
    fn test_clear_options_drop_bits() {
        let (flags, _) = parse_option_string("ro,rw,noexec");
        assert_eq!(flags, MsFlags::MS_NOEXEC);
    }

    #[test]
    fn test_round_trip() {
        let input = MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_RELATIME;
        let s = flags_to_option_string(input);
        let (parsed, data) = parse_option_string(&s);
        assert_eq!(parsed, input);
        assert!(data.is_empty());
    }

    #[test]
    fn test_rw_leads_when_writable() {
        assert_eq!(flags_to_option_string(MsFlags::MS_NOSUID), "rw,nosuid");
        assert!(flags_to_option_string(MsFlags::MS_RDONLY).starts_with("ro"));
    }
}
