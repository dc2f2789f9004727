//! sysbox-fs: userspace daemon that emulates portions of procfs and sysfs
//! for system containers. The default mode serves until signalled; the
//! hidden `nsenter` subcommand is the internal re-exec entrypoint and is
//! not meant for human invocation.

mod daemon;
mod observability;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "procfs/sysfs emulation daemon for system containers")]
pub struct Opts {
    /// Parent directory under which per-container mountpoints are created.
    #[arg(long, default_value = "/var/lib/sysboxfs")]
    pub mountpoint: PathBuf,

    /// Enable verbose logging (also propagated to the FUSE layer).
    #[arg(long, short = 'd')]
    pub debug: bool,

    /// Log destination.
    #[arg(long, default_value = "/dev/null")]
    pub log: PathBuf,

    /// Log format: text or json.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Permit read-write remounts of immutable read-only mounts.
    #[arg(long)]
    pub allow_immutable_remounts: bool,

    /// Permit unmounts of immutable mounts.
    #[arg(long)]
    pub allow_immutable_unmounts: bool,

    /// When to release a seccomp notification fd: proc-exit or cont-exit.
    #[arg(long, default_value = "cont-exit")]
    pub seccomp_fd_release: String,

    #[command(subcommand)]
    subcmd: Option<SubCommand>,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Internal re-exec entrypoint.
    #[command(hide = true)]
    Nsenter,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Some(SubCommand::Nsenter) = opts.subcmd {
        // The helper talks over fd 3 and must not touch the daemon's log.
        std::process::exit(libsysboxfs::nsenter::helper::run());
    }

    observability::init(&opts)?;
    daemon::run(&opts)
}
