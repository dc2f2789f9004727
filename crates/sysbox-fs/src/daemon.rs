//! Component construction and the daemon's signal loop. Every process-wide
//! service is built here and passed down by handle; nothing lives in a
//! global.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};

use libsysboxfs::container::{ContainerRegistry, FuseServerService};
use libsysboxfs::fuse::ServerPool;
use libsysboxfs::handler::HandlerRegistry;
use libsysboxfs::io::{create_io_service, IoBackend};
use libsysboxfs::mount::MountService;
use libsysboxfs::seccomp::{
    FdReleasePolicy, SeccompServer, Services, DEFAULT_SECCOMP_SOCKET,
};

use crate::Opts;

pub fn run(opts: &Opts) -> Result<()> {
    let policy = FdReleasePolicy::from_str(&opts.seccomp_fd_release)
        .map_err(|err| anyhow::anyhow!(err))?;

    fs::create_dir_all(&opts.mountpoint).with_context(|| {
        format!("failed to create mountpoint dir {}", opts.mountpoint.display())
    })?;

    let io = create_io_service(IoBackend::Host);
    let handlers = Arc::new(HandlerRegistry::new(io.clone()));
    let pool = Arc::new(ServerPool::new(io.clone(), handlers.clone(), &opts.mountpoint));
    let containers = Arc::new(ContainerRegistry::new(
        io.clone(),
        pool.clone() as Arc<dyn FuseServerService>,
    ));
    let mounts = Arc::new(MountService::new(io.clone(), handlers));

    let services = Arc::new(Services {
        io,
        containers,
        mounts,
        fuse_mountpoint: opts.mountpoint.clone(),
        allow_immutable_remounts: opts.allow_immutable_remounts,
        allow_immutable_unmounts: opts.allow_immutable_unmounts,
    });

    let seccomp = Arc::new(
        SeccompServer::new(services, policy)
            .context("seccomp notification support check failed")?,
    );
    let _acceptor = seccomp.listen(Path::new(DEFAULT_SECCOMP_SOCKET))?;

    tracing::info!(
        mountpoint = %opts.mountpoint.display(),
        "sysbox-fs serving"
    );
    wait_for_signals(&pool, &seccomp)
}

fn wait_for_signals(pool: &ServerPool, seccomp: &SeccompServer) -> Result<()> {
    let mut mask = SigSet::empty();
    for sig in [
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGQUIT,
        Signal::SIGSEGV,
    ] {
        mask.add(sig);
    }
    mask.thread_block().context("failed to block signals")?;

    loop {
        match mask.wait() {
            // TODO: reload configuration on SIGHUP.
            Ok(Signal::SIGHUP) => {
                tracing::info!("SIGHUP received; ignoring");
            }
            Ok(sig) => {
                tracing::info!(signal = %sig, "shutting down");
                break;
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(anyhow::anyhow!("sigwait failed: {errno}")),
        }
    }

    seccomp.shutdown();
    pool.shutdown();
    // Give the FUSE library time to flush its unmount log before exit.
    std::thread::sleep(Duration::from_secs(2));
    Ok(())
}
