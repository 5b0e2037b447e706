//! Daemon context and lifecycle
//!
//! Owns the global data structures behind the coarse vecs lock, the live
//! configuration, the registries, and the kernel collaborators. Also
//! provides the PID file, the fd-limit raise, and reconfiguration.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use mpath_core::alias::BindingsFile;
use mpath_core::checker::CheckerRegistry;
use mpath_core::config::{Config, MarginalPathgroups, MaxFds, QueueWithoutDaemon};
use mpath_core::dm::{DmChannel, SysfsSource};
use mpath_core::error::{CoreError, CoreResult};
use mpath_core::mapstate::{install_map, select_map_params, set_no_path_retry, update_mpp_paths};
use mpath_core::pgpolicy::group_paths;
use mpath_core::prio::PrioRegistry;
use mpath_core::prkeys::PrKeysFile;
use mpath_core::structs::{Multipath, PathRef, Vecs};

/// Everything the daemon threads share.
pub struct DaemonCtx {
    pub vecs: RwLock<Vecs>,
    pub conf: RwLock<Config>,
    pub config_file: PathBuf,
    pub dm: Box<dyn DmChannel>,
    pub sysfs: Box<dyn SysfsSource>,
    pub checkers: CheckerRegistry,
    pub prios: PrioRegistry,
    /// `forcequeueing daemon` latches queueing on for every map
    pub force_queueing: AtomicBool,
    shutdown: AtomicBool,
}

impl DaemonCtx {
    pub fn new(
        conf: Config,
        config_file: PathBuf,
        dm: Box<dyn DmChannel>,
        sysfs: Box<dyn SysfsSource>,
    ) -> Arc<Self> {
        Arc::new(DaemonCtx {
            vecs: RwLock::new(Vecs::new()),
            conf: RwLock::new(conf),
            config_file,
            dm,
            sysfs,
            checkers: CheckerRegistry::new(),
            prios: PrioRegistry::new(),
            force_queueing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn bindings(&self) -> BindingsFile {
        BindingsFile::new(&self.conf.read().bindings_file)
    }

    pub fn prkeys(&self) -> PrKeysFile {
        PrKeysFile::new(&self.conf.read().prkeys_file)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Rebuild a map's groups from its current path set and push the result to
/// the kernel.
pub fn regroup_map(
    mp: &mut Multipath,
    pathvec: &[PathRef],
    conf: &Config,
    dm: &dyn DmChannel,
) -> CoreResult<()> {
    update_mpp_paths(mp, pathvec);
    group_paths(mp, conf.marginal_pathgroups != MarginalPathgroups::Off)?;
    update_mpp_paths(mp, pathvec);
    install_map(mp, dm)
}

/// Rebuild the configuration from disk and re-resolve every map.
///
/// Bumps the config sequence number (the listener re-arms its file watches
/// off that), repairs the bindings file against the new static aliases,
/// resets the checker classes, and re-applies effective parameters,
/// grouping and queueing policy to every map.
pub fn reconfigure(ctx: &DaemonCtx) -> CoreResult<()> {
    info!("reconfigure: rebuilding configuration");
    let old_seq = ctx.conf.read().sequence_nr;
    let mut newconf = Config::load(&ctx.config_file)?;
    newconf.sequence_nr = old_seq + 1;

    let bindings = BindingsFile::new(&newconf.bindings_file);
    let read_only = newconf.bindings_read_only;
    if let Err(e) = bindings.check_and_repair(&mut newconf.mptable, read_only) {
        warn!("bindings file check failed: {}", e);
    }

    ctx.checkers.reset_all();
    *ctx.conf.write() = newconf;

    let conf = ctx.conf.read();
    let checkint = conf.checkint();
    let mut vecs = ctx.vecs.write();
    let Vecs { maps, paths } = &mut *vecs;
    for mp in maps.iter_mut() {
        select_map_params(&conf, mp);
        if let Err(e) = regroup_map(mp, paths, &conf, ctx.dm.as_ref()) {
            warn!("{}: regrouping after reconfigure failed: {}", mp.alias, e);
            continue;
        }
        set_no_path_retry(mp, ctx.dm.as_ref(), checkint, true);
    }
    info!("reconfigure: done, sequence_nr {}", conf.sequence_nr);
    Ok(())
}

/// Startup parameters of the daemon.
pub struct DaemonOptions {
    pub config_file: PathBuf,
    pub socket_name: String,
    pub pidfile: Option<PathBuf>,
}

/// Daemon entry point: load the configuration, claim the PID file, raise
/// the fd budget, repair the bindings file, start the checker loop and run
/// the control socket event loop until shutdown.
pub fn run(opts: DaemonOptions) -> CoreResult<()> {
    crate::listener::block_signals();

    let mut conf = Config::load(&opts.config_file)?;
    set_max_fds(conf.max_fds);
    let bindings = BindingsFile::new(&conf.bindings_file);
    let read_only = conf.bindings_read_only;
    if let Err(e) = bindings.check_and_repair(&mut conf.mptable, read_only) {
        warn!("bindings file check failed: {}", e);
    }

    let _pidfile = match opts.pidfile {
        Some(path) => Some(PidFile::create(path)?),
        None => None,
    };

    let ctx = DaemonCtx::new(
        conf,
        opts.config_file,
        Box::new(mpath_core::dm::MemoryDm::new()),
        Box::new(mpath_core::dm::MemorySysfs::new()),
    );
    let checker = crate::checkerloop::start_checker_loop(Arc::clone(&ctx))
        .map_err(CoreError::from)?;

    let rv = crate::listener::run_listener(Arc::clone(&ctx), &opts.socket_name);
    ctx.request_shutdown();
    checker.stop();
    stop_queueing_without_daemon(&ctx);
    info!("daemon exiting");
    rv
}

/// Unless queue_without_daemon allows it, maps must not keep queueing I/O
/// once nobody is left to count retries down.
fn stop_queueing_without_daemon(ctx: &DaemonCtx) {
    if ctx.conf.read().queue_without_daemon != QueueWithoutDaemon::No {
        return;
    }
    let vecs = ctx.vecs.read();
    for mp in &vecs.maps {
        if matches!(
            mp.no_path_retry,
            mpath_core::config::NoPathRetry::Queue | mpath_core::config::NoPathRetry::Retries(_)
        ) {
            info!("{}: disabling queueing on shutdown", mp.alias);
            if let Err(e) = ctx.dm.queue_if_no_path(&mp.alias, false) {
                warn!("{}: cannot disable queueing: {}", mp.alias, e);
            }
        }
    }
}

/// PID file with an exclusive advisory lock held for the daemon lifetime.
/// A second daemon instance fails to create it.
pub struct PidFile {
    path: PathBuf,
    _file: File,
}

impl PidFile {
    pub fn create(path: PathBuf) -> CoreResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| CoreError::io(&path, e, "open pid file"))?;
        // SAFETY: flock on the fd we just opened; LOCK_NB turns contention
        // into EWOULDBLOCK instead of blocking.
        let rv = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rv != 0 {
            return Err(CoreError::Fatal {
                reason: format!(
                    "{}: another instance is already running",
                    path.display()
                ),
            });
        }
        file.set_len(0)
            .map_err(|e| CoreError::io(&path, e, "truncate pid file"))?;
        writeln!(file, "{}", std::process::id())
            .map_err(|e| CoreError::io(&path, e, "write pid file"))?;
        Ok(PidFile { path, _file: file })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("cannot unlink {}: {}", self.path.display(), e);
        }
    }
}

/// Raise RLIMIT_NOFILE to the configured fd budget; `max` resolves to the
/// kernel's nr_open.
pub fn set_max_fds(max_fds: MaxFds) {
    let target: u64 = match max_fds {
        MaxFds::Undef => return,
        MaxFds::Value(n) => n as u64,
        MaxFds::Max => std::fs::read_to_string("/proc/sys/fs/nr_open")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(1048576),
    };
    let rl = libc::rlimit {
        rlim_cur: target,
        rlim_max: target,
    };
    // SAFETY: setrlimit with a stack rlimit struct; failure is reported,
    // not fatal.
    let rv = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rl) };
    if rv != 0 {
        warn!(
            "cannot raise RLIMIT_NOFILE to {}: {}",
            target,
            std::io::Error::last_os_error()
        );
    } else {
        info!("RLIMIT_NOFILE set to {}", target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpath_core::dm::{MemoryDm, MemorySysfs};
    use tempfile::TempDir;

    fn test_ctx(dir: &TempDir) -> Arc<DaemonCtx> {
        let mut conf = Config::builtin();
        conf.bindings_file = dir.path().join("bindings");
        conf.prkeys_file = dir.path().join("prkeys");
        conf.config_dir = dir.path().join("conf.d");
        DaemonCtx::new(
            conf,
            dir.path().join("multipath.conf"),
            Box::new(MemoryDm::new()),
            Box::new(MemorySysfs::new()),
        )
    }

    #[test]
    fn test_pid_file_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mpathd.pid");
        let pid = PidFile::create(path.clone()).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        let second = PidFile::create(path.clone());
        assert!(matches!(second, Err(CoreError::Fatal { .. })));

        drop(pid);
        assert!(!path.exists());
    }

    #[test]
    fn test_reconfigure_bumps_sequence() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        std::fs::write(
            &ctx.config_file,
            format!(
                "defaults {{\n bindings_file {}\n prkeys_file {}\n config_dir {}\n polling_interval 9\n}}\n",
                dir.path().join("bindings").display(),
                dir.path().join("prkeys").display(),
                dir.path().join("conf.d").display(),
            ),
        )
        .unwrap();

        assert_eq!(ctx.conf.read().sequence_nr, 1);
        reconfigure(&ctx).unwrap();
        let conf = ctx.conf.read();
        assert_eq!(conf.sequence_nr, 2);
        assert_eq!(conf.checkint(), 9);
    }

    #[test]
    fn test_reconfigure_repairs_bindings() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let bindings = dir.path().join("bindings");
        std::fs::write(&bindings, "mpatha WWA\nmpatha WWX\n").unwrap();
        std::fs::write(
            &ctx.config_file,
            format!(
                "defaults {{\n bindings_file {}\n prkeys_file {}\n config_dir {}\n}}\n",
                bindings.display(),
                dir.path().join("prkeys").display(),
                dir.path().join("conf.d").display(),
            ),
        )
        .unwrap();

        reconfigure(&ctx).unwrap();
        let content = std::fs::read_to_string(&bindings).unwrap();
        assert!(content.contains("mpatha WWA"));
        assert!(!content.contains("WWX"));
    }
}
