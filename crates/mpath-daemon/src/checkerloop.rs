//! Checker tick loop
//!
//! A background thread wakes every second: path health checks run on every
//! checkint boundary, while the per-map countdowns (retry_tick while a map
//! is recovering, ghost_delay_tick while only ghosts are active) step every
//! second. Results are applied under the global vecs lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use mpath_core::config::{Failback, LogCheckerErr};
use mpath_core::mapstate::{
    install_map, sync_map_state, update_prio, update_queue_mode_add_path,
    update_queue_mode_del_path,
};
use mpath_core::pgpolicy::sort_pathgroups;
use mpath_core::structs::Vecs;

use crate::daemon::DaemonCtx;

pub struct CheckerLoop {
    ctx: Arc<DaemonCtx>,
    tick_nr: u64,
}

impl CheckerLoop {
    pub fn new(ctx: Arc<DaemonCtx>) -> Self {
        CheckerLoop { ctx, tick_nr: 0 }
    }

    /// One one-second tick: countdown bookkeeping always, path checks on
    /// checkint boundaries.
    pub fn tick(&mut self) {
        let checkint = self.ctx.conf.read().checkint().max(1) as u64;
        self.tick_nr += 1;
        if self.tick_nr % checkint == 0 {
            self.check_all_paths();
        }
        self.update_map_ticks();
    }

    /// Run every path's checker and apply state transitions to the owning
    /// maps.
    pub fn check_all_paths(&self) {
        let ctx = &*self.ctx;
        let conf = ctx.conf.read();
        let checkint = conf.checkint();
        let log_once = conf.log_checker_err == LogCheckerErr::Once;
        let mut vecs = ctx.vecs.write();
        let Vecs { maps, paths } = &mut *vecs;

        for pp_ref in paths.iter() {
            let mut pp = pp_ref.write();
            if !pp.checker.is_bound() || pp.checker.is_disabled() {
                continue;
            }
            if pp.checker.need_wait() {
                debug!("{}: waiting for in-flight check", pp.dev);
                continue;
            }
            let prev = pp.state;
            let fd = pp.raw_fd();
            pp.checker.set_fd(fd);
            pp.checker.check(prev);
            let new = pp.checker.get_state();
            if new == prev {
                continue;
            }
            pp.state = new;
            let went_down = !new.is_active() && prev.is_active();
            if went_down && !log_once {
                warn!("{}: checker{}", pp.dev, pp.checker.message());
            } else {
                info!("{}: state {} -> {}", pp.dev, prev.name(), new.name());
            }
            if new.is_active() {
                update_prio(&mut pp);
            }
            let owner = pp.mpp.clone();
            drop(pp);

            let idx = owner.and_then(|alias| maps.iter().position(|m| m.alias == alias));
            if let Some(idx) = idx {
                let mp = &mut maps[idx];
                let came_back = new.is_active() && !prev.is_active();
                if came_back {
                    update_queue_mode_add_path(mp, ctx.dm.as_ref());
                } else if went_down {
                    update_queue_mode_del_path(mp, checkint);
                }
                sort_pathgroups(mp);
                // with immediate failback the kernel is handed the
                // re-sorted group order right away
                if came_back && mp.failback == Failback::Immediate {
                    match install_map(mp, ctx.dm.as_ref()) {
                        Ok(()) => {
                            mp.stat_switchgroup += 1;
                            info!("{}: immediate failback", mp.alias);
                        }
                        Err(e) => info!("{}: failback reload failed: {}", mp.alias, e),
                    }
                }
                sync_map_state(mp, ctx.dm.as_ref());
            }
        }
    }

    /// Step the per-map countdowns. retry_tick is decremented before it is
    /// evaluated; reaching zero hands queue_if_no_path off to the kernel,
    /// failing outstanding I/O.
    fn update_map_ticks(&self) {
        let ctx = &*self.ctx;
        let force = ctx.force_queueing.load(Ordering::Acquire);
        let mut vecs = ctx.vecs.write();
        for mp in &mut vecs.maps {
            if mp.retry_tick > 0 {
                mp.retry_tick -= 1;
                if mp.retry_tick == 0 {
                    if force {
                        info!("{}: retries exhausted but queueing is forced", mp.alias);
                        continue;
                    }
                    warn!("{}: Disable queueing", mp.alias);
                    if let Err(e) = ctx.dm.queue_if_no_path(&mp.alias, false) {
                        info!("{}: cannot disable queueing: {}", mp.alias, e);
                    }
                }
            }
            if mp.ghost_delay_tick > 0 {
                mp.ghost_delay_tick -= 1;
                if mp.ghost_delay_tick == 0 {
                    info!("{}: ghost delay expired", mp.alias);
                    sync_map_state(mp, ctx.dm.as_ref());
                }
            }
        }
    }
}

/// Handle to the running checker loop thread. Dropping it stops the loop.
pub struct CheckerHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CheckerHandle {
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CheckerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the checker tick thread.
pub fn start_checker_loop(ctx: Arc<DaemonCtx>) -> std::io::Result<CheckerHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);

    let thread = thread::Builder::new()
        .name("mpathd-checker".to_string())
        .spawn(move || {
            let mut cl = CheckerLoop::new(Arc::clone(&ctx));
            loop {
                let wake = Instant::now() + Duration::from_secs(1);
                while Instant::now() < wake {
                    if shutdown_clone.load(Ordering::Acquire) || ctx.is_shutdown() {
                        return;
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                cl.tick();
            }
        })?;

    Ok(CheckerHandle {
        shutdown,
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::uxsock_trigger;
    use mpath_core::checker::{CheckerContext, CheckerPlugin, PathState};
    use mpath_core::config::{Config, NoPathRetry};
    use mpath_core::dm::{MemoryDm, MemorySysfs, PathSeed};
    use mpath_core::mapstate::set_no_path_retry;
    use std::sync::atomic::AtomicU8;
    use tempfile::TempDir;

    // scripted checker shared by the loop tests; 0 = up, 1 = down.
    // The tests serialize on TEST_LOCK since they all drive this state.
    static SCRIPT_STATE: AtomicU8 = AtomicU8::new(0);
    static TEST_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    struct ScriptChecker;

    impl CheckerPlugin for ScriptChecker {
        fn check(&self, _ctx: &mut CheckerContext) -> PathState {
            match SCRIPT_STATE.load(Ordering::Relaxed) {
                0 => PathState::Up,
                _ => PathState::Down,
            }
        }
    }

    fn test_ctx(dir: &TempDir) -> Arc<DaemonCtx> {
        let mut conf = Config::builtin();
        conf.bindings_file = dir.path().join("bindings");
        conf.prkeys_file = dir.path().join("prkeys");
        conf.config_dir = dir.path().join("conf.d");
        conf.checkint = Some(5);
        conf.defaults.checker_name = Some("script".to_string());
        let sysfs = MemorySysfs::new();
        for (dev, dev_t) in [("sda", "8:0"), ("sdb", "8:16"), ("sdc", "8:32")] {
            sysfs.add_dev(PathSeed {
                dev: dev.to_string(),
                dev_t: dev_t.to_string(),
                wwid: "WW1".to_string(),
                size: 2048,
                ..Default::default()
            });
        }
        let ctx = DaemonCtx::new(
            conf,
            dir.path().join("multipath.conf"),
            Box::new(MemoryDm::new()),
            Box::new(sysfs),
        );
        ctx.checkers.register("script", || Box::new(ScriptChecker));
        ctx
    }

    #[test]
    fn test_no_path_retry_countdown_and_recovery() {
        let _guard = TEST_LOCK.lock();
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);

        SCRIPT_STATE.store(0, Ordering::Relaxed);
        for dev in ["sda", "sdb", "sdc"] {
            let reply = uxsock_trigger(&ctx, &format!("add path {}", dev), true);
            assert_eq!(reply.text, "ok\n");
        }

        let mut cl = CheckerLoop::new(Arc::clone(&ctx));
        // first boundary check brings the paths up
        cl.check_all_paths();
        {
            let mut vecs = ctx.vecs.write();
            assert_eq!(vecs.maps[0].count_active_paths(), 3);
            let mp = &mut vecs.maps[0];
            mp.no_path_retry = NoPathRetry::Retries(3);
            set_no_path_retry(mp, ctx.dm.as_ref(), 5, false);
        }
        let alias = ctx.vecs.read().maps[0].alias.clone();
        assert_eq!(queueing(&ctx, &alias), Some(true));

        // all three paths drop
        SCRIPT_STATE.store(1, Ordering::Relaxed);
        cl.check_all_paths();
        {
            let vecs = ctx.vecs.read();
            let mp = &vecs.maps[0];
            assert!(mp.in_recovery);
            assert_eq!(mp.retry_tick, 16);
            assert_eq!(mp.stat_queueing_timeouts, 1);
        }

        // sixteen one-second ticks exhaust the retry budget
        for i in 0..16 {
            assert_eq!(queueing(&ctx, &alias), Some(true), "tick {}", i);
            cl.tick_countdown_only();
        }
        {
            let vecs = ctx.vecs.read();
            assert_eq!(vecs.maps[0].retry_tick, 0);
            assert!(vecs.maps[0].in_recovery);
        }
        assert_eq!(queueing(&ctx, &alias), Some(false));
    }

    #[test]
    fn test_recovery_before_exhaustion_keeps_queueing() {
        let _guard = TEST_LOCK.lock();
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);

        SCRIPT_STATE.store(0, Ordering::Relaxed);
        for dev in ["sda", "sdb", "sdc"] {
            uxsock_trigger(&ctx, &format!("add path {}", dev), true);
        }
        let mut cl = CheckerLoop::new(Arc::clone(&ctx));
        cl.check_all_paths();
        {
            let mut vecs = ctx.vecs.write();
            let mp = &mut vecs.maps[0];
            mp.no_path_retry = NoPathRetry::Retries(3);
            set_no_path_retry(mp, ctx.dm.as_ref(), 5, false);
        }
        let alias = ctx.vecs.read().maps[0].alias.clone();

        SCRIPT_STATE.store(1, Ordering::Relaxed);
        cl.check_all_paths();
        assert!(ctx.vecs.read().maps[0].in_recovery);

        // ten ticks in, one path comes back
        for _ in 0..10 {
            cl.tick_countdown_only();
        }
        assert_eq!(ctx.vecs.read().maps[0].retry_tick, 6);
        SCRIPT_STATE.store(0, Ordering::Relaxed);
        cl.check_all_paths();

        let vecs = ctx.vecs.read();
        let mp = &vecs.maps[0];
        assert!(!mp.in_recovery);
        assert_eq!(mp.retry_tick, 0);
        assert_eq!(queueing(&ctx, &alias), Some(true));
    }

    #[test]
    fn test_forced_queueing_survives_exhaustion() {
        let _guard = TEST_LOCK.lock();
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        SCRIPT_STATE.store(0, Ordering::Relaxed);
        uxsock_trigger(&ctx, "add path sda", true);
        let mut cl = CheckerLoop::new(Arc::clone(&ctx));
        cl.check_all_paths();
        {
            let mut vecs = ctx.vecs.write();
            let mp = &mut vecs.maps[0];
            mp.no_path_retry = NoPathRetry::Retries(1);
            set_no_path_retry(mp, ctx.dm.as_ref(), 5, false);
        }
        let alias = ctx.vecs.read().maps[0].alias.clone();

        SCRIPT_STATE.store(1, Ordering::Relaxed);
        cl.check_all_paths();
        ctx.force_queueing.store(true, Ordering::Release);

        for _ in 0..6 {
            cl.tick_countdown_only();
        }
        assert_eq!(ctx.vecs.read().maps[0].retry_tick, 0);
        assert_eq!(queueing(&ctx, &alias), Some(true));
    }

    impl CheckerLoop {
        /// Tick without running path checks, for countdown-focused tests.
        fn tick_countdown_only(&mut self) {
            self.update_map_ticks();
        }
    }

    fn queueing(ctx: &DaemonCtx, alias: &str) -> Option<bool> {
        ctx.dm.get_status(alias).ok().map(|s| s.queue_if_no_path)
    }
}
