//! Map state machine
//!
//! Adoption of discovered paths into maps, synchronisation of the
//! in-memory model with the kernel collaborator, and the recovery state
//! machine driving queue_if_no_path while paths come and go.
//!
//! Queueing states of a map: queueing (paths available or queue forever),
//! recovering (no active path, bounded retries counting down), failing
//! (retries exhausted or fail policy). Invariants kept here:
//! `in_recovery` implies a positive retry budget, and a running
//! `retry_tick` implies `in_recovery`.

use std::time::Duration;

use log::{debug, info, warn};

use crate::alias::BindingsFile;
use crate::checker::CheckerRegistry;
use crate::config::{Config, NoPathRetry};
use crate::dm::{DmChannel, DmPathState, DmTable, DmTableGroup, SysfsSource};
use crate::error::{CoreError, CoreResult};
use crate::prio::{PrioRegistry, PRIO_UNDEF};
use crate::structs::{
    find_path_by_devt, find_slot, Multipath, Path, PathGroup, PathRef, Vecs,
};

/// Attach checker and prioritizer instances to a path and refresh its
/// priority. Fails when the configured checker class cannot be loaded;
/// the caller skips the path in that case.
pub fn pathinfo(
    pp: &mut Path,
    conf: &Config,
    checkers: &CheckerRegistry,
    prios: &PrioRegistry,
    want_checker: bool,
    want_prio: bool,
) -> CoreResult<()> {
    let hwe = conf.find_hwe(&pp.vendor_id, &pp.product_id, &pp.rev);
    if want_checker && !pp.checker.is_bound() {
        let name = conf.select_checker(hwe);
        let mut checker = checkers.get(&name);
        if !checker.is_bound() {
            return Err(CoreError::NotFound {
                object: format!("checker {}", name),
            });
        }
        checker.set_timeout(Duration::from_secs(conf.checker_timeout as u64));
        checker.set_fd(pp.raw_fd());
        checker.init(None)?;
        pp.checker = checker;
    }
    if want_prio && !pp.prio.is_bound() {
        let mpe = conf.find_mpe(&pp.wwid, None);
        let (name, args) = conf.select_prio(mpe, hwe);
        pp.prio = prios.get(&name, &args);
    }
    if want_prio {
        update_prio(pp);
    }
    Ok(())
}

/// Recompute the path's priority through its prioritizer instance.
pub fn update_prio(pp: &mut Path) {
    let cls = pp.prio.class();
    let args = pp.prio.args().to_string();
    pp.priority = match cls {
        Some(c) => c.getprio(pp, &args),
        None => PRIO_UNDEF,
    };
}

/// Detach a path from its map: clear the weak owner handle, reset the
/// kernel state, release checker and prioritizer handles, close the fd.
pub fn orphan_path(pp_ref: &PathRef, reason: &str) {
    let mut pp = pp_ref.write();
    debug!("{}: orphan path, {}", pp.dev, reason);
    pp.mpp = None;
    pp.dmstate = DmPathState::Undef;
    pp.prio.put();
    pp.checker.put();
    pp.fd = None;
}

/// Orphan every path currently owned by `mp_alias`.
pub fn orphan_paths(paths: &[PathRef], mp_alias: &str, reason: &str) {
    for pp in paths {
        let owned = pp.read().mpp.as_deref() == Some(mp_alias);
        if owned {
            orphan_path(pp, reason);
        }
    }
}

/// Rebuild the flattened path list from the map's groups: every path
/// reachable through a group that still exists globally appears in
/// `mp.paths` exactly once.
pub fn update_mpp_paths(mp: &mut Multipath, pathvec: &[PathRef]) {
    let mut flattened = std::mem::take(&mut mp.paths);
    for pg in &mp.groups {
        for pp in &pg.paths {
            let dev_t = pp.read().dev_t.clone();
            if find_path_by_devt(&flattened, &dev_t).is_none()
                && find_path_by_devt(pathvec, &dev_t).is_some()
            {
                flattened.push(pp.clone());
            }
        }
    }
    mp.paths = flattened;
}

/// Attach every matching discovered path to the map: WWID must match,
/// sizes must agree, and checker/prioritizer setup must succeed, otherwise
/// the path is skipped.
pub fn adopt_paths(
    pathvec: &[PathRef],
    mp: &mut Multipath,
    conf: &Config,
    checkers: &CheckerRegistry,
    prios: &PrioRegistry,
) {
    update_mpp_paths(mp, pathvec);

    for pp_ref in pathvec {
        // the membership probe read-locks list members, so it must run
        // before this path's write guard is taken
        let (dev, dev_t, wwid, size) = {
            let pp = pp_ref.read();
            (pp.dev.clone(), pp.dev_t.clone(), pp.wwid.clone(), pp.size)
        };
        if wwid != mp.wwid {
            continue;
        }
        if size != 0 && mp.size != 0 && size != mp.size {
            info!("{}: size mismatch for {}, not adding path", dev, mp.alias);
            continue;
        }
        let known = find_path_by_devt(&mp.paths, &dev_t).is_some();

        let mut pp = pp_ref.write();
        if let Err(e) = pathinfo(&mut pp, conf, checkers, prios, true, true) {
            info!("{}: pathinfo failed: {}", dev, e);
            continue;
        }
        pp.mpp = Some(mp.alias.clone());
        drop(pp);

        if !known {
            mp.paths.push(pp_ref.clone());
        }
        debug!("{}: ownership set to {}", dev, mp.alias);
    }
}

/// Remove a map: orphan its paths and, when `purge_vec` is set, drop it
/// from the global map list.
pub fn remove_map(vecs: &mut Vecs, alias: &str, purge_vec: bool) {
    orphan_paths(&vecs.paths, alias, "map removed internally");
    if purge_vec {
        if let Some(i) = vecs.find_map_by_alias(alias) {
            vecs.maps.remove(i);
        }
    }
}

/// Alias of a live map with the same WWID, remembered so a re-created map
/// can try to reuse its predecessor's user-friendly name.
pub fn find_existing_alias(vecs: &Vecs, wwid: &str) -> Option<String> {
    vecs.maps
        .iter()
        .find(|mp| mp.wwid == wwid)
        .map(|mp| mp.alias.clone())
}

/// Pick the map's alias: static `multipaths` alias, then a reusable or
/// fresh user-friendly name from the bindings file, then the WWID itself.
pub fn select_alias(
    conf: &Config,
    mp: &mut Multipath,
    bindings: &BindingsFile,
    dm: &dyn DmChannel,
) -> CoreResult<()> {
    let mpe_alias = conf.find_mpe(&mp.wwid, None).and_then(|m| m.alias.clone());
    if let Some(alias) = mpe_alias {
        mp.alias = alias;
        return Ok(());
    }
    let hwe_key = mp.hwe.clone();
    let mpe = conf.find_mpe(&mp.wwid, None);
    let hwe = hwe_key
        .as_ref()
        .and_then(|(v, p, r)| conf.find_hwe(v, p, r));
    if conf.select_user_friendly_names(mpe, hwe) {
        let prefix = conf.select_alias_prefix(mpe, hwe);
        let read_only = conf.bindings_read_only;
        if !mp.alias_old.is_empty() {
            if let Some(alias) =
                bindings.use_existing_alias(&mp.wwid, &mp.alias_old, &prefix, read_only)?
            {
                mp.alias = alias;
                return Ok(());
            }
        }
        if let Some(alias) = bindings.get_user_friendly_alias(&mp.wwid, &prefix, read_only, dm)? {
            mp.alias = alias;
            return Ok(());
        }
    }
    mp.alias = mp.wwid.clone();
    Ok(())
}

/// Resolve the map's effective parameters through the configuration
/// layers.
pub fn select_map_params(conf: &Config, mp: &mut Multipath) {
    let wwid = mp.wwid.clone();
    let alias = mp.alias.clone();
    let hwe_key = mp.hwe.clone();
    let mpe = conf.find_mpe(&wwid, Some(&alias));
    let hwe = hwe_key
        .as_ref()
        .and_then(|(v, p, r)| conf.find_hwe(v, p, r));
    mp.pgpolicy = conf.select_pgpolicy(mpe, hwe);
    mp.failback = conf.select_failback(mpe, hwe);
    mp.no_path_retry = conf.select_no_path_retry(mpe, hwe);
    mp.features = conf.select_features(mpe, hwe);
    mp.hwhandler = conf.select_hwhandler(mpe, hwe);
    // a configured ghost delay only arms when the map comes up with ghost
    // paths alone
    let ghost_delay = match conf.select_ghost_delay(mpe, hwe) {
        crate::config::UndefOffZero::Value(n) => n,
        _ => 0,
    };
    if ghost_delay > 0 && mp.ghost_delay_tick == 0 {
        use crate::checker::PathState;
        let has_up = mp.paths.iter().any(|p| p.read().state == PathState::Up);
        let has_ghost = mp.paths.iter().any(|p| p.read().state == PathState::Ghost);
        if has_ghost && !has_up {
            mp.ghost_delay_tick = ghost_delay;
        }
    }
}

/// Allocate a map for a path whose WWID matches no existing map: pick the
/// hardware profile from the path, select the alias, copy size and WWID,
/// adopt every matching path and optionally register the map globally.
///
/// Returns the index of the registered map, or None when `add_vec` is
/// unset (the built map is unwound again). Any failure unwinds adopted
/// paths before returning.
pub fn add_map_with_path(
    vecs: &mut Vecs,
    pp_ref: &PathRef,
    add_vec: bool,
    conf: &Config,
    bindings: &BindingsFile,
    dm: &dyn DmChannel,
    checkers: &CheckerRegistry,
    prios: &PrioRegistry,
) -> CoreResult<Option<usize>> {
    let (dev, wwid, size, hwe) = {
        let pp = pp_ref.read();
        (
            pp.dev.clone(),
            pp.wwid.clone(),
            pp.size,
            (
                pp.vendor_id.clone(),
                pp.product_id.clone(),
                pp.rev.clone(),
            ),
        )
    };
    if wwid.is_empty() {
        return Err(CoreError::PolicyViolation {
            object: dev,
            reason: "cannot create a map for an empty WWID".to_string(),
        });
    }

    let mut mp = Multipath::new(&wwid);
    mp.hwe = Some(hwe);
    mp.size = size;
    if let Some(old) = find_existing_alias(vecs, &wwid) {
        mp.alias_old = old;
    }
    select_alias(conf, &mut mp, bindings, dm)?;
    if vecs.find_map_by_alias(&mp.alias).is_some() {
        return Err(CoreError::PolicyViolation {
            object: mp.alias.clone(),
            reason: "alias already in use by another map".to_string(),
        });
    }
    select_map_params(conf, &mut mp);

    adopt_paths(&vecs.paths, &mut mp, conf, checkers, prios);
    let adopted = pp_ref.read().mpp.as_deref() == Some(mp.alias.as_str())
        && find_slot(&mp.paths, pp_ref).is_some();
    if !adopted {
        warn!("error setting ownership of {} to {}", dev, mp.alias);
        orphan_paths(&vecs.paths, &mp.alias, "failed to add map");
        return Err(CoreError::PolicyViolation {
            object: dev,
            reason: format!("could not adopt path into {}", mp.alias),
        });
    }

    if add_vec {
        vecs.maps.push(mp);
        Ok(Some(vecs.maps.len() - 1))
    } else {
        orphan_paths(&vecs.paths, &mp.alias, "map not registered");
        Ok(None)
    }
}

/// Table for the kernel collaborator, assembled from the map's groups.
pub fn assemble_table(mp: &Multipath) -> DmTable {
    DmTable {
        size: mp.size,
        features: mp.features.clone(),
        hwhandler: mp.hwhandler.clone(),
        groups: mp
            .groups
            .iter()
            .map(|pg| DmTableGroup {
                path_devts: pg.paths.iter().map(|pp| pp.read().dev_t.clone()).collect(),
            })
            .collect(),
    }
}

/// Install or refresh the kernel table for this map.
pub fn install_map(mp: &Multipath, dm: &dyn DmChannel) -> CoreResult<()> {
    let table = assemble_table(mp);
    if dm.map_present(&mp.alias) {
        dm.reload_map(&mp.alias, &table)
    } else {
        dm.create_map(&mp.alias, &mp.wwid, &table)
    }
}

/// Fetch the kernel table and rebuild the map's groups from it. Paths the
/// kernel reports but discovery no longer knows are dropped with a
/// warning.
pub fn update_multipath_table(
    mp: &mut Multipath,
    pathvec: &[PathRef],
    dm: &dyn DmChannel,
) -> CoreResult<()> {
    let table = match dm.get_table(&mp.alias) {
        Ok(t) => t,
        Err(e) => {
            info!("{}: error getting table: {}", mp.alias, e);
            return Err(e);
        }
    };
    mp.size = table.size;
    mp.features = table.features;
    mp.hwhandler = table.hwhandler;
    mp.groups = table
        .groups
        .iter()
        .map(|g| {
            let mut pg = PathGroup::new();
            for dev_t in &g.path_devts {
                match find_path_by_devt(pathvec, dev_t) {
                    Some(pp) => pg.paths.push(pp),
                    None => warn!("{}: unknown path {} in kernel table", mp.alias, dev_t),
                }
            }
            pg
        })
        .collect();
    Ok(())
}

/// Fetch the kernel status and refresh per-path dm-state and the group
/// priority sums.
pub fn update_multipath_status(mp: &mut Multipath, dm: &dyn DmChannel) -> CoreResult<()> {
    let status = match dm.get_status(&mp.alias) {
        Ok(s) => s,
        Err(e) => {
            info!("{}: error getting status: {}", mp.alias, e);
            return Err(e);
        }
    };
    for (pg, sg) in mp.groups.iter_mut().zip(status.groups.iter()) {
        for ps in &sg.paths {
            if let Some(pp) = find_path_by_devt(&pg.paths, &ps.dev_t) {
                pp.write().dmstate = ps.state;
            }
        }
    }
    for pg in &mut mp.groups {
        pg.prio_update();
    }
    Ok(())
}

/// Drop any path from the flattened list that no longer appears in the
/// map's groups, orphaning it, then restore the back-references.
pub fn sync_paths(mp: &mut Multipath, pathvec: &[PathRef]) {
    let mut i = 0;
    while i < mp.paths.len() {
        let pp_ref = mp.paths[i].clone();
        let found = mp
            .groups
            .iter()
            .any(|pg| find_slot(&pg.paths, &pp_ref).is_some());
        if !found {
            debug!("{} dropped path {}", mp.alias, pp_ref.read().dev);
            mp.paths.remove(i);
            orphan_path(&pp_ref, "path removed externally");
        } else {
            i += 1;
        }
    }
    update_mpp_paths(mp, pathvec);
    for pp in &mp.paths {
        pp.write().mpp = Some(mp.alias.clone());
    }
}

/// Full three-stage sync with the kernel: rebuild groups from the table,
/// drop vanished paths, refresh status and priorities.
pub fn update_multipath_strings(
    mp: &mut Multipath,
    pathvec: &[PathRef],
    dm: &dyn DmChannel,
) -> CoreResult<()> {
    update_mpp_paths(mp, pathvec);
    mp.groups.clear();
    update_multipath_table(mp, pathvec, dm)?;
    sync_paths(mp, pathvec);
    update_multipath_status(mp, dm)?;
    Ok(())
}

/// Push checker verdicts down to the kernel: reinstate paths the kernel
/// failed that are healthy again, fail paths the kernel still uses that
/// went down. Undetermined and delayed paths are left alone, as is
/// everything while a ghost delay is counting down.
pub fn sync_map_state(mp: &Multipath, dm: &dyn DmChannel) {
    use crate::checker::PathState;

    for pg in &mp.groups {
        for pp_ref in &pg.paths {
            let pp = pp_ref.read();
            if matches!(
                pp.state,
                PathState::Unchecked | PathState::Wild | PathState::Delayed
            ) {
                continue;
            }
            if mp.ghost_delay_tick > 0 {
                continue;
            }
            if matches!(pp.dmstate, DmPathState::Failed | DmPathState::Undef)
                && pp.state.is_active()
            {
                if let Err(e) = dm.reinstate_path(&mp.alias, &pp.dev_t) {
                    info!("{}: failed to reinstate {}: {}", mp.alias, pp.dev, e);
                }
            } else if matches!(pp.dmstate, DmPathState::Active | DmPathState::Undef)
                && matches!(pp.state, PathState::Down | PathState::Shaky)
            {
                info!(
                    "sync_map_state: failing {} state {} dmstate {:?}",
                    pp.dev,
                    pp.state.name(),
                    pp.dmstate
                );
                if let Err(e) = dm.fail_path(&mp.alias, &pp.dev_t) {
                    info!("{}: failed to fail {}: {}", mp.alias, pp.dev, e);
                }
            }
        }
    }
}

fn dm_queue(dm: &dyn DmChannel, alias: &str, enable: bool) {
    if let Err(e) = dm.queue_if_no_path(alias, enable) {
        info!("{}: cannot set queue_if_no_path to {}: {}", alias, enable, e);
    }
}

fn enter_recovery_mode(mp: &mut Multipath, checkint: u32) {
    let retries = match mp.no_path_retry {
        NoPathRetry::Retries(n) => n,
        _ => return,
    };
    if mp.in_recovery {
        return;
    }
    // +1: the checker loop decrements retry_tick before evaluating it, and
    // the decrement must not eat the first retry interval.
    mp.in_recovery = true;
    mp.stat_queueing_timeouts += 1;
    mp.retry_tick = retries * checkint + 1;
    warn!(
        "{}: Entering recovery mode: max_retries={}",
        mp.alias, retries
    );
}

/// Leave recovery once a path came back. no_path_retry may have changed
/// while the map was recovering, so it is tested again here before
/// re-asserting kernel queueing.
pub fn leave_recovery_mode(mp: &mut Multipath, dm: &dyn DmChannel) {
    let recovery = mp.in_recovery;
    mp.in_recovery = false;
    mp.retry_tick = 0;

    if recovery
        && matches!(
            mp.no_path_retry,
            NoPathRetry::Queue | NoPathRetry::Retries(_)
        )
    {
        dm_queue(dm, &mp.alias, true);
        info!("{}: queue_if_no_path enabled", mp.alias);
        warn!("{}: Recovered to normal mode", mp.alias);
    }
}

/// Align kernel queueing with the map's no_path_retry policy. With
/// `check_features` set, redundant toggles are skipped when the current
/// feature string already agrees.
pub fn set_no_path_retry(
    mp: &mut Multipath,
    dm: &dyn DmChannel,
    checkint: u32,
    check_features: bool,
) {
    let is_queueing = check_features && mp.features.contains("queue_if_no_path");

    match mp.no_path_retry {
        NoPathRetry::Undef => {}
        NoPathRetry::Fail => {
            if !check_features || is_queueing {
                dm_queue(dm, &mp.alias, false);
            }
        }
        NoPathRetry::Queue => {
            if !check_features || !is_queueing {
                dm_queue(dm, &mp.alias, true);
            }
        }
        NoPathRetry::Retries(_) => {
            if mp.count_active_paths() > 0 {
                // leave_recovery_mode() re-asserts queueing itself when the
                // map was recovering
                if (!check_features || !is_queueing) && !mp.in_recovery {
                    dm_queue(dm, &mp.alias, true);
                }
                leave_recovery_mode(mp, dm);
            } else {
                enter_recovery_mode(mp, checkint);
            }
        }
    }
}

/// Active path count dropped; enter recovery when the map ran dry.
pub fn update_queue_mode_del_path(mp: &mut Multipath, checkint: u32) {
    let active = mp.count_active_paths();
    if active == 0 {
        enter_recovery_mode(mp, checkint);
        if mp.no_path_retry != NoPathRetry::Queue {
            mp.stat_map_failures += 1;
        }
    }
    info!("{}: remaining active paths: {}", mp.alias, active);
}

/// A path came back; leave recovery if any path is active.
pub fn update_queue_mode_add_path(mp: &mut Multipath, dm: &dyn DmChannel) {
    let active = mp.count_active_paths();
    if active > 0 {
        leave_recovery_mode(mp, dm);
    }
    info!("{}: remaining active paths: {}", mp.alias, active);
}

/// Drop paths that disappeared from sysfs. A Down path vanishing is
/// routine; any other state gets a warning. Returns the number of paths
/// dropped.
pub fn verify_paths(
    mp: &mut Multipath,
    pathvec: &mut Vec<PathRef>,
    sysfs: &dyn SysfsSource,
) -> usize {
    use crate::checker::PathState;

    let mut count = 0;
    let mut i = 0;
    while i < mp.paths.len() {
        let (dev, state) = {
            let pp = mp.paths[i].read();
            (pp.dev.clone(), pp.state)
        };
        if sysfs.path_present(&dev) {
            debug!("{}: verified path {}", mp.alias, dev);
            i += 1;
            continue;
        }
        if state != PathState::Down {
            warn!(
                "{}: removing valid path {} in state {}",
                mp.alias,
                dev,
                state.name()
            );
        } else {
            debug!("{}: failed to access path {}", mp.alias, dev);
        }
        count += 1;
        let pp_ref = mp.paths.remove(i);
        if let Some(j) = find_slot(pathvec, &pp_ref) {
            pathvec.remove(j);
        }
        orphan_path(&pp_ref, "path removed from sysfs");
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::PathState;
    use crate::dm::{MemoryDm, MemorySysfs, PathSeed};
    use crate::pgpolicy::{group_paths, PgPolicy};
    use parking_lot::RwLock;
    use std::sync::Arc;

    fn path_ref(dev: &str, dev_t: &str, wwid: &str) -> PathRef {
        let mut pp = Path::new(dev, dev_t);
        pp.wwid = wwid.to_string();
        pp.state = PathState::Up;
        pp.size = 1000;
        Arc::new(RwLock::new(pp))
    }

    struct Fixture {
        conf: Config,
        checkers: CheckerRegistry,
        prios: PrioRegistry,
        dm: MemoryDm,
        bindings: BindingsFile,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let mut conf = Config::builtin();
        conf.defaults.checker_name = Some(crate::checker::NONE.to_string());
        Fixture {
            conf,
            checkers: CheckerRegistry::new(),
            prios: PrioRegistry::new(),
            dm: MemoryDm::new(),
            bindings: BindingsFile::new(&dir.path().join("bindings")),
            _dir: dir,
        }
    }

    fn vecs_with_paths(wwid: &str, n: usize) -> Vecs {
        let mut vecs = Vecs::new();
        for i in 0..n {
            vecs.paths
                .push(path_ref(&format!("sd{}", (b'a' + i as u8) as char), &format!("8:{}", i * 16), wwid));
        }
        vecs
    }

    fn build_map(f: &Fixture, vecs: &mut Vecs, wwid: &str) -> usize {
        let pp = vecs.paths[0].clone();
        let idx = add_map_with_path(
            vecs, &pp, true, &f.conf, &f.bindings, &f.dm, &f.checkers, &f.prios,
        )
        .unwrap()
        .unwrap();
        let mp = &mut vecs.maps[idx];
        mp.pgpolicy = PgPolicy::Multibus;
        group_paths(mp, false).unwrap();
        update_mpp_paths_from_groups(mp);
        install_map(mp, &f.dm).unwrap();
        assert_eq!(mp.wwid, wwid);
        idx
    }

    fn update_mpp_paths_from_groups(mp: &mut Multipath) {
        let all: Vec<PathRef> = mp
            .groups
            .iter()
            .flat_map(|pg| pg.paths.iter().cloned())
            .collect();
        mp.paths = all;
    }

    #[test]
    fn test_adopt_matching_paths() {
        let f = fixture();
        let mut vecs = vecs_with_paths("w1", 3);
        vecs.paths.push(path_ref("sdz", "65:0", "other"));

        let mut mp = Multipath::new("w1");
        mp.alias = "mpatha".to_string();
        mp.size = 1000;
        adopt_paths(&vecs.paths, &mut mp, &f.conf, &f.checkers, &f.prios);
        assert_eq!(mp.paths.len(), 3);
        assert_eq!(vecs.paths[0].read().mpp.as_deref(), Some("mpatha"));
        assert_eq!(vecs.paths[3].read().mpp, None);
    }

    #[test]
    fn test_adopt_skips_size_mismatch() {
        let f = fixture();
        let mut vecs = vecs_with_paths("w1", 2);
        vecs.paths[1].write().size = 4242;

        let mut mp = Multipath::new("w1");
        mp.alias = "mpatha".to_string();
        mp.size = 1000;
        adopt_paths(&vecs.paths, &mut mp, &f.conf, &f.checkers, &f.prios);
        assert_eq!(mp.paths.len(), 1);
    }

    #[test]
    fn test_add_map_with_path_registers() {
        let f = fixture();
        let mut vecs = vecs_with_paths("w1", 2);
        let idx = build_map(&f, &mut vecs, "w1");
        let mp = &vecs.maps[idx];
        // user_friendly_names is off: the alias is the WWID
        assert_eq!(mp.alias, "w1");
        assert_eq!(mp.paths.len(), 2);
        assert!(f.dm.map_present("w1"));
        // back-references point at the map
        for pp in &vecs.paths {
            assert_eq!(pp.read().mpp.as_deref(), Some("w1"));
        }
    }

    #[test]
    fn test_add_map_empty_wwid_rejected() {
        let f = fixture();
        let mut vecs = Vecs::new();
        vecs.paths.push(path_ref("sda", "8:0", ""));
        let pp = vecs.paths[0].clone();
        let err = add_map_with_path(
            &mut vecs, &pp, true, &f.conf, &f.bindings, &f.dm, &f.checkers, &f.prios,
        );
        assert!(matches!(err, Err(CoreError::PolicyViolation { .. })));
    }

    #[test]
    fn test_orphan_releases_ownership() {
        let f = fixture();
        let mut vecs = vecs_with_paths("w1", 2);
        let idx = build_map(&f, &mut vecs, "w1");
        let alias = vecs.maps[idx].alias.clone();
        remove_map(&mut vecs, &alias, true);
        assert!(vecs.maps.is_empty());
        for pp in &vecs.paths {
            let pp = pp.read();
            assert_eq!(pp.mpp, None);
            assert_eq!(pp.dmstate, DmPathState::Undef);
            assert!(!pp.checker.is_bound());
            assert!(!pp.prio.is_bound());
        }
    }

    #[test]
    fn test_recovery_entry_and_retry_tick() {
        // no_path_retry=3, checkint=5, all paths down:
        // in_recovery, retry_tick = 3*5+1, one queueing timeout counted
        let f = fixture();
        let mut vecs = vecs_with_paths("w1", 3);
        let idx = build_map(&f, &mut vecs, "w1");
        let mp = &mut vecs.maps[idx];
        mp.no_path_retry = NoPathRetry::Retries(3);

        for pp in &vecs.paths {
            pp.write().state = PathState::Down;
        }
        let mp = &mut vecs.maps[idx];
        update_queue_mode_del_path(mp, 5);

        assert!(mp.in_recovery);
        assert_eq!(mp.retry_tick, 16);
        assert_eq!(mp.stat_queueing_timeouts, 1);
        assert_eq!(mp.stat_map_failures, 1);

        // a second transition to zero paths must not restart the countdown
        mp.retry_tick = 7;
        update_queue_mode_del_path(mp, 5);
        assert_eq!(mp.retry_tick, 7);
        assert_eq!(mp.stat_queueing_timeouts, 1);
    }

    #[test]
    fn test_recovery_exit_restores_queueing() {
        let f = fixture();
        let mut vecs = vecs_with_paths("w1", 3);
        let idx = build_map(&f, &mut vecs, "w1");
        vecs.maps[idx].no_path_retry = NoPathRetry::Retries(3);

        for pp in &vecs.paths {
            pp.write().state = PathState::Down;
        }
        update_queue_mode_del_path(&mut vecs.maps[idx], 5);
        assert!(vecs.maps[idx].in_recovery);

        f.dm.queue_if_no_path("w1", true).unwrap();
        vecs.paths[1].write().state = PathState::Up;
        update_queue_mode_add_path(&mut vecs.maps[idx], &f.dm);

        let mp = &vecs.maps[idx];
        assert!(!mp.in_recovery);
        assert_eq!(mp.retry_tick, 0);
        assert_eq!(f.dm.is_queueing("w1"), Some(true));
    }

    #[test]
    fn test_recovery_invariants() {
        let f = fixture();
        let mut vecs = vecs_with_paths("w1", 1);
        let idx = build_map(&f, &mut vecs, "w1");
        let mp = &mut vecs.maps[idx];

        // in_recovery is never entered without a positive retry budget
        mp.no_path_retry = NoPathRetry::Queue;
        vecs.paths[0].write().state = PathState::Down;
        let mp = &mut vecs.maps[idx];
        update_queue_mode_del_path(mp, 5);
        assert!(!mp.in_recovery);
        assert_eq!(mp.retry_tick, 0);
        // queue-forever maps do not count map failures
        assert_eq!(mp.stat_map_failures, 0);
    }

    #[test]
    fn test_set_no_path_retry_fail_and_queue() {
        let f = fixture();
        let mut vecs = vecs_with_paths("w1", 2);
        let idx = build_map(&f, &mut vecs, "w1");

        let mp = &mut vecs.maps[idx];
        mp.no_path_retry = NoPathRetry::Queue;
        set_no_path_retry(mp, &f.dm, 5, false);
        assert_eq!(f.dm.is_queueing("w1"), Some(true));

        mp.no_path_retry = NoPathRetry::Fail;
        set_no_path_retry(mp, &f.dm, 5, false);
        assert_eq!(f.dm.is_queueing("w1"), Some(false));

        // numeric retries with active paths turn queueing back on
        mp.no_path_retry = NoPathRetry::Retries(2);
        set_no_path_retry(mp, &f.dm, 5, false);
        assert_eq!(f.dm.is_queueing("w1"), Some(true));
        assert!(!mp.in_recovery);
    }

    #[test]
    fn test_sync_with_kernel() {
        let f = fixture();
        let mut vecs = vecs_with_paths("w1", 3);
        let idx = build_map(&f, &mut vecs, "w1");
        f.dm.fail_path("w1", "8:16").unwrap();

        let Vecs { maps, paths } = &mut vecs;
        update_multipath_strings(&mut maps[idx], paths, &f.dm).unwrap();
        let mp = &maps[idx];
        assert_eq!(mp.groups.len(), 1);
        assert_eq!(mp.paths.len(), 3);
        let failed = mp
            .paths
            .iter()
            .find(|pp| pp.read().dev_t == "8:16")
            .unwrap();
        assert_eq!(failed.read().dmstate, DmPathState::Failed);

        // every path reachable through the groups is in the flattened
        // list, and every flattened path points back at the map
        for pg in &mp.groups {
            for pp in &pg.paths {
                assert!(find_slot(&mp.paths, pp).is_some());
            }
        }
        for pp in &mp.paths {
            assert_eq!(pp.read().mpp.as_deref(), Some(mp.alias.as_str()));
        }
    }

    #[test]
    fn test_sync_drops_vanished_paths() {
        let f = fixture();
        let mut vecs = vecs_with_paths("w1", 3);
        let idx = build_map(&f, &mut vecs, "w1");

        // kernel table shrinks to two paths
        let mut table = assemble_table(&vecs.maps[idx]);
        table.groups[0].path_devts.retain(|d| d != "8:32");
        f.dm.reload_map("w1", &table).unwrap();

        let Vecs { maps, paths } = &mut vecs;
        update_multipath_strings(&mut maps[idx], paths, &f.dm).unwrap();
        let mp = &maps[idx];
        assert_eq!(mp.paths.len(), 2);
        let dropped = paths.iter().find(|pp| pp.read().dev_t == "8:32").unwrap();
        assert_eq!(dropped.read().mpp, None);
    }

    #[test]
    fn test_sync_map_state_fails_and_reinstates() {
        let f = fixture();
        let mut vecs = vecs_with_paths("w1", 2);
        let idx = build_map(&f, &mut vecs, "w1");

        // checker says down, kernel still active -> fail_path
        vecs.paths[0].write().state = PathState::Down;
        vecs.paths[0].write().dmstate = DmPathState::Active;
        // kernel failed it, checker says up -> reinstate_path
        vecs.paths[1].write().state = PathState::Up;
        vecs.paths[1].write().dmstate = DmPathState::Failed;
        f.dm.fail_path("w1", "8:16").unwrap();

        sync_map_state(&vecs.maps[idx], &f.dm);
        let st = f.dm.get_status("w1").unwrap();
        assert_eq!(st.groups[0].paths[0].state, DmPathState::Failed);
        assert_eq!(st.groups[0].paths[1].state, DmPathState::Active);
    }

    #[test]
    fn test_sync_map_state_respects_ghost_delay() {
        let f = fixture();
        let mut vecs = vecs_with_paths("w1", 1);
        let idx = build_map(&f, &mut vecs, "w1");
        vecs.paths[0].write().state = PathState::Down;
        vecs.paths[0].write().dmstate = DmPathState::Active;
        vecs.maps[idx].ghost_delay_tick = 3;

        sync_map_state(&vecs.maps[idx], &f.dm);
        let st = f.dm.get_status("w1").unwrap();
        assert_eq!(st.groups[0].paths[0].state, DmPathState::Active);
    }

    #[test]
    fn test_verify_paths_drops_missing_dev() {
        let f = fixture();
        let sysfs = MemorySysfs::new();
        sysfs.add_dev(PathSeed {
            dev: "sda".to_string(),
            dev_t: "8:0".to_string(),
            wwid: "w1".to_string(),
            ..Default::default()
        });
        let mut vecs = vecs_with_paths("w1", 2);
        let idx = build_map(&f, &mut vecs, "w1");

        // sdb is gone from sysfs
        let Vecs { maps, paths } = &mut vecs;
        let dropped = verify_paths(&mut maps[idx], paths, &sysfs);
        assert_eq!(dropped, 1);
        assert_eq!(maps[idx].paths.len(), 1);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].read().dev, "sda");
    }

    #[test]
    fn test_find_existing_alias() {
        let mut vecs = Vecs::new();
        let mut mp = Multipath::new("w9");
        mp.alias = "mpathz".to_string();
        vecs.maps.push(mp);
        assert_eq!(find_existing_alias(&vecs, "w9").as_deref(), Some("mpathz"));
        assert_eq!(find_existing_alias(&vecs, "w0"), None);
    }
}
