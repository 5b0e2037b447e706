//! Path, path-group and map structures
//!
//! The daemon owns two top-level sequences, the known maps and the known
//! paths, both behind one coarse reader/writer lock ([`Vecs`]). Paths are
//! shared handles: the global path vector carries the discovery lifetime,
//! maps and groups hold non-owning clones of the same handle, and the
//! path→map back-edge is a weak handle (the owning map's alias) whose
//! dereference may fail after the map is gone.

use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::checker::{Checker, PathState};
use crate::config::{Failback, NoPathRetry};
use crate::dm::DmPathState;
use crate::pgpolicy::PgPolicy;
use crate::prio::Prio;

/// Shared handle to one path. All mutation happens under the global
/// [`Vecs`] lock; the per-path lock makes sharing between the global vector
/// and group member lists safe.
pub type PathRef = Arc<RwLock<Path>>;

/// One kernel block device reaching the volume through one
/// initiator–target pair.
pub struct Path {
    /// Device node name ("sdc")
    pub dev: String,
    /// major:minor
    pub dev_t: String,
    pub wwid: String,
    pub vendor_id: String,
    pub product_id: String,
    pub rev: String,
    pub serial: String,
    pub tgt_node_name: String,
    /// Size in 512-byte sectors
    pub size: u64,
    /// Last checker verdict
    pub state: PathState,
    /// Device-mapper state as last seen
    pub dmstate: DmPathState,
    pub priority: i32,
    pub marginal: bool,
    pub checker: Checker,
    pub prio: Prio,
    /// Owning map's alias; weak handle, may dangle after the map is removed
    pub mpp: Option<String>,
    /// Open fd used by the checker
    pub fd: Option<OwnedFd>,
}

impl Path {
    pub fn new(dev: &str, dev_t: &str) -> Self {
        Path {
            dev: dev.to_string(),
            dev_t: dev_t.to_string(),
            wwid: String::new(),
            vendor_id: String::new(),
            product_id: String::new(),
            rev: String::new(),
            serial: String::new(),
            tgt_node_name: String::new(),
            size: 0,
            state: PathState::Unchecked,
            dmstate: DmPathState::Undef,
            priority: crate::prio::PRIO_UNDEF,
            marginal: false,
            checker: Checker::unbound(),
            prio: Prio::unbound(),
            mpp: None,
            fd: None,
        }
    }

    /// Raw fd for the checker, -1 when no fd is open.
    pub fn raw_fd(&self) -> i32 {
        self.fd.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1)
    }
}

/// Ordered set of paths treated as a unit by the kernel. Rebuilt from
/// scratch on every regrouping; owns its member list but not the paths.
pub struct PathGroup {
    pub paths: Vec<PathRef>,
    /// Mean priority of the enabled members
    pub priority: i64,
    /// Members in state Up or Ghost
    pub enabled_paths: u32,
    /// All members are marginal
    pub marginal: bool,
}

impl PathGroup {
    pub fn new() -> Self {
        PathGroup {
            paths: Vec::new(),
            priority: 0,
            enabled_paths: 0,
            marginal: false,
        }
    }

    /// Refresh priority, enabled count and the aggregate marginal flag
    /// from the current member states.
    pub fn prio_update(&mut self) {
        let mut priority: i64 = 0;
        let mut marginal = !self.paths.is_empty();
        self.enabled_paths = 0;
        for pp in &self.paths {
            let pp = pp.read();
            if !pp.marginal {
                marginal = false;
            }
            if pp.state.is_active() {
                priority += pp.priority as i64;
                self.enabled_paths += 1;
            }
        }
        self.priority = if self.enabled_paths > 0 {
            priority / self.enabled_paths as i64
        } else {
            0
        };
        self.marginal = marginal;
    }
}

impl Default for PathGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// A logical multipathed volume.
pub struct Multipath {
    pub wwid: String,
    /// Node-local map name; unique across maps
    pub alias: String,
    /// Alias of a dead predecessor map with the same WWID, reused if the
    /// bindings file allows
    pub alias_old: String,
    /// Size in 512-byte sectors
    pub size: u64,
    pub features: String,
    pub hwhandler: String,
    /// Hardware identity the map inherited from its first path
    pub hwe: Option<(String, String, String)>,
    pub pgpolicy: PgPolicy,
    pub failback: Failback,
    pub no_path_retry: NoPathRetry,
    pub in_recovery: bool,
    /// Countdown until queueing is handed over to fail mode
    pub retry_tick: u32,
    /// Countdown while only ghost paths are active
    pub ghost_delay_tick: u32,
    pub groups: Vec<PathGroup>,
    /// Flattened path list; every path reachable through groups is here
    pub paths: Vec<PathRef>,
    pub stat_queueing_timeouts: u64,
    pub stat_map_failures: u64,
    pub stat_switchgroup: u64,
}

impl Multipath {
    pub fn new(wwid: &str) -> Self {
        Multipath {
            wwid: wwid.to_string(),
            alias: String::new(),
            alias_old: String::new(),
            size: 0,
            features: crate::config::DEFAULT_FEATURES.to_string(),
            hwhandler: crate::config::DEFAULT_HWHANDLER.to_string(),
            hwe: None,
            pgpolicy: PgPolicy::Failover,
            failback: Failback::Manual,
            no_path_retry: NoPathRetry::Undef,
            in_recovery: false,
            retry_tick: 0,
            ghost_delay_tick: 0,
            groups: Vec::new(),
            paths: Vec::new(),
            stat_queueing_timeouts: 0,
            stat_map_failures: 0,
            stat_switchgroup: 0,
        }
    }

    /// Paths in state Up or Ghost within the map's groups.
    pub fn count_active_paths(&self) -> usize {
        let mut active = 0;
        for pg in &self.groups {
            for pp in &pg.paths {
                if pp.read().state.is_active() {
                    active += 1;
                }
            }
        }
        active
    }

    pub fn reset_stats(&mut self) {
        self.stat_queueing_timeouts = 0;
        self.stat_map_failures = 0;
        self.stat_switchgroup = 0;
    }
}

/// The global data-structures set: all known maps and paths. The daemon
/// wraps this in one `RwLock`; every handler touching it holds that lock
/// for the whole handler.
pub struct Vecs {
    pub maps: Vec<Multipath>,
    pub paths: Vec<PathRef>,
}

impl Vecs {
    pub fn new() -> Self {
        Vecs {
            maps: Vec::new(),
            paths: Vec::new(),
        }
    }

    pub fn find_map_by_alias(&self, alias: &str) -> Option<usize> {
        self.maps.iter().position(|m| m.alias == alias)
    }

    pub fn find_map_by_wwid(&self, wwid: &str) -> Option<usize> {
        self.maps.iter().position(|m| m.wwid == wwid)
    }

    pub fn find_path_by_dev(&self, dev: &str) -> Option<PathRef> {
        find_path_by_dev(&self.paths, dev)
    }

    pub fn find_path_by_devt(&self, dev_t: &str) -> Option<PathRef> {
        find_path_by_devt(&self.paths, dev_t)
    }
}

impl Default for Vecs {
    fn default() -> Self {
        Self::new()
    }
}

pub fn find_path_by_dev(paths: &[PathRef], dev: &str) -> Option<PathRef> {
    paths.iter().find(|pp| pp.read().dev == dev).cloned()
}

pub fn find_path_by_devt(paths: &[PathRef], dev_t: &str) -> Option<PathRef> {
    paths.iter().find(|pp| pp.read().dev_t == dev_t).cloned()
}

/// Index of the same handle (pointer identity) in a path list.
pub fn find_slot(paths: &[PathRef], pp: &PathRef) -> Option<usize> {
    paths.iter().position(|p| Arc::ptr_eq(p, pp))
}

/// Relocate the element at `from` to the earlier index `to`, shifting the
/// range in between one slot towards the back. The group sort depends on
/// this primitive keeping the order of everything else stable.
pub fn move_up<T>(v: &mut Vec<T>, from: usize, to: usize) {
    if from >= v.len() || to >= from {
        return;
    }
    let elem = v.remove(from);
    v.insert(to, elem);
}
