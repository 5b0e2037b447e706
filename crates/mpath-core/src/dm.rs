//! Kernel collaborators
//!
//! The core never talks to the kernel directly. Two trait seams stand in
//! for it: [`DmChannel`] is the device-mapper control channel (create/load
//! tables, fail/reinstate paths, toggle queue_if_no_path) and
//! [`SysfsSource`] answers "does this block device still exist and what
//! does it look like".
//!
//! [`MemoryDm`] and [`MemorySysfs`] are the in-memory implementations used
//! by the daemon's default wiring and by the test-suite; a production build
//! plugs real ioctl/sysfs backends into the same traits.

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};

/// Device-mapper's view of one path, as reported by the map status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmPathState {
    /// Not known yet
    Undef,
    /// Carrying I/O
    Active,
    /// Failed by the kernel
    Failed,
}

/// One path group of a loaded table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DmTableGroup {
    /// Member paths, by major:minor
    pub path_devts: Vec<String>,
}

/// A device-mapper multipath table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DmTable {
    /// Map size in 512-byte sectors
    pub size: u64,
    /// Feature string ("1 queue_if_no_path" and friends)
    pub features: String,
    /// Hardware handler string
    pub hwhandler: String,
    /// Ordered path groups
    pub groups: Vec<DmTableGroup>,
}

/// Per-path slice of the map status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmPathStatus {
    pub dev_t: String,
    pub state: DmPathState,
}

/// Per-group slice of the map status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DmStatusGroup {
    pub paths: Vec<DmPathStatus>,
}

/// A device-mapper multipath status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DmStatus {
    /// Whether the kernel currently queues I/O with no usable path
    pub queue_if_no_path: bool,
    pub groups: Vec<DmStatusGroup>,
}

/// The device-mapper control channel the core drives.
///
/// `get_uuid` returns the stored WWID with the `mpath-` uuid prefix already
/// stripped, mirroring what the alias allocator and the reservation
/// coordinator need to compare against.
pub trait DmChannel: Send + Sync {
    fn map_present(&self, name: &str) -> bool;
    fn get_uuid(&self, name: &str) -> Option<String>;
    fn create_map(&self, name: &str, wwid: &str, table: &DmTable) -> CoreResult<()>;
    fn reload_map(&self, name: &str, table: &DmTable) -> CoreResult<()>;
    fn remove_map(&self, name: &str) -> CoreResult<()>;
    fn get_table(&self, name: &str) -> CoreResult<DmTable>;
    fn get_status(&self, name: &str) -> CoreResult<DmStatus>;
    fn fail_path(&self, name: &str, dev_t: &str) -> CoreResult<()>;
    fn reinstate_path(&self, name: &str, dev_t: &str) -> CoreResult<()>;
    fn queue_if_no_path(&self, name: &str, enable: bool) -> CoreResult<()>;
    fn resize_map(&self, name: &str, size: u64) -> CoreResult<()>;
    fn find_map_by_uuid(&self, uuid: &str) -> Option<String>;
    fn map_names(&self) -> Vec<String>;
}

fn not_present(name: &str) -> CoreError {
    CoreError::NotFound {
        object: format!("map {}", name),
    }
}

struct MemMap {
    uuid: String,
    table: DmTable,
    status: DmStatus,
}

fn status_from_table(table: &DmTable, queueing: bool) -> DmStatus {
    DmStatus {
        queue_if_no_path: queueing,
        groups: table
            .groups
            .iter()
            .map(|g| DmStatusGroup {
                paths: g
                    .path_devts
                    .iter()
                    .map(|d| DmPathStatus {
                        dev_t: d.clone(),
                        state: DmPathState::Active,
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// In-memory device-mapper state.
pub struct MemoryDm {
    maps: Mutex<HashMap<String, MemMap>>,
}

impl MemoryDm {
    pub fn new() -> Self {
        MemoryDm {
            maps: Mutex::new(HashMap::new()),
        }
    }

    /// Test/introspection helper: current queueing flag of a map.
    pub fn is_queueing(&self, name: &str) -> Option<bool> {
        self.maps
            .lock()
            .get(name)
            .map(|m| m.status.queue_if_no_path)
    }
}

impl Default for MemoryDm {
    fn default() -> Self {
        Self::new()
    }
}

impl DmChannel for MemoryDm {
    fn map_present(&self, name: &str) -> bool {
        self.maps.lock().contains_key(name)
    }

    fn get_uuid(&self, name: &str) -> Option<String> {
        self.maps.lock().get(name).map(|m| {
            m.uuid
                .strip_prefix("mpath-")
                .unwrap_or(m.uuid.as_str())
                .to_string()
        })
    }

    fn create_map(&self, name: &str, wwid: &str, table: &DmTable) -> CoreResult<()> {
        let mut maps = self.maps.lock();
        if maps.contains_key(name) {
            return Err(CoreError::PolicyViolation {
                object: name.to_string(),
                reason: "map already exists".to_string(),
            });
        }
        let queueing = table.features.contains("queue_if_no_path");
        maps.insert(
            name.to_string(),
            MemMap {
                uuid: format!("mpath-{}", wwid),
                status: status_from_table(table, queueing),
                table: table.clone(),
            },
        );
        Ok(())
    }

    fn reload_map(&self, name: &str, table: &DmTable) -> CoreResult<()> {
        let mut maps = self.maps.lock();
        let m = maps.get_mut(name).ok_or_else(|| not_present(name))?;
        let queueing = table.features.contains("queue_if_no_path");
        m.status = status_from_table(table, queueing);
        m.table = table.clone();
        Ok(())
    }

    fn remove_map(&self, name: &str) -> CoreResult<()> {
        self.maps
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_present(name))
    }

    fn get_table(&self, name: &str) -> CoreResult<DmTable> {
        self.maps
            .lock()
            .get(name)
            .map(|m| m.table.clone())
            .ok_or_else(|| not_present(name))
    }

    fn get_status(&self, name: &str) -> CoreResult<DmStatus> {
        self.maps
            .lock()
            .get(name)
            .map(|m| m.status.clone())
            .ok_or_else(|| not_present(name))
    }

    fn fail_path(&self, name: &str, dev_t: &str) -> CoreResult<()> {
        let mut maps = self.maps.lock();
        let m = maps.get_mut(name).ok_or_else(|| not_present(name))?;
        for g in &mut m.status.groups {
            for p in &mut g.paths {
                if p.dev_t == dev_t {
                    p.state = DmPathState::Failed;
                    return Ok(());
                }
            }
        }
        Err(CoreError::NotFound {
            object: format!("path {} in map {}", dev_t, name),
        })
    }

    fn reinstate_path(&self, name: &str, dev_t: &str) -> CoreResult<()> {
        let mut maps = self.maps.lock();
        let m = maps.get_mut(name).ok_or_else(|| not_present(name))?;
        for g in &mut m.status.groups {
            for p in &mut g.paths {
                if p.dev_t == dev_t {
                    p.state = DmPathState::Active;
                    return Ok(());
                }
            }
        }
        Err(CoreError::NotFound {
            object: format!("path {} in map {}", dev_t, name),
        })
    }

    fn queue_if_no_path(&self, name: &str, enable: bool) -> CoreResult<()> {
        let mut maps = self.maps.lock();
        let m = maps.get_mut(name).ok_or_else(|| not_present(name))?;
        m.status.queue_if_no_path = enable;
        Ok(())
    }

    fn resize_map(&self, name: &str, size: u64) -> CoreResult<()> {
        let mut maps = self.maps.lock();
        let m = maps.get_mut(name).ok_or_else(|| not_present(name))?;
        m.table.size = size;
        Ok(())
    }

    fn find_map_by_uuid(&self, uuid: &str) -> Option<String> {
        self.maps
            .lock()
            .iter()
            .find(|(_, m)| m.uuid == uuid)
            .map(|(name, _)| name.clone())
    }

    fn map_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.maps.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Discovery attributes of a block device, as read from sysfs/udev.
#[derive(Debug, Clone, Default)]
pub struct PathSeed {
    pub dev: String,
    pub dev_t: String,
    pub wwid: String,
    pub vendor_id: String,
    pub product_id: String,
    pub rev: String,
    pub serial: String,
    pub tgt_node_name: String,
    /// Size in 512-byte sectors
    pub size: u64,
}

/// Answers existence and discovery queries about block devices.
pub trait SysfsSource: Send + Sync {
    fn path_present(&self, dev: &str) -> bool;
    fn seed(&self, dev: &str) -> Option<PathSeed>;
    fn list_devs(&self) -> Vec<String>;
}

/// In-memory sysfs view, seeded by the embedder or the test-suite.
pub struct MemorySysfs {
    devs: Mutex<HashMap<String, PathSeed>>,
}

impl MemorySysfs {
    pub fn new() -> Self {
        MemorySysfs {
            devs: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_dev(&self, seed: PathSeed) {
        self.devs.lock().insert(seed.dev.clone(), seed);
    }

    pub fn remove_dev(&self, dev: &str) {
        self.devs.lock().remove(dev);
    }
}

impl Default for MemorySysfs {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsSource for MemorySysfs {
    fn path_present(&self, dev: &str) -> bool {
        self.devs.lock().contains_key(dev)
    }

    fn seed(&self, dev: &str) -> Option<PathSeed> {
        self.devs.lock().get(dev).cloned()
    }

    fn list_devs(&self) -> Vec<String> {
        let mut devs: Vec<String> = self.devs.lock().keys().cloned().collect();
        devs.sort();
        devs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_two_paths() -> DmTable {
        DmTable {
            size: 2097152,
            features: "1 queue_if_no_path".to_string(),
            hwhandler: "0".to_string(),
            groups: vec![DmTableGroup {
                path_devts: vec!["8:0".to_string(), "8:16".to_string()],
            }],
        }
    }

    #[test]
    fn test_create_and_uuid() {
        let dm = MemoryDm::new();
        dm.create_map("mpatha", "3600d0230", &table_two_paths()).unwrap();
        assert!(dm.map_present("mpatha"));
        assert_eq!(dm.get_uuid("mpatha").as_deref(), Some("3600d0230"));
        assert_eq!(
            dm.find_map_by_uuid("mpath-3600d0230").as_deref(),
            Some("mpatha")
        );
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let dm = MemoryDm::new();
        dm.create_map("mpatha", "w1", &table_two_paths()).unwrap();
        assert!(dm.create_map("mpatha", "w2", &table_two_paths()).is_err());
    }

    #[test]
    fn test_fail_and_reinstate() {
        let dm = MemoryDm::new();
        dm.create_map("mpatha", "w1", &table_two_paths()).unwrap();
        dm.fail_path("mpatha", "8:0").unwrap();
        let st = dm.get_status("mpatha").unwrap();
        assert_eq!(st.groups[0].paths[0].state, DmPathState::Failed);
        assert_eq!(st.groups[0].paths[1].state, DmPathState::Active);
        dm.reinstate_path("mpatha", "8:0").unwrap();
        let st = dm.get_status("mpatha").unwrap();
        assert_eq!(st.groups[0].paths[0].state, DmPathState::Active);
    }

    #[test]
    fn test_queueing_toggle() {
        let dm = MemoryDm::new();
        dm.create_map("mpatha", "w1", &table_two_paths()).unwrap();
        assert_eq!(dm.is_queueing("mpatha"), Some(true));
        dm.queue_if_no_path("mpatha", false).unwrap();
        assert_eq!(dm.is_queueing("mpatha"), Some(false));
    }

    #[test]
    fn test_missing_map_errors() {
        let dm = MemoryDm::new();
        assert!(dm.get_table("nope").is_err());
        assert!(dm.queue_if_no_path("nope", true).is_err());
        assert!(dm.remove_map("nope").is_err());
    }

    #[test]
    fn test_memory_sysfs() {
        let sysfs = MemorySysfs::new();
        sysfs.add_dev(PathSeed {
            dev: "sda".to_string(),
            dev_t: "8:0".to_string(),
            wwid: "w1".to_string(),
            size: 1024,
            ..Default::default()
        });
        assert!(sysfs.path_present("sda"));
        assert_eq!(sysfs.seed("sda").unwrap().size, 1024);
        sysfs.remove_dev("sda");
        assert!(!sysfs.path_present("sda"));
        assert!(sysfs.seed("sda").is_none());
    }
}
