//! Path prioritizer registry
//!
//! Prioritizers rank a path with a non-negative integer; the grouping
//! engine turns ranks into path-group order. Same registry and
//! reference-count scheme as the checker registry.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hashbrown::HashMap;
use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::structs::Path;

/// Marks a priority that could not be determined.
pub const PRIO_UNDEF: i32 = -1;

/// Default prioritizer when nothing more specific is configured.
pub const DEFAULT_PRIO: &str = "const";

/// A prioritizer implementation.
pub trait PrioPlugin: Send + Sync {
    /// Rank the path. Negative return values are normalised to
    /// [`PRIO_UNDEF`] by the caller.
    fn getprio(&self, path: &Path, args: &str) -> i32;
}

/// Factory producing plugin instances; registered per class name.
pub type PrioFactory = fn() -> Box<dyn PrioPlugin>;

/// A loaded prioritizer class.
pub struct PrioClass {
    name: String,
    plugin: Box<dyn PrioPlugin>,
    refcount: AtomicI32,
    owner: Weak<RegistryShared>,
}

impl PrioClass {
    fn ref_(&self) -> i32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn unref(&self) -> i32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn release_class(cls: &Arc<PrioClass>) {
    let cnt = cls.unref();
    if cnt != 0 {
        if cnt < 0 {
            warn!("{} prioritizer refcount {}", cls.name, cnt);
        } else {
            trace!("{} prioritizer refcount {}", cls.name, cnt);
        }
        return;
    }
    debug!("unloading {} prioritizer", cls.name);
    if let Some(owner) = cls.owner.upgrade() {
        owner.classes.lock().remove(&cls.name);
    }
}

struct RegistryShared {
    classes: Mutex<HashMap<String, Arc<PrioClass>>>,
}

/// Registry of prioritizer classes, keyed by name.
pub struct PrioRegistry {
    shared: Arc<RegistryShared>,
    factories: Mutex<HashMap<&'static str, PrioFactory>>,
}

impl PrioRegistry {
    /// Registry with the built-in prioritizer set.
    pub fn new() -> Self {
        let reg = PrioRegistry {
            shared: Arc::new(RegistryShared {
                classes: Mutex::new(HashMap::new()),
            }),
            factories: Mutex::new(HashMap::new()),
        };
        reg.register(DEFAULT_PRIO, || Box::new(ConstPrio));
        reg
    }

    /// Register a prioritizer class factory under `name`.
    pub fn register(&self, name: &'static str, factory: PrioFactory) {
        self.factories.lock().insert(name, factory);
    }

    fn add_class(&self, name: &str) -> Option<Arc<PrioClass>> {
        let factory = match self.factories.lock().get(name) {
            Some(f) => *f,
            None => {
                error!("prioritizer '{}' not found", name);
                return None;
            }
        };
        debug!("loading {} prioritizer", name);
        let cls = Arc::new(PrioClass {
            name: name.to_string(),
            plugin: factory(),
            refcount: AtomicI32::new(1),
            owner: Arc::downgrade(&self.shared),
        });
        self.shared
            .classes
            .lock()
            .insert(name.to_string(), Arc::clone(&cls));
        Some(cls)
    }

    /// Get a prioritizer instance bound to the named class, loading the
    /// class on first use. An empty or unknown name yields an unbound
    /// instance whose getprio reports [`PRIO_UNDEF`].
    pub fn get(&self, name: &str, args: &str) -> Prio {
        if name.is_empty() {
            return Prio::unbound();
        }
        let existing = self.shared.classes.lock().get(name).cloned();
        let cls = match existing {
            Some(c) => Some(c),
            None => self.add_class(name),
        };
        if let Some(c) = &cls {
            c.ref_();
        }
        Prio {
            cls,
            args: args.to_string(),
        }
    }

    /// Drop the registry's own reference on every class.
    pub fn cleanup(&self) {
        let all: Vec<Arc<PrioClass>> = self.shared.classes.lock().values().cloned().collect();
        for cls in &all {
            release_class(cls);
        }
    }

    pub fn loaded(&self) -> usize {
        self.shared.classes.lock().len()
    }
}

impl Default for PrioRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-path prioritizer instance.
pub struct Prio {
    cls: Option<Arc<PrioClass>>,
    args: String,
}

impl Prio {
    pub fn unbound() -> Self {
        Prio {
            cls: None,
            args: String::new(),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.cls.is_some()
    }

    pub fn name(&self) -> &str {
        self.cls.as_ref().map(|c| c.name.as_str()).unwrap_or("")
    }

    pub fn args(&self) -> &str {
        &self.args
    }

    pub fn set_args(&mut self, args: &str) {
        self.args = args.to_string();
    }

    /// Class handle for callers that must rank a path while mutably holding
    /// it (clone the handle first, then call getprio on the shared borrow).
    pub fn class(&self) -> Option<Arc<PrioClass>> {
        self.cls.clone()
    }

    /// Release the class reference. Safe to call more than once.
    pub fn put(&mut self) {
        if let Some(cls) = self.cls.take() {
            release_class(&cls);
        }
        self.args.clear();
    }
}

impl Drop for Prio {
    fn drop(&mut self) {
        self.put();
    }
}

impl Default for Prio {
    fn default() -> Self {
        Prio::unbound()
    }
}

impl PrioClass {
    /// Rank `path`, normalising negative plugin results to [`PRIO_UNDEF`].
    pub fn getprio(&self, path: &Path, args: &str) -> i32 {
        let value = self.plugin.getprio(path, args);
        if value < 0 {
            PRIO_UNDEF
        } else {
            value
        }
    }
}

/// Timeout budget for one prioritizer call, derived from the path's checker
/// timeout with a one second floor.
pub fn get_prio_timeout(checker_timeout: Duration) -> Duration {
    if checker_timeout > Duration::from_secs(1) {
        checker_timeout
    } else {
        Duration::from_secs(1)
    }
}

/// Constant priority: every path ranks 1.
struct ConstPrio;

impl PrioPlugin for ConstPrio {
    fn getprio(&self, _path: &Path, _args: &str) -> i32 {
        1
    }
}
