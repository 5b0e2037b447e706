//! Path checker registry
//!
//! Checkers classify the health of a single path. Each checker class is a
//! statically linked plugin behind the [`CheckerPlugin`] trait; classes are
//! instantiated on first use, shared by name, and reference counted so the
//! last dropper tears the class down and removes it from the registry.
//!
//! A [`Checker`] is the per-path instance: it carries the open fd, the
//! disable flag, the last returned state and message id, and an optional
//! per-map context shared by all checkers of one map.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;
use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};

/// Health states a checker can report for a path.
///
/// The set is closed; every consumer matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathState {
    /// Device state could not be determined
    Wild,
    /// Not checked yet (or checker disabled)
    Unchecked,
    /// Path is down
    Down,
    /// Path is up and usable
    Up,
    /// Path flaps between up and down
    Shaky,
    /// Path is up on a passive controller
    Ghost,
    /// Asynchronous check still in flight
    Pending,
    /// Checker timed out
    Timeout,
    /// Device was removed
    Removed,
    /// Reinstate delayed by policy
    Delayed,
}

impl PathState {
    /// Canonical lowercase state name, as shown by `list paths`.
    pub fn name(self) -> &'static str {
        match self {
            PathState::Wild => "wild",
            PathState::Unchecked => "unchecked",
            PathState::Down => "down",
            PathState::Up => "up",
            PathState::Shaky => "shaky",
            PathState::Ghost => "ghost",
            PathState::Pending => "pending",
            PathState::Timeout => "timeout",
            PathState::Removed => "removed",
            PathState::Delayed => "delayed",
        }
    }

    /// Up or Ghost paths carry I/O.
    pub fn is_active(self) -> bool {
        matches!(self, PathState::Up | PathState::Ghost)
    }
}

pub const CHECKER_MSGID_NONE: u16 = 0;
pub const CHECKER_MSGID_DISABLED: u16 = 1;
pub const CHECKER_MSGID_NO_FD: u16 = 2;
pub const CHECKER_MSGID_INVALID: u16 = 3;
pub const CHECKER_MSGID_UP: u16 = 4;
pub const CHECKER_MSGID_DOWN: u16 = 5;
pub const CHECKER_MSGID_GHOST: u16 = 6;
pub const CHECKER_MSGID_UNSUPPORTED: u16 = 7;

/// First message id owned by a checker class; smaller ids are generic.
pub const CHECKER_FIRST_MSGID: u16 = 1000;

const GENERIC_MSGTABLE: [&str; 8] = [
    "",
    " is disabled",
    " has no usable fd",
    " provided invalid message id",
    " reports path is up",
    " reports path is down",
    " reports path is ghost",
    " doesn't support this device",
];

/// Name of the pass-through checker; it never probes the device and simply
/// echoes the state proposed by the caller.
pub const NONE: &str = "none";

/// Default checker class used when nothing more specific is configured.
pub const DEFAULT_CHECKER: &str = "directio";

/// Per-map private state shared by all checker instances of one map.
pub type MapContext = Arc<Mutex<Option<Box<dyn Any + Send>>>>;

/// Mutable state of one checker instance, handed to the plugin callbacks.
pub struct CheckerContext {
    /// Open fd on the path device; negative means unusable
    pub fd: RawFd,
    /// Checker timeout for a single probe
    pub timeout: Duration,
    /// Last state returned by check()/pending()
    pub path_state: PathState,
    /// Message id resolved through the class or generic table
    pub msgid: u16,
    /// Administratively disabled
    pub disable: bool,
    /// Per-map context slot (None until attached to a map)
    pub mp_ctx: Option<MapContext>,
    /// Checker-private instance state
    pub data: Option<Box<dyn Any + Send + Sync>>,
}

impl CheckerContext {
    fn new() -> Self {
        CheckerContext {
            fd: -1,
            timeout: Duration::from_secs(30),
            path_state: PathState::Unchecked,
            msgid: CHECKER_MSGID_NONE,
            disable: false,
            mp_ctx: None,
            data: None,
        }
    }
}

/// A checker implementation. `check` is mandatory; everything else has a
/// do-nothing default so simple synchronous checkers stay small.
pub trait CheckerPlugin: Send + Sync {
    /// Probe the device behind `ctx.fd` and classify it.
    fn check(&self, ctx: &mut CheckerContext) -> PathState;

    /// Allocate instance context.
    fn init(&self, _ctx: &mut CheckerContext) -> CoreResult<()> {
        Ok(())
    }

    /// Allocate the shared per-map context. Failure is non-fatal; the
    /// instance keeps running without map context.
    fn mp_init(&self, _ctx: &mut CheckerContext) -> CoreResult<()> {
        Ok(())
    }

    /// Release instance context.
    fn free(&self, _ctx: &mut CheckerContext) {}

    /// Reset process-global class state.
    fn reset(&self) {}

    /// Re-examine a probe that previously returned [`PathState::Pending`].
    fn pending(&self, ctx: &mut CheckerContext) -> PathState {
        ctx.path_state
    }

    /// Whether this class implements `pending`.
    fn has_pending(&self) -> bool {
        false
    }

    /// Whether the event loop must wait for an in-flight probe before the
    /// next checker tick.
    fn need_wait(&self, _ctx: &CheckerContext) -> bool {
        false
    }

    /// Async background loop entry point, for classes that probe off-thread.
    fn thread(&self) {}

    /// Whether this class implements `thread`.
    fn has_thread(&self) -> bool {
        false
    }

    /// Class-private message table, indexed by `msgid - CHECKER_FIRST_MSGID`.
    fn msgtable(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Factory producing plugin instances; registered per class name.
pub type CheckerFactory = fn() -> Box<dyn CheckerPlugin>;

/// A loaded checker class: the plugin plus registry bookkeeping.
pub struct CheckerClass {
    name: String,
    plugin: Box<dyn CheckerPlugin>,
    refcount: AtomicI32,
    sync: AtomicBool,
    owner: Weak<RegistryShared>,
}

impl CheckerClass {
    /// Take a reference; returns the updated count.
    fn ref_(&self) -> i32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a reference; returns the updated count. Zero means the caller
    /// held the last reference and must destroy the class.
    fn unref(&self) -> i32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_sync(&self) -> bool {
        self.sync.load(Ordering::Relaxed)
    }

    pub fn set_sync(&self, sync: bool) {
        self.sync.store(sync, Ordering::Relaxed);
    }
}

/// Drop a class reference, destroying the class at refcount zero: remove it
/// from the owning registry and run its process-global reset.
fn release_class(cls: &Arc<CheckerClass>) {
    let cnt = cls.unref();
    if cnt != 0 {
        if cnt < 0 {
            warn!("{} checker refcount {}", cls.name, cnt);
        } else {
            trace!("{} checker refcount {}", cls.name, cnt);
        }
        return;
    }
    debug!("unloading {} checker", cls.name);
    if let Some(owner) = cls.owner.upgrade() {
        owner.classes.lock().remove(&cls.name);
    }
    cls.plugin.reset();
}

struct RegistryShared {
    classes: Mutex<HashMap<String, Arc<CheckerClass>>>,
}

/// Registry of checker classes, keyed by name.
pub struct CheckerRegistry {
    shared: Arc<RegistryShared>,
    factories: Mutex<HashMap<&'static str, CheckerFactory>>,
}

impl CheckerRegistry {
    /// Registry with the built-in checker set.
    pub fn new() -> Self {
        let reg = CheckerRegistry {
            shared: Arc::new(RegistryShared {
                classes: Mutex::new(HashMap::new()),
            }),
            factories: Mutex::new(HashMap::new()),
        };
        reg.register(DEFAULT_CHECKER, || Box::new(DirectioChecker));
        reg.register(NONE, || Box::new(NoneChecker));
        reg
    }

    /// Register a checker class factory under `name`. Embedders and tests
    /// use this to add classes beyond the built-ins.
    pub fn register(&self, name: &'static str, factory: CheckerFactory) {
        self.factories.lock().insert(name, factory);
    }

    fn add_class(&self, name: &str) -> Option<Arc<CheckerClass>> {
        let factory = match self.factories.lock().get(name) {
            Some(f) => *f,
            None => {
                error!("checker '{}' not found", name);
                return None;
            }
        };
        debug!("loading {} checker", name);
        let cls = Arc::new(CheckerClass {
            name: name.to_string(),
            plugin: factory(),
            refcount: AtomicI32::new(1),
            sync: AtomicBool::new(true),
            owner: Arc::downgrade(&self.shared),
        });
        self.shared
            .classes
            .lock()
            .insert(name.to_string(), Arc::clone(&cls));
        Some(cls)
    }

    /// Get a checker instance bound to the named class, loading the class
    /// on first use. An empty or unknown name yields an unbound instance.
    pub fn get(&self, name: &str) -> Checker {
        if name.is_empty() {
            return Checker::unbound();
        }
        let existing = self.shared.classes.lock().get(name).cloned();
        let cls = match existing {
            Some(c) => Some(c),
            None => self.add_class(name),
        };
        if let Some(c) = &cls {
            c.ref_();
        }
        Checker {
            cls,
            ctx: CheckerContext::new(),
        }
    }

    /// Run every loaded class's reset hook (configuration reload).
    pub fn reset_all(&self) {
        for cls in self.shared.classes.lock().values() {
            cls.plugin.reset();
        }
    }

    /// Drop the registry's own reference on every class; classes still held
    /// by live checkers survive until their last instance is put.
    pub fn cleanup(&self) {
        let all: Vec<Arc<CheckerClass>> = self.shared.classes.lock().values().cloned().collect();
        for cls in &all {
            release_class(cls);
        }
    }

    /// Number of currently loaded classes.
    pub fn loaded(&self) -> usize {
        self.shared.classes.lock().len()
    }
}

impl Default for CheckerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-path checker instance.
pub struct Checker {
    cls: Option<Arc<CheckerClass>>,
    pub ctx: CheckerContext,
}

impl Checker {
    /// Instance not bound to any class; check() reports Wild.
    pub fn unbound() -> Self {
        Checker {
            cls: None,
            ctx: CheckerContext::new(),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.cls.is_some()
    }

    pub fn name(&self) -> &str {
        self.cls.as_ref().map(|c| c.name.as_str()).unwrap_or("")
    }

    pub fn set_fd(&mut self, fd: RawFd) {
        self.ctx.fd = fd;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.ctx.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.ctx.timeout
    }

    pub fn enable(&mut self) {
        self.ctx.disable = false;
    }

    pub fn disable(&mut self) {
        self.ctx.disable = true;
        self.ctx.msgid = CHECKER_MSGID_DISABLED;
        self.ctx.path_state = PathState::Unchecked;
    }

    pub fn is_disabled(&self) -> bool {
        self.ctx.disable
    }

    /// Initialise instance context and, when the per-map slot is still
    /// empty, the shared map context. mp_init failure only detaches the map
    /// context, the instance stays usable.
    pub fn init(&mut self, mp_ctx: Option<MapContext>) -> CoreResult<()> {
        let cls = match &self.cls {
            Some(c) => Arc::clone(c),
            None => {
                return Err(CoreError::NotFound {
                    object: "checker class".to_string(),
                })
            }
        };
        self.ctx.mp_ctx = mp_ctx;
        cls.plugin.init(&mut self.ctx)?;
        if let Some(slot) = self.ctx.mp_ctx.clone() {
            if slot.lock().is_none() && cls.plugin.mp_init(&mut self.ctx).is_err() {
                self.ctx.mp_ctx = None;
            }
        }
        Ok(())
    }

    /// Attach a shared map context to an already initialised instance.
    pub fn mp_init(&mut self, mp_ctx: MapContext) -> CoreResult<()> {
        let cls = match &self.cls {
            Some(c) => Arc::clone(c),
            None => {
                return Err(CoreError::NotFound {
                    object: "checker class".to_string(),
                })
            }
        };
        if self.ctx.mp_ctx.is_some() {
            return Ok(());
        }
        self.ctx.mp_ctx = Some(Arc::clone(&mp_ctx));
        if mp_ctx.lock().is_none() && cls.plugin.mp_init(&mut self.ctx).is_err() {
            self.ctx.mp_ctx = None;
            return Err(CoreError::Transient {
                operation: "checker mp_init".to_string(),
                reason: format!("{} map context allocation failed", cls.name),
            });
        }
        Ok(())
    }

    /// Run one check. `proposed` is the state the pass-through class echoes.
    pub fn check(&mut self, proposed: PathState) -> PathState {
        self.ctx.msgid = CHECKER_MSGID_NONE;
        let cls = match &self.cls {
            Some(c) => Arc::clone(c),
            None => {
                self.ctx.path_state = PathState::Wild;
                return PathState::Wild;
            }
        };
        if self.ctx.disable {
            self.ctx.msgid = CHECKER_MSGID_DISABLED;
            self.ctx.path_state = PathState::Unchecked;
        } else if cls.name == NONE {
            self.ctx.path_state = proposed;
        } else if self.ctx.fd < 0 {
            self.ctx.msgid = CHECKER_MSGID_NO_FD;
            self.ctx.path_state = PathState::Wild;
        } else {
            self.ctx.path_state = cls.plugin.check(&mut self.ctx);
        }
        self.ctx.path_state
    }

    /// Last state, re-polling `pending()` while the probe is in flight.
    pub fn get_state(&mut self) -> PathState {
        let cls = match &self.cls {
            Some(c) => Arc::clone(c),
            None => return PathState::Unchecked,
        };
        if self.ctx.path_state != PathState::Pending || !cls.plugin.has_pending() {
            return self.ctx.path_state;
        }
        self.ctx.path_state = cls.plugin.pending(&mut self.ctx);
        self.ctx.path_state
    }

    /// Whether the next tick must wait for this checker to settle.
    pub fn need_wait(&self) -> bool {
        match &self.cls {
            Some(c) => self.ctx.path_state == PathState::Pending && c.plugin.need_wait(&self.ctx),
            None => false,
        }
    }

    pub fn is_sync(&self) -> bool {
        self.cls.as_ref().map(|c| c.is_sync()).unwrap_or(true)
    }

    /// Human-readable message for the current msgid. Unknown ids resolve to
    /// the empty string.
    pub fn message(&self) -> &'static str {
        let id = self.ctx.msgid as usize;
        if id < GENERIC_MSGTABLE.len() {
            return GENERIC_MSGTABLE[id];
        }
        if self.ctx.msgid >= CHECKER_FIRST_MSGID {
            if let Some(cls) = &self.cls {
                let idx = (self.ctx.msgid - CHECKER_FIRST_MSGID) as usize;
                let table = cls.plugin.msgtable();
                if idx < table.len() {
                    return table[idx];
                }
            }
        }
        GENERIC_MSGTABLE[CHECKER_MSGID_NONE as usize]
    }

    pub fn clear_message(&mut self) {
        self.ctx.msgid = CHECKER_MSGID_NONE;
    }

    /// Release the class reference and instance context. Safe to call more
    /// than once; Drop calls it as well.
    pub fn put(&mut self) {
        if let Some(cls) = self.cls.take() {
            cls.plugin.free(&mut self.ctx);
            release_class(&cls);
        }
        self.ctx = CheckerContext::new();
    }
}

impl Drop for Checker {
    fn drop(&mut self) {
        self.put();
    }
}

impl Default for Checker {
    fn default() -> Self {
        Checker::unbound()
    }
}

/// Spawn the async background loop of a checker class. The spawned thread
/// pins a class reference for its whole lifetime and drops it on exit, so
/// the class cannot be destroyed under a running thread.
pub fn start_checker_thread(cls: &Arc<CheckerClass>) -> CoreResult<thread::JoinHandle<()>> {
    cls.ref_();
    let pinned = Arc::clone(cls);
    let spawned = thread::Builder::new()
        .name(format!("checker-{}", cls.name))
        .spawn(move || {
            pinned.plugin.thread();
            release_class(&pinned);
        });
    match spawned {
        Ok(handle) => Ok(handle),
        Err(e) => {
            warn!("failed to start checker thread for {}: {}", cls.name, e);
            release_class(cls);
            Err(CoreError::from(e))
        }
    }
}

/// Direct-I/O read probe: a small read at offset zero through the path fd.
/// Succeeding reads classify the path Up, failing ones Down.
struct DirectioChecker;

impl CheckerPlugin for DirectioChecker {
    fn check(&self, ctx: &mut CheckerContext) -> PathState {
        let mut buf = [0u8; 4096];
        // SAFETY: pread into a stack buffer of the advertised size on an fd
        // the caller guarantees is open (fd < 0 is filtered before check()).
        let n = unsafe {
            libc::pread(
                ctx.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n >= 0 {
            ctx.msgid = CHECKER_MSGID_UP;
            PathState::Up
        } else {
            ctx.msgid = CHECKER_MSGID_DOWN;
            PathState::Down
        }
    }
}

/// Pass-through checker; check() short-circuits in [`Checker::check`].
struct NoneChecker;

impl CheckerPlugin for NoneChecker {
    fn check(&self, ctx: &mut CheckerContext) -> PathState {
        ctx.path_state
    }
}
