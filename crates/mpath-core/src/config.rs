//! Configuration model
//!
//! The effective value of a tunable for a given path or map is resolved by
//! walking four layers, highest precedence first: the matching `multipaths`
//! entry, the `overrides` block, the matching hardware-table entry, the
//! `defaults` block — falling back to the built-in default table.
//!
//! Every tunable has a typed domain with an explicit "undefined" sentinel
//! so lower layers can contribute. Invalid numeric values are clamped with
//! a warning; unknown enumeration strings are rejected with a warning and
//! leave the tunable undefined; deprecated keywords are accepted, logged
//! once, and discarded.
//!
//! The loader understands the block-structured sections `defaults`,
//! `blacklist`, `blacklist_exceptions`, `devices/device`, `overrides` and
//! `multipaths/multipath`. Unknown keywords warn and never abort.

use std::collections::HashSet;
use std::path::{Path as FsPath, PathBuf};

use log::{info, warn};
use regex::Regex;

use crate::checker::DEFAULT_CHECKER;
use crate::error::CoreResult;
use crate::pgpolicy::PgPolicy;
use crate::prio::DEFAULT_PRIO;

pub const DEFAULT_CONFIGFILE: &str = "/etc/multipath.conf";
pub const DEFAULT_CONFIG_DIR: &str = "/etc/multipath/conf.d";
pub const DEFAULT_BINDINGS_FILE: &str = "/etc/multipath/bindings";
pub const DEFAULT_PRKEYS_FILE: &str = "/etc/multipath/prkeys";
pub const DEFAULT_PIDFILE: &str = "/run/multipathd.pid";
pub const DEFAULT_SOCKET: &str = "@/org/kernel/linux/storage/multipathd";
pub const DEFAULT_ALIAS_PREFIX: &str = "mpath";
pub const DEFAULT_FEATURES: &str = "0";
pub const DEFAULT_HWHANDLER: &str = "0";
pub const DEFAULT_CHECKINT: u32 = 5;
pub const DEFAULT_VERBOSITY: u32 = 2;
pub const DEFAULT_UXSOCK_TIMEOUT: u32 = 4000;
pub const DEFAULT_CHECKER_TIMEOUT: u32 = 30;

/// Tri-state boolean whose Undef lets lower layers contribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum YesNoUndef {
    #[default]
    Undef,
    No,
    Yes,
}

impl YesNoUndef {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "yes" | "1" => Some(YesNoUndef::Yes),
            "no" | "0" => Some(YesNoUndef::No),
            _ => None,
        }
    }

    pub fn or(self, other: YesNoUndef) -> YesNoUndef {
        if self == YesNoUndef::Undef {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FindMultipaths {
    Off,
    On,
    Strict,
    #[default]
    Greedy,
    Smart,
}

impl FindMultipaths {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "off" | "no" | "0" => Some(FindMultipaths::Off),
            "on" | "yes" | "1" => Some(FindMultipaths::On),
            "strict" => Some(FindMultipaths::Strict),
            "greedy" => Some(FindMultipaths::Greedy),
            "smart" => Some(FindMultipaths::Smart),
            _ => None,
        }
    }
}

/// When an inactive, higher-priority path group becomes usable again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Failback {
    #[default]
    Undef,
    Manual,
    Immediate,
    Followover,
    /// Deferred failback after this many seconds
    Value(u32),
}

impl Failback {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Failback::Manual),
            "immediate" => Some(Failback::Immediate),
            "followover" => Some(Failback::Followover),
            _ => value.parse::<u32>().ok().map(Failback::Value),
        }
    }
}

/// Queue-vs-fail policy once every path of a map is gone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NoPathRetry {
    #[default]
    Undef,
    /// Fail I/O immediately
    Fail,
    /// Queue forever
    Queue,
    /// Queue for this many checker intervals, then fail
    Retries(u32),
}

impl NoPathRetry {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "fail" | "0" => Some(NoPathRetry::Fail),
            "queue" => Some(NoPathRetry::Queue),
            _ => match value.parse::<u32>() {
                Ok(n) if n > 0 => Some(NoPathRetry::Retries(n)),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MarginalPathgroups {
    #[default]
    Off,
    On,
    Fpin,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AutoResize {
    #[default]
    Never,
    GrowOnly,
    GrowShrink,
}

impl AutoResize {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "never" => Some(AutoResize::Never),
            "grow_only" => Some(AutoResize::GrowOnly),
            "grow_shrink" => Some(AutoResize::GrowShrink),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogCheckerErr {
    #[default]
    Always,
    Once,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueWithoutDaemon {
    #[default]
    No,
    Yes,
    Forced,
}

/// Numeric tunables distinguishing "unset", "explicitly off", zero and a
/// positive value (fast_io_fail_tmo, eh_deadline, the marginal/san path
/// error knobs, ghost_delay, the delay_*_checks pair).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UndefOffZero {
    #[default]
    Undef,
    Off,
    Zero,
    Value(u32),
}

impl UndefOffZero {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "off" | "no" => Some(UndefOffZero::Off),
            "0" => Some(UndefOffZero::Zero),
            _ => match value.parse::<u32>() {
                Ok(n) => Some(UndefOffZero::Value(n)),
                Err(_) => None,
            },
        }
    }

    pub fn or(self, other: UndefOffZero) -> UndefOffZero {
        if self == UndefOffZero::Undef {
            other
        } else {
            self
        }
    }
}

/// Open-file budget; `max` resolves to the kernel's nr_open at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaxFds {
    #[default]
    Undef,
    Max,
    Value(u32),
}

/// Persistent reservation key source for a map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReservationKey {
    #[default]
    Undef,
    /// Stored in the prkeys file
    File,
    Key {
        key: u64,
        aptpl: bool,
    },
}

impl ReservationKey {
    fn parse(value: &str) -> Option<Self> {
        if value == "file" {
            return Some(ReservationKey::File);
        }
        let (hex, aptpl) = match value.strip_suffix(":aptpl") {
            Some(h) => (h, true),
            None => (value, false),
        };
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        u64::from_str_radix(hex, 16)
            .ok()
            .map(|key| ReservationKey::Key { key, aptpl })
    }
}

/// Per-device tunables; every field defaults to its undefined sentinel so
/// a layer only contributes what it explicitly sets.
#[derive(Debug, Clone, Default)]
pub struct Attrs {
    pub pgpolicy: Option<PgPolicy>,
    pub failback: Failback,
    pub no_path_retry: NoPathRetry,
    pub user_friendly_names: YesNoUndef,
    pub alias_prefix: Option<String>,
    pub checker_name: Option<String>,
    pub prio_name: Option<String>,
    pub prio_args: Option<String>,
    pub features: Option<String>,
    pub hwhandler: Option<String>,
    pub fast_io_fail: UndefOffZero,
    pub eh_deadline: UndefOffZero,
    /// `infinity` is stored as u32::MAX
    pub dev_loss: Option<u32>,
    pub ghost_delay: UndefOffZero,
    pub retain_hwhandler: YesNoUndef,
    pub detect_prio: YesNoUndef,
    pub detect_checker: YesNoUndef,
    pub deferred_remove: YesNoUndef,
    pub skip_kpartx: YesNoUndef,
    pub san_path_err_threshold: UndefOffZero,
    pub san_path_err_forget_rate: UndefOffZero,
    pub san_path_err_recovery_time: UndefOffZero,
    pub marginal_path_err_sample_time: UndefOffZero,
    pub marginal_path_err_rate_threshold: UndefOffZero,
    pub marginal_path_err_recheck_gap_time: UndefOffZero,
    pub marginal_path_double_failed_time: UndefOffZero,
    pub delay_watch_checks: UndefOffZero,
    pub delay_wait_checks: UndefOffZero,
    pub all_tg_pt: YesNoUndef,
    pub reservation_key: ReservationKey,
}

/// Hardware-table entry matched on vendor/product/revision regexes.
#[derive(Debug, Clone)]
pub struct HwEntry {
    pub vendor: String,
    pub product: String,
    pub revision: Option<String>,
    vendor_re: Option<Regex>,
    product_re: Option<Regex>,
    revision_re: Option<Regex>,
    pub attrs: Attrs,
}

impl HwEntry {
    pub fn new(vendor: &str, product: &str, revision: Option<&str>, attrs: Attrs) -> Self {
        let compile = |pat: &str, what: &str| match Regex::new(pat) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("invalid {} regex \"{}\": {}", what, pat, e);
                None
            }
        };
        HwEntry {
            vendor: vendor.to_string(),
            product: product.to_string(),
            revision: revision.map(|r| r.to_string()),
            vendor_re: compile(vendor, "vendor"),
            product_re: compile(product, "product"),
            revision_re: revision.and_then(|r| compile(r, "revision")),
            attrs,
        }
    }

    pub fn matches(&self, vendor: &str, product: &str, revision: &str) -> bool {
        let hit = |re: &Option<Regex>, s: &str| re.as_ref().map(|r| r.is_match(s)).unwrap_or(false);
        if !hit(&self.vendor_re, vendor) || !hit(&self.product_re, product) {
            return false;
        }
        match &self.revision_re {
            Some(re) => re.is_match(revision),
            None => true,
        }
    }
}

/// Per-map entry matched on WWID or alias.
#[derive(Debug, Clone, Default)]
pub struct MpEntry {
    pub wwid: String,
    pub alias: Option<String>,
    pub attrs: Attrs,
}

/// Regex lists for the blacklist and blacklist_exceptions sections.
#[derive(Debug, Default)]
pub struct Blacklist {
    pub devnodes: Vec<Regex>,
    pub wwids: Vec<Regex>,
}

impl Blacklist {
    fn add(&mut self, kind: &str, pattern: &str) {
        match Regex::new(pattern) {
            Ok(re) => match kind {
                "devnode" => self.devnodes.push(re),
                _ => self.wwids.push(re),
            },
            Err(e) => warn!("invalid blacklist regex \"{}\": {}", pattern, e),
        }
    }

    fn matches_devnode(&self, dev: &str) -> bool {
        self.devnodes.iter().any(|re| re.is_match(dev))
    }

    fn matches_wwid(&self, wwid: &str) -> bool {
        self.wwids.iter().any(|re| re.is_match(wwid))
    }
}

const LAYER_NAMES: [&str; 5] = [
    "multipath setting",
    "overrides setting",
    "device setting",
    "defaults setting",
    "internal default",
];

/// Deprecated keywords: accepted, logged once, discarded.
const DEPRECATED_KEYWORDS: [&str; 5] = [
    "getuid_callout",
    "udev_dir",
    "multipath_tool",
    "pg_timeout",
    "default_getuid_callout",
];

/// The full configuration: global tunables, the four attribute layers, the
/// blacklists, and a monotonic sequence number bumped on every (re)load.
#[derive(Debug)]
pub struct Config {
    pub verbosity: u32,
    pub checkint: Option<u32>,
    pub max_checkint: Option<u32>,
    /// Control-socket command timeout, milliseconds
    pub uxsock_timeout: u32,
    /// Checker probe timeout, seconds
    pub checker_timeout: u32,
    pub max_fds: MaxFds,
    pub queue_without_daemon: QueueWithoutDaemon,
    pub log_checker_err: LogCheckerErr,
    pub marginal_pathgroups: MarginalPathgroups,
    pub find_multipaths: FindMultipaths,
    pub auto_resize: AutoResize,
    pub bindings_file: PathBuf,
    pub prkeys_file: PathBuf,
    pub config_dir: PathBuf,
    pub bindings_read_only: bool,
    pub defaults: Attrs,
    pub overrides: Attrs,
    pub hwtable: Vec<HwEntry>,
    pub mptable: Vec<MpEntry>,
    pub blacklist: Blacklist,
    pub blacklist_exceptions: Blacklist,
    pub sequence_nr: u32,
    deprecated_logged: HashSet<String>,
}

fn builtin_hwtable() -> Vec<HwEntry> {
    vec![
        HwEntry::new("NVME", ".*", None, {
            let mut a = Attrs::default();
            a.pgpolicy = Some(PgPolicy::Multibus);
            a.checker_name = Some("none".to_string());
            a
        }),
        HwEntry::new("(LSI|ENGENIO|NETAPP)", "INF-01-00", None, {
            let mut a = Attrs::default();
            a.pgpolicy = Some(PgPolicy::GroupByPrio);
            a.failback = Failback::Immediate;
            a.no_path_retry = NoPathRetry::Retries(30);
            a
        }),
    ]
}

impl Config {
    /// Built-in default table only; what an empty config file resolves to.
    pub fn builtin() -> Self {
        Config {
            verbosity: DEFAULT_VERBOSITY,
            checkint: None,
            max_checkint: None,
            uxsock_timeout: DEFAULT_UXSOCK_TIMEOUT,
            checker_timeout: DEFAULT_CHECKER_TIMEOUT,
            max_fds: MaxFds::Undef,
            queue_without_daemon: QueueWithoutDaemon::No,
            log_checker_err: LogCheckerErr::Always,
            marginal_pathgroups: MarginalPathgroups::Off,
            find_multipaths: FindMultipaths::Greedy,
            auto_resize: AutoResize::Never,
            bindings_file: PathBuf::from(DEFAULT_BINDINGS_FILE),
            prkeys_file: PathBuf::from(DEFAULT_PRKEYS_FILE),
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            bindings_read_only: false,
            defaults: Attrs::default(),
            overrides: Attrs::default(),
            hwtable: builtin_hwtable(),
            mptable: Vec::new(),
            blacklist: Blacklist::default(),
            blacklist_exceptions: Blacklist::default(),
            sequence_nr: 1,
            deprecated_logged: HashSet::new(),
        }
    }

    /// Load the main config file (if present) plus every `*.conf` fragment
    /// in `config_dir`, in sorted order.
    pub fn load(file: &FsPath) -> CoreResult<Config> {
        let mut conf = Config::builtin();
        match std::fs::read_to_string(file) {
            Ok(src) => conf.parse_into(&src, &file.to_string_lossy()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("{}: no configuration file, using defaults", file.display());
            }
            Err(e) => return Err(crate::error::CoreError::io(file, e, "read config")),
        }
        let dir = conf.config_dir.clone();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            let mut fragments: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().map(|x| x == "conf").unwrap_or(false))
                .collect();
            fragments.sort();
            for frag in fragments {
                if let Ok(src) = std::fs::read_to_string(&frag) {
                    conf.parse_into(&src, &frag.to_string_lossy());
                }
            }
        }
        Ok(conf)
    }

    pub fn checkint(&self) -> u32 {
        self.checkint.unwrap_or(DEFAULT_CHECKINT)
    }

    pub fn max_checkint(&self) -> u32 {
        self.max_checkint.unwrap_or(self.checkint() * 4)
    }

    /// Per-map entry for this WWID or alias.
    pub fn find_mpe(&self, wwid: &str, alias: Option<&str>) -> Option<&MpEntry> {
        self.mptable.iter().find(|mpe| {
            mpe.wwid == wwid || (alias.is_some() && mpe.alias.as_deref() == alias)
        })
    }

    /// Hardware-table entry for this device. Later entries win so user
    /// entries appended by the loader override the built-in table.
    pub fn find_hwe(&self, vendor: &str, product: &str, revision: &str) -> Option<&HwEntry> {
        self.hwtable
            .iter()
            .rev()
            .find(|hwe| hwe.matches(vendor, product, revision))
    }

    fn layers<'a>(
        &'a self,
        mpe: Option<&'a MpEntry>,
        hwe: Option<&'a HwEntry>,
    ) -> [Option<&'a Attrs>; 4] {
        [
            mpe.map(|m| &m.attrs),
            Some(&self.overrides),
            hwe.map(|h| &h.attrs),
            Some(&self.defaults),
        ]
    }

    fn pick<T>(
        layers: &[Option<&Attrs>; 4],
        get: impl Fn(&Attrs) -> Option<T>,
    ) -> Option<(T, &'static str)> {
        for (i, layer) in layers.iter().enumerate() {
            if let Some(attrs) = layer {
                if let Some(v) = get(attrs) {
                    return Some((v, LAYER_NAMES[i]));
                }
            }
        }
        None
    }

    pub fn select_pgpolicy(&self, mpe: Option<&MpEntry>, hwe: Option<&HwEntry>) -> PgPolicy {
        let layers = self.layers(mpe, hwe);
        match Self::pick(&layers, |a| a.pgpolicy) {
            Some((v, origin)) => {
                log::debug!("path_grouping_policy = {} ({})", v.name(), origin);
                v
            }
            None => PgPolicy::Failover,
        }
    }

    pub fn select_no_path_retry(&self, mpe: Option<&MpEntry>, hwe: Option<&HwEntry>) -> NoPathRetry {
        let layers = self.layers(mpe, hwe);
        match Self::pick(&layers, |a| {
            if a.no_path_retry == NoPathRetry::Undef {
                None
            } else {
                Some(a.no_path_retry)
            }
        }) {
            Some((v, origin)) => {
                log::debug!("no_path_retry = {:?} ({})", v, origin);
                v
            }
            None => NoPathRetry::Undef,
        }
    }

    pub fn select_failback(&self, mpe: Option<&MpEntry>, hwe: Option<&HwEntry>) -> Failback {
        let layers = self.layers(mpe, hwe);
        match Self::pick(&layers, |a| {
            if a.failback == Failback::Undef {
                None
            } else {
                Some(a.failback)
            }
        }) {
            Some((v, _)) => v,
            None => Failback::Manual,
        }
    }

    pub fn select_checker(&self, hwe: Option<&HwEntry>) -> String {
        let layers = self.layers(None, hwe);
        match Self::pick(&layers, |a| a.checker_name.clone()) {
            Some((v, origin)) => {
                log::debug!("path_checker = {} ({})", v, origin);
                v
            }
            None => DEFAULT_CHECKER.to_string(),
        }
    }

    pub fn select_prio(&self, mpe: Option<&MpEntry>, hwe: Option<&HwEntry>) -> (String, String) {
        let layers = self.layers(mpe, hwe);
        let name = match Self::pick(&layers, |a| a.prio_name.clone()) {
            Some((v, _)) => v,
            None => DEFAULT_PRIO.to_string(),
        };
        let args = match Self::pick(&layers, |a| a.prio_args.clone()) {
            Some((v, _)) => v,
            None => String::new(),
        };
        (name, args)
    }

    pub fn select_features(&self, mpe: Option<&MpEntry>, hwe: Option<&HwEntry>) -> String {
        let layers = self.layers(mpe, hwe);
        match Self::pick(&layers, |a| a.features.clone()) {
            Some((v, _)) => v,
            None => DEFAULT_FEATURES.to_string(),
        }
    }

    pub fn select_hwhandler(&self, mpe: Option<&MpEntry>, hwe: Option<&HwEntry>) -> String {
        let layers = self.layers(mpe, hwe);
        match Self::pick(&layers, |a| a.hwhandler.clone()) {
            Some((v, _)) => v,
            None => DEFAULT_HWHANDLER.to_string(),
        }
    }

    pub fn select_user_friendly_names(&self, mpe: Option<&MpEntry>, hwe: Option<&HwEntry>) -> bool {
        let layers = self.layers(mpe, hwe);
        match Self::pick(&layers, |a| match a.user_friendly_names {
            YesNoUndef::Undef => None,
            v => Some(v),
        }) {
            Some((YesNoUndef::Yes, _)) => true,
            _ => false,
        }
    }

    pub fn select_alias_prefix(&self, mpe: Option<&MpEntry>, hwe: Option<&HwEntry>) -> String {
        let layers = self.layers(mpe, hwe);
        match Self::pick(&layers, |a| a.alias_prefix.clone()) {
            Some((v, _)) => v,
            None => DEFAULT_ALIAS_PREFIX.to_string(),
        }
    }

    pub fn select_ghost_delay(&self, mpe: Option<&MpEntry>, hwe: Option<&HwEntry>) -> UndefOffZero {
        let layers = self.layers(mpe, hwe);
        match Self::pick(&layers, |a| match a.ghost_delay {
            UndefOffZero::Undef => None,
            v => Some(v),
        }) {
            Some((v, _)) => v,
            None => UndefOffZero::Undef,
        }
    }

    pub fn select_all_tg_pt(&self, hwe: Option<&HwEntry>) -> bool {
        let layers = self.layers(None, hwe);
        matches!(
            Self::pick(&layers, |a| match a.all_tg_pt {
                YesNoUndef::Undef => None,
                v => Some(v),
            }),
            Some((YesNoUndef::Yes, _))
        )
    }

    pub fn select_reservation_key(
        &self,
        mpe: Option<&MpEntry>,
        hwe: Option<&HwEntry>,
    ) -> ReservationKey {
        let layers = self.layers(mpe, hwe);
        match Self::pick(&layers, |a| match a.reservation_key {
            ReservationKey::Undef => None,
            v => Some(v),
        }) {
            Some((v, _)) => v,
            None => ReservationKey::Undef,
        }
    }

    /// True when the device node is blacklisted and not excepted.
    pub fn filter_devnode(&self, dev: &str) -> bool {
        self.blacklist.matches_devnode(dev) && !self.blacklist_exceptions.matches_devnode(dev)
    }

    /// True when the WWID is blacklisted and not excepted.
    pub fn filter_wwid(&self, wwid: &str) -> bool {
        self.blacklist.matches_wwid(wwid) && !self.blacklist_exceptions.matches_wwid(wwid)
    }

    fn deprecated(&mut self, keyword: &str, file: &str, line: u32) -> bool {
        if !DEPRECATED_KEYWORDS.contains(&keyword) {
            return false;
        }
        if self.deprecated_logged.insert(keyword.to_string()) {
            warn!(
                "{} line {}, keyword \"{}\" is deprecated and will be ignored",
                file, line, keyword
            );
        }
        true
    }

    /// Parse one configuration source into this config. Errors inside the
    /// source only produce warnings; the grammar is never fatal.
    pub fn parse_into(&mut self, src: &str, file: &str) {
        let tokens = tokenize(src);
        let mut p = Parser {
            tokens: &tokens,
            pos: 0,
            file,
        };
        while let Some((section, line)) = p.next_token() {
            if !p.expect_open() {
                warn!("{} line {}, missing '{{' after \"{}\"", file, line, section);
                continue;
            }
            match section.as_str() {
                "defaults" => self.parse_defaults(&mut p),
                "blacklist" => Self::parse_blacklist_section(&mut p, &mut self.blacklist),
                "blacklist_exceptions" => {
                    Self::parse_blacklist_section(&mut p, &mut self.blacklist_exceptions)
                }
                "devices" => self.parse_devices(&mut p),
                "multipaths" => self.parse_multipaths(&mut p),
                "overrides" => {
                    let mut attrs = std::mem::take(&mut self.overrides);
                    self.parse_attr_block(&mut p, &mut attrs);
                    self.overrides = attrs;
                }
                other => {
                    warn!("{} line {}, unknown section \"{}\"", file, line, other);
                    p.skip_block();
                }
            }
        }
    }

    fn parse_defaults(&mut self, p: &mut Parser) {
        while let Some((kw, line)) = p.next_token() {
            if kw == "}" {
                return;
            }
            if self.deprecated(&kw, p.file, line) {
                p.next_token();
                continue;
            }
            let value = match p.next_value(&kw, line) {
                Some(v) => v,
                None => continue,
            };
            let file = p.file;
            match kw.as_str() {
                "verbosity" => {
                    if let Some(v) = parse_clamped(&kw, &value, 0, 4, file, line) {
                        self.verbosity = v;
                    }
                }
                "polling_interval" => {
                    if let Some(v) = parse_clamped(&kw, &value, 1, 86400, file, line) {
                        self.checkint = Some(v);
                    }
                }
                "max_polling_interval" => {
                    if let Some(v) = parse_clamped(&kw, &value, 1, 86400, file, line) {
                        self.max_checkint = Some(v);
                    }
                }
                "uxsock_timeout" => {
                    if let Some(v) = parse_clamped(&kw, &value, 100, 600000, file, line) {
                        self.uxsock_timeout = v;
                    }
                }
                "checker_timeout" => {
                    if let Some(v) = parse_clamped(&kw, &value, 1, 3600, file, line) {
                        self.checker_timeout = v;
                    }
                }
                "max_fds" => {
                    if value == "max" {
                        self.max_fds = MaxFds::Max;
                    } else if let Some(v) = parse_clamped(&kw, &value, 32, u32::MAX, file, line) {
                        self.max_fds = MaxFds::Value(v);
                    }
                }
                "queue_without_daemon" => {
                    self.queue_without_daemon = match value.as_str() {
                        "no" | "0" => QueueWithoutDaemon::No,
                        "yes" | "1" => QueueWithoutDaemon::Yes,
                        "forced" => QueueWithoutDaemon::Forced,
                        _ => {
                            invalid_value(&kw, &value, file, line);
                            self.queue_without_daemon
                        }
                    }
                }
                "log_checker_err" => {
                    self.log_checker_err = match value.as_str() {
                        "once" => LogCheckerErr::Once,
                        "always" => LogCheckerErr::Always,
                        _ => {
                            invalid_value(&kw, &value, file, line);
                            self.log_checker_err
                        }
                    }
                }
                "marginal_pathgroups" => self.set_marginal_pathgroups(&value, file, line),
                "find_multipaths" => match FindMultipaths::parse(&value) {
                    Some(v) => self.find_multipaths = v,
                    None => invalid_value(&kw, &value, file, line),
                },
                "auto_resize" => match AutoResize::parse(&value) {
                    Some(v) => self.auto_resize = v,
                    None => invalid_value(&kw, &value, file, line),
                },
                "bindings_file" => self.bindings_file = PathBuf::from(value),
                "prkeys_file" => self.prkeys_file = PathBuf::from(value),
                "config_dir" => self.config_dir = PathBuf::from(value),
                "bindings_read_only" => {
                    if let Some(v) = YesNoUndef::parse(&value) {
                        self.bindings_read_only = v == YesNoUndef::Yes;
                    } else {
                        invalid_value(&kw, &value, file, line);
                    }
                }
                _ => {
                    let mut attrs = std::mem::take(&mut self.defaults);
                    let handled = set_attr_keyword(&mut attrs, &kw, &value, file, line);
                    self.defaults = attrs;
                    if !handled {
                        warn!("{} line {}, unknown keyword \"{}\"", file, line, kw);
                    }
                }
            }
        }
    }

    fn set_marginal_pathgroups(&mut self, value: &str, file: &str, line: u32) {
        self.marginal_pathgroups = match value {
            "off" | "no" | "0" => MarginalPathgroups::Off,
            "on" | "yes" | "1" => MarginalPathgroups::On,
            #[cfg(feature = "fpin")]
            "fpin" => MarginalPathgroups::Fpin,
            #[cfg(not(feature = "fpin"))]
            "fpin" => {
                warn!(
                    "{} line {}, support for \"fpin\" is not compiled in for marginal_pathgroups",
                    file, line
                );
                self.marginal_pathgroups
            }
            _ => {
                invalid_value("marginal_pathgroups", value, file, line);
                self.marginal_pathgroups
            }
        };
    }

    fn parse_blacklist_section(p: &mut Parser, bl: &mut Blacklist) {
        while let Some((kw, line)) = p.next_token() {
            match kw.as_str() {
                "}" => return,
                "devnode" | "wwid" | "property" | "protocol" => {
                    if let Some(value) = p.next_value(&kw, line) {
                        bl.add(&kw, &value);
                    }
                }
                "device" => {
                    warn!(
                        "{} line {}, blacklist device blocks are not supported, ignoring",
                        p.file, line
                    );
                    if p.expect_open() {
                        p.skip_block();
                    }
                }
                other => {
                    warn!("{} line {}, unknown keyword \"{}\"", p.file, line, other);
                    p.next_token();
                }
            }
        }
    }

    fn parse_devices(&mut self, p: &mut Parser) {
        while let Some((kw, line)) = p.next_token() {
            match kw.as_str() {
                "}" => return,
                "device" => {
                    if !p.expect_open() {
                        warn!("{} line {}, missing '{{' after \"device\"", p.file, line);
                        continue;
                    }
                    let mut vendor = String::new();
                    let mut product = String::new();
                    let mut revision: Option<String> = None;
                    let mut attrs = Attrs::default();
                    while let Some((dkw, dline)) = p.next_token() {
                        if dkw == "}" {
                            break;
                        }
                        if self.deprecated(&dkw, p.file, dline) {
                            p.next_token();
                            continue;
                        }
                        let value = match p.next_value(&dkw, dline) {
                            Some(v) => v,
                            None => continue,
                        };
                        match dkw.as_str() {
                            "vendor" => vendor = value,
                            "product" => product = value,
                            "revision" => revision = Some(value),
                            _ => {
                                if !set_attr_keyword(&mut attrs, &dkw, &value, p.file, dline) {
                                    warn!(
                                        "{} line {}, unknown keyword \"{}\"",
                                        p.file, dline, dkw
                                    );
                                }
                            }
                        }
                    }
                    if vendor.is_empty() && product.is_empty() {
                        warn!("{} line {}, device entry without vendor/product", p.file, line);
                        continue;
                    }
                    self.hwtable
                        .push(HwEntry::new(&vendor, &product, revision.as_deref(), attrs));
                }
                other => {
                    warn!("{} line {}, unknown keyword \"{}\"", p.file, line, other);
                    p.next_token();
                }
            }
        }
    }

    fn parse_multipaths(&mut self, p: &mut Parser) {
        while let Some((kw, line)) = p.next_token() {
            match kw.as_str() {
                "}" => return,
                "multipath" => {
                    if !p.expect_open() {
                        warn!("{} line {}, missing '{{' after \"multipath\"", p.file, line);
                        continue;
                    }
                    let mut mpe = MpEntry::default();
                    while let Some((mkw, mline)) = p.next_token() {
                        if mkw == "}" {
                            break;
                        }
                        if self.deprecated(&mkw, p.file, mline) {
                            p.next_token();
                            continue;
                        }
                        let value = match p.next_value(&mkw, mline) {
                            Some(v) => v,
                            None => continue,
                        };
                        match mkw.as_str() {
                            "wwid" => mpe.wwid = value,
                            "alias" => mpe.alias = Some(value),
                            _ => {
                                if !set_attr_keyword(&mut mpe.attrs, &mkw, &value, p.file, mline) {
                                    warn!(
                                        "{} line {}, unknown keyword \"{}\"",
                                        p.file, mline, mkw
                                    );
                                }
                            }
                        }
                    }
                    if mpe.wwid.is_empty() {
                        warn!("{} line {}, multipath entry without wwid", p.file, line);
                        continue;
                    }
                    self.mptable.push(mpe);
                }
                other => {
                    warn!("{} line {}, unknown keyword \"{}\"", p.file, line, other);
                    p.next_token();
                }
            }
        }
    }

    fn parse_attr_block(&mut self, p: &mut Parser, attrs: &mut Attrs) {
        while let Some((kw, line)) = p.next_token() {
            if kw == "}" {
                return;
            }
            if kw == "protocol" {
                // overrides/protocol subsection: not modeled
                warn!(
                    "{} line {}, protocol subsections are not supported, ignoring",
                    p.file, line
                );
                if p.expect_open() {
                    p.skip_block();
                }
                continue;
            }
            if self.deprecated(&kw, p.file, line) {
                p.next_token();
                continue;
            }
            if let Some(value) = p.next_value(&kw, line) {
                if !set_attr_keyword(attrs, &kw, &value, p.file, line) {
                    warn!("{} line {}, unknown keyword \"{}\"", p.file, line, kw);
                }
            }
        }
    }

    /// Render the effective configuration, `show config` style.
    pub fn snprint(&self) -> String {
        let mut out = String::new();
        out.push_str("defaults {\n");
        out.push_str(&format!("\tverbosity {}\n", self.verbosity));
        out.push_str(&format!("\tpolling_interval {}\n", self.checkint()));
        out.push_str(&format!("\tmax_polling_interval {}\n", self.max_checkint()));
        out.push_str(&format!("\tuxsock_timeout {}\n", self.uxsock_timeout));
        out.push_str(&format!("\tfind_multipaths {:?}\n", self.find_multipaths));
        out.push_str(&format!(
            "\tmarginal_pathgroups {:?}\n",
            self.marginal_pathgroups
        ));
        out.push_str(&format!("\tbindings_file {}\n", self.bindings_file.display()));
        out.push_str(&format!("\tprkeys_file {}\n", self.prkeys_file.display()));
        out.push_str("}\n");
        out.push_str("devices {\n");
        for hwe in &self.hwtable {
            out.push_str(&format!(
                "\tdevice {{ vendor \"{}\" product \"{}\" }}\n",
                hwe.vendor, hwe.product
            ));
        }
        out.push_str("}\n");
        out.push_str("multipaths {\n");
        for mpe in &self.mptable {
            out.push_str(&format!(
                "\tmultipath {{ wwid {} alias {} }}\n",
                mpe.wwid,
                mpe.alias.as_deref().unwrap_or("-")
            ));
        }
        out.push_str("}\n");
        out
    }
}

fn invalid_value(keyword: &str, value: &str, file: &str, line: u32) {
    warn!(
        "{} line {}, invalid value for {}: \"{}\"",
        file, line, keyword, value
    );
}

fn parse_clamped(
    keyword: &str,
    value: &str,
    min: u32,
    max: u32,
    file: &str,
    line: u32,
) -> Option<u32> {
    match value.parse::<u32>() {
        Ok(v) if v < min => {
            warn!(
                "{} line {}, value for {} too small, clamping to {}",
                file, line, keyword, min
            );
            Some(min)
        }
        Ok(v) if v > max => {
            warn!(
                "{} line {}, value for {} too large, clamping to {}",
                file, line, keyword, max
            );
            Some(max)
        }
        Ok(v) => Some(v),
        Err(_) => {
            invalid_value(keyword, value, file, line);
            None
        }
    }
}

/// Set one per-device keyword on an Attrs layer. Returns false for unknown
/// keywords so the caller can warn with section context.
fn set_attr_keyword(attrs: &mut Attrs, keyword: &str, value: &str, file: &str, line: u32) -> bool {
    macro_rules! yes_no {
        ($field:ident) => {
            match YesNoUndef::parse(value) {
                Some(v) => attrs.$field = v,
                None => invalid_value(keyword, value, file, line),
            }
        };
    }
    macro_rules! undef_off_zero {
        ($field:ident) => {
            match UndefOffZero::parse(value) {
                Some(v) => attrs.$field = v,
                None => invalid_value(keyword, value, file, line),
            }
        };
    }
    match keyword {
        "path_grouping_policy" => match PgPolicy::parse(value) {
            Some(v) => attrs.pgpolicy = Some(v),
            None => invalid_value(keyword, value, file, line),
        },
        "failback" => match Failback::parse(value) {
            Some(v) => attrs.failback = v,
            None => invalid_value(keyword, value, file, line),
        },
        "no_path_retry" => match NoPathRetry::parse(value) {
            Some(v) => attrs.no_path_retry = v,
            None => invalid_value(keyword, value, file, line),
        },
        "user_friendly_names" => yes_no!(user_friendly_names),
        "alias_prefix" => attrs.alias_prefix = Some(value.to_string()),
        "path_checker" | "checker" => attrs.checker_name = Some(value.to_string()),
        "prio" => attrs.prio_name = Some(value.to_string()),
        "prio_args" => attrs.prio_args = Some(value.to_string()),
        "features" => attrs.features = Some(value.to_string()),
        "hardware_handler" => attrs.hwhandler = Some(value.to_string()),
        "fast_io_fail_tmo" => undef_off_zero!(fast_io_fail),
        "eh_deadline" => undef_off_zero!(eh_deadline),
        "dev_loss_tmo" => {
            if value == "infinity" {
                attrs.dev_loss = Some(u32::MAX);
            } else {
                match parse_clamped(keyword, value, 0, u32::MAX, file, line) {
                    Some(v) => attrs.dev_loss = Some(v),
                    None => {}
                }
            }
        }
        "ghost_delay" => undef_off_zero!(ghost_delay),
        "retain_attached_hw_handler" => yes_no!(retain_hwhandler),
        "detect_prio" => yes_no!(detect_prio),
        "detect_checker" => yes_no!(detect_checker),
        "deferred_remove" => yes_no!(deferred_remove),
        "skip_kpartx" => yes_no!(skip_kpartx),
        "san_path_err_threshold" => undef_off_zero!(san_path_err_threshold),
        "san_path_err_forget_rate" => undef_off_zero!(san_path_err_forget_rate),
        "san_path_err_recovery_time" => undef_off_zero!(san_path_err_recovery_time),
        "marginal_path_err_sample_time" => undef_off_zero!(marginal_path_err_sample_time),
        "marginal_path_err_rate_threshold" => undef_off_zero!(marginal_path_err_rate_threshold),
        "marginal_path_err_recheck_gap_time" => {
            undef_off_zero!(marginal_path_err_recheck_gap_time)
        }
        "marginal_path_double_failed_time" => undef_off_zero!(marginal_path_double_failed_time),
        "delay_watch_checks" => undef_off_zero!(delay_watch_checks),
        "delay_wait_checks" => undef_off_zero!(delay_wait_checks),
        "all_tg_pt" => yes_no!(all_tg_pt),
        "reservation_key" => match ReservationKey::parse(value) {
            Some(v) => attrs.reservation_key = v,
            None => invalid_value(keyword, value, file, line),
        },
        _ => return false,
    }
    true
}

fn tokenize(src: &str) -> Vec<(String, u32)> {
    let mut tokens = Vec::new();
    for (idx, raw) in src.lines().enumerate() {
        let line_nr = idx as u32 + 1;
        let mut chars = raw.chars().peekable();
        loop {
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
            match chars.peek() {
                None => break,
                Some('#') | Some('!') => break,
                Some('"') => {
                    chars.next();
                    let mut tok = String::new();
                    for c in chars.by_ref() {
                        if c == '"' {
                            break;
                        }
                        tok.push(c);
                    }
                    tokens.push((tok, line_nr));
                }
                Some('{') | Some('}') => {
                    if let Some(c) = chars.next() {
                        tokens.push((c.to_string(), line_nr));
                    }
                }
                _ => {
                    let mut tok = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_whitespace() || c == '{' || c == '}' || c == '#' {
                            break;
                        }
                        tok.push(c);
                        chars.next();
                    }
                    tokens.push((tok, line_nr));
                }
            }
        }
    }
    tokens
}

struct Parser<'a> {
    tokens: &'a [(String, u32)],
    pos: usize,
    file: &'a str,
}

impl Parser<'_> {
    fn next_token(&mut self) -> Option<(String, u32)> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect_open(&mut self) -> bool {
        match self.tokens.get(self.pos) {
            Some((t, _)) if t == "{" => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn next_value(&mut self, keyword: &str, line: u32) -> Option<String> {
        match self.next_token() {
            Some((t, _)) if t != "{" && t != "}" => Some(t),
            _ => {
                warn!(
                    "{} line {}, missing value for keyword \"{}\"",
                    self.file, line, keyword
                );
                None
            }
        }
    }

    fn skip_block(&mut self) {
        let mut depth = 1;
        while let Some((t, _)) = self.next_token() {
            match t.as_str() {
                "{" => depth += 1,
                "}" => {
                    depth -= 1;
                    if depth == 0 {
                        return;
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
defaults {
    verbosity 3
    polling_interval 7
    user_friendly_names yes
    find_multipaths strict
    no_path_retry 12
    marginal_pathgroups on
}
blacklist {
    devnode "^(ram|zram)[0-9]"
    wwid "W_BAD.*"
}
blacklist_exceptions {
    wwid "W_BAD_BUT_OK"
}
devices {
    device {
        vendor "ACME"
        product "STOR.*"
        path_grouping_policy group_by_prio
        no_path_retry queue
        path_checker none
    }
}
overrides {
    failback immediate
}
multipaths {
    multipath {
        wwid 3600d0230000000000e13955cc3757801
        alias yellow
        no_path_retry fail
    }
}
"#;

    #[test]
    fn test_parse_sample() {
        let mut conf = Config::builtin();
        conf.parse_into(SAMPLE, "test.conf");
        assert_eq!(conf.verbosity, 3);
        assert_eq!(conf.checkint(), 7);
        assert_eq!(conf.max_checkint(), 28);
        assert_eq!(conf.find_multipaths, FindMultipaths::Strict);
        assert_eq!(conf.marginal_pathgroups, MarginalPathgroups::On);
        assert_eq!(conf.defaults.user_friendly_names, YesNoUndef::Yes);
        assert_eq!(conf.defaults.no_path_retry, NoPathRetry::Retries(12));
        assert_eq!(conf.mptable.len(), 1);
        assert_eq!(conf.mptable[0].alias.as_deref(), Some("yellow"));
        assert_eq!(conf.overrides.failback, Failback::Immediate);
    }

    #[test]
    fn test_layered_resolution() {
        let mut conf = Config::builtin();
        conf.parse_into(SAMPLE, "test.conf");
        let mpe = conf.find_mpe("3600d0230000000000e13955cc3757801", None);
        assert!(mpe.is_some());
        let hwe = conf.find_hwe("ACME", "STOR-3000", "0001");
        assert!(hwe.is_some());

        // multipaths entry wins over defaults and hwtable
        assert_eq!(conf.select_no_path_retry(mpe, hwe), NoPathRetry::Fail);
        // hwtable wins over defaults when no mpe matches
        assert_eq!(conf.select_no_path_retry(None, hwe), NoPathRetry::Queue);
        // defaults apply when nothing else matches
        assert_eq!(conf.select_no_path_retry(None, None), NoPathRetry::Retries(12));
        // overrides beat the hardware table
        assert_eq!(conf.select_failback(None, hwe), Failback::Immediate);
        // hw checker selection
        assert_eq!(conf.select_checker(hwe), "none");
        assert_eq!(conf.select_checker(None), DEFAULT_CHECKER);
    }

    #[test]
    fn test_reservation_and_pr_selectors() {
        let mut conf = Config::builtin();
        conf.parse_into(
            "defaults {\n reservation_key file\n}\ndevices {\n device {\n vendor ACME\n product DISK\n all_tg_pt yes\n ghost_delay 30\n reservation_key 0xabc\n }\n}\n",
            "t.conf",
        );
        let hwe = conf.find_hwe("ACME", "DISK-X", "1");
        assert!(conf.select_all_tg_pt(hwe));
        assert!(!conf.select_all_tg_pt(None));
        assert_eq!(conf.select_ghost_delay(None, hwe), UndefOffZero::Value(30));
        // the hardware layer wins over defaults
        assert_eq!(
            conf.select_reservation_key(None, hwe),
            ReservationKey::Key { key: 0xabc, aptpl: false }
        );
        assert_eq!(
            conf.select_reservation_key(None, None),
            ReservationKey::File
        );
    }

    #[test]
    fn test_builtin_hwtable_matches() {
        let conf = Config::builtin();
        let hwe = conf.find_hwe("NVME", "Samsung SSD", "1.2");
        assert!(hwe.is_some());
        assert_eq!(conf.select_pgpolicy(None, hwe), PgPolicy::Multibus);
        assert!(conf.find_hwe("QEMU", "HARDDISK", "2").is_none());
    }

    #[test]
    fn test_user_device_overrides_builtin() {
        let mut conf = Config::builtin();
        conf.parse_into(
            "devices {\n device {\n vendor NVME\n product \".*\"\n path_grouping_policy failover\n }\n}\n",
            "t.conf",
        );
        let hwe = conf.find_hwe("NVME", "X", "1");
        assert_eq!(conf.select_pgpolicy(None, hwe), PgPolicy::Failover);
    }

    #[test]
    fn test_blacklist_and_exceptions() {
        let mut conf = Config::builtin();
        conf.parse_into(SAMPLE, "test.conf");
        assert!(conf.filter_devnode("ram0"));
        assert!(!conf.filter_devnode("sda"));
        assert!(conf.filter_wwid("W_BAD_1"));
        assert!(!conf.filter_wwid("W_BAD_BUT_OK"));
    }

    #[test]
    fn test_invalid_values_leave_undef() {
        let mut conf = Config::builtin();
        conf.parse_into(
            "defaults {\n no_path_retry sometimes\n find_multipaths maybe\n}\n",
            "t.conf",
        );
        assert_eq!(conf.defaults.no_path_retry, NoPathRetry::Undef);
        assert_eq!(conf.find_multipaths, FindMultipaths::Greedy);
    }

    #[test]
    fn test_clamping() {
        let mut conf = Config::builtin();
        conf.parse_into("defaults {\n verbosity 99\n polling_interval 0\n}\n", "t.conf");
        assert_eq!(conf.verbosity, 4);
        assert_eq!(conf.checkint(), 1);
    }

    #[test]
    fn test_deprecated_keyword_ignored() {
        let mut conf = Config::builtin();
        conf.parse_into(
            "defaults {\n udev_dir /dev\n verbosity 1\n}\n",
            "t.conf",
        );
        assert_eq!(conf.verbosity, 1);
    }

    #[test]
    fn test_unknown_section_skipped() {
        let mut conf = Config::builtin();
        conf.parse_into(
            "weird { stuff { nested 1 } }\ndefaults { verbosity 0 }\n",
            "t.conf",
        );
        assert_eq!(conf.verbosity, 0);
    }

    #[test]
    fn test_dev_loss_infinity_and_max_fds() {
        let mut conf = Config::builtin();
        conf.parse_into(
            "defaults {\n dev_loss_tmo infinity\n max_fds max\n}\n",
            "t.conf",
        );
        assert_eq!(conf.defaults.dev_loss, Some(u32::MAX));
        assert_eq!(conf.max_fds, MaxFds::Max);
    }

    #[test]
    fn test_reservation_key_forms() {
        assert_eq!(ReservationKey::parse("file"), Some(ReservationKey::File));
        assert_eq!(
            ReservationKey::parse("0x123abc"),
            Some(ReservationKey::Key { key: 0x123abc, aptpl: false })
        );
        assert_eq!(
            ReservationKey::parse("beef:aptpl"),
            Some(ReservationKey::Key { key: 0xbeef, aptpl: true })
        );
        assert_eq!(ReservationKey::parse("not-a-key"), None);
    }

    #[test]
    fn test_undef_off_zero_domain() {
        assert_eq!(UndefOffZero::parse("off"), Some(UndefOffZero::Off));
        assert_eq!(UndefOffZero::parse("0"), Some(UndefOffZero::Zero));
        assert_eq!(UndefOffZero::parse("17"), Some(UndefOffZero::Value(17)));
        assert_eq!(UndefOffZero::parse("banana"), None);
    }

    #[test]
    fn test_snprint_roundtrips_sections() {
        let mut conf = Config::builtin();
        conf.parse_into(SAMPLE, "test.conf");
        let dump = conf.snprint();
        assert!(dump.contains("polling_interval 7"));
        assert!(dump.contains("wwid 3600d0230000000000e13955cc3757801"));
        assert!(dump.contains("vendor \"ACME\""));
    }
}
