//! Persistent alias bindings store
//!
//! Maps WWIDs to user-friendly aliases (`mpatha`, `mpathb`, …) through a
//! line-oriented text file. The numeric part of an alias is encoded in
//! lowercase base-26; ids start at 1. Lookups scan the file linearly;
//! appends happen under an exclusive advisory lock; conflict repair
//! rewrites the file atomically (temp file in the same directory, rename,
//! directory fsync).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path as FsPath, PathBuf};

use log::{debug, error, info, warn};

use crate::config::MpEntry;
use crate::dm::DmChannel;
use crate::error::{CoreError, CoreResult};
use crate::platform::{durable_sync, fsync_dir, FileLock, LockKind};

pub const BINDINGS_FILE_HEADER: &str = "\
# Multipath bindings, Version : 1.0
# NOTE: this file is automatically maintained by the multipath program.
# You should not need to edit this file in normal circumstances.
#
# Format:
# alias wwid
#
";

/// Aliases must be usable as device-mapper names: no slashes, not empty.
pub fn valid_alias(alias: &str) -> bool {
    !alias.is_empty() && !alias.contains('/')
}

/// Encode id `n >= 1` as `prefix` plus lowercase base-26 digits
/// (1 → a, 26 → z, 27 → aa).
pub fn format_devname(id: i32, prefix: &str) -> Option<String> {
    if id <= 0 {
        return None;
    }
    let mut id = id;
    let mut digits: Vec<char> = Vec::new();
    loop {
        id -= 1;
        digits.push((b'a' + (id % 26) as u8) as char);
        if id < 26 {
            break;
        }
        id /= 26;
    }
    let mut name = String::with_capacity(prefix.len() + digits.len());
    name.push_str(prefix);
    name.extend(digits.iter().rev());
    Some(name)
}

/// Decode an alias back to its id; None when the alias does not carry the
/// prefix, contains non-base-26 digits, is longer than prefix+7 (an id of
/// "aaaaaaaa" overflows i32), or overflows.
pub fn scan_devname(alias: &str, prefix: &str) -> Option<i32> {
    let rest = alias.strip_prefix(prefix)?;
    if rest.is_empty() || rest.len() > 7 {
        return None;
    }
    let last_26 = i32::MAX / 26;
    let mut n: i32 = 0;
    for c in rest.chars() {
        if !c.is_ascii_lowercase() {
            return None;
        }
        let i = (c as u8 - b'a') as i32;
        if n > last_26 || (n == last_26 && i >= i32::MAX % 26) {
            return None;
        }
        n = n * 26 + i;
        n += 1;
    }
    Some(n)
}

/// Strip comment and split one record line into (alias, wwid, extra).
fn parse_line(line: &str) -> Option<(&str, Option<&str>, Option<&str>)> {
    let line = match line.find(['#', '\r']) {
        Some(pos) => &line[..pos],
        None => line,
    };
    let mut tokens = line.split_whitespace();
    let alias = tokens.next()?;
    Some((alias, tokens.next(), tokens.next()))
}

enum Lookup {
    /// A row with the requested WWID exists
    Found(String),
    /// No row matched; this id is free under the prefix
    FreeId(i32),
}

/// The persistent bindings file.
pub struct BindingsFile {
    path: PathBuf,
}

impl BindingsFile {
    pub fn new<P: AsRef<FsPath>>(path: P) -> Self {
        BindingsFile {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &FsPath {
        &self.path
    }

    /// Open the file, creating it with the header banner and 0600
    /// permissions when missing. Returns the handle and whether writing is
    /// possible; an unwritable file degrades to read-only with a warning.
    fn open(&self) -> CoreResult<(File, bool)> {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(&self.path)
        {
            Ok(mut file) => {
                let len = file
                    .metadata()
                    .map_err(|e| CoreError::io(&self.path, e, "stat bindings file"))?
                    .len();
                if len == 0 {
                    file.write_all(BINDINGS_FILE_HEADER.as_bytes())
                        .map_err(|e| CoreError::io(&self.path, e, "write bindings header"))?;
                    durable_sync(&file)
                        .map_err(|e| CoreError::io(&self.path, e, "sync bindings header"))?;
                }
                Ok((file, true))
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::PermissionDenied
                    || e.raw_os_error() == Some(libc::EROFS) =>
            {
                warn!(
                    "cannot open {} for writing, bindings are read-only",
                    self.path.display()
                );
                let file = File::open(&self.path)
                    .map_err(|e| CoreError::io(&self.path, e, "open bindings file"))?;
                Ok((file, false))
            }
            Err(e) => Err(CoreError::io(&self.path, e, "open bindings file")),
        }
    }

    fn read_content(file: &mut File) -> CoreResult<String> {
        let mut content = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut content)?;
        Ok(content)
    }

    /// Scan for a binding of `map_wwid`. When none exists, compute the
    /// smallest free id under `prefix`: the scan tracks the next candidate,
    /// the biggest id seen, and the smallest id bigger than the candidate;
    /// a `check_taken` probe additionally skips ids whose alias is already
    /// claimed in the kernel by a foreign map.
    ///
    /// `prefix == None` is only valid without a probe; that combination is
    /// rejected at this boundary.
    fn lookup_binding(
        &self,
        content: &str,
        map_wwid: &str,
        prefix: Option<&str>,
        check_taken: Option<(&dyn DmChannel, &str)>,
    ) -> CoreResult<Lookup> {
        if prefix.is_none() && check_taken.is_some() {
            return Err(CoreError::Config {
                option: "lookup_binding".to_string(),
                value: "no prefix".to_string(),
                reason: "a kernel-claimed probe requires an alias prefix".to_string(),
            });
        }

        let mut id: i32 = 1;
        let mut biggest_id: i32 = 1;
        let mut smallest_bigger_id: i32 = i32::MAX;

        for (line_idx, line) in content.lines().enumerate() {
            let (alias, wwid, _) = match parse_line(line) {
                Some(parsed) => parsed,
                None => continue,
            };
            let curr_id = prefix.and_then(|p| scan_devname(alias, p)).unwrap_or(-1);
            if curr_id == id {
                if id < i32::MAX {
                    id += 1;
                } else {
                    id = -1;
                    break;
                }
            }
            if curr_id > biggest_id {
                biggest_id = curr_id;
            }
            if curr_id > id && curr_id < smallest_bigger_id {
                smallest_bigger_id = curr_id;
            }
            let wwid = match wwid {
                Some(w) => w,
                None => {
                    debug!(
                        "ignoring malformed line {} in bindings file",
                        line_idx + 1
                    );
                    continue;
                }
            };
            if wwid == map_wwid {
                debug!(
                    "found matching wwid [{}] in bindings file, setting alias to {}",
                    wwid, alias
                );
                return Ok(Lookup::Found(alias.to_string()));
            }
        }

        if id >= smallest_bigger_id {
            if biggest_id < i32::MAX {
                id = biggest_id + 1;
            } else {
                id = -1;
            }
        }
        if id > 0 {
            if let Some((dm, wwid)) = check_taken {
                let prefix = prefix.unwrap_or("");
                while id > 0 && self.id_already_taken(dm, id, prefix, wwid) {
                    if id == i32::MAX {
                        id = -1;
                        break;
                    }
                    id += 1;
                    if id == smallest_bigger_id {
                        if biggest_id == i32::MAX {
                            id = -1;
                            break;
                        }
                        if biggest_id >= smallest_bigger_id {
                            id = biggest_id + 1;
                        }
                    }
                }
            }
        }
        if id < 0 {
            error!("no more available user_friendly_names");
            return Err(CoreError::ResourceExhaustion {
                resource: "user_friendly_names".to_string(),
            });
        }
        debug!("no matching wwid [{}] in bindings file", map_wwid);
        Ok(Lookup::FreeId(id))
    }

    /// The alias is taken when a foreign map (different WWID) already
    /// claims it in the kernel but it has no row in the bindings file.
    fn id_already_taken(&self, dm: &dyn DmChannel, id: i32, prefix: &str, map_wwid: &str) -> bool {
        let alias = match format_devname(id, prefix) {
            Some(a) => a,
            None => return false,
        };
        if !dm.map_present(&alias) {
            return false;
        }
        if dm.get_uuid(&alias).as_deref() == Some(map_wwid) {
            return false;
        }
        debug!(
            "{}: alias '{}' already taken, but not in bindings file, reselecting alias",
            map_wwid, alias
        );
        true
    }

    /// Append `alias wwid` for a free id; a partial append is truncated
    /// back out before reporting the error.
    fn allocate_binding(
        &self,
        file: &mut File,
        wwid: &str,
        id: i32,
        prefix: &str,
    ) -> CoreResult<String> {
        if id <= 0 {
            return Err(CoreError::ResourceExhaustion {
                resource: "user_friendly_names".to_string(),
            });
        }
        let alias = format_devname(id, prefix).ok_or_else(|| CoreError::ResourceExhaustion {
            resource: "user_friendly_names".to_string(),
        })?;
        let line = format!("{} {}\n", alias, wwid);
        let offset = file
            .seek(SeekFrom::End(0))
            .map_err(|e| CoreError::io(&self.path, e, "seek to end of bindings file"))?;
        if let Err(e) = file.write_all(line.as_bytes()) {
            if file.set_len(offset).is_err() {
                error!("cannot truncate the partial binding write");
            }
            return Err(CoreError::io(&self.path, e, "write binding"));
        }
        durable_sync(file).map_err(|e| CoreError::io(&self.path, e, "sync binding"))?;
        debug!("created new binding [{}] for WWID [{}]", alias, wwid);
        Ok(alias)
    }

    /// Look up (or, when allowed, create) the alias for `wwid`. Returns
    /// None when a new alias would be needed but the file is read-only.
    pub fn get_user_friendly_alias(
        &self,
        wwid: &str,
        prefix: &str,
        bindings_read_only: bool,
        dm: &dyn DmChannel,
    ) -> CoreResult<Option<String>> {
        if wwid.is_empty() {
            debug!("cannot find binding for empty WWID");
            return Ok(None);
        }
        let (mut file, can_write) = self.open()?;
        let writing = can_write && !bindings_read_only;
        let _lock = FileLock::new(
            &file,
            if writing {
                LockKind::Exclusive
            } else {
                LockKind::Shared
            },
        )
        .map_err(|e| CoreError::io(&self.path, e, "lock bindings file"))?;

        let content = Self::read_content(&mut file)?;
        match self.lookup_binding(&content, wwid, Some(prefix), Some((dm, wwid)))? {
            Lookup::Found(alias) => Ok(Some(alias)),
            Lookup::FreeId(id) => {
                if writing {
                    Ok(Some(self.allocate_binding(&mut file, wwid, id, prefix)?))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Reverse lookup: the WWID bound to `alias`.
    pub fn get_user_friendly_wwid(&self, alias: &str) -> CoreResult<String> {
        if alias.is_empty() {
            return Err(CoreError::NotFound {
                object: "empty alias".to_string(),
            });
        }
        let (mut file, _) = self.open()?;
        let _lock = FileLock::new(&file, LockKind::Shared)
            .map_err(|e| CoreError::io(&self.path, e, "lock bindings file"))?;
        let content = Self::read_content(&mut file)?;
        match self.rlookup_binding(&content, alias) {
            Some(wwid) => Ok(wwid),
            None => Err(CoreError::NotFound {
                object: format!("alias {}", alias),
            }),
        }
    }

    fn rlookup_binding(&self, content: &str, map_alias: &str) -> Option<String> {
        for (line_idx, line) in content.lines().enumerate() {
            let (alias, wwid, _) = match parse_line(line) {
                Some(parsed) => parsed,
                None => continue,
            };
            let wwid = match wwid {
                Some(w) => w,
                None => {
                    debug!(
                        "ignoring malformed line {} in bindings file",
                        line_idx + 1
                    );
                    continue;
                }
            };
            if alias == map_alias {
                debug!(
                    "found matching alias [{}] in bindings file, setting wwid to {}",
                    alias, wwid
                );
                return Some(wwid.to_string());
            }
        }
        debug!("no matching alias [{}] in bindings file", map_alias);
        None
    }

    /// Try to give `wwid` the alias a dead predecessor map used. Succeeds
    /// when `alias_old` is unbound (its id is appended for this WWID) or
    /// already bound to this WWID; an alias bound to a different WWID
    /// cannot be reused.
    pub fn use_existing_alias(
        &self,
        wwid: &str,
        alias_old: &str,
        prefix: &str,
        bindings_read_only: bool,
    ) -> CoreResult<Option<String>> {
        let (mut file, can_write) = self.open()?;
        let writing = can_write && !bindings_read_only;
        let _lock = FileLock::new(
            &file,
            if writing {
                LockKind::Exclusive
            } else {
                LockKind::Shared
            },
        )
        .map_err(|e| CoreError::io(&self.path, e, "lock bindings file"))?;
        let content = Self::read_content(&mut file)?;

        if let Some(bound) = self.rlookup_binding(&content, alias_old) {
            if bound == wwid {
                return Ok(Some(alias_old.to_string()));
            }
            error!(
                "alias {} already bound to wwid {}, cannot reuse",
                alias_old, bound
            );
            return Ok(None);
        }

        if let Lookup::Found(alias) = self.lookup_binding(&content, wwid, None, None)? {
            debug!("use existing binding [{}] for WWID [{}]", alias, wwid);
            return Ok(Some(alias));
        }

        let id = match scan_devname(alias_old, prefix) {
            Some(id) => id,
            None => return Ok(None),
        };
        if !writing {
            return Ok(None);
        }
        let alias = self.allocate_binding(&mut file, wwid, id, prefix)?;
        info!("allocated existing binding [{}] for WWID [{}]", alias, wwid);
        Ok(Some(alias))
    }

    /// Check the bindings file against itself and the static `multipaths`
    /// aliases. Conflicting static aliases are nulled out; when the file
    /// itself is inconsistent it is rewritten atomically keeping one
    /// binding per alias. Returns whether a rewrite happened.
    pub fn check_and_repair(
        &self,
        mptable: &mut [MpEntry],
        bindings_read_only: bool,
    ) -> CoreResult<bool> {
        // phase 1: the static configuration must be self-consistent
        let mut bindings = Bindings::new();
        let mut order: Vec<usize> = (0..mptable.len()).collect();
        order.sort_by(|&a, &b| match (&mptable[a].alias, &mptable[b].alias) {
            (Some(x), Some(y)) => x.cmp(y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        for idx in order {
            let (alias, wwid) = match &mptable[idx].alias {
                Some(a) => (a.clone(), mptable[idx].wwid.clone()),
                None => break,
            };
            if bindings.add(&alias, &wwid) == AddBinding::Conflict {
                error!(
                    "alias \"{}\" bound to multiple wwids in configuration, discarding binding to {}",
                    alias, wwid
                );
                mptable[idx].alias = None;
            }
        }

        // phase 2: the file against the (now consistent) static aliases
        let (mut file, can_write) = self.open()?;
        let writing = can_write && !bindings_read_only;
        let _lock = FileLock::new(
            &file,
            if writing {
                LockKind::Exclusive
            } else {
                LockKind::Shared
            },
        )
        .map_err(|e| CoreError::io(&self.path, e, "lock bindings file"))?;
        let content = Self::read_content(&mut file)?;

        let mut bindings = Bindings::new();
        let mut bad = false;
        for (line_idx, line) in content.lines().enumerate() {
            let (alias, wwid, extra) = match parse_line(line) {
                Some(parsed) => parsed,
                None => continue,
            };
            let wwid = match wwid {
                Some(w) => w,
                None => {
                    warn!(
                        "invalid line {} in bindings file, missing WWID",
                        line_idx + 1
                    );
                    continue;
                }
            };
            if let Some(extra) = extra {
                warn!(
                    "invalid line {} in bindings file, extra args \"{}\"",
                    line_idx + 1,
                    extra
                );
            }
            let mpe_wwid = mptable
                .iter()
                .find(|mpe| mpe.alias.as_deref() == Some(alias))
                .map(|mpe| mpe.wwid.as_str());
            if let Some(mpe_wwid) = mpe_wwid {
                if mpe_wwid != wwid {
                    error!(
                        "alias \"{}\" for WWID {} in bindings file on line {} conflicts with configuration entry for {}",
                        alias,
                        wwid,
                        line_idx + 1,
                        mpe_wwid
                    );
                    bad = true;
                    continue;
                }
            }
            match bindings.add(alias, wwid) {
                AddBinding::Conflict => {
                    error!(
                        "multiple bindings for alias \"{}\" in bindings file on line {}, discarding binding to WWID {}",
                        alias,
                        line_idx + 1,
                        wwid
                    );
                    bad = true;
                }
                AddBinding::Exists => {
                    info!(
                        "duplicate line for alias {} in bindings file on line {}",
                        alias,
                        line_idx + 1
                    );
                }
                AddBinding::Added => {}
            }
        }

        if !bad {
            return Ok(false);
        }
        if !writing {
            error!(
                "bad settings in read-only bindings file {}",
                self.path.display()
            );
            return Err(CoreError::PolicyViolation {
                object: self.path.display().to_string(),
                reason: "conflicting bindings in read-only file".to_string(),
            });
        }
        self.rewrite(&bindings)?;
        Ok(true)
    }

    /// Atomic rewrite: temp file in the same directory, rename over the
    /// original, fsync of the directory. Never truncate-in-place.
    fn rewrite(&self, bindings: &Bindings) -> CoreResult<()> {
        let dir = self
            .path
            .parent()
            .unwrap_or_else(|| FsPath::new("."))
            .to_path_buf();
        let mut tmp = tempfile::Builder::new()
            .prefix(".bindings.")
            .tempfile_in(&dir)
            .map_err(|e| CoreError::io(&self.path, e, "create bindings temp file"))?;
        tmp.write_all(BINDINGS_FILE_HEADER.as_bytes())
            .map_err(|e| CoreError::io(&self.path, e, "write bindings temp file"))?;
        for binding in &bindings.entries {
            tmp.write_all(format!("{} {}\n", binding.alias, binding.wwid).as_bytes())
                .map_err(|e| CoreError::io(&self.path, e, "write bindings temp file"))?;
        }
        durable_sync(tmp.as_file())
            .map_err(|e| CoreError::io(&self.path, e, "sync bindings temp file"))?;
        tmp.persist(&self.path)
            .map_err(|e| CoreError::io(&self.path, e.error, "rename bindings file"))?;
        fsync_dir(&self.path).map_err(|e| CoreError::io(&self.path, e, "sync bindings dir"))?;
        info!("updated bindings file {}", self.path.display());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddBinding {
    Exists,
    Conflict,
    Added,
}

struct Binding {
    alias: String,
    wwid: String,
}

/// In-memory bindings set kept sorted by alias; the backward scan exploits
/// that the file is usually sorted already.
struct Bindings {
    entries: Vec<Binding>,
}

impl Bindings {
    fn new() -> Self {
        Bindings {
            entries: Vec::new(),
        }
    }

    fn add(&mut self, alias: &str, wwid: &str) -> AddBinding {
        let mut insert_at = 0;
        for i in (0..self.entries.len()).rev() {
            match self.entries[i].alias.as_str().cmp(alias) {
                std::cmp::Ordering::Equal => {
                    return if self.entries[i].wwid == wwid {
                        AddBinding::Exists
                    } else {
                        AddBinding::Conflict
                    };
                }
                std::cmp::Ordering::Less => {
                    insert_at = i + 1;
                    break;
                }
                std::cmp::Ordering::Greater => {}
            }
        }
        self.entries.insert(
            insert_at,
            Binding {
                alias: alias.to_string(),
                wwid: wwid.to_string(),
            },
        );
        AddBinding::Added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dm::MemoryDm;
    use tempfile::TempDir;

    fn bindings(dir: &TempDir) -> BindingsFile {
        BindingsFile::new(dir.path().join("bindings"))
    }

    #[test]
    fn test_valid_alias() {
        assert!(valid_alias("mpatha"));
        assert!(!valid_alias("mp/atha"));
        assert!(!valid_alias(""));
    }

    #[test]
    fn test_devname_codec() {
        assert_eq!(format_devname(1, "mpath").as_deref(), Some("mpatha"));
        assert_eq!(format_devname(26, "mpath").as_deref(), Some("mpathz"));
        assert_eq!(format_devname(27, "mpath").as_deref(), Some("mpathaa"));
        assert_eq!(format_devname(52, "mpath").as_deref(), Some("mpathaz"));
        assert_eq!(format_devname(53, "mpath").as_deref(), Some("mpathba"));
        assert_eq!(format_devname(0, "mpath"), None);
        assert_eq!(format_devname(-4, "mpath"), None);
    }

    #[test]
    fn test_devname_roundtrip() {
        for id in [1, 2, 25, 26, 27, 51, 52, 53, 676, 677, 18278, 1 << 20] {
            let name = format_devname(id, "mpath").unwrap();
            assert_eq!(scan_devname(&name, "mpath"), Some(id), "id {}", id);
        }
    }

    #[test]
    fn test_scan_devname_rejects() {
        assert_eq!(scan_devname("mpath", "mpath"), None);
        assert_eq!(scan_devname("dm-3", "mpath"), None);
        assert_eq!(scan_devname("mpathA", "mpath"), None);
        assert_eq!(scan_devname("mpath0", "mpath"), None);
        // more than 7 digits overflows a 32-bit id
        assert_eq!(scan_devname("mpathaaaaaaaa", "mpath"), None);
        assert_eq!(scan_devname("mpathzzzzzzz", "mpath"), None);
    }

    #[test]
    fn test_alias_allocation_sequence() {
        // fresh file, prefix mpath: WWA -> mpatha, WWB -> mpathb,
        // WWA again finds the first entry
        let dir = TempDir::new().unwrap();
        let bf = bindings(&dir);
        let dm = MemoryDm::new();

        let a = bf.get_user_friendly_alias("WWA", "mpath", false, &dm).unwrap();
        assert_eq!(a.as_deref(), Some("mpatha"));
        let b = bf.get_user_friendly_alias("WWB", "mpath", false, &dm).unwrap();
        assert_eq!(b.as_deref(), Some("mpathb"));
        let a2 = bf.get_user_friendly_alias("WWA", "mpath", false, &dm).unwrap();
        assert_eq!(a2.as_deref(), Some("mpatha"));
    }

    #[test]
    fn test_file_format() {
        let dir = TempDir::new().unwrap();
        let bf = bindings(&dir);
        let dm = MemoryDm::new();
        bf.get_user_friendly_alias("WWA", "mpath", false, &dm).unwrap();

        let content = std::fs::read_to_string(bf.path()).unwrap();
        assert!(content.starts_with("# Multipath bindings, Version : 1.0\n"));
        assert!(content.ends_with("mpatha WWA\n"));

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(bf.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_gap_filling_and_jump() {
        let dir = TempDir::new().unwrap();
        let bf = bindings(&dir);
        let dm = MemoryDm::new();
        std::fs::write(
            bf.path(),
            format!(
                "{}mpatha WWA\nmpathc WWC\nmpathd WWD\n",
                BINDINGS_FILE_HEADER
            ),
        )
        .unwrap();

        // the gap at id 2 is used first
        let b = bf.get_user_friendly_alias("WWB", "mpath", false, &dm).unwrap();
        assert_eq!(b.as_deref(), Some("mpathb"));
        // then the scan jumps past the biggest id
        let e = bf.get_user_friendly_alias("WWE", "mpath", false, &dm).unwrap();
        assert_eq!(e.as_deref(), Some("mpathe"));
    }

    #[test]
    fn test_comments_and_malformed_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let bf = bindings(&dir);
        std::fs::write(
            bf.path(),
            "# comment\n\nmpatha WWA # trailing comment\nmissingwwid\nmpathb WWB\n",
        )
        .unwrap();

        assert_eq!(bf.get_user_friendly_wwid("mpatha").unwrap(), "WWA");
        assert_eq!(bf.get_user_friendly_wwid("mpathb").unwrap(), "WWB");
        assert!(bf.get_user_friendly_wwid("missingwwid").is_err());
    }

    #[test]
    fn test_kernel_claimed_alias_skipped() {
        let dir = TempDir::new().unwrap();
        let bf = bindings(&dir);
        let dm = MemoryDm::new();
        // a foreign map already owns "mpatha" in the kernel
        dm.create_map("mpatha", "FOREIGN", &crate::dm::DmTable::default())
            .unwrap();

        let a = bf.get_user_friendly_alias("WWA", "mpath", false, &dm).unwrap();
        assert_eq!(a.as_deref(), Some("mpathb"));
    }

    #[test]
    fn test_kernel_claim_by_same_wwid_is_fine() {
        let dir = TempDir::new().unwrap();
        let bf = bindings(&dir);
        let dm = MemoryDm::new();
        dm.create_map("mpatha", "WWA", &crate::dm::DmTable::default())
            .unwrap();

        let a = bf.get_user_friendly_alias("WWA", "mpath", false, &dm).unwrap();
        assert_eq!(a.as_deref(), Some("mpatha"));
    }

    #[test]
    fn test_read_only_returns_no_alias() {
        let dir = TempDir::new().unwrap();
        let bf = bindings(&dir);
        let dm = MemoryDm::new();
        let a = bf.get_user_friendly_alias("WWA", "mpath", true, &dm).unwrap();
        assert_eq!(a, None);
        // existing bindings still resolve
        std::fs::write(bf.path(), "mpathq WWQ\n").unwrap();
        let q = bf.get_user_friendly_alias("WWQ", "mpath", true, &dm).unwrap();
        assert_eq!(q.as_deref(), Some("mpathq"));
    }

    #[test]
    fn test_use_existing_alias() {
        let dir = TempDir::new().unwrap();
        let bf = bindings(&dir);

        // unbound old alias: its id is allocated for the new wwid
        let a = bf
            .use_existing_alias("WWA", "mpathg", "mpath", false)
            .unwrap();
        assert_eq!(a.as_deref(), Some("mpathg"));

        // already bound to this wwid: reused as-is
        let again = bf
            .use_existing_alias("WWA", "mpathg", "mpath", false)
            .unwrap();
        assert_eq!(again.as_deref(), Some("mpathg"));

        // bound to a different wwid: refused
        let refused = bf
            .use_existing_alias("WWB", "mpathg", "mpath", false)
            .unwrap();
        assert_eq!(refused, None);
    }

    #[test]
    fn test_lookup_no_prefix_with_probe_rejected() {
        let dir = TempDir::new().unwrap();
        let bf = bindings(&dir);
        let dm = MemoryDm::new();
        let err = bf.lookup_binding("", "WWA", None, Some((&dm, "WWA")));
        assert!(matches!(err, Err(CoreError::Config { .. })));
    }

    #[test]
    fn test_check_and_repair_drops_conflicts() {
        let dir = TempDir::new().unwrap();
        let bf = bindings(&dir);
        std::fs::write(
            bf.path(),
            format!(
                "{}mpatha WWA\nmpathb WWB\nmpatha WWX\n",
                BINDINGS_FILE_HEADER
            ),
        )
        .unwrap();

        let mut mptable = Vec::new();
        let repaired = bf.check_and_repair(&mut mptable, false).unwrap();
        assert!(repaired);

        let content = std::fs::read_to_string(bf.path()).unwrap();
        assert!(content.contains("mpatha WWA\n"));
        assert!(content.contains("mpathb WWB\n"));
        assert!(!content.contains("WWX"));
        assert!(content.starts_with(BINDINGS_FILE_HEADER));
    }

    #[test]
    fn test_check_and_repair_idempotent() {
        let dir = TempDir::new().unwrap();
        let bf = bindings(&dir);
        std::fs::write(
            bf.path(),
            format!(
                "{}mpathb WWB\nmpatha WWA\nmpatha WWX\n",
                BINDINGS_FILE_HEADER
            ),
        )
        .unwrap();

        let mut mptable = Vec::new();
        bf.check_and_repair(&mut mptable, false).unwrap();
        let first = std::fs::read_to_string(bf.path()).unwrap();
        let repaired_again = bf.check_and_repair(&mut mptable, false).unwrap();
        assert!(!repaired_again);
        let second = std::fs::read_to_string(bf.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_check_and_repair_nulls_static_conflicts() {
        let dir = TempDir::new().unwrap();
        let bf = bindings(&dir);
        std::fs::write(bf.path(), format!("{}mpatha WWA\n", BINDINGS_FILE_HEADER)).unwrap();

        let mut mptable = vec![
            MpEntry {
                wwid: "W1".to_string(),
                alias: Some("shared".to_string()),
                ..Default::default()
            },
            MpEntry {
                wwid: "W2".to_string(),
                alias: Some("shared".to_string()),
                ..Default::default()
            },
        ];
        bf.check_and_repair(&mut mptable, false).unwrap();
        let kept: Vec<_> = mptable.iter().filter(|m| m.alias.is_some()).collect();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_static_alias_conflicting_with_file_is_dropped_from_file() {
        let dir = TempDir::new().unwrap();
        let bf = bindings(&dir);
        std::fs::write(
            bf.path(),
            format!("{}yellow WWFILE\nmpatha WWA\n", BINDINGS_FILE_HEADER),
        )
        .unwrap();

        let mut mptable = vec![MpEntry {
            wwid: "WWCONF".to_string(),
            alias: Some("yellow".to_string()),
            ..Default::default()
        }];
        let repaired = bf.check_and_repair(&mut mptable, false).unwrap();
        assert!(repaired);
        let content = std::fs::read_to_string(bf.path()).unwrap();
        assert!(!content.contains("WWFILE"));
        assert!(content.contains("mpatha WWA\n"));
    }
}
