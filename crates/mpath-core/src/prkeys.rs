//! Persistent reservation key store
//!
//! Remembers the registered reservation key per WWID so the key can be
//! reapplied after a daemon restart. Same textual discipline as the
//! bindings file: header banner, `keyhex[:aptpl] wwid` lines, flock-guarded
//! appends, atomic rewrite.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path as FsPath, PathBuf};

use log::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::platform::{durable_sync, fsync_dir, FileLock, LockKind};

pub const PRKEYS_FILE_HEADER: &str = "\
# Multipath persistent reservation keys, Version : 1.0
# NOTE: this file is automatically maintained by the multipathd program.
# You should not need to edit this file in normal circumstances.
#
# Format:
# prkey wwid
#
";

/// A registered reservation key; `aptpl` marks keys that must survive a
/// target power loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrKey {
    pub key: u64,
    pub aptpl: bool,
}

impl fmt::Display for PrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.aptpl {
            write!(f, "0x{:x}:aptpl", self.key)
        } else {
            write!(f, "0x{:x}", self.key)
        }
    }
}

impl PrKey {
    pub fn parse(s: &str) -> Option<Self> {
        let (hex, aptpl) = match s.strip_suffix(":aptpl") {
            Some(h) => (h, true),
            None => (s, false),
        };
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        u64::from_str_radix(hex, 16).ok().map(|key| PrKey { key, aptpl })
    }
}

/// The persistent prkeys file.
pub struct PrKeysFile {
    path: PathBuf,
}

impl PrKeysFile {
    pub fn new<P: AsRef<FsPath>>(path: P) -> Self {
        PrKeysFile {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &FsPath {
        &self.path
    }

    fn open(&self) -> CoreResult<File> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(&self.path)
            .map_err(|e| CoreError::io(&self.path, e, "open prkeys file"))?;
        let len = file
            .metadata()
            .map_err(|e| CoreError::io(&self.path, e, "stat prkeys file"))?
            .len();
        if len == 0 {
            file.write_all(PRKEYS_FILE_HEADER.as_bytes())
                .map_err(|e| CoreError::io(&self.path, e, "write prkeys header"))?;
            durable_sync(&file).map_err(|e| CoreError::io(&self.path, e, "sync prkeys header"))?;
        }
        Ok(file)
    }

    fn read_entries(file: &mut File) -> CoreResult<Vec<(PrKey, String)>> {
        let mut content = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut content)?;
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let mut tokens = line.split_whitespace();
            let (key, wwid) = match (tokens.next(), tokens.next()) {
                (Some(k), Some(w)) => (k, w),
                _ => continue,
            };
            match PrKey::parse(key) {
                Some(key) => entries.push((key, wwid.to_string())),
                None => debug!("ignoring malformed prkey \"{}\"", key),
            }
        }
        Ok(entries)
    }

    /// The stored key for `wwid`, if any.
    pub fn get_prkey(&self, wwid: &str) -> CoreResult<Option<PrKey>> {
        let mut file = self.open()?;
        let _lock = FileLock::new(&file, LockKind::Shared)
            .map_err(|e| CoreError::io(&self.path, e, "lock prkeys file"))?;
        let entries = Self::read_entries(&mut file)?;
        Ok(entries
            .into_iter()
            .find(|(_, w)| w == wwid)
            .map(|(key, _)| key))
    }

    /// Store (or replace) the key for `wwid`. A fresh WWID is appended
    /// under the write lock; replacing an existing entry rewrites the file
    /// atomically.
    pub fn set_prkey(&self, wwid: &str, key: PrKey) -> CoreResult<()> {
        let mut file = self.open()?;
        let _lock = FileLock::new(&file, LockKind::Exclusive)
            .map_err(|e| CoreError::io(&self.path, e, "lock prkeys file"))?;
        let mut entries = Self::read_entries(&mut file)?;

        match entries.iter_mut().find(|(_, w)| w == wwid) {
            Some(entry) => {
                if entry.0 == key {
                    return Ok(());
                }
                entry.0 = key;
                self.rewrite(&entries)?;
            }
            None => {
                let line = format!("{} {}\n", key, wwid);
                file.seek(SeekFrom::End(0))
                    .map_err(|e| CoreError::io(&self.path, e, "seek prkeys file"))?;
                file.write_all(line.as_bytes())
                    .map_err(|e| CoreError::io(&self.path, e, "append prkey"))?;
                durable_sync(&file).map_err(|e| CoreError::io(&self.path, e, "sync prkey"))?;
                debug!("stored prkey {} for WWID {}", key, wwid);
            }
        }
        Ok(())
    }

    /// Remove the key for `wwid`; no-op when none is stored.
    pub fn remove_prkey(&self, wwid: &str) -> CoreResult<()> {
        let mut file = self.open()?;
        let _lock = FileLock::new(&file, LockKind::Exclusive)
            .map_err(|e| CoreError::io(&self.path, e, "lock prkeys file"))?;
        let mut entries = Self::read_entries(&mut file)?;
        let before = entries.len();
        entries.retain(|(_, w)| w != wwid);
        if entries.len() != before {
            self.rewrite(&entries)?;
        }
        Ok(())
    }

    fn rewrite(&self, entries: &[(PrKey, String)]) -> CoreResult<()> {
        let dir = self
            .path
            .parent()
            .unwrap_or_else(|| FsPath::new("."))
            .to_path_buf();
        let mut tmp = tempfile::Builder::new()
            .prefix(".prkeys.")
            .tempfile_in(&dir)
            .map_err(|e| CoreError::io(&self.path, e, "create prkeys temp file"))?;
        tmp.write_all(PRKEYS_FILE_HEADER.as_bytes())
            .map_err(|e| CoreError::io(&self.path, e, "write prkeys temp file"))?;
        for (key, wwid) in entries {
            tmp.write_all(format!("{} {}\n", key, wwid).as_bytes())
                .map_err(|e| CoreError::io(&self.path, e, "write prkeys temp file"))?;
        }
        durable_sync(tmp.as_file())
            .map_err(|e| CoreError::io(&self.path, e, "sync prkeys temp file"))?;
        tmp.persist(&self.path)
            .map_err(|e| CoreError::io(&self.path, e.error, "rename prkeys file"))?;
        fsync_dir(&self.path).map_err(|e| CoreError::io(&self.path, e, "sync prkeys dir"))?;
        info!("updated prkeys file {}", self.path.display());
        Ok(())
    }
}
