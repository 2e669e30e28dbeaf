//! cryptvault
//!
//! Multiplayer save exclusivity for cryptcrawl: a character claimed by one
//! adventure session cannot be attached to another until it is released, every
//! save file is checksum-stamped and bound to its owning session, and a killed
//! session can be resumed from the newest snapshot that still verifies.

pub mod backups;
pub mod checksum;
pub mod envelope;
pub mod error;
pub mod recovery;
pub mod registry;
pub mod saves;
pub mod session;
pub mod verify;

use std::path::{Path, PathBuf};

pub use vaultproto::{CharacterIdentity, SessionId};

/// Where the three file classes live under one vault root.
#[derive(Clone, Debug)]
pub struct VaultConfig {
    pub root: PathBuf,
    /// Locks older than this are dead sessions; swept at startup and on demand.
    pub lock_ttl_s: u64,
    /// Per-session backup ring size.
    pub backup_keep: usize,
    /// Backups past this age are eligible for cleanup.
    pub backup_retention_days: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            lock_ttl_s: 24 * 60 * 60,
            backup_keep: 3,
            backup_retention_days: 30,
        }
    }
}

impl VaultConfig {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn lock_table_path(&self) -> PathBuf {
        self.root.join("character_locks.json")
    }

    pub fn saves_dir(&self) -> PathBuf {
        self.root.join("multiplayer_saves")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("adventure_backups")
    }
}

pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn atomic_write_json(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
