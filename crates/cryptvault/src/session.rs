use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use vaultproto::{CharacterIdentity, SessionId};

use crate::backups::{BackupConfig, BackupRotator};
use crate::error::{LockError, RecoveryError, SaveError};
use crate::recovery::{RecoveryManager, RestoredSession};
use crate::registry::LockRegistry;
use crate::saves::SaveWriter;
use crate::{now_unix, VaultConfig};

/// One party member the session wants to claim.
#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub identity: CharacterIdentity,
    pub display_name: String,
    pub role_tag: String,
}

impl RosterEntry {
    pub fn new(display_name: &str, role_tag: &str, created_at_unix: u64) -> Self {
        Self {
            identity: CharacterIdentity::derive(display_name, role_tag, created_at_unix),
            display_name: display_name.to_string(),
            role_tag: role_tag.to_string(),
        }
    }
}

/// Per-session front door over the whole subsystem: claims the roster
/// up front (all-or-nothing), then routes every save and snapshot through
/// the session's own files. Dropping it without `end` leaves the locks held
/// on purpose; that is the crash case sweep and restore exist for.
#[derive(Debug)]
pub struct ExclusiveSession {
    id: SessionId,
    registry: Arc<Mutex<LockRegistry>>,
    writer: SaveWriter,
    rotator: BackupRotator,
    roster: Vec<CharacterIdentity>,
    ended: bool,
}

impl ExclusiveSession {
    /// Start a new adventure: mint a session id and claim every roster
    /// character. If any claim loses, everything taken so far is released and
    /// the `AlreadyLocked` error reports who holds the contested character.
    pub async fn begin(
        registry: Arc<Mutex<LockRegistry>>,
        cfg: &VaultConfig,
        roster: &[RosterEntry],
    ) -> Result<Self, LockError> {
        let id = SessionId::mint();
        let now = now_unix();

        {
            let mut reg = registry.lock().await;
            let mut acquired: Vec<CharacterIdentity> = Vec::new();
            for r in roster {
                match reg.acquire(r.identity.clone(), id, &r.display_name, &r.role_tag, now) {
                    Ok(()) => acquired.push(r.identity.clone()),
                    Err(e) => {
                        for taken in &acquired {
                            let _ = reg.release(taken);
                        }
                        return Err(e);
                    }
                }
            }
        }

        info!(session=%id, party=roster.len(), "exclusive session started");
        Ok(Self {
            id,
            registry,
            writer: SaveWriter::new(cfg.saves_dir()),
            rotator: backup_rotator(cfg),
            roster: roster.iter().map(|r| r.identity.clone()).collect(),
            ended: false,
        })
    }

    /// Resume a crashed session from its newest trustworthy record,
    /// re-acquiring exactly the characters that record references.
    pub async fn resume(
        registry: Arc<Mutex<LockRegistry>>,
        cfg: &VaultConfig,
        session: SessionId,
    ) -> Result<(Self, RestoredSession), RecoveryError> {
        let writer = SaveWriter::new(cfg.saves_dir());
        let rotator = backup_rotator(cfg);
        let mgr = RecoveryManager::new(writer.clone(), rotator.clone());

        let restored = {
            let mut reg = registry.lock().await;
            mgr.restore(&mut reg, session, now_unix())?
        };

        let me = Self {
            id: session,
            registry,
            writer,
            rotator,
            roster: restored.roster.clone(),
            ended: false,
        };
        Ok((me, restored))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn roster(&self) -> &[CharacterIdentity] {
        &self.roster
    }

    /// Overwrite this session's canonical save.
    pub fn save(&self, payload: &[u8]) -> Result<PathBuf, SaveError> {
        self.writer.write(self.id, payload, &self.roster)
    }

    /// Push a snapshot onto the session's backup ring.
    pub fn snapshot(&self, payload: &[u8]) -> Result<PathBuf, SaveError> {
        self.rotator.snapshot(self.id, payload, &self.roster)
    }

    /// Graceful teardown: release every lock this session holds. Idempotent.
    pub async fn end(&mut self) -> Result<Vec<CharacterIdentity>, LockError> {
        if self.ended {
            return Ok(Vec::new());
        }
        let released = {
            let mut reg = self.registry.lock().await;
            reg.release_all(self.id)?
        };
        self.ended = true;
        info!(session=%self.id, released=released.len(), "exclusive session ended");
        Ok(released)
    }
}

fn backup_rotator(cfg: &VaultConfig) -> BackupRotator {
    BackupRotator::new(BackupConfig {
        dir: cfg.backups_dir(),
        keep: cfg.backup_keep,
        retention_days: cfg.backup_retention_days,
        ..BackupConfig::default()
    })
}
