use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{info, warn};
use vaultproto::{CharacterIdentity, SessionId};

use crate::envelope::SaveEnvelope;
use crate::error::SaveError;
use crate::now_unix;
use crate::verify::verify_file;

#[derive(Clone, Debug)]
pub struct BackupConfig {
    pub dir: PathBuf,
    /// Ring size per session.
    pub keep: usize,
    /// Entries older than this are eligible for `cleanup_older_than`.
    pub retention_days: u64,
    pub channel_capacity: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("adventure_backups"),
            keep: 3,
            retention_days: 30,
            channel_capacity: 64,
        }
    }
}

pub fn backup_file_name(session: SessionId, ordinal: u64) -> String {
    format!("emergency_backup_{}_{:06}.json", session.to_hex(), ordinal)
}

pub fn parse_backup_file_name(name: &str) -> Option<(SessionId, u64)> {
    let rest = name.strip_prefix("emergency_backup_")?;
    let stem = rest.strip_suffix(".json")?;
    let (hex, ord_s) = stem.split_at(stem.find('_')?);
    let session = SessionId::parse_hex(hex)?;
    let ordinal = ord_s.strip_prefix('_')?.parse::<u64>().ok()?;
    Some((session, ordinal))
}

/// Bounded history of recent session snapshots, independent of the canonical
/// save, so an in-progress adventure can be rolled back after a bad outcome
/// or a crash. Ordinals only ever grow within a session; the ring keeps the
/// newest `keep` entries and the prune step never runs before the fresh
/// snapshot is durably on disk.
#[derive(Debug, Clone)]
pub struct BackupRotator {
    cfg: BackupConfig,
}

impl BackupRotator {
    pub fn new(cfg: BackupConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.cfg
    }

    /// All backup files for a session, newest ordinal first.
    pub fn list(&self, session: SessionId) -> Result<Vec<(u64, PathBuf)>, SaveError> {
        let rd = match std::fs::read_dir(&self.cfg.dir) {
            Ok(rd) => rd,
            // No directory yet means no backups yet, same as an absent lock
            // table.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SaveError::Io {
                    path: self.cfg.dir.clone(),
                    source: e,
                })
            }
        };

        let mut out = Vec::new();
        for ent in rd {
            let ent = ent.map_err(|e| SaveError::Io {
                path: self.cfg.dir.clone(),
                source: e,
            })?;
            let name = ent.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some((sid, ordinal)) = parse_backup_file_name(name) else {
                continue;
            };
            if sid != session {
                continue;
            }
            out.push((ordinal, ent.path()));
        }
        out.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(out)
    }

    /// Write a new ring entry, then prune everything beyond the retention
    /// count.
    pub fn snapshot(
        &self,
        session: SessionId,
        payload: &[u8],
        locked_identities: &[CharacterIdentity],
    ) -> Result<PathBuf, SaveError> {
        let existing = self.list(session)?;
        let ordinal = existing.first().map(|(o, _)| o + 1).unwrap_or(1);

        let path = self.cfg.dir.join(backup_file_name(session, ordinal));
        let mut env = SaveEnvelope::build(session, payload, locked_identities, now_unix());
        env.ordinal = Some(ordinal);
        let s = serde_json::to_string_pretty(&env).map_err(|e| SaveError::Encode {
            path: path.clone(),
            source: e,
        })?;
        crate::atomic_write_json(&path, s.as_bytes()).map_err(|e| SaveError::Io {
            path: path.clone(),
            source: e,
        })?;

        // The new entry is durable; now bound the ring.
        let keep = self.cfg.keep.max(1);
        for (ordinal, old) in self.list(session)?.into_iter().skip(keep) {
            if let Err(e) = std::fs::remove_file(&old) {
                warn!(err=%e, ordinal, path=%old.display(), "backup prune failed");
            }
        }

        Ok(path)
    }

    /// Newest backup that still verifies; unverifiable entries are skipped,
    /// which is what heals a truncated write left by a crash.
    pub fn latest(&self, session: SessionId) -> Result<Option<PathBuf>, SaveError> {
        for (ordinal, path) in self.list(session)? {
            match verify_file(&path) {
                Ok(_) => return Ok(Some(path)),
                Err(e) => {
                    warn!(err=%e, ordinal, path=%path.display(), "skipping unverifiable backup");
                }
            }
        }
        Ok(None)
    }

    /// Retention-window cleanup across all sessions. Only entries that parse
    /// and verify are aged out; a corrupt file is reported by `latest`'s
    /// skip path and deciding its fate belongs to the operator.
    pub fn cleanup_older_than(&self, now_unix: u64, max_age_s: u64) -> Result<usize, SaveError> {
        let rd = match std::fs::read_dir(&self.cfg.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(SaveError::Io {
                    path: self.cfg.dir.clone(),
                    source: e,
                })
            }
        };

        let mut removed = 0usize;
        for ent in rd {
            let ent = ent.map_err(|e| SaveError::Io {
                path: self.cfg.dir.clone(),
                source: e,
            })?;
            let name = ent.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if parse_backup_file_name(name).is_none() {
                continue;
            }
            let path = ent.path();
            let Ok(env) = verify_file(&path) else {
                continue;
            };
            if now_unix.saturating_sub(env.created_at_unix) <= max_age_s {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(err=%e, path=%path.display(), "retention cleanup failed"),
            }
        }
        Ok(removed)
    }
}

struct SpoolJob {
    payload: Vec<u8>,
    locked_identities: Vec<CharacterIdentity>,
}

/// Fire-and-forget front for the rotator: game code hands over a state blob
/// and keeps running; a background task does the write. Correctness never
/// depends on this path, so a full channel or a failed write only warns.
#[derive(Clone)]
pub struct BackupSpool {
    tx: Option<mpsc::Sender<SpoolJob>>,
}

impl BackupSpool {
    pub fn start(rotator: BackupRotator, session: SessionId) -> Self {
        let capacity = rotator.cfg.channel_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        tokio::spawn(spool_task(rotator, session, rx));
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn try_snapshot(&self, payload: &[u8], locked_identities: &[CharacterIdentity]) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        let _ = tx.try_send(SpoolJob {
            payload: payload.to_vec(),
            locked_identities: locked_identities.to_vec(),
        });
    }
}

async fn spool_task(rotator: BackupRotator, session: SessionId, mut rx: mpsc::Receiver<SpoolJob>) {
    while let Some(SpoolJob {
        payload,
        locked_identities,
    }) = rx.recv().await
    {
        let r = rotator.clone();
        let res = tokio::task::spawn_blocking(move || {
            r.snapshot(session, &payload, &locked_identities)
        })
        .await;
        match res {
            Ok(Ok(path)) => {
                info!(session=%session, path=%path.display(), "emergency backup written");
            }
            Ok(Err(e)) => warn!(err=%e, session=%session, "emergency backup failed"),
            Err(e) => warn!(err=%e, session=%session, "emergency backup task died"),
        }
    }
}
