use std::path::PathBuf;

use tracing::{info, warn};
use vaultproto::{CharacterIdentity, SessionId};

use crate::backups::BackupRotator;
use crate::envelope::SaveEnvelope;
use crate::error::{LockError, RecoveryError};
use crate::registry::LockRegistry;
use crate::saves::{parse_canonical_save_name, SaveWriter};
use crate::verify::verify_file;

/// What a successful restore hands back to the game layer.
#[derive(Debug)]
pub struct RestoredSession {
    pub session: SessionId,
    pub payload: Vec<u8>,
    pub roster: Vec<CharacterIdentity>,
    pub source: PathBuf,
    pub created_at_unix: u64,
}

/// Turns files on disk back into a running session with correctly re-held
/// locks. The canonical save wins when it verifies; otherwise the newest
/// verifiable backup. Lock re-acquisition is all-or-nothing: one contested
/// character aborts the whole restore and rolls back anything taken so far,
/// so two sessions can never both believe they own a character.
#[derive(Debug)]
pub struct RecoveryManager {
    saves: SaveWriter,
    backups: BackupRotator,
}

impl RecoveryManager {
    pub fn new(saves: SaveWriter, backups: BackupRotator) -> Self {
        Self { saves, backups }
    }

    pub fn restore(
        &self,
        registry: &mut LockRegistry,
        session: SessionId,
        now_unix: u64,
    ) -> Result<RestoredSession, RecoveryError> {
        let (env, source) = self.pick_record(session)?;

        let payload = env.payload().map_err(|e| RecoveryError::Io {
            path: source.clone(),
            // verify_file already decoded this once; a failure here means the
            // file changed under us
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        let mut acquired: Vec<CharacterIdentity> = Vec::new();
        for identity in &env.locked_identities {
            match registry.acquire(identity.clone(), session, "", "", now_unix) {
                Ok(()) => acquired.push(identity.clone()),
                Err(LockError::AlreadyLocked { identity, owner }) => {
                    rollback(registry, &acquired);
                    return Err(RecoveryError::IdentityContested { identity, owner });
                }
                Err(e) => {
                    rollback(registry, &acquired);
                    return Err(e.into());
                }
            }
        }

        info!(
            session=%session,
            source=%source.display(),
            characters=env.locked_identities.len(),
            "session restored"
        );

        Ok(RestoredSession {
            session,
            payload,
            roster: env.locked_identities,
            source,
            created_at_unix: env.created_at_unix,
        })
    }

    /// Restore whichever session has the newest verifiable record in the
    /// vault: the "just resume my game" path after an unclean shutdown.
    pub fn restore_latest(
        &self,
        registry: &mut LockRegistry,
        now_unix: u64,
    ) -> Result<RestoredSession, RecoveryError> {
        let mut best: Option<(u64, SessionId)> = None;
        for (session, created) in self.scan_candidates()? {
            if best.map(|(ts, _)| created > ts).unwrap_or(true) {
                best = Some((created, session));
            }
        }
        let Some((_, session)) = best else {
            return Err(RecoveryError::NothingToRestore);
        };
        self.restore(registry, session, now_unix)
    }

    fn pick_record(&self, session: SessionId) -> Result<(SaveEnvelope, PathBuf), RecoveryError> {
        let canonical = self.saves.canonical_path(session);
        match verify_file(&canonical) {
            Ok(env) => return Ok((env, canonical)),
            Err(crate::error::IntegrityError::Io { ref source, .. })
                if source.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(err=%e, path=%canonical.display(), "canonical save not trusted; trying backups");
            }
        }

        if let Some(path) = self
            .backups
            .latest(session)
            .map_err(save_error_to_recovery)?
        {
            // latest() only returns verified paths
            if let Ok(env) = verify_file(&path) {
                return Ok((env, path));
            }
        }

        Err(RecoveryError::NoUsableSave { session })
    }

    /// Every session with at least one verifiable record, with the newest
    /// record timestamp seen for it.
    fn scan_candidates(&self) -> Result<Vec<(SessionId, u64)>, RecoveryError> {
        let mut out: Vec<(SessionId, u64)> = Vec::new();

        let rd = match std::fs::read_dir(self.saves.dir()) {
            Ok(rd) => Some(rd),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(RecoveryError::Io {
                    path: self.saves.dir().to_path_buf(),
                    source: e,
                })
            }
        };
        if let Some(rd) = rd {
            for ent in rd {
                let ent = ent.map_err(|e| RecoveryError::Io {
                    path: self.saves.dir().to_path_buf(),
                    source: e,
                })?;
                let name = ent.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(session) = parse_canonical_save_name(name) else {
                    continue;
                };
                match verify_file(&ent.path()) {
                    Ok(env) => push_candidate(&mut out, session, env.created_at_unix),
                    Err(e) => {
                        warn!(err=%e, path=%ent.path().display(), "skipping unverifiable save");
                    }
                }
            }
        }

        // A session whose canonical save never landed can still be resumed
        // from its ring.
        for (session, path) in self.scan_backup_sessions()? {
            if let Ok(env) = verify_file(&path) {
                push_candidate(&mut out, session, env.created_at_unix);
            }
        }

        Ok(out)
    }

    fn scan_backup_sessions(&self) -> Result<Vec<(SessionId, PathBuf)>, RecoveryError> {
        let dir = self.backups.config().dir.clone();
        let rd = match std::fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RecoveryError::Io { path: dir, source: e }),
        };

        let mut sessions: Vec<SessionId> = Vec::new();
        for ent in rd {
            let ent = ent.map_err(|e| RecoveryError::Io {
                path: dir.clone(),
                source: e,
            })?;
            let name = ent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((session, _)) = crate::backups::parse_backup_file_name(name) else {
                continue;
            };
            if !sessions.contains(&session) {
                sessions.push(session);
            }
        }

        let mut out = Vec::new();
        for session in sessions {
            if let Some(path) = self
                .backups
                .latest(session)
                .map_err(save_error_to_recovery)?
            {
                out.push((session, path));
            }
        }
        Ok(out)
    }
}

fn push_candidate(out: &mut Vec<(SessionId, u64)>, session: SessionId, created: u64) {
    for (s, ts) in out.iter_mut() {
        if *s == session {
            *ts = (*ts).max(created);
            return;
        }
    }
    out.push((session, created));
}

fn rollback(registry: &mut LockRegistry, acquired: &[CharacterIdentity]) {
    for id in acquired {
        if let Err(e) = registry.release(id) {
            warn!(err=%e, identity=%id, "rollback release failed");
        }
    }
}

fn save_error_to_recovery(e: crate::error::SaveError) -> RecoveryError {
    match e {
        crate::error::SaveError::Io { path, source } => RecoveryError::Io { path, source },
        crate::error::SaveError::Encode { path, source } => RecoveryError::Io {
            path,
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, source),
        },
    }
}

#[cfg(test)]
mod tests {
    use vaultproto::{CharacterIdentity, SessionId};

    use super::RecoveryManager;
    use crate::backups::{BackupConfig, BackupRotator};
    use crate::error::RecoveryError;
    use crate::registry::LockRegistry;
    use crate::saves::SaveWriter;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: LockRegistry,
        saves: SaveWriter,
        backups: BackupRotator,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = LockRegistry::open(dir.path().join("character_locks.json")).unwrap();
        let saves = SaveWriter::new(dir.path().join("multiplayer_saves"));
        let backups = BackupRotator::new(BackupConfig {
            dir: dir.path().join("adventure_backups"),
            ..BackupConfig::default()
        });
        Fixture {
            _dir: dir,
            registry,
            saves,
            backups,
        }
    }

    fn roster() -> Vec<CharacterIdentity> {
        vec![
            CharacterIdentity::derive("ash", "ranger", 1),
            CharacterIdentity::derive("morgath", "warlock", 2),
        ]
    }

    #[test]
    fn restore_prefers_canonical_and_relocks_exactly_the_roster() {
        let mut f = fixture();
        let sid = SessionId(1);
        let roster = roster();

        f.saves.write(sid, b"canonical", &roster).unwrap();
        f.backups.snapshot(sid, b"older backup", &roster).unwrap();

        let mgr = RecoveryManager::new(f.saves.clone(), f.backups.clone());
        let restored = mgr.restore(&mut f.registry, sid, 100).unwrap();

        assert_eq!(restored.payload, b"canonical");
        assert_eq!(restored.roster, roster);
        for id in &roster {
            assert_eq!(f.registry.is_locked(id).unwrap().session_id, sid);
        }
        assert_eq!(f.registry.len(), roster.len());
    }

    #[test]
    fn corrupt_canonical_falls_back_to_newest_good_backup() {
        let mut f = fixture();
        let sid = SessionId(2);
        let roster = roster();

        let canonical = f.saves.write(sid, b"canonical", &roster).unwrap();
        f.backups.snapshot(sid, b"ring-1", &roster).unwrap();
        f.backups.snapshot(sid, b"ring-2", &roster).unwrap();

        let s = std::fs::read_to_string(&canonical).unwrap();
        std::fs::write(&canonical, &s[..s.len() / 2]).unwrap();

        let mgr = RecoveryManager::new(f.saves.clone(), f.backups.clone());
        let restored = mgr.restore(&mut f.registry, sid, 100).unwrap();
        assert_eq!(restored.payload, b"ring-2");
    }

    #[test]
    fn contested_identity_aborts_with_no_partial_locks() {
        let mut f = fixture();
        let sid = SessionId(3);
        let thief = SessionId(66);
        let roster = roster();

        f.saves.write(sid, b"state", &roster).unwrap();

        // Another session grabbed the second character in the meantime.
        f.registry
            .acquire(roster[1].clone(), thief, "Morgath", "warlock", 50)
            .unwrap();

        let mgr = RecoveryManager::new(f.saves.clone(), f.backups.clone());
        let err = mgr.restore(&mut f.registry, sid, 100).unwrap_err();
        match err {
            RecoveryError::IdentityContested { identity, owner } => {
                assert_eq!(identity, roster[1]);
                assert_eq!(owner, thief);
            }
            other => panic!("unexpected: {other:?}"),
        }

        // all-or-nothing: the first roster member was rolled back, the
        // thief's lock is untouched
        assert!(f.registry.is_locked(&roster[0]).is_none());
        assert_eq!(f.registry.is_locked(&roster[1]).unwrap().session_id, thief);
        assert_eq!(f.registry.len(), 1);
    }

    #[test]
    fn crashed_session_restores_into_its_own_leftover_locks() {
        let mut f = fixture();
        let sid = SessionId(4);
        let roster = roster();

        // Locks persisted by the session before it was killed.
        for id in &roster {
            f.registry.acquire(id.clone(), sid, "", "", 40).unwrap();
        }
        f.saves.write(sid, b"state", &roster).unwrap();

        let mgr = RecoveryManager::new(f.saves.clone(), f.backups.clone());
        let restored = mgr.restore(&mut f.registry, sid, 100).unwrap();
        assert_eq!(restored.roster, roster);
        for id in &roster {
            assert_eq!(f.registry.is_locked(id).unwrap().session_id, sid);
        }
    }

    #[test]
    fn kill_mid_backup_write_restores_from_last_full_snapshot() {
        let mut f = fixture();
        let sid = SessionId(8);
        let roster = roster();

        // no canonical save landed before the kill; the ring has one full
        // snapshot and one truncated by the dying process
        f.backups.snapshot(sid, b"turn 40", &roster).unwrap();
        let half = f.backups.snapshot(sid, b"turn 41", &roster).unwrap();
        let s = std::fs::read_to_string(&half).unwrap();
        std::fs::write(&half, &s[..s.len() / 2]).unwrap();

        let mgr = RecoveryManager::new(f.saves.clone(), f.backups.clone());
        let restored = mgr.restore(&mut f.registry, sid, 100).unwrap();
        assert_eq!(restored.payload, b"turn 40");
        assert_eq!(restored.roster, roster);
        for id in &roster {
            assert_eq!(f.registry.is_locked(id).unwrap().session_id, sid);
        }
        assert_eq!(f.registry.len(), roster.len());
    }

    #[test]
    fn nothing_on_disk_is_no_usable_save() {
        let mut f = fixture();
        let sid = SessionId(5);
        let mgr = RecoveryManager::new(f.saves.clone(), f.backups.clone());
        assert!(matches!(
            mgr.restore(&mut f.registry, sid, 100),
            Err(RecoveryError::NoUsableSave { session }) if session == sid
        ));
    }

    #[test]
    fn restore_latest_picks_the_newest_session_record() {
        let mut f = fixture();
        let a = SessionId(10);
        let b = SessionId(11);

        f.saves.write(a, b"session-a", &[]).unwrap();
        f.saves.write(b, b"session-b", &[]).unwrap();

        // force a strictly newer timestamp for b; created_at is metadata and
        // not under the payload checksum
        let path_b = f.saves.canonical_path(b);
        let mut env_b: crate::envelope::SaveEnvelope =
            serde_json::from_str(&std::fs::read_to_string(&path_b).unwrap()).unwrap();
        env_b.created_at_unix += 1_000;
        std::fs::write(&path_b, serde_json::to_string(&env_b).unwrap()).unwrap();

        let mgr = RecoveryManager::new(f.saves.clone(), f.backups.clone());
        let restored = mgr.restore_latest(&mut f.registry, 100).unwrap();
        assert_eq!(restored.session, b);
        assert_eq!(restored.payload, b"session-b");
    }

    #[test]
    fn restore_latest_with_empty_vault_is_nothing_to_restore() {
        let mut f = fixture();
        let mgr = RecoveryManager::new(f.saves.clone(), f.backups.clone());
        assert!(matches!(
            mgr.restore_latest(&mut f.registry, 100),
            Err(RecoveryError::NothingToRestore)
        ));
    }

    #[test]
    fn session_with_only_backups_is_still_recoverable_via_latest() {
        let mut f = fixture();
        let sid = SessionId(12);
        f.backups.snapshot(sid, b"ring-only", &[]).unwrap();

        let mgr = RecoveryManager::new(f.saves.clone(), f.backups.clone());
        let restored = mgr.restore_latest(&mut f.registry, 100).unwrap();
        assert_eq!(restored.session, sid);
        assert_eq!(restored.payload, b"ring-only");
    }
}
