use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;
use vaultproto::{CharacterIdentity, SessionId};

use crate::error::LockError;

/// One held claim: which session owns a character, since when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    pub session_id: SessionId,
    pub acquired_at_unix: u64,
    // Denormalized for human-readable lock reports; identity never depends on
    // these.
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub role_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LockTableFile {
    #[serde(default)]
    pub v: u32,
    #[serde(default)]
    pub updated_unix: u64,
    #[serde(default)]
    pub locks: BTreeMap<String, LockEntry>,
}

/// Single source of truth for "which session owns which character".
///
/// One owned object per vault; callers share it behind a mutex and the table
/// is flushed to disk after every mutation, so a crash never silently releases
/// locks. Re-acquiring under the same session id succeeds and refreshes the
/// timestamp; that is how a restored session steps back into its own locks.
#[derive(Debug)]
pub struct LockRegistry {
    path: PathBuf,
    locks: HashMap<CharacterIdentity, LockEntry>,
    updated_unix: u64,
}

impl LockRegistry {
    /// An absent table file is the normal first-run state, not an error.
    pub fn open(path: PathBuf) -> Result<Self, LockError> {
        let s = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    locks: HashMap::new(),
                    updated_unix: 0,
                });
            }
            Err(e) => return Err(LockError::Io { path, source: e }),
        };

        let file: LockTableFile = serde_json::from_str(&s).map_err(|e| LockError::Malformed {
            path: path.clone(),
            detail: e.to_string(),
        })?;

        let mut locks = HashMap::new();
        for (key, entry) in file.locks {
            let Some(identity) = CharacterIdentity::parse(&key) else {
                return Err(LockError::Malformed {
                    path,
                    detail: format!("bad identity key {key:?}"),
                });
            };
            locks.insert(identity, entry);
        }

        Ok(Self {
            path,
            locks,
            updated_unix: file.updated_unix,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Never blocks; reads the in-memory table.
    pub fn is_locked(&self, identity: &CharacterIdentity) -> Option<&LockEntry> {
        self.locks.get(identity)
    }

    pub fn held_by(&self, session: SessionId) -> Vec<CharacterIdentity> {
        let mut out = self
            .locks
            .iter()
            .filter(|(_, e)| e.session_id == session)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        out.sort();
        out
    }

    /// Claim a character for a session. Losing to an existing holder is an
    /// expected outcome; the table is untouched in that case. A repeat acquire
    /// by the holding session refreshes `acquired_at_unix`.
    pub fn acquire(
        &mut self,
        identity: CharacterIdentity,
        session: SessionId,
        display_name: &str,
        role_tag: &str,
        now_unix: u64,
    ) -> Result<(), LockError> {
        if let Some(existing) = self.locks.get(&identity) {
            if existing.session_id != session {
                return Err(LockError::AlreadyLocked {
                    identity,
                    owner: existing.session_id,
                });
            }
        }

        self.locks.insert(
            identity,
            LockEntry {
                session_id: session,
                acquired_at_unix: now_unix,
                display_name: display_name.trim().to_string(),
                role_tag: role_tag.trim().to_string(),
            },
        );
        self.updated_unix = now_unix.max(self.updated_unix);
        self.save()
    }

    /// Idempotent: releasing an unheld identity is a no-op, and no-ops are not
    /// flushed.
    pub fn release(&mut self, identity: &CharacterIdentity) -> Result<bool, LockError> {
        if self.locks.remove(identity).is_none() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Session teardown: drop every lock the session holds.
    pub fn release_all(&mut self, session: SessionId) -> Result<Vec<CharacterIdentity>, LockError> {
        let released = self.held_by(session);
        if released.is_empty() {
            return Ok(released);
        }
        for id in &released {
            self.locks.remove(id);
        }
        self.save()?;
        Ok(released)
    }

    /// Liveness safety valve for crashed sessions; not the primary release
    /// path. Returns the identities freed.
    pub fn sweep_expired(
        &mut self,
        now_unix: u64,
        ttl_s: u64,
    ) -> Result<Vec<CharacterIdentity>, LockError> {
        let mut expired = self
            .locks
            .iter()
            .filter(|(_, e)| now_unix.saturating_sub(e.acquired_at_unix) > ttl_s)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        expired.sort();

        if expired.is_empty() {
            return Ok(expired);
        }
        for id in &expired {
            if let Some(e) = self.locks.remove(id) {
                info!(identity=%id, session=%e.session_id, age_s=now_unix.saturating_sub(e.acquired_at_unix), "expired stale character lock");
            }
        }
        self.updated_unix = now_unix.max(self.updated_unix);
        self.save()?;
        Ok(expired)
    }

    pub fn snapshot_file(&self) -> LockTableFile {
        let mut locks = BTreeMap::new();
        for (id, entry) in &self.locks {
            locks.insert(id.to_string(), entry.clone());
        }
        LockTableFile {
            v: 1,
            updated_unix: self.updated_unix,
            locks,
        }
    }

    fn save(&self) -> Result<(), LockError> {
        let file = self.snapshot_file();
        let s = serde_json::to_string_pretty(&file).map_err(|e| LockError::Malformed {
            path: self.path.clone(),
            detail: e.to_string(),
        })?;
        crate::atomic_write_json(&self.path, s.as_bytes()).map_err(|e| LockError::Io {
            path: self.path.clone(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use vaultproto::{CharacterIdentity, SessionId};

    use super::LockRegistry;
    use crate::error::LockError;

    fn ids() -> (CharacterIdentity, CharacterIdentity) {
        (
            CharacterIdentity::derive("ash", "ranger", 100),
            CharacterIdentity::derive("morgath", "warlock", 200),
        )
    }

    #[test]
    fn second_session_loses_and_table_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = LockRegistry::open(dir.path().join("character_locks.json")).unwrap();
        let (a, _) = ids();
        let (s1, s2) = (SessionId(1), SessionId(2));

        reg.acquire(a.clone(), s1, "Ash", "ranger", 10).unwrap();
        let err = reg.acquire(a.clone(), s2, "Ash", "ranger", 11).unwrap_err();
        match err {
            LockError::AlreadyLocked { identity, owner } => {
                assert_eq!(identity, a);
                assert_eq!(owner, s1);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let held = reg.is_locked(&a).expect("still locked");
        assert_eq!(held.session_id, s1);
        assert_eq!(held.acquired_at_unix, 10);
    }

    #[test]
    fn same_session_reacquire_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = LockRegistry::open(dir.path().join("character_locks.json")).unwrap();
        let (a, _) = ids();
        let s1 = SessionId(1);

        reg.acquire(a.clone(), s1, "Ash", "ranger", 10).unwrap();
        reg.acquire(a.clone(), s1, "Ash", "ranger", 20).unwrap();
        assert_eq!(reg.is_locked(&a).unwrap().acquired_at_unix, 20);
    }

    #[test]
    fn release_is_idempotent_even_for_never_locked() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = LockRegistry::open(dir.path().join("character_locks.json")).unwrap();
        let (a, b) = ids();

        reg.acquire(a.clone(), SessionId(1), "Ash", "ranger", 10)
            .unwrap();
        assert!(reg.release(&a).unwrap());
        assert!(!reg.release(&a).unwrap());
        assert!(!reg.release(&b).unwrap());
        assert!(reg.is_locked(&a).is_none());
    }

    #[test]
    fn release_all_only_touches_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = LockRegistry::open(dir.path().join("character_locks.json")).unwrap();
        let (a, b) = ids();
        let c = CharacterIdentity::derive("tilly", "cleric", 300);

        reg.acquire(a.clone(), SessionId(1), "Ash", "ranger", 10)
            .unwrap();
        reg.acquire(b.clone(), SessionId(1), "Morgath", "warlock", 10)
            .unwrap();
        reg.acquire(c.clone(), SessionId(2), "Tilly", "cleric", 10)
            .unwrap();

        let mut released = reg.release_all(SessionId(1)).unwrap();
        released.sort();
        let mut expect = vec![a.clone(), b.clone()];
        expect.sort();
        assert_eq!(released, expect);
        assert!(reg.is_locked(&a).is_none());
        assert!(reg.is_locked(&c).is_some());
    }

    #[test]
    fn sweep_frees_only_stale_locks_and_allows_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = LockRegistry::open(dir.path().join("character_locks.json")).unwrap();
        let (a, b) = ids();

        reg.acquire(a.clone(), SessionId(1), "Ash", "ranger", 100)
            .unwrap();
        reg.acquire(b.clone(), SessionId(2), "Morgath", "warlock", 900)
            .unwrap();

        let swept = reg.sweep_expired(1_000, 500).unwrap();
        assert_eq!(swept, vec![a.clone()]);
        assert!(reg.is_locked(&a).is_none());
        assert!(reg.is_locked(&b).is_some());

        reg.acquire(a.clone(), SessionId(3), "Ash", "ranger", 1_001)
            .unwrap();
        assert_eq!(reg.is_locked(&a).unwrap().session_id, SessionId(3));
    }

    #[test]
    fn table_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("character_locks.json");
        let (a, _) = ids();

        {
            let mut reg = LockRegistry::open(path.clone()).unwrap();
            reg.acquire(a.clone(), SessionId(9), "Ash", "ranger", 10)
                .unwrap();
        }

        let reg = LockRegistry::open(path).unwrap();
        let held = reg.is_locked(&a).expect("persisted");
        assert_eq!(held.session_id, SessionId(9));
        assert_eq!(held.display_name, "Ash");
    }

    #[test]
    fn malformed_table_is_an_error_not_an_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("character_locks.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            LockRegistry::open(path),
            Err(LockError::Malformed { .. })
        ));
    }

    #[test]
    fn racing_acquires_have_exactly_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Arc::new(Mutex::new(
            LockRegistry::open(dir.path().join("character_locks.json")).unwrap(),
        ));
        let (a, _) = ids();

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let reg = reg.clone();
            let a = a.clone();
            handles.push(std::thread::spawn(move || {
                reg.lock()
                    .unwrap()
                    .acquire(a, SessionId(i as u128 + 1), "Ash", "ranger", 10)
                    .is_ok()
            }));
        }

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
        assert!(reg.lock().unwrap().is_locked(&a).is_some());
    }
}
