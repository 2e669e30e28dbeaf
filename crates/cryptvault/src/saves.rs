use std::path::{Path, PathBuf};

use vaultproto::{CharacterIdentity, SessionId};

use crate::envelope::SaveEnvelope;
use crate::error::SaveError;
use crate::now_unix;

/// Canonical save filename for a session. The name is derived from the
/// session id alone, so two sessions can never collide on a path and a file
/// claiming a different owner is detectable by name.
pub fn canonical_save_name(session: SessionId) -> String {
    format!("mp_exclusive_{}.json", session.to_hex())
}

pub fn parse_canonical_save_name(name: &str) -> Option<SessionId> {
    let rest = name.strip_prefix("mp_exclusive_")?;
    let hex = rest.strip_suffix(".json")?;
    SessionId::parse_hex(hex)
}

/// Persists one session's full state to its single canonical file,
/// overwritten on each write. Within a session writes are strictly ordered:
/// each completes (temp file, then rename) before the next begins.
#[derive(Debug, Clone)]
pub struct SaveWriter {
    dir: PathBuf,
}

impl SaveWriter {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn canonical_path(&self, session: SessionId) -> PathBuf {
        self.dir.join(canonical_save_name(session))
    }

    pub fn write(
        &self,
        session: SessionId,
        payload: &[u8],
        locked_identities: &[CharacterIdentity],
    ) -> Result<PathBuf, SaveError> {
        let path = self.canonical_path(session);
        let env = SaveEnvelope::build(session, payload, locked_identities, now_unix());
        let s = serde_json::to_string_pretty(&env).map_err(|e| SaveError::Encode {
            path: path.clone(),
            source: e,
        })?;
        crate::atomic_write_json(&path, s.as_bytes()).map_err(|e| SaveError::Io {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }
}
