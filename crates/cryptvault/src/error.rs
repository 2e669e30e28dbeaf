use std::path::PathBuf;

use thiserror::Error;
use vaultproto::{CharacterIdentity, SessionId};

/// Lock Registry failures. `AlreadyLocked` is an expected outcome callers
/// branch on, not a fault.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("character {identity} is already locked by session {owner}")]
    AlreadyLocked {
        identity: CharacterIdentity,
        owner: SessionId,
    },

    #[error("lock table {path:?} is malformed: {detail}")]
    Malformed { path: PathBuf, detail: String },

    #[error("lock table i/o on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a save/backup file cannot be trusted. All variants are terminal for
/// that file; nothing here repairs anything in place.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("checksum mismatch in {path:?}: stored {stored}, computed {computed}")]
    ChecksumMismatch {
        path: PathBuf,
        stored: String,
        computed: String,
    },

    #[error("{path:?} declares session {declared} but is not that session's file")]
    FilenameSpoofed { path: PathBuf, declared: SessionId },

    #[error("{path:?} is malformed: {detail}")]
    Malformed { path: PathBuf, detail: String },

    #[error("i/o reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("i/o writing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not encode envelope for {path:?}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Another session has since claimed a character this record references.
    /// Recovery aborts entirely; no partial re-acquire survives.
    #[error("character {identity} was claimed by session {owner} since the save was written")]
    IdentityContested {
        identity: CharacterIdentity,
        owner: SessionId,
    },

    #[error("no verifiable save or backup exists for session {session}")]
    NoUsableSave { session: SessionId },

    #[error("no verifiable save exists in the vault")]
    NothingToRestore,

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("i/o during recovery on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
