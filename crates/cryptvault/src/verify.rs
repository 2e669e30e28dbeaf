use std::path::Path;

use crate::backups::backup_file_name;
use crate::checksum;
use crate::envelope::SaveEnvelope;
use crate::error::IntegrityError;
use crate::saves::canonical_save_name;

/// Decide whether a save/backup file may be trusted before its payload is
/// used. Checks, in order: structure, checksum, and that the on-disk name is
/// the one derivable from the envelope's own session id (a file copied or
/// renamed from another session's save fails that cross-check). Every failure
/// is terminal for the file; nothing is repaired in place.
pub fn verify_file(path: &Path) -> Result<SaveEnvelope, IntegrityError> {
    let s = std::fs::read_to_string(path).map_err(|e| IntegrityError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let env: SaveEnvelope = serde_json::from_str(&s).map_err(|e| IntegrityError::Malformed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    if env.checksum_algo != checksum::CHECKSUM_ALGO {
        return Err(IntegrityError::Malformed {
            path: path.to_path_buf(),
            detail: format!("unknown checksum algo {:?}", env.checksum_algo),
        });
    }

    let payload = env.payload().map_err(|e| IntegrityError::Malformed {
        path: path.to_path_buf(),
        detail: format!("payload is not valid base64: {e}"),
    })?;

    let computed = checksum::digest(&payload);
    if computed != env.checksum {
        return Err(IntegrityError::ChecksumMismatch {
            path: path.to_path_buf(),
            stored: env.checksum,
            computed,
        });
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| IntegrityError::Malformed {
            path: path.to_path_buf(),
            detail: "unreadable file name".to_string(),
        })?;

    let expected = match env.ordinal {
        Some(ordinal) => backup_file_name(env.session_id, ordinal),
        None => canonical_save_name(env.session_id),
    };
    if name != expected {
        return Err(IntegrityError::FilenameSpoofed {
            path: path.to_path_buf(),
            declared: env.session_id,
        });
    }

    Ok(env)
}
