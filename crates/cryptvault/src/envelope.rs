use base64::Engine;
use serde::{Deserialize, Serialize};
use vaultproto::{CharacterIdentity, SessionId};

use crate::checksum;

pub const ENVELOPE_VERSION: u32 = 1;

/// On-disk shape shared by canonical saves and backup ring entries. The
/// payload is opaque game state; this layer never looks inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveEnvelope {
    pub v: u32,
    pub checksum_algo: String,
    pub session_id: SessionId,
    /// Digest of the decoded payload bytes only; metadata excluded.
    pub checksum: String,
    pub created_at_unix: u64,
    /// Characters the session held when this record was written, so recovery
    /// knows what to re-acquire.
    #[serde(default)]
    pub locked_identities: Vec<CharacterIdentity>,
    pub payload_b64: String,
    /// Present on backup ring entries only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u64>,
}

impl SaveEnvelope {
    pub fn build(
        session: SessionId,
        payload: &[u8],
        locked_identities: &[CharacterIdentity],
        created_at_unix: u64,
    ) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            checksum_algo: checksum::CHECKSUM_ALGO.to_string(),
            session_id: session,
            checksum: checksum::digest(payload),
            created_at_unix,
            locked_identities: locked_identities.to_vec(),
            payload_b64: base64::engine::general_purpose::STANDARD.encode(payload),
            ordinal: None,
        }
    }

    /// Decode the payload blob. A broken base64 column means the record was
    /// tampered with or truncated; callers treat it like any other integrity
    /// failure.
    pub fn payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.payload_b64)
    }
}

#[cfg(test)]
mod tests {
    use vaultproto::{CharacterIdentity, SessionId};

    use super::SaveEnvelope;
    use crate::checksum;

    #[test]
    fn build_stamps_algo_and_checksum() {
        let sid = SessionId(42);
        let roster = vec![CharacterIdentity::derive("ash", "ranger", 100)];
        let env = SaveEnvelope::build(sid, b"blob", &roster, 1_700_000_000);

        assert_eq!(env.v, super::ENVELOPE_VERSION);
        assert_eq!(env.checksum_algo, checksum::CHECKSUM_ALGO);
        assert_eq!(env.checksum, checksum::digest(b"blob"));
        assert_eq!(env.payload().unwrap(), b"blob");
        assert_eq!(env.locked_identities, roster);
        assert!(env.ordinal.is_none());
    }

    #[test]
    fn json_round_trip_keeps_session_binding() {
        let env = SaveEnvelope::build(SessionId(7), b"x", &[], 5);
        let s = serde_json::to_string(&env).unwrap();
        let back: SaveEnvelope = serde_json::from_str(&s).unwrap();
        assert_eq!(back.session_id, SessionId(7));
        assert_eq!(back.checksum, env.checksum);
        // ordinal is absent from canonical saves, not null
        assert!(!s.contains("ordinal"));
    }

    #[test]
    fn bad_base64_fails_decode() {
        let mut env = SaveEnvelope::build(SessionId(1), b"x", &[], 5);
        env.payload_b64 = "@@@not base64@@@".to_string();
        assert!(env.payload().is_err());
    }
}
