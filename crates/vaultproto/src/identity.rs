use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::Digest;

/// Stable, content-derived id for one persisted character.
///
/// Derived from the attributes that never change after creation (name, role,
/// creation time), so two in-memory copies of the same character hash
/// identically no matter which session loaded them. 32 lowercase hex chars
/// (first 16 bytes of SHA-256), short enough to live in filenames and lock
/// reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterIdentity(String);

impl CharacterIdentity {
    pub const HEX_LEN: usize = 32;

    pub fn derive(name: &str, role_tag: &str, created_at_unix: u64) -> Self {
        let name_lc = name.trim().to_ascii_lowercase();
        let role_lc = role_tag.trim().to_ascii_lowercase();

        let mut h = sha2::Sha256::new();
        h.update(name_lc.as_bytes());
        h.update(b"|");
        h.update(role_lc.as_bytes());
        h.update(b"|");
        h.update(created_at_unix.to_be_bytes());
        let out = h.finalize();

        let mut s = String::with_capacity(Self::HEX_LEN);
        for x in &out[..Self::HEX_LEN / 2] {
            s.push_str(&format!("{:02x}", x));
        }
        Self(s)
    }

    /// Accept an already-derived id (CLI input, lock table keys).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() != Self::HEX_LEN {
            return None;
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return None;
        }
        Some(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CharacterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::CharacterIdentity;

    #[test]
    fn derive_is_deterministic_and_case_insensitive() {
        let a = CharacterIdentity::derive("Morgath", "warlock", 1_700_000_000);
        let b = CharacterIdentity::derive("  morgath ", "WARLOCK", 1_700_000_000);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), CharacterIdentity::HEX_LEN);
    }

    #[test]
    fn distinct_attributes_produce_distinct_ids() {
        let a = CharacterIdentity::derive("Morgath", "warlock", 1_700_000_000);
        let b = CharacterIdentity::derive("Morgath", "warlock", 1_700_000_001);
        let c = CharacterIdentity::derive("Morgath", "cleric", 1_700_000_000);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn parse_validates_shape() {
        let id = CharacterIdentity::derive("x", "y", 0);
        assert_eq!(CharacterIdentity::parse(id.as_str()), Some(id.clone()));
        assert_eq!(
            CharacterIdentity::parse(&format!(" {} ", id.as_str())),
            Some(id)
        );
        assert!(CharacterIdentity::parse("short").is_none());
        assert!(CharacterIdentity::parse(&"G".repeat(32)).is_none());
        assert!(CharacterIdentity::parse(&"A".repeat(32)).is_none());
    }
}
