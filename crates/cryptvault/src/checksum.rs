use sha2::Digest;

/// Identifier stamped into every envelope so a future algorithm change cannot
/// silently misverify old files.
pub const CHECKSUM_ALGO: &str = "sha256-v1";

/// Content digest of a save payload. Metadata never participates.
pub fn digest(payload: &[u8]) -> String {
    let mut h = sha2::Sha256::new();
    h.update(payload);
    let out = h.finalize();
    let mut s = String::with_capacity(out.len() * 2);
    for x in out {
        s.push_str(&format!("{:02x}", x));
    }
    s
}

pub fn verify(payload: &[u8], expected: &str) -> bool {
    digest(payload) == expected
}

#[cfg(test)]
mod tests {
    use super::{digest, verify};

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(digest(b"hello"), digest(b"hello"));
        assert_ne!(digest(b"hello"), digest(b"hellp"));
        assert_eq!(digest(b"").len(), 64);
    }

    #[test]
    fn digest_matches_known_vector() {
        // sha256("abc")
        assert_eq!(
            digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn verify_compares_recomputed() {
        let d = digest(b"payload");
        assert!(verify(b"payload", &d));
        assert!(!verify(b"payloae", &d));
        assert!(!verify(b"payload", "not-a-digest"));
    }
}
