use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u128);

impl SessionId {
    pub const LEN: usize = 16;
    pub const HEX_LEN: usize = 32;

    /// Mint a fresh id from OS randomness.
    pub fn mint() -> Self {
        let mut b = [0u8; Self::LEN];
        getrandom::getrandom(&mut b).expect("getrandom");
        Self(u128::from_be_bytes(b))
    }

    pub fn to_be_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(b: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(b))
    }

    /// Fixed-width lowercase hex; used in filenames and envelopes.
    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }

    pub fn parse_hex(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() != Self::HEX_LEN {
            return None;
        }
        u128::from_str_radix(s, 16).ok().map(Self)
    }

    pub fn short(self) -> u64 {
        // Good enough for logs/UI: XOR high/low halves.
        (self.0 as u64) ^ ((self.0 >> 64) as u64)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_hex(s).ok_or(())
    }
}

impl serde::Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s: String = serde::Deserialize::deserialize(de)?;
        Self::parse_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("bad session id {s:?}")))
    }
}
