//! Domain-separated SHA-256 digests over canonical JSON

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest as _, Sha256};

/// 32-byte SHA-256 digest, serialized as lowercase hex
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Fixed predecessor of the first ledger record
    pub const GENESIS: Digest = Digest([0u8; 32]);

    /// Hash `bytes` under a domain label so digests of different kinds never collide
    pub fn of(domain: &str, bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain.as_bytes());
        hasher.update(b":");
        hasher.update(bytes);
        Digest(hasher.finalize().into())
    }

    /// Hash the canonical JSON encoding of `value`
    pub fn of_json<T: Serialize>(domain: &str, value: &T) -> serde_json::Result<Self> {
        let bytes = canonical_json_bytes(&serde_json::to_value(value)?)?;
        Ok(Self::of(domain, &bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Digest(out))
    }

    /// First eight hex characters, for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Serialize with object keys sorted at every depth
pub fn canonical_json_bytes(v: &Value) -> serde_json::Result<Vec<u8>> {
    fn canonicalize_value(v: &Value) -> Value {
        match v {
            Value::Object(map) => {
                let mut keys: Vec<_> = map.iter().collect();
                keys.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in keys {
                    out.insert(k.clone(), canonicalize_value(v));
                }
                Value::Object(out)
            }
            Value::Array(arr) => Value::Array(arr.iter().map(canonicalize_value).collect()),
            _ => v.clone(),
        }
    }

    serde_json::to_vec(&canonicalize_value(v))
}
