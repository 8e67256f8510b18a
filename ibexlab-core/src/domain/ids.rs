use serde::{Deserialize, Serialize};
use std::fmt;

/// Content checksum (BLAKE3 hex of serialized bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checksum(pub String);

impl Checksum {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    /// Checksum of the canonical JSON encoding of `value`.
    pub fn of_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::of_bytes(&serde_json::to_vec(value)?))
    }

    /// First 12 hex characters, for display and path segments.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic feature-configuration hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigHash(pub String);

impl ConfigHash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one stage invocation: `{timestamp}-{checksum prefix}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Build a run id from the invocation timestamp and a checksum over the
    /// stage name and its input checksums.
    pub fn new(timestamp: chrono::DateTime<chrono::Utc>, content: &Checksum) -> Self {
        Self(format!(
            "{}-{}",
            timestamp.format("%Y%m%dT%H%M%S%.6fZ"),
            content.short()
        ))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scaler identity: ticker + config hash + checksum of fitted parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScalerId(pub String);

impl fmt::Display for ScalerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn checksum_is_deterministic() {
        let a = Checksum::of_bytes(b"BBVA.MC");
        let b = Checksum::of_bytes(b"BBVA.MC");
        assert_eq!(a, b);
        assert_ne!(a, Checksum::of_bytes(b"SAN.MC"));
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn run_id_embeds_timestamp_and_checksum() {
        let ts = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let sum = Checksum::of_bytes(b"stage");
        let id = RunId::new(ts, &sum);
        assert!(id.0.starts_with("20240301T120000"));
        assert!(id.0.ends_with(sum.short()));
    }
}
