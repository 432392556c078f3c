//! Metadata canonicalization and SHA256 fingerprints

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{RegistryError, Result};

/// Domain separation tag prepended to every canonical metadata encoding
const METADATA_DOMAIN: &[u8] = b"provenance-registry/metadata/v1";

/// SHA256 digest (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Length of a digest in bytes
    pub const LEN: usize = 32;

    /// Compute checksum from raw bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Wrap an already computed digest
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    /// Parse a hex digest, with or without a `0x` prefix
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| RegistryError::InvalidMetadata(format!("bad digest '{}': {}", s, e)))?;
        Ok(Self(out))
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Checksum {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Descriptive metadata for a physical product
///
/// Only its fingerprint is stored in the registry; the record itself lives
/// off-registry (usually behind the product's metadata URI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductMetadata {
    pub name: String,
    pub description: String,
    /// Serial fingerprint as entered by the registrant
    pub serial_hash: String,
    /// Creation time, canonicalized to whole milliseconds
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl ProductMetadata {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        serial_hash: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            serial_hash: serial_hash.into(),
            created_at,
        }
    }

    /// Reject records with an empty or whitespace-only required field
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("name", &self.name),
            ("description", &self.description),
            ("serialHash", &self.serial_hash),
        ] {
            if value.trim().is_empty() {
                return Err(RegistryError::InvalidMetadata(format!(
                    "field '{}' is required",
                    field
                )));
            }
        }
        Ok(())
    }

    /// Deterministic byte encoding of this record
    ///
    /// Layout: domain tag, then `name`, `description`, `serialHash` as
    /// big-endian u64 length + raw UTF-8 bytes, then the creation time as a
    /// big-endian i64 count of milliseconds since the Unix epoch.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let mut buf = Vec::with_capacity(
            METADATA_DOMAIN.len()
                + self.name.len()
                + self.description.len()
                + self.serial_hash.len()
                + 4 * 8,
        );
        buf.extend_from_slice(METADATA_DOMAIN);
        for field in [&self.name, &self.description, &self.serial_hash] {
            buf.extend_from_slice(&(field.len() as u64).to_be_bytes());
            buf.extend_from_slice(field.as_bytes());
        }
        buf.extend_from_slice(&self.created_at.timestamp_millis().to_be_bytes());
        Ok(buf)
    }

    /// Compute the metadata digest
    pub fn fingerprint(&self) -> Result<Checksum> {
        fingerprint(self)
    }
}

/// Canonicalize `metadata` and hash it
pub fn fingerprint(metadata: &ProductMetadata) -> Result<Checksum> {
    Ok(Checksum::from_bytes(&metadata.canonical_bytes()?))
}
