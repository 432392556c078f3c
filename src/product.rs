//! Product records and the identifiers they are keyed by

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::checksum::Checksum;
use crate::error::{RegistryError, Result};

/// Longest accepted serial fingerprint, in bytes
pub const MAX_SERIAL_LEN: usize = 256;

/// Unique serial fingerprint of a physical item; the registry's primary key
///
/// Parsed from `0x`-prefixed hex, or taken as the raw UTF-8 bytes of any
/// other (trimmed) string. Always displayed as `0x`-prefixed lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialHash(Vec<u8>);

impl SerialHash {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(RegistryError::InvalidSerial("serial hash is empty".into()));
        }
        if bytes.len() > MAX_SERIAL_LEN {
            return Err(RegistryError::InvalidSerial(format!(
                "serial hash is {} bytes, limit is {}",
                bytes.len(),
                MAX_SERIAL_LEN
            )));
        }
        Ok(Self(bytes))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(digits) => {
                let bytes = hex::decode(digits)
                    .map_err(|e| RegistryError::InvalidSerial(format!("'{}': {}", s, e)))?;
                Self::from_bytes(bytes)
            }
            None => Self::from_bytes(s.as_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for SerialHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl FromStr for SerialHash {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for SerialHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SerialHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn identity_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9:._@\-]{0,127}$").expect("identity pattern is valid")
    })
}

/// Identity of a party acting on the registry (an account address or handle)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    /// Parse a well-formed identity: 1-128 characters from
    /// `[A-Za-z0-9:._@-]`, starting with an alphanumeric
    pub fn parse(s: &str) -> Result<Self> {
        if identity_pattern().is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(RegistryError::InvalidOwner(format!(
                "malformed identity '{}'",
                s
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// One ownership assignment; creation is recorded with no previous owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub previous_owner: Option<Identity>,
    pub new_owner: Identity,
    pub timestamp: DateTime<Utc>,
}

/// An active dispute on a product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    pub reason: String,
    pub flagged_by: Identity,
    pub flagged_at: DateTime<Utc>,
}

/// Registry record for one physical product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub serial_hash: SerialHash,
    pub metadata_hash: Checksum,
    pub metadata_uri: Option<String>,
    pub current_owner: Identity,
    pub flag: Option<Flag>,
    pub transfer_history: Vec<TransferRecord>,
    pub registered_at: DateTime<Utc>,
    pub registered_by: Identity,
}

impl Product {
    /// Create a freshly registered, unflagged product owned by `owner`
    pub fn new(
        serial_hash: SerialHash,
        metadata_hash: Checksum,
        metadata_uri: Option<String>,
        owner: Identity,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            serial_hash,
            metadata_hash,
            metadata_uri,
            current_owner: owner.clone(),
            flag: None,
            transfer_history: vec![TransferRecord {
                previous_owner: None,
                new_owner: owner.clone(),
                timestamp: now,
            }],
            registered_at: now,
            registered_by: owner,
        }
    }

    pub fn is_flagged(&self) -> bool {
        self.flag.is_some()
    }

    pub fn status(&self) -> ProductStatus {
        if self.is_flagged() {
            ProductStatus::Flagged
        } else {
            ProductStatus::Active
        }
    }

    /// Check the record-level invariants
    pub fn check_invariants(&self) -> Result<()> {
        let serial = &self.serial_hash;
        let first = self.transfer_history.first().ok_or_else(|| {
            RegistryError::CorruptState(format!("{} has no transfer history", serial))
        })?;
        if first.previous_owner.is_some() {
            return Err(RegistryError::CorruptState(format!(
                "{} history does not start with its registration",
                serial
            )));
        }
        for pair in self.transfer_history.windows(2) {
            if pair[1].previous_owner.as_ref() != Some(&pair[0].new_owner) {
                return Err(RegistryError::CorruptState(format!(
                    "{} history is not a chain of owners",
                    serial
                )));
            }
        }
        let last = &self.transfer_history[self.transfer_history.len() - 1];
        if last.new_owner != self.current_owner {
            return Err(RegistryError::CorruptState(format!(
                "{} current owner {} does not match history",
                serial, self.current_owner
            )));
        }
        Ok(())
    }

    pub fn view(&self) -> ProductView {
        ProductView::from(self)
    }
}

/// Lifecycle state of a registered product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Active,
    Flagged,
}

/// Read model handed to clients for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductView {
    pub serial_hash: SerialHash,
    pub metadata_uri: Option<String>,
    pub current_owner: Identity,
    pub is_flagged: bool,
    pub flag_reason: Option<String>,
    pub flagged_by: Option<Identity>,
}

impl From<&Product> for ProductView {
    fn from(p: &Product) -> Self {
        Self {
            serial_hash: p.serial_hash.clone(),
            metadata_uri: p.metadata_uri.clone(),
            current_owner: p.current_owner.clone(),
            is_flagged: p.is_flagged(),
            flag_reason: p.flag.as_ref().map(|f| f.reason.clone()),
            flagged_by: p.flag.as_ref().map(|f| f.flagged_by.clone()),
        }
    }
}
