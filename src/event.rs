//! Append-only event log
//!
//! Every committed registry operation leaves exactly one event. The event's
//! transaction id is a SHA256 over its sequence number and contents, so ids
//! are unique within a log and reproducible from the log alone.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::checksum::Checksum;
use crate::error::{RegistryError, Result};
use crate::product::{Flag, Identity, Product, SerialHash, TransferRecord};

/// What happened to a product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Registered {
        metadata_hash: Checksum,
        metadata_uri: Option<String>,
    },
    Transferred {
        from: Identity,
        to: Identity,
    },
    Flagged {
        reason: String,
    },
    FlagCleared,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Registered { .. } => "registered",
            EventKind::Transferred { .. } => "transferred",
            EventKind::Flagged { .. } => "flagged",
            EventKind::FlagCleared => "flag_cleared",
        }
    }
}

/// A committed registry operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEvent {
    /// Position in the log, starting at 0
    pub sequence: u64,
    pub tx_id: Checksum,
    pub serial_hash: SerialHash,
    /// Identity that submitted the operation
    pub actor: Identity,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl RegistryEvent {
    fn new(
        sequence: u64,
        serial_hash: SerialHash,
        actor: Identity,
        timestamp: DateTime<Utc>,
        kind: EventKind,
    ) -> Self {
        let tx_id = compute_tx_id(sequence, &serial_hash, &actor, timestamp, &kind);
        Self {
            sequence,
            tx_id,
            serial_hash,
            actor,
            timestamp,
            kind,
        }
    }

    /// Recompute the transaction id and compare
    pub fn verify(&self) -> bool {
        compute_tx_id(
            self.sequence,
            &self.serial_hash,
            &self.actor,
            self.timestamp,
            &self.kind,
        ) == self.tx_id
    }
}

fn compute_tx_id(
    sequence: u64,
    serial_hash: &SerialHash,
    actor: &Identity,
    timestamp: DateTime<Utc>,
    kind: &EventKind,
) -> Checksum {
    let mut parts: Vec<&[u8]> = vec![
        kind.name().as_bytes(),
        serial_hash.as_bytes(),
        actor.as_str().as_bytes(),
    ];
    match kind {
        EventKind::Registered {
            metadata_hash,
            metadata_uri,
        } => {
            parts.push(metadata_hash.as_bytes());
            parts.push(metadata_uri.as_deref().unwrap_or_default().as_bytes());
        }
        EventKind::Transferred { from, to } => {
            parts.push(from.as_str().as_bytes());
            parts.push(to.as_str().as_bytes());
        }
        EventKind::Flagged { reason } => parts.push(reason.as_bytes()),
        EventKind::FlagCleared => {}
    }

    let mut hasher = Sha256::new();
    hasher.update(sequence.to_be_bytes());
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.update(timestamp.timestamp_millis().to_be_bytes());
    Checksum::from_digest(hasher.finalize().into())
}

/// Ordered, append-only list of registry events
#[derive(Debug, Default)]
pub struct EventLog {
    events: RwLock<Vec<RegistryEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted events
    ///
    /// Sequence numbers must run 0, 1, 2, ... and every transaction id must
    /// verify.
    pub fn from_events(events: Vec<RegistryEvent>) -> Result<Self> {
        for (index, event) in events.iter().enumerate() {
            if event.sequence != index as u64 {
                return Err(RegistryError::CorruptState(format!(
                    "event {} has sequence {}",
                    index, event.sequence
                )));
            }
            if !event.verify() {
                return Err(RegistryError::CorruptState(format!(
                    "event {} transaction id does not verify",
                    index
                )));
            }
        }
        Ok(Self {
            events: RwLock::new(events),
        })
    }

    /// Append an event, assigning its sequence number and transaction id
    pub fn append(
        &self,
        serial_hash: SerialHash,
        actor: Identity,
        timestamp: DateTime<Utc>,
        kind: EventKind,
    ) -> RegistryEvent {
        let mut events = self.events.write();
        let event = RegistryEvent::new(events.len() as u64, serial_hash, actor, timestamp, kind);
        events.push(event.clone());
        event
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All events, oldest first
    pub fn all(&self) -> Vec<RegistryEvent> {
        self.events.read().clone()
    }

    /// Events for one product, oldest first
    pub fn for_serial(&self, serial_hash: &SerialHash) -> Vec<RegistryEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.serial_hash == *serial_hash)
            .cloned()
            .collect()
    }
}

/// Rebuild every product's state from its events, in registration order
///
/// Each event must apply cleanly to the state left by the events before it:
/// one registration per serial, transfers made by the current owner, flags
/// raised only on unflagged products and cleared only on flagged ones.
pub fn replay(events: &[RegistryEvent]) -> Result<Vec<Product>> {
    let mut products: Vec<Product> = Vec::new();
    let mut index: HashMap<SerialHash, usize> = HashMap::new();

    for event in events {
        let serial = &event.serial_hash;
        if let EventKind::Registered {
            metadata_hash,
            metadata_uri,
        } = &event.kind
        {
            if index.contains_key(serial) {
                return Err(corrupt(event, "registers a serial twice"));
            }
            index.insert(serial.clone(), products.len());
            products.push(Product::new(
                serial.clone(),
                *metadata_hash,
                metadata_uri.clone(),
                event.actor.clone(),
                event.timestamp,
            ));
            continue;
        }

        let product = match index.get(serial) {
            Some(&i) => &mut products[i],
            None => return Err(corrupt(event, "refers to an unregistered serial")),
        };
        match &event.kind {
            EventKind::Registered { .. } => {}
            EventKind::Transferred { from, to } => {
                if *from != product.current_owner || event.actor != *from {
                    return Err(corrupt(event, "transfers from someone other than the owner"));
                }
                if product.is_flagged() {
                    return Err(corrupt(event, "transfers a flagged product"));
                }
                product.transfer_history.push(TransferRecord {
                    previous_owner: Some(from.clone()),
                    new_owner: to.clone(),
                    timestamp: event.timestamp,
                });
                product.current_owner = to.clone();
            }
            EventKind::Flagged { reason } => {
                if product.is_flagged() {
                    return Err(corrupt(event, "flags a product that is already flagged"));
                }
                product.flag = Some(Flag {
                    reason: reason.clone(),
                    flagged_by: event.actor.clone(),
                    flagged_at: event.timestamp,
                });
            }
            EventKind::FlagCleared => {
                if product.flag.take().is_none() {
                    return Err(corrupt(event, "clears a product that is not flagged"));
                }
            }
        }
    }
    Ok(products)
}

fn corrupt(event: &RegistryEvent, problem: &str) -> RegistryError {
    RegistryError::CorruptState(format!(
        "event {} ({} {}) {}",
        event.sequence,
        event.kind.name(),
        event.serial_hash,
        problem
    ))
}
