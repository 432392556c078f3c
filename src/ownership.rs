//! Ownership transfers

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::product::{Identity, Product, SerialHash, TransferRecord};
use crate::store::RecordStore;

/// Validates and applies ownership transfers
///
/// Only the current owner may hand a product on, and never while the
/// product carries an active flag.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnershipManager;

impl OwnershipManager {
    pub fn new() -> Self {
        Self
    }

    /// Move `serial_hash` from its current owner to `new_owner`
    pub fn transfer(
        &self,
        store: &RecordStore,
        serial_hash: &SerialHash,
        new_owner: &Identity,
        requester: &Identity,
        now: DateTime<Utc>,
    ) -> Result<TransferRecord> {
        self.transfer_then(store, serial_hash, new_owner, requester, now, |_, _| ())
            .map(|(record, ())| record)
    }

    /// [`transfer`](Self::transfer), calling `on_commit` while the record is
    /// still locked
    pub fn transfer_then<R, C>(
        &self,
        store: &RecordStore,
        serial_hash: &SerialHash,
        new_owner: &Identity,
        requester: &Identity,
        now: DateTime<Utc>,
        on_commit: C,
    ) -> Result<(TransferRecord, R)>
    where
        C: FnOnce(&Product, &TransferRecord) -> R,
    {
        let apply = |product: &mut Product| {
            if product.current_owner != *requester {
                return Err(RegistryError::unauthorized(
                    requester,
                    "transfer",
                    serial_hash,
                ));
            }
            if product.is_flagged() {
                return Err(RegistryError::TransferBlocked {
                    serial: serial_hash.to_string(),
                });
            }
            if product.current_owner == *new_owner {
                return Err(RegistryError::InvalidOwner(format!(
                    "{} already owns {}",
                    new_owner, serial_hash
                )));
            }

            let record = TransferRecord {
                previous_owner: Some(product.current_owner.clone()),
                new_owner: new_owner.clone(),
                timestamp: now,
            };
            debug!(serial = %serial_hash, from = %product.current_owner, to = %new_owner, "applying transfer");
            product.transfer_history.push(record.clone());
            product.current_owner = new_owner.clone();
            Ok(record)
        };
        store.update_then(serial_hash, apply, on_commit)
    }

    /// Every ownership assignment of `serial_hash`, oldest first
    pub fn history(
        &self,
        store: &RecordStore,
        serial_hash: &SerialHash,
    ) -> Result<Vec<TransferRecord>> {
        Ok(store.get(serial_hash)?.transfer_history)
    }
}
