//! Record Store
//!
//! Maps serial fingerprints to product records. Records are inserted once,
//! never removed, and enumerated in insertion order.
//!
//! Locking is two-level: the table (record map plus insertion-order index)
//! sits behind one `RwLock`, and every record has its own `Mutex`. Writers
//! to different records only share the table read lock; writers to the same
//! record queue on its mutex.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::checksum::Checksum;
use crate::error::{RegistryError, Result};
use crate::product::{Identity, Product, SerialHash};

#[derive(Default)]
struct Table {
    records: HashMap<SerialHash, Arc<Mutex<Product>>>,
    /// Insertion-order index
    order: Vec<SerialHash>,
}

/// In-memory product table
#[derive(Default)]
pub struct RecordStore {
    table: RwLock<Table>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from records in insertion order
    ///
    /// Fails with `CorruptState` on a duplicate serial or a record whose
    /// invariants do not hold.
    pub fn from_snapshot(products: Vec<Product>) -> Result<Self> {
        let mut table = Table::default();
        for product in products {
            product.check_invariants()?;
            let serial = product.serial_hash.clone();
            if table.records.contains_key(&serial) {
                return Err(RegistryError::CorruptState(format!(
                    "duplicate record for {}",
                    serial
                )));
            }
            table.order.push(serial.clone());
            table.records.insert(serial, Arc::new(Mutex::new(product)));
        }
        Ok(Self {
            table: RwLock::new(table),
        })
    }

    /// Copy of every record in insertion order
    pub fn snapshot(&self) -> Vec<Product> {
        self.snapshot_then(|| ()).0
    }

    /// Copy every record, then run `with` before any record is unlocked
    ///
    /// No create or update can commit between the copy and `with`, so
    /// anything `with` reads from a commit hook's output agrees with the
    /// copied records.
    pub fn snapshot_then<R, W>(&self, with: W) -> (Vec<Product>, R)
    where
        W: FnOnce() -> R,
    {
        let table = self.table.read();
        let records: Vec<_> = table
            .order
            .iter()
            .filter_map(|serial| table.records.get(serial))
            .collect();
        let guards: Vec<_> = records.iter().map(|record| record.lock()).collect();
        let products = guards.iter().map(|guard| Product::clone(guard)).collect();
        (products, with())
    }

    /// Insert a new record owned by `owner`
    pub fn create(
        &self,
        serial_hash: SerialHash,
        metadata_hash: Checksum,
        metadata_uri: Option<String>,
        owner: Identity,
        now: DateTime<Utc>,
    ) -> Result<Product> {
        self.create_then(serial_hash, metadata_hash, metadata_uri, owner, now, |_| ())
            .map(|(product, ())| product)
    }

    /// Like [`create`](Self::create), then run `on_commit` before the new
    /// record becomes visible to other callers
    pub fn create_then<R, C>(
        &self,
        serial_hash: SerialHash,
        metadata_hash: Checksum,
        metadata_uri: Option<String>,
        owner: Identity,
        now: DateTime<Utc>,
        on_commit: C,
    ) -> Result<(Product, R)>
    where
        C: FnOnce(&Product) -> R,
    {
        let mut table = self.table.write();
        if table.records.contains_key(&serial_hash) {
            return Err(RegistryError::DuplicateSerial {
                serial: serial_hash.to_string(),
            });
        }

        let product = Product::new(serial_hash.clone(), metadata_hash, metadata_uri, owner, now);
        table.order.push(serial_hash.clone());
        table
            .records
            .insert(serial_hash, Arc::new(Mutex::new(product.clone())));
        let committed = on_commit(&product);
        Ok((product, committed))
    }

    /// Get a copy of a record
    pub fn get(&self, serial_hash: &SerialHash) -> Result<Product> {
        let record = self.record(serial_hash)?;
        let product = record.lock().clone();
        Ok(product)
    }

    pub fn contains(&self, serial_hash: &SerialHash) -> bool {
        self.table.read().records.contains_key(serial_hash)
    }

    pub fn len(&self) -> usize {
        self.table.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serial fingerprints in insertion order
    pub fn serial_hashes(&self) -> Vec<SerialHash> {
        self.table.read().order.clone()
    }

    /// Enumerate records in insertion order
    ///
    /// Each call starts an independent pass. Records are read as they are
    /// yielded, and the pass ends at the length observed when it started.
    pub fn list_all(&self) -> Products<'_> {
        Products {
            store: self,
            next: 0,
            end: self.len(),
        }
    }

    /// Apply `mutator` to one record as a transaction
    ///
    /// The mutator works on a copy while the record's lock is held. The copy
    /// replaces the stored record only if the mutator succeeds and the
    /// result still satisfies the record invariants; otherwise the stored
    /// record is untouched.
    pub fn update<T, F>(&self, serial_hash: &SerialHash, mutator: F) -> Result<T>
    where
        F: FnOnce(&mut Product) -> Result<T>,
    {
        self.update_then(serial_hash, mutator, |_, _| ())
            .map(|(out, ())| out)
    }

    /// Like [`update`](Self::update), then run `on_commit` on the committed
    /// record before its lock is released
    ///
    /// Used to emit events in the same order the record changed.
    pub fn update_then<T, R, F, C>(
        &self,
        serial_hash: &SerialHash,
        mutator: F,
        on_commit: C,
    ) -> Result<(T, R)>
    where
        F: FnOnce(&mut Product) -> Result<T>,
        C: FnOnce(&Product, &T) -> R,
    {
        let record = self.record(serial_hash)?;
        let mut guard = record.lock();

        let mut working = guard.clone();
        let out = mutator(&mut working)?;

        if working.serial_hash != guard.serial_hash {
            return Err(RegistryError::CorruptState(format!(
                "update attempted to rekey {}",
                guard.serial_hash
            )));
        }
        if working.transfer_history.len() < guard.transfer_history.len()
            || working.transfer_history[..guard.transfer_history.len()]
                != guard.transfer_history[..]
        {
            return Err(RegistryError::CorruptState(format!(
                "update attempted to rewrite history of {}",
                guard.serial_hash
            )));
        }
        working.check_invariants()?;

        *guard = working;
        let committed = on_commit(&guard, &out);
        Ok((out, committed))
    }

    fn record(&self, serial_hash: &SerialHash) -> Result<Arc<Mutex<Product>>> {
        self.table
            .read()
            .records
            .get(serial_hash)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(serial_hash))
    }

    fn record_at(&self, index: usize) -> Option<Arc<Mutex<Product>>> {
        let table = self.table.read();
        let serial = table.order.get(index)?;
        let record = table.records.get(serial).cloned();
        record
    }
}

impl fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStore")
            .field("len", &self.len())
            .finish()
    }
}

/// Insertion-order iterator returned by [`RecordStore::list_all`]
pub struct Products<'a> {
    store: &'a RecordStore,
    next: usize,
    end: usize,
}

impl Iterator for Products<'_> {
    type Item = Product;

    fn next(&mut self) -> Option<Product> {
        if self.next >= self.end {
            return None;
        }
        let record = self.store.record_at(self.next)?;
        self.next += 1;
        let product = record.lock().clone();
        Some(product)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end.saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}
