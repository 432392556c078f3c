//! Product Registry
//!
//! The single entry point for clients. Every mutating operation validates
//! its request, commits through one atomic store call, and records exactly
//! one event while the affected record is still locked.
//!
//! Per-product lifecycle:
//!
//! ```text
//! Unregistered --register--> Active --flag--> Flagged --clear--> Active
//!                            Active --transfer--> Active
//! ```

use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checksum::{Checksum, ProductMetadata};
use crate::config::ProvenanceConfig;
use crate::error::{RegistryError, Result};
use crate::event::{self, EventKind, EventLog, RegistryEvent};
use crate::flag::FlagManager;
use crate::ownership::OwnershipManager;
use crate::product::{Identity, Product, ProductView, SerialHash, TransferRecord};
use crate::store::{Products, RecordStore};

/// Version written into persisted state files
pub const STATE_VERSION: u32 = 1;

/// Default upper bound on metadata URI length, in bytes
pub const DEFAULT_MAX_URI_LEN: usize = 2048;

/// Source of commit timestamps
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A request to register a new product
///
/// `metadata_hash` is always stored. When `metadata` is attached, the
/// registry recomputes its fingerprint and refuses the request unless it
/// matches `metadata_hash` and names the same serial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub serial_hash: SerialHash,
    pub metadata_hash: Checksum,
    #[serde(default)]
    pub metadata_uri: Option<String>,
    #[serde(default)]
    pub metadata: Option<ProductMetadata>,
}

impl RegisterRequest {
    pub fn new(serial_hash: SerialHash, metadata_hash: Checksum) -> Self {
        Self {
            serial_hash,
            metadata_hash,
            metadata_uri: None,
            metadata: None,
        }
    }

    /// Build a hash-verified request straight from a metadata record
    pub fn from_metadata(metadata: ProductMetadata) -> Result<Self> {
        let serial_hash = SerialHash::parse(&metadata.serial_hash)?;
        let metadata_hash = metadata.fingerprint()?;
        Ok(Self {
            serial_hash,
            metadata_hash,
            metadata_uri: None,
            metadata: Some(metadata),
        })
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.metadata_uri = Some(uri.into());
        self
    }

    pub fn with_metadata(mut self, metadata: ProductMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Result of a committed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub serial_hash: SerialHash,
    pub tx_id: Checksum,
}

impl From<&RegistryEvent> for Receipt {
    fn from(event: &RegistryEvent) -> Self {
        Self {
            serial_hash: event.serial_hash.clone(),
            tx_id: event.tx_id,
        }
    }
}

/// Persisted registry contents
///
/// `products` is in registration order; that order is the registry's
/// insertion-order index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    pub version: u32,
    pub products: Vec<Product>,
    pub events: Vec<RegistryEvent>,
}

/// Registration limits
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub require_metadata: bool,
    pub max_uri_len: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            require_metadata: false,
            max_uri_len: DEFAULT_MAX_URI_LEN,
        }
    }
}

/// The product provenance registry
#[derive(Debug)]
pub struct ProductRegistry {
    store: RecordStore,
    events: EventLog,
    ownership: OwnershipManager,
    flags: FlagManager,
    options: RegistryOptions,
    clock: Box<dyn Clock>,
}

impl Default for ProductRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductRegistry {
    /// Create an empty registry with the open flag policy
    pub fn new() -> Self {
        Self {
            store: RecordStore::new(),
            events: EventLog::new(),
            ownership: OwnershipManager::new(),
            flags: FlagManager::default(),
            options: RegistryOptions::default(),
            clock: Box::new(SystemClock),
        }
    }

    /// Create an empty registry configured from `config`
    pub fn with_config(config: &ProvenanceConfig) -> Result<Self> {
        Ok(Self::new()
            .with_flag_manager(config.flag_manager()?)
            .with_options(RegistryOptions {
                require_metadata: config.registry.require_metadata,
                max_uri_len: config.registry.max_uri_len,
            }))
    }

    pub fn with_flag_manager(mut self, flags: FlagManager) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_options(mut self, options: RegistryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Register a new product owned by `caller`
    pub fn register(&self, caller: &Identity, request: RegisterRequest) -> Result<Receipt> {
        let serial = request.serial_hash.clone();
        self.validate_registration(&request)
            .inspect_err(|e| warn!(serial = %serial, caller = %caller, error = %e, "registration rejected"))?;

        let RegisterRequest {
            serial_hash,
            metadata_hash,
            metadata_uri,
            ..
        } = request;
        let now = self.clock.now();

        let (_, receipt) = self
            .store
            .create_then(
                serial_hash,
                metadata_hash,
                metadata_uri,
                caller.clone(),
                now,
                |product| {
                    let event = self.events.append(
                        product.serial_hash.clone(),
                        caller.clone(),
                        now,
                        EventKind::Registered {
                            metadata_hash: product.metadata_hash,
                            metadata_uri: product.metadata_uri.clone(),
                        },
                    );
                    Receipt::from(&event)
                },
            )
            .inspect_err(|e| warn!(serial = %serial, caller = %caller, error = %e, "registration rejected"))?;

        info!(serial = %serial, owner = %caller, tx_id = %receipt.tx_id, "product registered");
        Ok(receipt)
    }

    /// Transfer ownership of `serial_hash` from `caller` to `new_owner`
    pub fn transfer(
        &self,
        caller: &Identity,
        serial_hash: &SerialHash,
        new_owner: &Identity,
    ) -> Result<Receipt> {
        let now = self.clock.now();
        let (_, receipt) = self
            .ownership
            .transfer_then(
                &self.store,
                serial_hash,
                new_owner,
                caller,
                now,
                |_, record| {
                    let event = self.events.append(
                        serial_hash.clone(),
                        caller.clone(),
                        now,
                        EventKind::Transferred {
                            from: caller.clone(),
                            to: record.new_owner.clone(),
                        },
                    );
                    Receipt::from(&event)
                },
            )
            .inspect_err(|e| warn!(serial = %serial_hash, caller = %caller, error = %e, "transfer rejected"))?;

        info!(serial = %serial_hash, from = %caller, to = %new_owner, tx_id = %receipt.tx_id, "ownership transferred");
        Ok(receipt)
    }

    /// Raise a dispute flag on `serial_hash`
    pub fn flag(&self, caller: &Identity, serial_hash: &SerialHash, reason: &str) -> Result<Receipt> {
        let now = self.clock.now();
        let (_, receipt) = self
            .flags
            .flag_then(&self.store, serial_hash, reason, caller, now, |product| {
                let reason = product
                    .flag
                    .as_ref()
                    .map(|f| f.reason.clone())
                    .unwrap_or_default();
                let event = self.events.append(
                    serial_hash.clone(),
                    caller.clone(),
                    now,
                    EventKind::Flagged { reason },
                );
                Receipt::from(&event)
            })
            .inspect_err(|e| warn!(serial = %serial_hash, caller = %caller, error = %e, "flag rejected"))?;

        info!(serial = %serial_hash, by = %caller, tx_id = %receipt.tx_id, "product flagged");
        Ok(receipt)
    }

    /// Clear the active flag on `serial_hash`
    pub fn clear_flag(&self, caller: &Identity, serial_hash: &SerialHash) -> Result<Receipt> {
        let now = self.clock.now();
        let (_, receipt) = self
            .flags
            .clear_then(&self.store, serial_hash, caller, |_| {
                let event = self.events.append(
                    serial_hash.clone(),
                    caller.clone(),
                    now,
                    EventKind::FlagCleared,
                );
                Receipt::from(&event)
            })
            .inspect_err(|e| warn!(serial = %serial_hash, caller = %caller, error = %e, "clear rejected"))?;

        info!(serial = %serial_hash, by = %caller, tx_id = %receipt.tx_id, "flag cleared");
        Ok(receipt)
    }

    /// Display view of one product
    pub fn get_product(&self, serial_hash: &SerialHash) -> Result<ProductView> {
        Ok(self.store.get(serial_hash)?.view())
    }

    /// Full record of one product
    pub fn product(&self, serial_hash: &SerialHash) -> Result<Product> {
        self.store.get(serial_hash)
    }

    /// Serial fingerprints in registration order
    pub fn list_product_ids(&self) -> Vec<SerialHash> {
        self.store.serial_hashes()
    }

    /// Full records in registration order
    pub fn products(&self) -> Products<'_> {
        self.store.list_all()
    }

    pub fn transfer_history(&self, serial_hash: &SerialHash) -> Result<Vec<TransferRecord>> {
        self.ownership.history(&self.store, serial_hash)
    }

    /// Check `metadata` against the digest stored for `serial_hash`
    ///
    /// Returns `Ok(false)` when the record has been altered. Fails when the
    /// product is unknown or the metadata is malformed.
    pub fn verify_metadata(&self, serial_hash: &SerialHash, metadata: &ProductMetadata) -> Result<bool> {
        let product = self.store.get(serial_hash)?;
        let digest = metadata.fingerprint()?;
        let same_serial = SerialHash::parse(&metadata.serial_hash)
            .map(|s| s == *serial_hash)
            .unwrap_or(false);
        let verified = same_serial && digest == product.metadata_hash;
        debug!(serial = %serial_hash, verified, "metadata checked");
        Ok(verified)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// All events, oldest first
    pub fn events(&self) -> Vec<RegistryEvent> {
        self.events.all()
    }

    /// Events for one product, oldest first
    pub fn events_for(&self, serial_hash: &SerialHash) -> Vec<RegistryEvent> {
        self.events.for_serial(serial_hash)
    }

    /// Copy of the registry contents
    ///
    /// Events are read while every record is locked, so the products and
    /// the log describe the same moment.
    pub fn snapshot(&self) -> RegistryState {
        let (products, events) = self.store.snapshot_then(|| self.events.all());
        RegistryState {
            version: STATE_VERSION,
            products,
            events,
        }
    }

    /// Replace this registry's contents with `state`
    ///
    /// Every product must equal the state its events replay to, in the
    /// same registration order.
    pub fn restore(self, state: RegistryState) -> Result<Self> {
        if state.version != STATE_VERSION {
            return Err(RegistryError::CorruptState(format!(
                "unsupported state version {}",
                state.version
            )));
        }
        let events = EventLog::from_events(state.events)?;
        check_against_events(&state.products, &event::replay(&events.all())?)?;
        let store = RecordStore::from_snapshot(state.products)?;
        Ok(Self {
            store,
            events,
            ..self
        })
    }

    /// Write the registry contents to `path` as JSON
    ///
    /// The file is replaced atomically: contents go to a sibling temporary
    /// file which is then renamed over `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(&self.snapshot())?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(path = %path.display(), products = self.len(), "registry saved");
        Ok(())
    }

    /// Load `path` into this registry, or keep it empty if the file does
    /// not exist yet
    pub fn load(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(self);
        }
        let content = fs::read_to_string(path)?;
        let state: RegistryState = serde_json::from_str(&content)?;
        let registry = self.restore(state)?;
        debug!(path = %path.display(), products = registry.len(), "registry loaded");
        Ok(registry)
    }

    /// Open the registry stored at `path`, configured from `config`
    pub fn open(path: impl AsRef<Path>, config: &ProvenanceConfig) -> Result<Self> {
        Self::with_config(config)?.load(path)
    }

    fn validate_registration(&self, request: &RegisterRequest) -> Result<()> {
        if let Some(uri) = &request.metadata_uri {
            if uri.trim().is_empty() {
                return Err(RegistryError::InvalidMetadata(
                    "metadata URI is empty".into(),
                ));
            }
            if uri.len() > self.options.max_uri_len {
                return Err(RegistryError::InvalidMetadata(format!(
                    "metadata URI is {} bytes, limit is {}",
                    uri.len(),
                    self.options.max_uri_len
                )));
            }
        }

        let Some(metadata) = &request.metadata else {
            if self.options.require_metadata {
                return Err(RegistryError::InvalidMetadata(
                    "metadata record is required".into(),
                ));
            }
            return Ok(());
        };

        let digest = metadata.fingerprint()?;
        if SerialHash::parse(&metadata.serial_hash).ok().as_ref() != Some(&request.serial_hash) {
            return Err(RegistryError::InvalidMetadata(format!(
                "metadata names serial '{}', request registers {}",
                metadata.serial_hash, request.serial_hash
            )));
        }
        if digest != request.metadata_hash {
            return Err(RegistryError::InvalidMetadata(format!(
                "metadata hash mismatch: expected {}, got {}",
                request.metadata_hash, digest
            )));
        }
        Ok(())
    }
}

fn check_against_events(products: &[Product], replayed: &[Product]) -> Result<()> {
    for (index, expected) in replayed.iter().enumerate() {
        let Some(product) = products.get(index) else {
            return Err(RegistryError::CorruptState(format!(
                "{} is registered in the event log but has no record",
                expected.serial_hash
            )));
        };
        if product.serial_hash != expected.serial_hash {
            return Err(RegistryError::CorruptState(format!(
                "record {} is {}, event log registers {}",
                index, product.serial_hash, expected.serial_hash
            )));
        }
        if product != expected {
            return Err(RegistryError::CorruptState(format!(
                "record for {} does not match its events",
                product.serial_hash
            )));
        }
    }
    if let Some(extra) = products.get(replayed.len()) {
        return Err(RegistryError::CorruptState(format!(
            "{} has no registration event",
            extra.serial_hash
        )));
    }
    Ok(())
}
