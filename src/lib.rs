//! Product Provenance Registry
//!
//! A tamper-evident, append-only registry of physical products keyed by
//! serial fingerprint.
//!
//! ## Features
//!
//! - **Register once**: each serial fingerprint maps to exactly one record
//! - **Metadata integrity**: SHA256 fingerprints over canonical metadata
//! - **Ownership history**: transfers are appended, never rewritten
//! - **Disputes**: flagged products cannot change hands until cleared
//! - **Event log**: every committed operation yields one event and tx id
//!
//! ## Architecture
//!
//! ```text
//! ProductRegistry ── validate ──> checksum (fingerprint)
//!        │
//!        ├── OwnershipManager ─┐
//!        ├── FlagManager ──────┼──> RecordStore (per-record locked updates)
//!        │                     │
//!        └── EventLog <────────┘  (appended while the record is locked)
//! ```

pub mod checksum;
pub mod config;
pub mod error;
pub mod event;
pub mod flag;
pub mod ownership;
pub mod product;
pub mod registry;
pub mod store;

pub use checksum::{fingerprint, Checksum, ProductMetadata};
pub use config::ProvenanceConfig;
pub use error::{RegistryError, Result};
pub use event::{EventKind, EventLog, RegistryEvent};
pub use flag::{FlagManager, FlagPolicy, OpenFlagPolicy, VerifierFlagPolicy};
pub use ownership::OwnershipManager;
pub use product::{Flag, Identity, Product, ProductStatus, ProductView, SerialHash, TransferRecord};
pub use registry::{Clock, ProductRegistry, Receipt, RegisterRequest, RegistryOptions, RegistryState, SystemClock};
pub use store::RecordStore;
