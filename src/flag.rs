//! Dispute flags
//!
//! A flag marks a product as disputed (suspected counterfeit, reported
//! stolen, recalled). While flagged, a product cannot change hands. Who may
//! raise and clear flags is decided by a [`FlagPolicy`].

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::product::{Flag, Identity, Product, SerialHash};
use crate::store::RecordStore;

/// Default limit on flag reason length, in bytes
pub const DEFAULT_MAX_REASON_LEN: usize = 1024;

/// Authorization rules for raising and clearing flags
pub trait FlagPolicy: Send + Sync + fmt::Debug {
    /// May `flagger` raise a flag on `product`?
    fn can_flag(&self, product: &Product, flagger: &Identity) -> bool;

    /// May `clearer` clear the active flag on `product`?
    fn can_clear(&self, product: &Product, flag: &Flag, clearer: &Identity) -> bool;
}

/// Anyone may flag; the flagger or the administrator may clear
#[derive(Debug, Clone, Default)]
pub struct OpenFlagPolicy {
    pub administrator: Option<Identity>,
}

impl OpenFlagPolicy {
    pub fn new(administrator: Option<Identity>) -> Self {
        Self { administrator }
    }
}

impl FlagPolicy for OpenFlagPolicy {
    fn can_flag(&self, _product: &Product, _flagger: &Identity) -> bool {
        true
    }

    fn can_clear(&self, _product: &Product, flag: &Flag, clearer: &Identity) -> bool {
        flag.flagged_by == *clearer || self.administrator.as_ref() == Some(clearer)
    }
}

/// Only listed verifiers (and the administrator) may flag
///
/// Clearing follows the same rule as [`OpenFlagPolicy`].
#[derive(Debug, Clone, Default)]
pub struct VerifierFlagPolicy {
    pub administrator: Option<Identity>,
    pub verifiers: HashSet<Identity>,
}

impl VerifierFlagPolicy {
    pub fn new(administrator: Option<Identity>, verifiers: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            administrator,
            verifiers: verifiers.into_iter().collect(),
        }
    }
}

impl FlagPolicy for VerifierFlagPolicy {
    fn can_flag(&self, _product: &Product, flagger: &Identity) -> bool {
        self.verifiers.contains(flagger) || self.administrator.as_ref() == Some(flagger)
    }

    fn can_clear(&self, _product: &Product, flag: &Flag, clearer: &Identity) -> bool {
        flag.flagged_by == *clearer || self.administrator.as_ref() == Some(clearer)
    }
}

/// Applies and clears dispute flags under a policy
#[derive(Debug)]
pub struct FlagManager {
    policy: Box<dyn FlagPolicy>,
    max_reason_len: usize,
}

impl Default for FlagManager {
    fn default() -> Self {
        Self::new(Box::new(OpenFlagPolicy::default()))
    }
}

impl FlagManager {
    pub fn new(policy: Box<dyn FlagPolicy>) -> Self {
        Self {
            policy,
            max_reason_len: DEFAULT_MAX_REASON_LEN,
        }
    }

    pub fn with_max_reason_len(mut self, max_reason_len: usize) -> Self {
        self.max_reason_len = max_reason_len;
        self
    }

    pub fn policy(&self) -> &dyn FlagPolicy {
        self.policy.as_ref()
    }

    /// Raise a flag on `serial_hash`
    pub fn flag(
        &self,
        store: &RecordStore,
        serial_hash: &SerialHash,
        reason: &str,
        flagger: &Identity,
        now: DateTime<Utc>,
    ) -> Result<Product> {
        self.flag_then(store, serial_hash, reason, flagger, now, |_| ())
            .map(|(product, ())| product)
    }

    /// [`flag`](Self::flag), calling `on_commit` while the record is still
    /// locked
    pub fn flag_then<R, C>(
        &self,
        store: &RecordStore,
        serial_hash: &SerialHash,
        reason: &str,
        flagger: &Identity,
        now: DateTime<Utc>,
        on_commit: C,
    ) -> Result<(Product, R)>
    where
        C: FnOnce(&Product) -> R,
    {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(RegistryError::InvalidReason("reason is required".into()));
        }
        if reason.len() > self.max_reason_len {
            return Err(RegistryError::InvalidReason(format!(
                "reason is {} bytes, limit is {}",
                reason.len(),
                self.max_reason_len
            )));
        }

        let apply = |product: &mut Product| {
            if product.is_flagged() {
                return Err(RegistryError::AlreadyFlagged {
                    serial: serial_hash.to_string(),
                });
            }
            if !self.policy.can_flag(product, flagger) {
                return Err(RegistryError::unauthorized(flagger, "flag", serial_hash));
            }

            debug!(serial = %serial_hash, by = %flagger, "raising flag");
            product.flag = Some(Flag {
                reason: reason.to_string(),
                flagged_by: flagger.clone(),
                flagged_at: now,
            });
            Ok(product.clone())
        };
        store.update_then(serial_hash, apply, |committed, _| on_commit(committed))
    }

    /// Clear the active flag on `serial_hash`
    pub fn clear(
        &self,
        store: &RecordStore,
        serial_hash: &SerialHash,
        clearer: &Identity,
    ) -> Result<Product> {
        self.clear_then(store, serial_hash, clearer, |_| ())
            .map(|(product, ())| product)
    }

    /// [`clear`](Self::clear), calling `on_commit` while the record is still
    /// locked
    pub fn clear_then<R, C>(
        &self,
        store: &RecordStore,
        serial_hash: &SerialHash,
        clearer: &Identity,
        on_commit: C,
    ) -> Result<(Product, R)>
    where
        C: FnOnce(&Product) -> R,
    {
        let apply = |product: &mut Product| {
            let flag = product.flag.as_ref().ok_or_else(|| RegistryError::NotFlagged {
                serial: serial_hash.to_string(),
            })?;
            if !self.policy.can_clear(product, flag, clearer) {
                return Err(RegistryError::unauthorized(clearer, "clear", serial_hash));
            }

            debug!(serial = %serial_hash, by = %clearer, "clearing flag");
            product.flag = None;
            Ok(product.clone())
        };
        store.update_then(serial_hash, apply, |committed, _| on_commit(committed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    fn setup() -> (RecordStore, SerialHash) {
        let store = RecordStore::new();
        let serial = SerialHash::parse("0xAA").unwrap();
        store
            .create(
                serial.clone(),
                Checksum::from_bytes(b"m"),
                None,
                id("owner1"),
                Utc::now(),
            )
            .unwrap();
        (store, serial)
    }

    #[test]
    fn test_flag_and_clear() {
        let (store, serial) = setup();
        let mgr = FlagManager::default();

        let flagged = mgr
            .flag(&store, &serial, "counterfeit suspected", &id("inspector"), Utc::now())
            .unwrap();
        let flag = flagged.flag.as_ref().unwrap();
        assert_eq!(flag.reason, "counterfeit suspected");
        assert_eq!(flag.flagged_by, id("inspector"));

        let cleared = mgr.clear(&store, &serial, &id("inspector")).unwrap();
        assert!(cleared.flag.is_none());
        assert!(!store.get(&serial).unwrap().is_flagged());
    }

    #[test]
    fn test_double_flag() {
        let (store, serial) = setup();
        let mgr = FlagManager::default();
        mgr.flag(&store, &serial, "first", &id("a"), Utc::now()).unwrap();

        let result = mgr.flag(&store, &serial, "second", &id("b"), Utc::now());
        assert!(matches!(result, Err(RegistryError::AlreadyFlagged { .. })));
        assert_eq!(store.get(&serial).unwrap().flag.unwrap().reason, "first");
    }

    #[test]
    fn test_clear_unflagged() {
        let (store, serial) = setup();
        let result = FlagManager::default().clear(&store, &serial, &id("owner1"));
        assert!(matches!(result, Err(RegistryError::NotFlagged { .. })));
    }

    #[test]
    fn test_blank_and_oversized_reason() {
        let (store, serial) = setup();
        let mgr = FlagManager::default().with_max_reason_len(8);

        let result = mgr.flag(&store, &serial, "  ", &id("a"), Utc::now());
        assert!(matches!(result, Err(RegistryError::InvalidReason(_))));

        let result = mgr.flag(&store, &serial, "far too long a reason", &id("a"), Utc::now());
        assert!(matches!(result, Err(RegistryError::InvalidReason(_))));
        assert!(!store.get(&serial).unwrap().is_flagged());
    }

    #[test]
    fn test_only_flagger_or_admin_clears() {
        let (store, serial) = setup();
        let mgr = FlagManager::new(Box::new(OpenFlagPolicy::new(Some(id("admin")))));
        mgr.flag(&store, &serial, "stolen", &id("a"), Utc::now()).unwrap();

        let result = mgr.clear(&store, &serial, &id("owner1"));
        assert!(matches!(result, Err(RegistryError::Unauthorized { .. })));
        assert!(store.get(&serial).unwrap().is_flagged());

        mgr.clear(&store, &serial, &id("admin")).unwrap();
        assert!(!store.get(&serial).unwrap().is_flagged());
    }

    #[test]
    fn test_verifier_policy() {
        let (store, serial) = setup();
        let mgr = FlagManager::new(Box::new(VerifierFlagPolicy::new(
            None,
            [id("regulator")],
        )));

        let result = mgr.flag(&store, &serial, "recall", &id("owner1"), Utc::now());
        assert!(matches!(result, Err(RegistryError::Unauthorized { .. })));

        mgr.flag(&store, &serial, "recall", &id("regulator"), Utc::now())
            .unwrap();
        assert!(store.get(&serial).unwrap().is_flagged());
    }
}
