//! End-to-end registry behavior
//!
//! Drives `ProductRegistry` through full product lifecycles, the way a
//! client layer would.

use std::sync::Arc;
use std::thread;

use chrono::{TimeZone, Utc};
use provenance_registry::{
    Checksum, EventKind, FlagManager, Identity, OpenFlagPolicy, ProductMetadata, ProductRegistry,
    ProvenanceConfig, RegisterRequest, RegistryError, SerialHash,
};
use tempfile::tempdir;

fn id(s: &str) -> Identity {
    Identity::parse(s).unwrap()
}

fn serial(s: &str) -> SerialHash {
    SerialHash::parse(s).unwrap()
}

fn register(registry: &ProductRegistry, owner: &str, s: &str) {
    registry
        .register(
            &id(owner),
            RegisterRequest::new(serial(s), Checksum::from_bytes(s.as_bytes())),
        )
        .unwrap();
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_counterfeit_dispute_lifecycle() {
    let registry = ProductRegistry::new();
    let aa = serial("0xAA");
    let owner1 = id("owner1");
    let owner2 = id("owner2");
    let owner3 = id("owner3");

    let metadata = ProductMetadata::new(
        "Leather Handbag",
        "Limited run, stitched lining",
        "0xAA",
        Utc.timestamp_millis_opt(1_715_000_000_000).unwrap(),
    );
    let h = metadata.fingerprint().unwrap();
    let receipt = registry
        .register(
            &owner1,
            RegisterRequest::new(aa.clone(), h)
                .with_uri("ipfs://m1")
                .with_metadata(metadata),
        )
        .unwrap();
    assert_eq!(receipt.serial_hash, aa);

    let view = registry.get_product(&aa).unwrap();
    assert_eq!(view.current_owner, owner1);
    assert!(!view.is_flagged);
    assert_eq!(view.metadata_uri.as_deref(), Some("ipfs://m1"));
    assert_eq!(registry.product(&aa).unwrap().metadata_hash, h);

    registry.transfer(&owner1, &aa, &owner2).unwrap();
    assert_eq!(registry.get_product(&aa).unwrap().current_owner, owner2);
    assert_eq!(registry.transfer_history(&aa).unwrap().len(), 2);

    registry.flag(&owner2, &aa, "counterfeit suspected").unwrap();
    let view = registry.get_product(&aa).unwrap();
    assert!(view.is_flagged);
    assert_eq!(view.flag_reason.as_deref(), Some("counterfeit suspected"));
    assert_eq!(view.flagged_by.as_ref(), Some(&owner2));

    let blocked = registry.transfer(&owner2, &aa, &owner3);
    assert!(matches!(blocked, Err(RegistryError::TransferBlocked { .. })));

    registry.clear_flag(&owner2, &aa).unwrap();
    let view = registry.get_product(&aa).unwrap();
    assert!(!view.is_flagged);
    assert!(view.flag_reason.is_none());
    assert!(view.flagged_by.is_none());

    registry.transfer(&owner2, &aa, &owner3).unwrap();
    let history = registry.transfer_history(&aa).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history.last().unwrap().new_owner, owner3);
    assert_eq!(registry.get_product(&aa).unwrap().current_owner, owner3);

    let kinds: Vec<_> = registry
        .events_for(&aa)
        .into_iter()
        .map(|e| e.kind.name())
        .collect();
    assert_eq!(
        kinds,
        vec!["registered", "transferred", "flagged", "flag_cleared", "transferred"]
    );
}

#[test]
fn test_duplicate_registration_keeps_first() {
    let registry = ProductRegistry::new();
    let first = RegisterRequest::new(serial("0xAA"), Checksum::from_bytes(b"first"))
        .with_uri("ipfs://first");
    registry.register(&id("owner1"), first).unwrap();

    let second = RegisterRequest::new(serial("0xAA"), Checksum::from_bytes(b"second"))
        .with_uri("ipfs://second");
    let result = registry.register(&id("mallory"), second);
    assert!(matches!(result, Err(RegistryError::DuplicateSerial { .. })));

    assert_eq!(registry.list_product_ids(), vec![serial("0xAA")]);
    let product = registry.product(&serial("0xAA")).unwrap();
    assert_eq!(product.current_owner, id("owner1"));
    assert_eq!(product.metadata_hash, Checksum::from_bytes(b"first"));
    assert_eq!(product.metadata_uri.as_deref(), Some("ipfs://first"));
}

#[test]
fn test_non_owner_transfer_changes_nothing() {
    let registry = ProductRegistry::new();
    register(&registry, "owner1", "0xAA");
    let before = registry.product(&serial("0xAA")).unwrap();

    let result = registry.transfer(&id("owner2"), &serial("0xAA"), &id("owner2"));
    assert!(matches!(result, Err(RegistryError::Unauthorized { .. })));
    assert_eq!(registry.product(&serial("0xAA")).unwrap(), before);
}

#[test]
fn test_flag_state_errors() {
    let registry = ProductRegistry::new();
    register(&registry, "owner1", "0xAA");

    let result = registry.clear_flag(&id("owner1"), &serial("0xAA"));
    assert!(matches!(result, Err(RegistryError::NotFlagged { .. })));

    registry.flag(&id("owner1"), &serial("0xAA"), "stolen").unwrap();
    let result = registry.flag(&id("owner1"), &serial("0xAA"), "stolen again");
    assert!(matches!(result, Err(RegistryError::AlreadyFlagged { .. })));
}

#[test]
fn test_unknown_product() {
    let registry = ProductRegistry::new();
    let missing = serial("0x0404");
    assert!(matches!(
        registry.get_product(&missing),
        Err(RegistryError::NotFound { .. })
    ));
    assert!(matches!(
        registry.transfer(&id("a"), &missing, &id("b")),
        Err(RegistryError::NotFound { .. })
    ));
    assert!(matches!(
        registry.flag(&id("a"), &missing, "x"),
        Err(RegistryError::NotFound { .. })
    ));
    assert!(matches!(
        registry.clear_flag(&id("a"), &missing),
        Err(RegistryError::NotFound { .. })
    ));
    assert!(registry.events().is_empty());
}

#[test]
fn test_reads_are_idempotent() {
    let registry = ProductRegistry::new();
    register(&registry, "owner1", "0xAA");
    registry.flag(&id("inspector"), &serial("0xAA"), "recall").unwrap();

    let a = registry.get_product(&serial("0xAA")).unwrap();
    let b = registry.get_product(&serial("0xAA")).unwrap();
    assert_eq!(a, b);
    assert_eq!(registry.list_product_ids(), registry.list_product_ids());
    assert_eq!(registry.events().len(), 2);
}

#[test]
fn test_listing_follows_registration_order() {
    let registry = ProductRegistry::new();
    for s in ["0x30", "0x10", "0x20"] {
        register(&registry, "owner1", s);
    }
    let expected = vec![serial("0x30"), serial("0x10"), serial("0x20")];
    assert_eq!(registry.list_product_ids(), expected);

    let listed: Vec<_> = registry.products().map(|p| p.serial_hash).collect();
    assert_eq!(listed, expected);
}

#[test]
fn test_administrator_clears_any_flag() {
    let registry = ProductRegistry::new().with_flag_manager(FlagManager::new(Box::new(
        OpenFlagPolicy::new(Some(id("admin"))),
    )));
    register(&registry, "owner1", "0xAA");
    registry.flag(&id("stranger"), &serial("0xAA"), "looks fake").unwrap();

    let result = registry.clear_flag(&id("owner1"), &serial("0xAA"));
    assert!(matches!(result, Err(RegistryError::Unauthorized { .. })));

    registry.clear_flag(&id("admin"), &serial("0xAA")).unwrap();
    registry
        .transfer(&id("owner1"), &serial("0xAA"), &id("owner2"))
        .unwrap();
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_state_file_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("registry.json");
    let config = ProvenanceConfig::default();

    {
        let registry = ProductRegistry::open(&path, &config).unwrap();
        register(&registry, "owner1", "0xAA");
        register(&registry, "owner1", "0xBB");
        registry
            .transfer(&id("owner1"), &serial("0xBB"), &id("owner2"))
            .unwrap();
        registry.save(&path).unwrap();
    }

    let registry = ProductRegistry::open(&path, &config).unwrap();
    assert_eq!(registry.list_product_ids(), vec![serial("0xAA"), serial("0xBB")]);
    assert_eq!(
        registry.get_product(&serial("0xBB")).unwrap().current_owner,
        id("owner2")
    );
    assert_eq!(registry.events().len(), 3);

    // The restored registry keeps enforcing uniqueness
    let again = registry.register(
        &id("owner9"),
        RegisterRequest::new(serial("0xAA"), Checksum::from_bytes(b"x")),
    );
    assert!(matches!(again, Err(RegistryError::DuplicateSerial { .. })));
}

#[test]
fn test_tampered_state_file_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("registry.json");

    let registry = ProductRegistry::new();
    register(&registry, "owner1", "0xAA");
    registry
        .transfer(&id("owner1"), &serial("0xAA"), &id("owner2"))
        .unwrap();
    registry.save(&path).unwrap();

    // Rewrite the current owner without a matching transfer
    let content = std::fs::read_to_string(&path).unwrap();
    let mut state: serde_json::Value = serde_json::from_str(&content).unwrap();
    state["products"][0]["current_owner"] = serde_json::json!("mallory");
    std::fs::write(&path, serde_json::to_string(&state).unwrap()).unwrap();

    let result = ProductRegistry::new().load(&path);
    assert!(matches!(result, Err(RegistryError::CorruptState(_))));
}

/// Save a registry, edit its JSON with `edit`, and try to load it back
fn load_edited(
    registry: &ProductRegistry,
    edit: impl FnOnce(&mut serde_json::Value),
) -> provenance_registry::Result<ProductRegistry> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("registry.json");
    registry.save(&path).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let mut state: serde_json::Value = serde_json::from_str(&content).unwrap();
    edit(&mut state);
    std::fs::write(&path, serde_json::to_string(&state).unwrap()).unwrap();

    ProductRegistry::new().load(&path)
}

#[test]
fn test_dropped_flag_rejected() {
    let registry = ProductRegistry::new();
    register(&registry, "owner1", "0xAA");
    registry.flag(&id("inspector"), &serial("0xAA"), "counterfeit suspected").unwrap();

    let result = load_edited(&registry, |state| {
        state["products"][0]["flag"] = serde_json::Value::Null;
    });
    assert!(matches!(result, Err(RegistryError::CorruptState(_))));

    // Untouched state still loads, and the dispute still blocks transfers
    let restored = load_edited(&registry, |_| {}).unwrap();
    assert!(matches!(
        restored.transfer(&id("owner1"), &serial("0xAA"), &id("owner2")),
        Err(RegistryError::TransferBlocked { .. })
    ));
}

#[test]
fn test_forged_metadata_hash_rejected() {
    let registry = ProductRegistry::new();
    register(&registry, "owner1", "0xAA");

    let forged = Checksum::from_bytes(b"forged").to_string();
    let result = load_edited(&registry, |state| {
        state["products"][0]["metadata_hash"] = serde_json::json!(forged);
    });
    assert!(matches!(result, Err(RegistryError::CorruptState(_))));
}

#[test]
fn test_removed_record_rejected() {
    let registry = ProductRegistry::new();
    register(&registry, "owner1", "0xAA");
    register(&registry, "owner1", "0xBB");

    let result = load_edited(&registry, |state| {
        if let Some(products) = state["products"].as_array_mut() {
            products.pop();
        }
    });
    assert!(matches!(result, Err(RegistryError::CorruptState(_))));
}

#[test]
fn test_snapshot_taken_during_writes_is_consistent() {
    let registry = Arc::new(ProductRegistry::new());
    let writer = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for n in 0..50u8 {
                let s = format!("0x{:02x}", n);
                register(&registry, "maker", &s);
                registry.flag(&id("inspector"), &serial(&s), "batch recall").unwrap();
            }
        })
    };
    for _ in 0..20 {
        let state = registry.snapshot();
        ProductRegistry::new().restore(state).unwrap();
    }
    writer.join().unwrap();
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_racing_transfers_serialize() {
    let registry = Arc::new(ProductRegistry::new());
    register(&registry, "owner1", "0xAA");

    // Every thread tries to take the product from owner1; only one can win.
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                registry
                    .transfer(&id("owner1"), &serial("0xAA"), &id(&format!("buyer{}", i)))
                    .is_ok()
            })
        })
        .collect();
    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(wins, 1);

    let product = registry.product(&serial("0xAA")).unwrap();
    assert_eq!(product.transfer_history.len(), 2);
    product.check_invariants().unwrap();
    assert_eq!(registry.events().len(), 2);
}

#[test]
fn test_parallel_registrations_and_event_order() {
    let registry = Arc::new(ProductRegistry::new());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for n in 0..25u8 {
                    let s = format!("0x{:02x}{:02x}", t, n);
                    register(&registry, "maker", &s);
                    registry
                        .transfer(&id("maker"), &serial(&s), &id("retailer"))
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(registry.len(), 100);
    let events = registry.events();
    assert_eq!(events.len(), 200);
    for (i, e) in events.iter().enumerate() {
        assert_eq!(e.sequence, i as u64);
    }
    // Each product's registration is logged before its transfer
    for s in registry.list_product_ids() {
        let kinds: Vec<_> = registry.events_for(&s).into_iter().map(|e| e.kind).collect();
        assert!(matches!(kinds[0], EventKind::Registered { .. }));
        assert!(matches!(kinds[1], EventKind::Transferred { .. }));
    }
}
