#![allow(dead_code)]

use agora::{
    bus::Relay,
    entity::{Condition, Offer, OfferAttributes, User},
    manager::Manager,
    store::Store,
};
use std::sync::Arc;
use tempfile::TempDir;

pub const ALICE: &str = "alice";
pub const BOB: &str = "bob";
pub const CAROL: &str = "carol";
/// Owned by Bob
pub const BIKE: &str = "offer-bike";
/// Owned by Carol
pub const DESK: &str = "offer-desk";

/// A store on a fresh database file, seeded with three users and two offers.
/// Keep the returned directory alive for as long as the store is used.
pub async fn seeded_store() -> (TempDir, Store) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = Store::new(dir.path().join("agora.db"))
        .await
        .expect("Failed to create store");
    store.init().await.expect("Failed to init schema");

    for (id, name) in [(ALICE, "Alice"), (BOB, "Bob"), (CAROL, "Carol")] {
        store
            .insert_user(&User::new(id, name, format!("{}@uni.example", id)))
            .await
            .unwrap();
    }

    store
        .insert_offer(&Offer::new(
            BIKE,
            BOB,
            "City bike",
            OfferAttributes::Other,
        ))
        .await
        .unwrap();
    store
        .insert_offer(&Offer::new(
            DESK,
            CAROL,
            "Standing desk",
            OfferAttributes::Furniture {
                width_cm: Some(120),
                depth_cm: Some(60),
                height_cm: None,
            },
        ))
        .await
        .unwrap();

    (dir, store)
}

pub async fn seeded_manager() -> (TempDir, Arc<Relay>, Arc<Manager>) {
    let (dir, store) = seeded_store().await;
    let relay = Arc::new(Relay::new(64));
    let manager = Arc::new(Manager::new(store, relay.clone()));
    (dir, relay, manager)
}

pub fn electronics() -> OfferAttributes {
    OfferAttributes::Electronics {
        brand: Some("Fairphone".into()),
        model: Some("5".into()),
        condition: Condition::Used,
    }
}
