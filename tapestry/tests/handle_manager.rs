//! Handles across handle managers sharing one set of stores

mod common;

use common::{clock, peer, person, spec};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tapestry::data::{EntityRecord, Ttl};
use tapestry::error::{Error, HandleError};
use tapestry::handle::{HandleContainerType, HandleMode, HandleOptions};
use tapestry::storage::{StorageKey, StoreManager};

#[tokio::test]
async fn test_store_is_visible_to_the_same_handle_at_once() {
    let stores = Arc::new(StoreManager::new());
    let time = clock();
    let a = peer("a", &stores, &time);
    let handle = a
        .manager
        .entity_singleton_handle(
            &spec("me", HandleMode::ReadWrite, HandleContainerType::Singleton),
            StorageKey::ram("me"),
            &HandleOptions::for_particle("p"),
        )
        .unwrap();
    a.scheduler.wait_for_idle().await.unwrap();

    let mut ada = person("e1", "Ada", 36.0, true);
    let done = handle.store(&mut ada).unwrap();
    assert_eq!(handle.fetch().unwrap(), Some(ada.clone()));
    assert!(done.await.unwrap());
}

#[tokio::test]
async fn test_writes_reach_readers_in_other_managers() {
    let stores = Arc::new(StoreManager::new());
    let time = clock();
    let a = peer("a", &stores, &time);
    let b = peer("b", &stores, &time);
    let key = StorageKey::ram("people");
    let writer = a
        .manager
        .entity_collection_handle(
            &spec("out", HandleMode::Write, HandleContainerType::Collection),
            key.clone(),
            &HandleOptions::for_particle("w"),
        )
        .unwrap();
    let reader = b
        .manager
        .entity_collection_handle(
            &spec("in", HandleMode::ReadQuery, HandleContainerType::Collection),
            key,
            &HandleOptions::for_particle("r"),
        )
        .unwrap();
    a.scheduler.wait_for_idle().await.unwrap();
    b.scheduler.wait_for_idle().await.unwrap();

    let mut people = vec![person("e1", "Ada", 36.0, true), person("e2", "Bo", 7.0, false)];
    writer.store_all(&mut people).unwrap().await.unwrap();
    a.scheduler.wait_for_idle().await.unwrap();
    b.scheduler.wait_for_idle().await.unwrap();

    assert_eq!(reader.size().unwrap(), 2);
    assert_eq!(reader.fetch_by_id("e2").unwrap(), Some(people[1].clone()));
    let cool = reader
        .query(|p| p.boolean("is_cool").ok().flatten() == Some(true))
        .unwrap();
    assert_eq!(cool, vec![people[0].clone()]);
}

#[tokio::test]
async fn test_ttl_expiry_hides_entities() {
    let stores = Arc::new(StoreManager::new());
    let time = clock();
    let a = peer("a", &stores, &time);
    let handle = a
        .manager
        .entity_collection_handle(
            &spec("short", HandleMode::ReadWrite, HandleContainerType::Collection),
            StorageKey::ram("short"),
            &HandleOptions::for_particle("p").with_ttl(Ttl::Minutes(2)),
        )
        .unwrap();
    a.scheduler.wait_for_idle().await.unwrap();

    let mut ada = person("e1", "Ada", 36.0, true);
    handle.store(&mut ada).unwrap().await.unwrap();
    assert_eq!(
        ada.expiration_timestamp(),
        common::START_MILLIS + 2 * 60 * 1000
    );
    assert_eq!(handle.fetch_all().unwrap(), vec![ada]);

    time.advance(5 * 60 * 1000);
    assert!(handle.fetch_all().unwrap().is_empty());
    assert!(handle.fetch_by_id("e1").unwrap().is_none());
    assert_eq!(handle.size().unwrap(), 0);
}

#[tokio::test]
async fn test_closed_manager_stops_propagation() {
    let stores = Arc::new(StoreManager::new());
    let time = clock();
    let a = peer("a", &stores, &time);
    let b = peer("b", &stores, &time);
    let key = StorageKey::ram("people");
    let writer = a
        .manager
        .entity_collection_handle(
            &spec("out", HandleMode::Write, HandleContainerType::Collection),
            key.clone(),
            &HandleOptions::for_particle("w"),
        )
        .unwrap();
    let reader = b
        .manager
        .entity_collection_handle(
            &spec("in", HandleMode::Read, HandleContainerType::Collection),
            key,
            &HandleOptions::for_particle("r"),
        )
        .unwrap();
    let updates = Arc::new(AtomicUsize::new(0));
    let seen = updates.clone();
    reader
        .on_update(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    a.scheduler.wait_for_idle().await.unwrap();
    b.scheduler.wait_for_idle().await.unwrap();

    writer
        .store(&mut person("e1", "Ada", 36.0, true))
        .unwrap()
        .await
        .unwrap();
    a.scheduler.wait_for_idle().await.unwrap();
    b.scheduler.wait_for_idle().await.unwrap();
    assert_eq!(updates.load(Ordering::SeqCst), 1);

    b.manager.close().await.unwrap();
    writer
        .store(&mut person("e2", "Bo", 7.0, false))
        .unwrap()
        .await
        .unwrap();
    a.scheduler.wait_for_idle().await.unwrap();
    b.scheduler.wait_for_idle().await.unwrap();

    assert_eq!(updates.load(Ordering::SeqCst), 1);
    assert!(reader.is_closed());
    assert_eq!(
        reader.fetch_all().err().unwrap().to_string(),
        "Handle b:host:r:in is closed"
    );
}

#[tokio::test]
async fn test_capability_violations_name_handle_and_operation() {
    let stores = Arc::new(StoreManager::new());
    let time = clock();
    let a = peer("a", &stores, &time);
    let key = StorageKey::ram("people");
    let write_only = a
        .manager
        .entity_collection_handle(
            &spec("out", HandleMode::Write, HandleContainerType::Collection),
            key.clone(),
            &HandleOptions::for_particle("p"),
        )
        .unwrap();
    let read_only = a
        .manager
        .entity_collection_handle(
            &spec("in", HandleMode::Read, HandleContainerType::Collection),
            key,
            &HandleOptions::for_particle("p"),
        )
        .unwrap();
    a.scheduler.wait_for_idle().await.unwrap();

    assert_eq!(
        write_only.fetch_all().err().unwrap().to_string(),
        "fetch_all is not permitted on handle a:host:p:out (mode Write)"
    );
    assert!(matches!(
        read_only.store(&mut person("e1", "Ada", 36.0, true)),
        Err(Error::Handle(HandleError::NotPermitted { .. }))
    ));
    assert!(matches!(
        read_only.query(|_| true),
        Err(Error::Handle(HandleError::NotPermitted { .. }))
    ));

    let mut nameless = common::person_spec().create();
    let read_write = a
        .manager
        .entity_collection_handle(
            &spec("rw", HandleMode::ReadWrite, HandleContainerType::Collection),
            StorageKey::ram("other"),
            &HandleOptions::for_particle("p"),
        )
        .unwrap();
    assert_eq!(
        read_write.remove(&nameless).err().unwrap().to_string(),
        "Cannot remove an item without ID."
    );
    read_write.store(&mut nameless).unwrap();
    assert!(nameless.entity_id().is_some());
}

#[tokio::test]
async fn test_singleton_query_modes_are_rejected() {
    let err = tapestry::handle::HandleSpec::new(
        "s",
        HandleMode::Query,
        HandleContainerType::Singleton,
        tapestry::handle::HandleDataType::Entity,
        common::person_spec(),
    )
    .err()
    .unwrap();
    assert_eq!(err.to_string(), "Singleton Handles do not support mode Query");
}
