//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use tapestry::data::{BaseEntitySpec, EntityBase, FieldType, FieldValue, Schema};
use tapestry::handle::{HandleContainerType, HandleDataType, HandleMode, HandleSpec};
use tapestry::storage::StoreManager;
use tapestry::time::FakeTime;
use tapestry::{HandleManager, IdGenerator, Scheduler};

pub const START_MILLIS: i64 = 1_700_000_000_000;

pub fn person_spec() -> Arc<BaseEntitySpec> {
    let schema = Schema::builder("Person")
        .singleton("name", FieldType::Text)
        .singleton("age", FieldType::Number)
        .singleton("is_cool", FieldType::Boolean)
        .build();
    Arc::new(BaseEntitySpec::new("Person", Arc::new(schema)))
}

pub fn person(id: &str, name: &str, age: f64, is_cool: bool) -> EntityBase {
    let mut entity = person_spec().create().with_id(id);
    entity
        .set_singleton("name", Some(FieldValue::from(name)))
        .unwrap();
    entity
        .set_singleton("age", Some(FieldValue::from(age)))
        .unwrap();
    entity
        .set_singleton("is_cool", Some(FieldValue::from(is_cool)))
        .unwrap();
    entity
}

pub fn spec(
    name: &str,
    mode: HandleMode,
    container: HandleContainerType,
) -> HandleSpec<BaseEntitySpec> {
    HandleSpec::new(name, mode, container, HandleDataType::Entity, person_spec()).unwrap()
}

/// One arc's view of a process: its own scheduler and handle manager over
/// stores shared with every other fixture built from the same `stores`
pub struct Peer {
    pub scheduler: Scheduler,
    pub manager: HandleManager,
}

pub fn peer(name: &str, stores: &Arc<StoreManager>, time: &Arc<FakeTime>) -> Peer {
    let scheduler = Scheduler::current(name);
    let manager = HandleManager::builder(name, "host", scheduler.clone())
        .stores(stores.clone())
        .time(time.clone())
        .ids(IdGenerator::with_session("test"))
        .build()
        .unwrap();
    Peer { scheduler, manager }
}

pub fn clock() -> Arc<FakeTime> {
    Arc::new(FakeTime::new(START_MILLIS))
}
