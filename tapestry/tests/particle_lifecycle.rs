//! Particles driven by an arc host over real handles and stores

mod common;

use common::{clock, person, spec};
use parking_lot::Mutex;
use std::sync::Arc;
use tapestry::crdt::{CrdtSet, CrdtSetOp, VersionMap};
use tapestry::data::RawEntity;
use tapestry::handle::{HandleContainerType, HandleMode, HandleOptions, ParticleHandle};
use tapestry::particle::MAX_CONSECUTIVE_FAILURES;
use tapestry::storage::{StorageKey, StoreEvent, StoreManager};
use tapestry::{
    ArcHost, HandleManager, IdGenerator, Particle, ParticleInstance, ParticleState, Scheduler,
};

/// Records every callback it receives
#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| e.as_str() == entry).count()
    }
}

struct Watcher {
    journal: Journal,
    fail_start: bool,
}

impl Particle for Watcher {
    fn on_first_start(&mut self) -> anyhow::Result<()> {
        self.journal.0.lock().push("first_start".into());
        Ok(())
    }

    fn on_start(&mut self) -> anyhow::Result<()> {
        if self.fail_start {
            anyhow::bail!("start refused");
        }
        self.journal.0.lock().push("start".into());
        Ok(())
    }

    fn on_ready(&mut self) -> anyhow::Result<()> {
        self.journal.0.lock().push("ready".into());
        Ok(())
    }

    fn on_update(&mut self, handle: &str) -> anyhow::Result<()> {
        self.journal.0.lock().push(format!("update:{}", handle));
        Ok(())
    }

    fn on_desync(&mut self) -> anyhow::Result<()> {
        self.journal.0.lock().push("desync".into());
        Ok(())
    }

    fn on_resync(&mut self) -> anyhow::Result<()> {
        self.journal.0.lock().push("resync".into());
        Ok(())
    }

    fn on_shutdown(&mut self) -> anyhow::Result<()> {
        self.journal.0.lock().push("shutdown".into());
        Ok(())
    }
}

fn host(stores: &Arc<StoreManager>) -> ArcHost {
    let manager = HandleManager::builder("arc", "host", Scheduler::current("arc"))
        .stores(stores.clone())
        .time(clock())
        .ids(IdGenerator::with_session("test"))
        .build()
        .unwrap();
    ArcHost::new(manager)
}

fn reader(
    manager: &HandleManager,
    particle: &str,
    name: &str,
) -> anyhow::Result<Arc<dyn ParticleHandle>> {
    let handle = manager.entity_collection_handle(
        &spec(name, HandleMode::Read, HandleContainerType::Collection),
        StorageKey::ram(name),
        &HandleOptions::for_particle(particle),
    )?;
    let handle: Arc<dyn ParticleHandle> = Arc::new(handle);
    Ok(handle)
}

fn register_watcher(host: &ArcHost, journal: &Journal, keys: &'static [&'static str]) {
    let journal = journal.clone();
    host.register_particle("watcher", move |manager, name| {
        let mut handles = Vec::new();
        for key in keys {
            handles.push(reader(manager, name, key)?);
        }
        Ok(ParticleInstance::new(
            Box::new(Watcher {
                journal: journal.clone(),
                fail_start: false,
            }),
            handles,
        ))
    });
}

/// Op that skips ahead of every replica, forcing a desync
fn gapped_op() -> CrdtSetOp<RawEntity> {
    CrdtSetOp::Add {
        actor: "ghost".into(),
        version_map: VersionMap::from_pairs([("ghost", 5)]),
        added: RawEntity::empty("ghost-entity"),
    }
}

#[tokio::test]
async fn test_ready_fires_once_after_every_handle_syncs() {
    let stores = Arc::new(StoreManager::new());
    let host = host(&stores);
    let journal = Journal::default();
    register_watcher(&host, &journal, &["left", "middle", "right"]);

    let state = host.start_particle("watcher").await.unwrap();
    assert_eq!(state, ParticleState::Running);
    assert_eq!(journal.entries(), vec!["first_start", "start", "ready"]);
}

#[tokio::test]
async fn test_updates_arrive_per_handle() {
    let stores = Arc::new(StoreManager::new());
    let host = host(&stores);
    let journal = Journal::default();
    register_watcher(&host, &journal, &["left", "right"]);
    host.start_particle("watcher").await.unwrap();

    let time = clock();
    let writer_peer = common::peer("writer", &stores, &time);
    let writer = writer_peer
        .manager
        .entity_collection_handle(
            &spec("out", HandleMode::Write, HandleContainerType::Collection),
            StorageKey::ram("right"),
            &HandleOptions::for_particle("w"),
        )
        .unwrap();
    writer_peer.scheduler.wait_for_idle().await.unwrap();
    writer
        .store(&mut person("e1", "Ada", 36.0, true))
        .unwrap()
        .await
        .unwrap();
    writer_peer.scheduler.wait_for_idle().await.unwrap();
    host.handle_manager().scheduler().wait_for_idle().await.unwrap();

    assert_eq!(journal.count("update:arc:host:watcher:right"), 1);
    assert_eq!(journal.count("update:arc:host:watcher:left"), 0);
}

#[tokio::test]
async fn test_desync_and_resync_are_reported_once() {
    let stores = Arc::new(StoreManager::new());
    let host = host(&stores);
    let journal = Journal::default();
    register_watcher(&host, &journal, &["left", "right"]);
    host.start_particle("watcher").await.unwrap();

    for key in ["left", "right"] {
        stores
            .get_or_create::<CrdtSet<RawEntity>>(&StorageKey::ram(key))
            .deliver(StoreEvent::Operations(vec![gapped_op()]));
    }
    host.handle_manager().scheduler().wait_for_idle().await.unwrap();

    assert_eq!(journal.count("desync"), 1);
    assert_eq!(journal.count("resync"), 1);
    let entries = journal.entries();
    let desync = entries.iter().position(|e| e == "desync").unwrap();
    let resync = entries.iter().position(|e| e == "resync").unwrap();
    assert!(desync < resync);
    assert_eq!(host.particle_state("watcher"), Some(ParticleState::Running));
}

#[tokio::test]
async fn test_repeated_start_failures_end_in_max_failed() {
    let stores = Arc::new(StoreManager::new());
    let host = host(&stores);
    let journal = Journal::default();
    let recorded = journal.clone();
    host.register_particle("stubborn", move |manager, name| {
        Ok(ParticleInstance::new(
            Box::new(Watcher {
                journal: recorded.clone(),
                fail_start: true,
            }),
            vec![reader(manager, name, "left")?],
        ))
    });

    let state = host.start_particle("stubborn").await.unwrap();
    assert_eq!(state, ParticleState::MaxFailed("start refused".into()));
    let context = host.particle("stubborn").unwrap();
    assert_eq!(context.consecutive_failures(), MAX_CONSECUTIVE_FAILURES);
    // on_first_start succeeded once; rebuilt instances skip it
    assert_eq!(journal.count("first_start"), 1);
    assert_eq!(journal.count("ready"), 0);

    // Terminal: asking again does not rebuild it
    let again = host.start_particle("stubborn").await.unwrap();
    assert!(matches!(again, ParticleState::MaxFailed(_)));
    assert_eq!(journal.count("first_start"), 1);
}

#[tokio::test]
async fn test_stop_runs_shutdown_and_closes_handles() {
    let stores = Arc::new(StoreManager::new());
    let host = host(&stores);
    let journal = Journal::default();
    register_watcher(&host, &journal, &["left"]);
    host.start_all().await.unwrap();
    host.stop().await.unwrap();

    assert_eq!(journal.count("shutdown"), 1);
    assert_eq!(host.particle_state("watcher"), Some(ParticleState::Stopped));
    assert!(host.handle_manager().is_closed());
    assert!(host
        .particle("watcher")
        .unwrap()
        .handles()
        .iter()
        .all(|handle| handle.is_closed()));
}
