use super::{Particle, ParticleState};
use crate::error::{ParticleError, Result};
use crate::handle::ParticleHandle;
use crate::scheduler::Completion;
use crate::storage::{ProxyState, StorageEvent};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Failures in a row before a particle is given up on; the fifth consecutive
/// failure is terminal
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// A freshly built particle together with the handles it was given
pub struct ParticleInstance {
    pub particle: Box<dyn Particle>,
    pub handles: Vec<Arc<dyn ParticleHandle>>,
}

impl ParticleInstance {
    pub fn new(particle: Box<dyn Particle>, handles: Vec<Arc<dyn ParticleHandle>>) -> Self {
        Self { particle, handles }
    }
}

struct Lifecycle {
    state: ParticleState,
    failures: u32,
    /// Readable handles that have not reported ready yet
    awaiting_ready: BTreeSet<String>,
    desynced: BTreeSet<String>,
    pending_ready: Option<oneshot::Sender<bool>>,
}

enum Followup {
    Ready(oneshot::Sender<bool>),
    Update,
    Desync,
    Resync,
}

/// Drives one particle instance through its lifecycle
pub struct ParticleContext {
    name: String,
    particle: Mutex<Box<dyn Particle>>,
    handles: Vec<Arc<dyn ParticleHandle>>,
    lifecycle: Mutex<Lifecycle>,
}

impl ParticleContext {
    pub fn new(name: impl Into<String>, instance: ParticleInstance) -> Arc<Self> {
        Self::with_state(name.into(), instance, ParticleState::Instantiated, 0)
    }

    fn with_state(
        name: String,
        instance: ParticleInstance,
        state: ParticleState,
        failures: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            particle: Mutex::new(instance.particle),
            handles: instance.handles,
            lifecycle: Mutex::new(Lifecycle {
                state,
                failures,
                awaiting_ready: BTreeSet::new(),
                desynced: BTreeSet::new(),
                pending_ready: None,
            }),
        })
    }

    /// Same particle slot and failure history, new instance
    pub fn copy_with(&self, instance: ParticleInstance) -> Arc<Self> {
        let lifecycle = self.lifecycle.lock();
        Self::with_state(
            self.name.clone(),
            instance,
            lifecycle.state.clone(),
            lifecycle.failures,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ParticleState {
        self.lifecycle.lock().state.clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lifecycle.lock().failures
    }

    pub fn handles(&self) -> &[Arc<dyn ParticleHandle>] {
        &self.handles
    }

    fn readable(&self) -> impl Iterator<Item = &Arc<dyn ParticleHandle>> {
        self.handles.iter().filter(|handle| handle.mode().can_read())
    }

    fn invalid(&self, action: &'static str, state: &ParticleState) -> ParticleError {
        ParticleError::InvalidState {
            particle: self.name.clone(),
            action,
            state: state.to_string(),
        }
    }

    /// Run a particle callback; errors come back as a rendered cause
    fn call(
        &self,
        callback: &'static str,
        f: impl FnOnce(&mut dyn Particle) -> anyhow::Result<()>,
    ) -> std::result::Result<(), String> {
        let result = {
            let mut particle = self.particle.lock();
            f(particle.as_mut())
        };
        result.map_err(|err| {
            let cause = format!("{:#}", err);
            warn!(particle = %self.name, callback, error = %cause, "Particle callback failed");
            cause
        })
    }

    fn failed(&self, cause: String) -> ParticleError {
        self.mark_failed(cause.clone());
        ParticleError::CallbackFailed {
            particle: self.name.clone(),
            cause,
        }
    }

    /// Start the particle and hook its readable handles up to storage events
    pub fn init_particle(self: &Arc<Self>) -> Result<()> {
        let state = self.state();
        if !state.may_init() {
            return Err(self.invalid("init_particle", &state).into());
        }
        debug!(particle = %self.name, state = %state, "Initializing particle");

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.awaiting_ready = self.readable().map(|h| h.name().to_string()).collect();
            lifecycle.desynced.clear();
        }
        for handle in self.readable() {
            let context = Arc::downgrade(self);
            let name = handle.name().to_string();
            handle.register_for_storage_events(Arc::new(move |event| {
                if let Some(context) = context.upgrade() {
                    context.notify(event, &name);
                }
            }))?;
        }

        if !state.has_been_started() {
            self.call("on_first_start", |p| p.on_first_start())
                .map_err(|cause| self.failed(cause))?;
            self.lifecycle.lock().state = ParticleState::FirstStart;
        }
        self.call("on_start", |p| p.on_start())
            .map_err(|cause| self.failed(cause))?;
        self.lifecycle.lock().state = ParticleState::Waiting;
        Ok(())
    }

    /// Bring a waiting particle to `Running`
    ///
    /// The completion resolves to true once `on_ready` has run, or false when
    /// it failed. Handles whose proxies already synced count as ready.
    pub fn run_particle(&self) -> std::result::Result<Completion<bool>, ParticleError> {
        let synced: Vec<String> = self
            .readable()
            .filter(|h| matches!(h.proxy_state(), ProxyState::Sync | ProxyState::Desync))
            .map(|h| h.name().to_string())
            .collect();

        let (completion, ready_now, to_sync) = {
            let mut lifecycle = self.lifecycle.lock();
            match &lifecycle.state {
                ParticleState::Running => return Ok(Completion::ready(true)),
                ParticleState::Waiting if lifecycle.pending_ready.is_none() => {}
                other => return Err(self.invalid("run_particle", other)),
            }
            for name in &synced {
                lifecycle.awaiting_ready.remove(name);
            }
            let (tx, completion) = Completion::channel();
            if lifecycle.awaiting_ready.is_empty() {
                (completion, Some(tx), BTreeSet::new())
            } else {
                lifecycle.pending_ready = Some(tx);
                (completion, None, lifecycle.awaiting_ready.clone())
            }
        };

        match ready_now {
            Some(tx) => self.move_to_ready(tx),
            None => {
                debug!(particle = %self.name, waiting = to_sync.len(), "Waiting for handles");
                for handle in self.readable().filter(|h| to_sync.contains(h.name())) {
                    handle.maybe_initiate_sync();
                }
            }
        }
        Ok(completion)
    }

    fn move_to_ready(&self, tx: oneshot::Sender<bool>) {
        match self.call("on_ready", |p| p.on_ready()) {
            Ok(()) => {
                {
                    let mut lifecycle = self.lifecycle.lock();
                    if lifecycle.state == ParticleState::Waiting {
                        lifecycle.state = ParticleState::Running;
                    }
                }
                debug!(particle = %self.name, "Particle running");
                let _ = tx.send(true);
            }
            Err(cause) => {
                self.mark_failed(cause);
                let _ = tx.send(false);
            }
        }
    }

    /// Fold one handle's storage event into the particle's lifecycle
    pub fn notify(&self, event: StorageEvent, handle: &str) {
        let followup = {
            let mut lifecycle = self.lifecycle.lock();
            if !lifecycle.state.may_notify() {
                if event == StorageEvent::Ready {
                    lifecycle.awaiting_ready.remove(handle);
                }
                debug!(particle = %self.name, handle, event = ?event, state = %lifecycle.state, "Ignoring storage event");
                return;
            }
            match event {
                StorageEvent::Ready => {
                    if lifecycle.awaiting_ready.remove(handle)
                        && lifecycle.awaiting_ready.is_empty()
                    {
                        lifecycle.pending_ready.take().map(Followup::Ready)
                    } else {
                        None
                    }
                }
                StorageEvent::Update => {
                    let live = matches!(
                        lifecycle.state,
                        ParticleState::Running | ParticleState::Desynced
                    );
                    (live && lifecycle.awaiting_ready.is_empty()).then_some(Followup::Update)
                }
                StorageEvent::Desync => {
                    let first = lifecycle.desynced.is_empty();
                    lifecycle.desynced.insert(handle.to_string());
                    if first && lifecycle.state == ParticleState::Running {
                        lifecycle.state = ParticleState::Desynced;
                        Some(Followup::Desync)
                    } else {
                        None
                    }
                }
                StorageEvent::Resync => {
                    lifecycle.desynced.remove(handle);
                    (lifecycle.desynced.is_empty()
                        && lifecycle.state == ParticleState::Desynced)
                        .then_some(Followup::Resync)
                }
            }
        };

        let result = match followup {
            None => return,
            Some(Followup::Ready(tx)) => {
                self.move_to_ready(tx);
                return;
            }
            Some(Followup::Update) => self.call("on_update", |p| p.on_update(handle)),
            Some(Followup::Desync) => self.call("on_desync", |p| p.on_desync()),
            Some(Followup::Resync) => self.call("on_resync", |p| p.on_resync()).map(|()| {
                let mut lifecycle = self.lifecycle.lock();
                if lifecycle.state == ParticleState::Desynced {
                    lifecycle.state = ParticleState::Running;
                }
            }),
        };
        if let Err(cause) = result {
            // Failures while running do not count against the restart budget
            self.lifecycle.lock().state = ParticleState::Failed(cause);
        }
    }

    /// Detach from storage events and run `on_shutdown`
    ///
    /// A failing `on_shutdown` is recorded on the state, not returned.
    pub fn stop_particle(&self) {
        for handle in &self.handles {
            handle.unregister_for_storage_events();
        }
        let state = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.pending_ready = None;
            lifecycle.awaiting_ready.clear();
            lifecycle.desynced.clear();
            lifecycle.state.clone()
        };
        if matches!(state, ParticleState::MaxFailed(_)) {
            return;
        }
        match self.call("on_shutdown", |p| p.on_shutdown()) {
            Ok(()) => {
                self.lifecycle.lock().state = ParticleState::Stopped;
                debug!(particle = %self.name, "Particle stopped");
            }
            Err(cause) => self.mark_failed(cause),
        }
    }

    /// Record a failure; enough of them in a row is terminal
    pub fn mark_failed(&self, cause: impl Into<String>) {
        let cause = cause.into();
        let mut lifecycle = self.lifecycle.lock();
        if matches!(lifecycle.state, ParticleState::MaxFailed(_)) {
            return;
        }
        lifecycle.failures += 1;
        lifecycle.state = if lifecycle.failures >= MAX_CONSECUTIVE_FAILURES {
            warn!(particle = %self.name, failures = lifecycle.failures, "Particle failed too many times");
            ParticleState::MaxFailed(cause)
        } else if lifecycle.state.has_been_started() {
            ParticleState::Failed(cause)
        } else {
            ParticleState::FailedNeverStarted(cause)
        };
    }
}

impl fmt::Debug for ParticleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.lifecycle.lock();
        f.debug_struct("ParticleContext")
            .field("name", &self.name)
            .field("state", &lifecycle.state)
            .field("failures", &lifecycle.failures)
            .field("awaiting_ready", &lifecycle.awaiting_ready)
            .field("desynced", &lifecycle.desynced)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::handle::HandleMode;
    use crate::storage::EventCallback;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        log: Log,
        fail_on: Option<&'static str>,
    }

    impl Recorder {
        fn record(&self, what: &'static str) -> anyhow::Result<()> {
            self.log.lock().push(what.to_string());
            if self.fail_on == Some(what) {
                anyhow::bail!("{} exploded", what);
            }
            Ok(())
        }
    }

    impl Particle for Recorder {
        fn on_first_start(&mut self) -> anyhow::Result<()> {
            self.record("first_start")
        }

        fn on_start(&mut self) -> anyhow::Result<()> {
            self.record("start")
        }

        fn on_ready(&mut self) -> anyhow::Result<()> {
            self.record("ready")
        }

        fn on_update(&mut self, _handle: &str) -> anyhow::Result<()> {
            self.record("update")
        }

        fn on_desync(&mut self) -> anyhow::Result<()> {
            self.record("desync")
        }

        fn on_resync(&mut self) -> anyhow::Result<()> {
            self.record("resync")
        }

        fn on_shutdown(&mut self) -> anyhow::Result<()> {
            self.record("shutdown")
        }
    }

    struct FakeHandle {
        name: String,
        mode: HandleMode,
        state: Mutex<ProxyState>,
        events: Mutex<Option<EventCallback>>,
        sync_requests: AtomicUsize,
    }

    impl FakeHandle {
        fn new(name: &str, mode: HandleMode) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                mode,
                state: Mutex::new(ProxyState::AwaitingSync),
                events: Mutex::new(None),
                sync_requests: AtomicUsize::new(0),
            })
        }

        fn fire(&self, event: StorageEvent) {
            let callback = self.events.lock().clone();
            if let Some(callback) = callback {
                callback(event);
            }
        }
    }

    impl ParticleHandle for FakeHandle {
        fn name(&self) -> &str {
            &self.name
        }

        fn mode(&self) -> HandleMode {
            self.mode
        }

        fn proxy_state(&self) -> ProxyState {
            *self.state.lock()
        }

        fn maybe_initiate_sync(&self) {
            self.sync_requests.fetch_add(1, Ordering::SeqCst);
        }

        fn register_for_storage_events(&self, callback: EventCallback) -> Result<()> {
            *self.events.lock() = Some(callback);
            Ok(())
        }

        fn unregister_for_storage_events(&self) {
            *self.events.lock() = None;
        }

        fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    fn context(
        fail_on: Option<&'static str>,
        handles: &[Arc<FakeHandle>],
    ) -> (Arc<ParticleContext>, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let instance = ParticleInstance::new(
            Box::new(Recorder {
                log: log.clone(),
                fail_on,
            }),
            handles
                .iter()
                .map(|h| h.clone() as Arc<dyn ParticleHandle>)
                .collect(),
        );
        (ParticleContext::new("p", instance), log)
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().clone()
    }

    #[tokio::test]
    async fn test_write_only_particle_is_ready_at_once() {
        let writer = FakeHandle::new("w", HandleMode::Write);
        let (ctx, log) = context(None, &[writer.clone()]);
        ctx.init_particle().unwrap();
        assert_eq!(ctx.state(), ParticleState::Waiting);

        assert!(ctx.run_particle().unwrap().await.unwrap());
        assert_eq!(ctx.state(), ParticleState::Running);
        assert_eq!(entries(&log), vec!["first_start", "start", "ready"]);
        assert_eq!(writer.sync_requests.load(Ordering::SeqCst), 0);
        assert!(writer.events.lock().is_none());
    }

    #[tokio::test]
    async fn test_ready_waits_for_every_readable_handle() {
        let a = FakeHandle::new("a", HandleMode::Read);
        let b = FakeHandle::new("b", HandleMode::ReadWrite);
        let (ctx, log) = context(None, &[a.clone(), b.clone()]);
        ctx.init_particle().unwrap();
        let ready = ctx.run_particle().unwrap();
        assert_eq!(a.sync_requests.load(Ordering::SeqCst), 1);

        b.fire(StorageEvent::Ready);
        // Updates before readiness are not delivered
        b.fire(StorageEvent::Update);
        assert_eq!(ctx.state(), ParticleState::Waiting);
        a.fire(StorageEvent::Ready);

        assert!(ready.await.unwrap());
        assert_eq!(ctx.state(), ParticleState::Running);
        assert_eq!(entries(&log), vec!["first_start", "start", "ready"]);

        a.fire(StorageEvent::Update);
        b.fire(StorageEvent::Update);
        assert_eq!(
            entries(&log).iter().filter(|e| *e == "update").count(),
            2
        );
    }

    #[tokio::test]
    async fn test_already_synced_handle_counts_as_ready() {
        let a = FakeHandle::new("a", HandleMode::Read);
        *a.state.lock() = ProxyState::Sync;
        let (ctx, _log) = context(None, &[a.clone()]);
        ctx.init_particle().unwrap();
        assert!(ctx.run_particle().unwrap().await.unwrap());
        assert_eq!(ctx.state(), ParticleState::Running);
    }

    #[tokio::test]
    async fn test_one_desync_until_all_resync() {
        let a = FakeHandle::new("a", HandleMode::Read);
        let b = FakeHandle::new("b", HandleMode::Read);
        *a.state.lock() = ProxyState::Sync;
        *b.state.lock() = ProxyState::Sync;
        let (ctx, log) = context(None, &[a.clone(), b.clone()]);
        ctx.init_particle().unwrap();
        ctx.run_particle().unwrap().await.unwrap();

        a.fire(StorageEvent::Desync);
        b.fire(StorageEvent::Desync);
        assert_eq!(ctx.state(), ParticleState::Desynced);
        a.fire(StorageEvent::Resync);
        assert_eq!(ctx.state(), ParticleState::Desynced);
        b.fire(StorageEvent::Resync);
        assert_eq!(ctx.state(), ParticleState::Running);

        let log = entries(&log);
        assert_eq!(log.iter().filter(|e| *e == "desync").count(), 1);
        assert_eq!(log.iter().filter(|e| *e == "resync").count(), 1);
    }

    #[tokio::test]
    async fn test_failed_first_start_never_started() {
        let (ctx, _log) = context(Some("first_start"), &[]);
        let err = ctx.init_particle().unwrap_err();
        assert!(matches!(
            err,
            Error::Particle(ParticleError::CallbackFailed { .. })
        ));
        assert_eq!(
            ctx.state(),
            ParticleState::FailedNeverStarted("first_start exploded".into())
        );
        assert_eq!(ctx.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_failed_ready_resolves_false() {
        let (ctx, _log) = context(Some("ready"), &[]);
        ctx.init_particle().unwrap();
        assert!(!ctx.run_particle().unwrap().await.unwrap());
        assert_eq!(ctx.state(), ParticleState::Failed("ready exploded".into()));
    }

    #[test]
    fn test_max_failed_is_terminal() {
        let (ctx, _log) = context(None, &[]);
        for _ in 0..MAX_CONSECUTIVE_FAILURES - 1 {
            ctx.mark_failed("nope");
        }
        assert_eq!(ctx.state(), ParticleState::FailedNeverStarted("nope".into()));
        ctx.mark_failed("last");
        assert_eq!(ctx.state(), ParticleState::MaxFailed("last".into()));

        ctx.mark_failed("again");
        assert_eq!(ctx.consecutive_failures(), MAX_CONSECUTIVE_FAILURES);
        assert!(matches!(
            ctx.init_particle(),
            Err(Error::Particle(ParticleError::InvalidState { .. }))
        ));
    }

    #[test]
    fn test_copy_keeps_history() {
        let (ctx, _log) = context(None, &[]);
        ctx.mark_failed("boom");
        let copy = ctx.copy_with(ParticleInstance::new(Box::new(crate::particle::NoopParticle), vec![]));
        assert_eq!(copy.state(), ctx.state());
        assert_eq!(copy.consecutive_failures(), 1);
        assert_eq!(copy.name(), "p");
    }

    #[tokio::test]
    async fn test_stop_detaches_and_restart_skips_first_start() {
        let a = FakeHandle::new("a", HandleMode::Read);
        *a.state.lock() = ProxyState::Sync;
        let (ctx, log) = context(None, &[a.clone()]);
        ctx.init_particle().unwrap();
        ctx.run_particle().unwrap().await.unwrap();

        ctx.stop_particle();
        assert_eq!(ctx.state(), ParticleState::Stopped);
        assert!(a.events.lock().is_none());

        ctx.init_particle().unwrap();
        assert_eq!(
            entries(&log),
            vec!["first_start", "start", "ready", "shutdown", "start"]
        );
    }

    #[test]
    fn test_run_requires_waiting() {
        let (ctx, _log) = context(None, &[]);
        let err = ctx.run_particle().err().unwrap();
        assert_eq!(
            err.to_string(),
            "run_particle: particle p is in an invalid state (Instantiated)"
        );
    }
}
