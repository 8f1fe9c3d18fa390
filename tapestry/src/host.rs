//! Particle host: starts, restarts and stops the particles of one arc
//!
//! Particles are registered by name with a factory that builds a fresh
//! instance and its handles. A particle that fails while starting is rebuilt
//! from its factory and started again, carrying its failure count over,
//! until it runs or exhausts [`MAX_CONSECUTIVE_FAILURES`].

use crate::error::{Error, ParticleError, Result};
use crate::handle::HandleManager;
use crate::particle::{
    NoopParticle, ParticleContext, ParticleInstance, ParticleState, MAX_CONSECUTIVE_FAILURES,
};
use crate::scheduler::Scheduler;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builds a particle instance; given the host's handle manager and the
/// particle's name
pub type ParticleFactory =
    Arc<dyn Fn(&HandleManager, &str) -> anyhow::Result<ParticleInstance> + Send + Sync>;

pub struct ArcHost {
    manager: Arc<HandleManager>,
    factories: Mutex<HashMap<String, ParticleFactory>>,
    particles: Mutex<BTreeMap<String, Arc<ParticleContext>>>,
}

impl ArcHost {
    pub fn new(manager: HandleManager) -> Self {
        Self {
            manager: Arc::new(manager),
            factories: Mutex::new(HashMap::new()),
            particles: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn handle_manager(&self) -> &Arc<HandleManager> {
        &self.manager
    }

    fn scheduler(&self) -> &Scheduler {
        self.manager.scheduler()
    }

    /// Register `factory` under `name`, replacing any earlier registration
    pub fn register_particle<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&HandleManager, &str) -> anyhow::Result<ParticleInstance> + Send + Sync + 'static,
    {
        self.factories.lock().insert(name.into(), Arc::new(factory));
    }

    pub fn particle_state(&self, name: &str) -> Option<ParticleState> {
        self.particles.lock().get(name).map(|context| context.state())
    }

    pub fn particle(&self, name: &str) -> Option<Arc<ParticleContext>> {
        self.particles.lock().get(name).cloned()
    }

    /// Start every registered particle, in name order
    pub async fn start_all(&self) -> Result<BTreeMap<String, ParticleState>> {
        let mut names: Vec<String> = self.factories.lock().keys().cloned().collect();
        names.sort();
        let mut states = BTreeMap::new();
        for name in names {
            let state = self.start_particle(&name).await?;
            states.insert(name, state);
        }
        Ok(states)
    }

    /// Start `name`, rebuilding it after each failure until it runs or is
    /// given up on; returns the state it settled in
    pub async fn start_particle(&self, name: &str) -> Result<ParticleState> {
        let factory = self
            .factories
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ParticleError::NotFound(name.to_string()))?;
        let mut previous = self.particle(name);
        if let Some(existing) = &previous {
            let state = existing.state();
            if !state.may_init() {
                debug!(particle = %name, state = %state, "Particle already started");
                return Ok(state);
            }
        }

        loop {
            let context = match factory(&self.manager, name) {
                Ok(instance) => match &previous {
                    Some(previous) => previous.copy_with(instance),
                    None => ParticleContext::new(name, instance),
                },
                Err(err) => {
                    let context = previous.clone().unwrap_or_else(|| {
                        ParticleContext::new(
                            name,
                            ParticleInstance::new(Box::new(NoopParticle), Vec::new()),
                        )
                    });
                    context.mark_failed(format!("{:#}", err));
                    context
                }
            };
            self.particles
                .lock()
                .insert(name.to_string(), context.clone());

            if context.state().may_init() {
                self.attempt(&context).await?;
            }

            let state = context.state();
            match &state {
                ParticleState::Failed(cause) | ParticleState::FailedNeverStarted(cause) => {
                    warn!(
                        particle = %name,
                        failures = context.consecutive_failures(),
                        max = MAX_CONSECUTIVE_FAILURES,
                        cause = %cause,
                        "Restarting failed particle"
                    );
                    for handle in context.handles() {
                        handle.close();
                    }
                    previous = Some(context);
                }
                _ => {
                    info!(particle = %name, state = %state, "Particle started");
                    return Ok(state);
                }
            }
        }
    }

    /// One init-and-run pass on the scheduler; callback failures end up on
    /// the context's state rather than in the result
    async fn attempt(&self, context: &Arc<ParticleContext>) -> Result<()> {
        let init = {
            let context = context.clone();
            self.scheduler().run(move || context.init_particle())?.await?
        };
        match init {
            Ok(()) => {}
            Err(Error::Particle(ParticleError::CallbackFailed { .. })) => return Ok(()),
            Err(err) => return Err(err),
        }

        let run = {
            let context = context.clone();
            self.scheduler().run(move || context.run_particle())?.await?
        };
        let _ready = run?;
        self.scheduler().wait_for_idle().await?;
        debug!(particle = %context.name(), state = %context.state(), "Start attempt finished");
        Ok(())
    }

    /// Stop every particle, then close the handle manager
    pub async fn stop(&self) -> Result<()> {
        let contexts: Vec<Arc<ParticleContext>> =
            self.particles.lock().values().cloned().collect();
        for context in contexts {
            self.scheduler()
                .run(move || context.stop_particle())?
                .await?;
        }
        self.manager.close().await?;
        info!(arc = %self.manager.arc_id(), "Arc host stopped");
        Ok(())
    }
}
