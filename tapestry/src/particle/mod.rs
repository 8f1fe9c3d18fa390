//! Particles and their lifecycle
//!
//! A particle is application code that reads and writes only through its
//! handles. [`ParticleContext`] drives one particle instance through its
//! lifecycle and folds the storage events of all its handles into single
//! particle-level callbacks:
//!
//! ```text
//!  Instantiated ──init──▶ FirstStart ──▶ Waiting ──run, all handles ready──▶ Running
//!                                                                  desync ▲ │ first
//!                                                   every handle resynced │ ▼ desync
//!                                                                       Desynced
//! ```
//!
//! A callback error moves the particle to `Failed`; after
//! [`MAX_CONSECUTIVE_FAILURES`] it lands in the terminal `MaxFailed`.

mod context;
mod state;

pub use context::{ParticleContext, ParticleInstance, MAX_CONSECUTIVE_FAILURES};
pub use state::ParticleState;

/// Lifecycle callbacks of a particle
///
/// Every callback runs with no other callback of the same particle running.
/// Returning an error marks the particle as failed.
///
/// # Example
///
/// ```ignore
/// use tapestry::particle::Particle;
///
/// struct Counter {
///     updates: u32,
/// }
///
/// impl Particle for Counter {
///     fn on_update(&mut self, handle: &str) -> anyhow::Result<()> {
///         self.updates += 1;
///         tracing::info!(handle, updates = self.updates, "update");
///         Ok(())
///     }
/// }
/// ```
pub trait Particle: Send {
    /// Called once, the first time the particle is ever started
    fn on_first_start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on every start, including restarts
    fn on_start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once every readable handle has synced
    fn on_ready(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once per change seen by the named handle
    fn on_update(&mut self, handle: &str) -> anyhow::Result<()> {
        let _ = handle;
        Ok(())
    }

    /// Called when the first handle falls out of sync
    fn on_desync(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the last desynced handle is back in sync
    fn on_resync(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_shutdown(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Type name for logging
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A particle that does nothing
pub struct NoopParticle;

impl Particle for NoopParticle {
    fn type_name(&self) -> &'static str {
        "NoopParticle"
    }
}
