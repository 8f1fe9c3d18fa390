use super::Scheduler;
use crate::config::SchedulerConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tracing::debug;

/// Hands out one scheduler per arc, all sharing one tokio runtime
pub struct SchedulerProvider {
    runtime: Handle,
    config: SchedulerConfig,
    schedulers: Mutex<HashMap<String, Scheduler>>,
    launches: AtomicU64,
}

impl SchedulerProvider {
    pub fn new(runtime: Handle, config: SchedulerConfig) -> Self {
        Self {
            runtime,
            config,
            schedulers: Mutex::new(HashMap::new()),
            launches: AtomicU64::new(0),
        }
    }

    /// The live scheduler for `arc_id`, starting a new one if the previous
    /// was cancelled or failed
    pub fn provide(&self, arc_id: &str) -> Scheduler {
        let mut schedulers = self.schedulers.lock();
        if let Some(existing) = schedulers.get(arc_id) {
            if existing.is_active() {
                return existing.clone();
            }
        }
        let launched = self.launches.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(arc = %arc_id, launched, "Launching scheduler");
        let scheduler = Scheduler::new(arc_id, self.runtime.clone(), &self.config);
        schedulers.insert(arc_id.to_string(), scheduler.clone());
        scheduler
    }

    /// Number of schedulers started so far
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    /// Cancel every scheduler and forget them
    pub fn cancel_all(&self) {
        for (_, scheduler) in self.schedulers.lock().drain() {
            scheduler.cancel();
        }
    }
}
