use std::fmt;

/// Where a particle is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticleState {
    /// Constructed, never started
    Instantiated,
    /// `on_first_start` ran
    FirstStart,
    /// Started, waiting for its handles to sync
    Waiting,
    Running,
    /// At least one handle is out of sync
    Desynced,
    Stopped,
    /// A callback failed after the particle had started
    Failed(String),
    /// A callback failed before the particle ever started
    FailedNeverStarted(String),
    /// Failed too often in a row; never restarted
    MaxFailed(String),
}

impl ParticleState {
    /// Whether `on_first_start` has already run
    pub fn has_been_started(&self) -> bool {
        !matches!(
            self,
            ParticleState::Instantiated | ParticleState::FailedNeverStarted(_)
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ParticleState::Failed(_)
                | ParticleState::FailedNeverStarted(_)
                | ParticleState::MaxFailed(_)
        )
    }

    /// Failure cause, if failed
    pub fn cause(&self) -> Option<&str> {
        match self {
            ParticleState::Failed(cause)
            | ParticleState::FailedNeverStarted(cause)
            | ParticleState::MaxFailed(cause) => Some(cause),
            _ => None,
        }
    }

    pub(crate) fn may_init(&self) -> bool {
        matches!(
            self,
            ParticleState::Instantiated
                | ParticleState::Stopped
                | ParticleState::Failed(_)
                | ParticleState::FailedNeverStarted(_)
        )
    }

    pub(crate) fn may_notify(&self) -> bool {
        matches!(
            self,
            ParticleState::Waiting | ParticleState::Running | ParticleState::Desynced
        )
    }
}

impl fmt::Display for ParticleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticleState::Instantiated => f.write_str("Instantiated"),
            ParticleState::FirstStart => f.write_str("FirstStart"),
            ParticleState::Waiting => f.write_str("Waiting"),
            ParticleState::Running => f.write_str("Running"),
            ParticleState::Desynced => f.write_str("Desynced"),
            ParticleState::Stopped => f.write_str("Stopped"),
            ParticleState::Failed(cause) => write!(f, "Failed: {}", cause),
            ParticleState::FailedNeverStarted(cause) => {
                write!(f, "Failed_NeverStarted: {}", cause)
            }
            ParticleState::MaxFailed(cause) => write!(f, "MaxFailed: {}", cause),
        }
    }
}
