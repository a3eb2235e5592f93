use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    #[default]
    Available,
    Unavailable,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Available => f.write_str("Available"),
            ServiceState::Unavailable => f.write_str("Unavailable"),
        }
    }
}

/// Process-wide switch deciding whether new work is accepted.
///
/// Reads take the shared side of the lock and never wait on anything but a
/// concurrent `set_state`, which only swaps one value.
#[derive(Debug, Default)]
pub struct AvailabilityGate {
    state: RwLock<ServiceState>,
}

impl AvailabilityGate {
    pub fn new(initial: ServiceState) -> Self {
        Self {
            state: RwLock::new(initial),
        }
    }

    pub fn is_available(&self) -> bool {
        *self.state.read() == ServiceState::Available
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    /// Set the explicit state, returning the previous one.
    pub fn set_state(&self, state: ServiceState) -> ServiceState {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            tracing::info!(from = %previous, to = %state, "Service state changed");
        }
        previous
    }
}
