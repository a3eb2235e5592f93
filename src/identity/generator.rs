use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use super::{Identity, MAX_TIMESTAMP_MS, RANDOM_MASK};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("clock reading {0} ms is outside the representable range")]
    ClockOutOfRange(i64),
    #[error("random component exhausted within millisecond {0}")]
    Exhausted(u64),
}

struct GeneratorState {
    last: Option<(u64, u128)>,
    rng: StdRng,
}

/// Process-wide identity source.
///
/// Every draw happens under one mutex. When the clock has not moved past the
/// previous draw, the previous random component is incremented instead of
/// drawing a new one, so identities from one generator are strictly increasing.
pub struct IdGenerator {
    clock: Arc<dyn Clock>,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(GeneratorState {
                last: None,
                rng: StdRng::from_entropy(),
            }),
        }
    }

    pub fn generate(&self) -> Result<Identity, GenerationError> {
        let mut state = self.state.lock();

        let now = self.clock.now().timestamp_millis();
        let ms = u64::try_from(now)
            .ok()
            .filter(|ms| *ms <= MAX_TIMESTAMP_MS)
            .ok_or(GenerationError::ClockOutOfRange(now))?;

        let (ms, random) = match state.last {
            Some((last_ms, last_random)) if ms <= last_ms => {
                let next = last_random + 1;
                if next > RANDOM_MASK {
                    return Err(GenerationError::Exhausted(last_ms));
                }
                (last_ms, next)
            }
            _ => (ms, state.rng.gen::<u128>() & RANDOM_MASK),
        };

        state.last = Some((ms, random));
        Ok(Identity::from_parts(ms, random))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}
