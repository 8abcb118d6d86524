//! Bad-password throttling.
//!
//! Unlock and delete both validate the master password; repeated failures
//! trigger an exponential cooldown so the USB link cannot be used to
//! grind the passphrase. One throttle instance guards one operation
//! class; a success clears the counter.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cooldown cap.
const MAX_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct State {
    consecutive_failures: u32,
    blocked_until: Option<Instant>,
}

/// Exponential-backoff throttle for password-bearing operations.
#[derive(Debug, Default)]
pub struct Throttle {
    state: Mutex<State>,
}

impl Throttle {
    /// Create an idle throttle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether an attempt is currently allowed; on `Err` the caller
    /// must wait the returned duration.
    pub fn check(&self) -> Result<(), Duration> {
        let state = self.state.lock().expect("throttle lock poisoned");
        match state.blocked_until {
            Some(until) => {
                let now = Instant::now();
                if now < until {
                    Err(until - now)
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    /// Record a failed password attempt, doubling the cooldown (1s, 2s,
    /// 4s, ... capped at 60s).
    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("throttle lock poisoned");
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let exp = state.consecutive_failures.saturating_sub(1).min(6);
        let cooldown = Duration::from_secs(1u64 << exp).min(MAX_COOLDOWN);
        state.blocked_until = Some(Instant::now() + cooldown);
    }

    /// Record a successful attempt, clearing the cooldown.
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("throttle lock poisoned");
        state.consecutive_failures = 0;
        state.blocked_until = None;
    }
}
