use std::collections::HashMap;
use std::sync::Mutex;

use cadence_types::CeremonyType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeremonyFailurePolicy {
    /// Stop workflow execution and escalate.
    Abort,
    /// Retry the ceremony up to its configured attempts.
    Retry,
    /// Log and continue without the ceremony.
    Continue,
    /// Circuit breaker tripped; do not attempt the ceremony at all.
    Skip,
}

#[derive(Debug, Clone, Copy)]
pub struct FailureConfig {
    pub policy: CeremonyFailurePolicy,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub circuit_breaker_threshold: u32,
}

impl FailureConfig {
    const fn new(policy: CeremonyFailurePolicy, max_retries: u32) -> Self {
        Self {
            policy,
            max_retries,
            retry_delay_secs: 5,
            circuit_breaker_threshold: 3,
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open: bool,
}

/// Per-ceremony-type failure policy with a circuit breaker keyed by
/// `(ceremony type, epic)`. Planning is critical, standups are optional,
/// retrospectives are worth retrying to save the learnings.
///
/// Breaker state is in-memory and lost on restart; a restart implies a
/// fresh attempt.
#[derive(Default)]
pub struct CeremonyFailureHandler {
    state: Mutex<HashMap<(CeremonyType, i64), BreakerState>>,
}

impl CeremonyFailureHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_for(ceremony_type: CeremonyType) -> FailureConfig {
        match ceremony_type {
            CeremonyType::Planning => FailureConfig::new(CeremonyFailurePolicy::Abort, 3),
            CeremonyType::Standup => FailureConfig::new(CeremonyFailurePolicy::Continue, 0),
            CeremonyType::Retrospective => FailureConfig::new(CeremonyFailurePolicy::Retry, 3),
        }
    }

    /// Returns the policy to apply for this failure. Once the breaker for
    /// `(type, epic)` opens, every call returns `Skip` until
    /// [`CeremonyFailureHandler::reset_failures`].
    pub fn handle_failure(
        &self,
        ceremony_type: CeremonyType,
        epic_num: i64,
        error: &anyhow::Error,
    ) -> CeremonyFailurePolicy {
        let config = Self::config_for(ceremony_type);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = state.entry((ceremony_type, epic_num)).or_default();

        if breaker.open {
            tracing::warn!(
                ceremony_type = ceremony_type.as_str(),
                epic_num,
                "circuit breaker open; skipping ceremony"
            );
            return CeremonyFailurePolicy::Skip;
        }

        breaker.consecutive_failures += 1;
        tracing::error!(
            ceremony_type = ceremony_type.as_str(),
            epic_num,
            consecutive_failures = breaker.consecutive_failures,
            error = %error,
            "ceremony failure tracked"
        );

        if breaker.consecutive_failures >= config.circuit_breaker_threshold {
            breaker.open = true;
            tracing::error!(
                ceremony_type = ceremony_type.as_str(),
                epic_num,
                threshold = config.circuit_breaker_threshold,
                "circuit breaker tripped; future ceremonies will be skipped"
            );
            return CeremonyFailurePolicy::Skip;
        }

        config.policy
    }

    /// Called on success: clears the failure count and closes the breaker.
    pub fn reset_failures(&self, ceremony_type: CeremonyType, epic_num: i64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.remove(&(ceremony_type, epic_num)).is_some() {
            tracing::info!(
                ceremony_type = ceremony_type.as_str(),
                epic_num,
                "ceremony failure state reset"
            );
        }
    }

    pub fn failure_count(&self, ceremony_type: CeremonyType, epic_num: i64) -> u32 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .get(&(ceremony_type, epic_num))
            .map(|b| b.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn is_circuit_open(&self, ceremony_type: CeremonyType, epic_num: i64) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .get(&(ceremony_type, epic_num))
            .map(|b| b.open)
            .unwrap_or(false)
    }
}
