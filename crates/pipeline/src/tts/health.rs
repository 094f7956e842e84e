//! Per-provider circuit breaker
//!
//! Counts consecutive failures for one synthesis provider. Reaching the
//! threshold opens the circuit; after the cooldown one trial call is
//! allowed (half-open). A trial success closes the circuit, a trial
//! failure reopens it for another cooldown.

use std::time::{Duration, Instant};

use voice_turn_config::CircuitBreakerConfig;
use voice_turn_core::ProviderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Health of one provider, owned by the synthesis adapter
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    id: ProviderId,
    state: CircuitState,
    consecutive_failures: u32,
    total_failures: u64,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    threshold: u32,
    cooldown: Duration,
}

impl ProviderHealth {
    pub fn new(id: ProviderId, config: &CircuitBreakerConfig) -> Self {
        Self::with_settings(id, config.failure_threshold, config.cooldown())
    }

    pub fn with_settings(id: ProviderId, threshold: u32, cooldown: Duration) -> Self {
        Self {
            id,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_failures: 0,
            last_failure: None,
            opened_at: None,
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub fn id(&self) -> &ProviderId {
        &self.id
    }

    /// Circuit state, reporting an expired open circuit as half-open
    pub fn state(&self) -> CircuitState {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) if at.elapsed() >= self.cooldown => CircuitState::HalfOpen,
            (state, _) => state,
        }
    }

    /// Whether a call may be attempted now. Moves an expired open circuit
    /// to half-open.
    pub fn is_available(&mut self) -> bool {
        let state = self.state();
        if state != self.state {
            tracing::info!(provider = %self.id, "Circuit half-open, allowing trial call");
            self.state = state;
        }
        state != CircuitState::Open
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::info!(provider = %self.id, "Circuit closed");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        let now = Instant::now();
        self.consecutive_failures += 1;
        self.total_failures += 1;
        self.last_failure = Some(now);

        let trip = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= self.threshold,
            CircuitState::Open => false,
        };
        if trip {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
            metrics::counter!("voice_turn_circuit_open_total", "provider" => self.id.to_string())
                .increment(1);
            tracing::warn!(
                provider = %self.id,
                failures = self.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit opened"
            );
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }
}
