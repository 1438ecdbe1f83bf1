//! Timeout sweep: forces hails out of states they sat in for too long
//!
//! Each tick scans live hails in a timeout-eligible state and issues a
//! transition that expects that state. A hail that moved on in the meantime
//! yields a lost race, which is dropped at debug level.

use crate::domain::error::{DispatchError, DispatchResult};
use crate::domain::hail::HailStatus;
use crate::domain::types::Actor;
use crate::infra::clock::Clock;
use crate::infra::config::{default_timeout_rules, Config, TimeoutRuleConfig};
use crate::infra::metrics::Metrics;
use crate::services::hail_machine::{HailMachine, TransitionRequest};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const TIMEOUT_REASON: &str = "timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutRule {
    pub state: HailStatus,
    pub after_ms: u64,
    pub target: HailStatus,
}

/// Validated rule set, at most one rule per state
#[derive(Debug, Clone)]
pub struct TimeoutRules {
    by_state: FxHashMap<HailStatus, TimeoutRule>,
    states: Vec<HailStatus>,
}

impl TimeoutRules {
    /// Reject rules whose target is not a legal move from their state
    pub fn new(rules: impl IntoIterator<Item = TimeoutRule>) -> DispatchResult<Self> {
        let mut by_state = FxHashMap::default();
        let mut states = Vec::new();
        for rule in rules {
            if rule.state.is_terminal() {
                return Err(DispatchError::Config(format!(
                    "timeout rule on terminal state {}",
                    rule.state
                )));
            }
            if !rule.state.can_transition_to(rule.target) {
                return Err(DispatchError::Config(format!(
                    "timeout rule {} -> {} is not a legal transition",
                    rule.state, rule.target
                )));
            }
            if rule.after_ms == 0 {
                return Err(DispatchError::Config(format!(
                    "timeout rule on {} has a zero deadline",
                    rule.state
                )));
            }
            if by_state.insert(rule.state, rule).is_some() {
                return Err(DispatchError::Config(format!(
                    "duplicate timeout rule for {}",
                    rule.state
                )));
            }
            states.push(rule.state);
        }
        Ok(Self { by_state, states })
    }

    pub fn from_config(config: &Config) -> DispatchResult<Self> {
        Self::new(config.timeout_rules().iter().map(TimeoutRule::from))
    }

    pub fn get(&self, state: HailStatus) -> Option<&TimeoutRule> {
        self.by_state.get(&state)
    }

    pub fn states(&self) -> &[HailStatus] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl Default for TimeoutRules {
    fn default() -> Self {
        let mut by_state = FxHashMap::default();
        let mut states = Vec::new();
        for rule in default_timeout_rules().iter().map(TimeoutRule::from) {
            states.push(rule.state);
            by_state.insert(rule.state, rule);
        }
        Self { by_state, states }
    }
}

impl From<&TimeoutRuleConfig> for TimeoutRule {
    fn from(rule: &TimeoutRuleConfig) -> Self {
        Self {
            state: rule.state,
            after_ms: rule.after_secs.saturating_mul(1000),
            target: rule.target,
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub fired: usize,
    pub lost_races: usize,
    pub flushed: usize,
}

pub struct TimeoutScheduler {
    machine: Arc<HailMachine>,
    rules: TimeoutRules,
    metrics: Arc<Metrics>,
}

impl TimeoutScheduler {
    pub fn new(machine: Arc<HailMachine>, rules: TimeoutRules, metrics: Arc<Metrics>) -> Self {
        Self { machine, rules, metrics }
    }

    pub fn rules(&self) -> &TimeoutRules {
        &self.rules
    }

    /// Fire every rule whose deadline has strictly passed, then flush parked events
    pub fn sweep(&self, now_ms: u64) -> SweepReport {
        let mut report = SweepReport::default();

        for due in self.machine.hails_in(self.rules.states()) {
            let Some(rule) = self.rules.get(due.status) else {
                continue;
            };
            if now_ms.saturating_sub(due.entered_at_ms) <= rule.after_ms {
                continue;
            }

            let request = TransitionRequest::new(due.hail_id.clone(), rule.target, Actor::System)
                .with_reason(TIMEOUT_REASON)
                .expecting(rule.state);
            match self.machine.transition(request, now_ms) {
                Ok(_) => {
                    report.fired += 1;
                    self.metrics.record_timeout_fired();
                    info!(
                        hail_id = %due.hail_id,
                        from = %rule.state,
                        to = %rule.target,
                        waited_ms = %now_ms.saturating_sub(due.entered_at_ms),
                        "hail_timeout_fired"
                    );
                }
                Err(e) if e.is_lost_race() => {
                    report.lost_races += 1;
                    self.metrics.record_timeout_race_lost();
                    debug!(hail_id = %due.hail_id, error = %e, "hail_timeout_lost_race");
                }
                Err(e) => {
                    warn!(hail_id = %due.hail_id, error = %e, "hail_timeout_failed");
                }
            }
        }

        report.flushed = self.machine.flush_pending_events();
        report
    }

    /// Sweep on a fixed tick until shutdown
    pub async fn run(
        self: Arc<Self>,
        clock: Arc<dyn Clock>,
        tick_ms: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick_ms = %tick_ms, rules = %self.rules.len(), "timeout_scheduler_started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep(clock.now_ms());
                    if report.fired > 0 || report.lost_races > 0 {
                        debug!(
                            fired = %report.fired,
                            lost_races = %report.lost_races,
                            flushed = %report.flushed,
                            "timeout_sweep"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("timeout_scheduler_stopped");
                        return;
                    }
                }
            }
        }
    }
}
