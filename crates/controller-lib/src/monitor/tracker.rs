//! Consecutive-failure tracking and bounded check history

use crate::models::{HealthCheck, HealthStatus, ServiceId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Health crossing the failure threshold in either direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Degraded { consecutive_failures: u32 },
    Recovered,
}

/// Health view of one instance, as served by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub service_id: ServiceId,
    pub status: HealthStatus,
    pub degraded: bool,
    pub consecutive_failures: u32,
    pub last_check: Option<HealthCheck>,
    pub history: Vec<HealthCheck>,
}

#[derive(Debug, Default)]
struct TrackerState {
    consecutive_failures: u32,
    degraded: bool,
    history: VecDeque<HealthCheck>,
}

pub struct HealthTracker {
    states: DashMap<ServiceId, TrackerState>,
    history_limit: usize,
}

impl HealthTracker {
    pub fn new(history_limit: usize) -> Self {
        Self {
            states: DashMap::new(),
            history_limit: history_limit.max(1),
        }
    }

    /// Record a check. Returns a transition only when the instance crosses
    /// `retries` consecutive failures, or recovers after having crossed it.
    pub fn record(&self, check: HealthCheck, retries: u32) -> Option<HealthTransition> {
        let mut state = self.states.entry(check.service_id).or_default();

        let transition = match check.status {
            HealthStatus::Unhealthy => {
                state.consecutive_failures += 1;
                if !state.degraded && state.consecutive_failures >= retries.max(1) {
                    state.degraded = true;
                    Some(HealthTransition::Degraded {
                        consecutive_failures: state.consecutive_failures,
                    })
                } else {
                    None
                }
            }
            HealthStatus::Healthy => {
                state.consecutive_failures = 0;
                if state.degraded {
                    state.degraded = false;
                    Some(HealthTransition::Recovered)
                } else {
                    None
                }
            }
            // Checks inside the start period count for nothing
            HealthStatus::Starting | HealthStatus::Unknown => None,
        };

        state.history.push_back(check);
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
        transition
    }

    pub fn report(&self, id: &ServiceId) -> HealthReport {
        match self.states.get(id) {
            Some(state) => {
                let last_check = state.history.back().cloned();
                let status = if state.degraded {
                    HealthStatus::Unhealthy
                } else {
                    last_check.as_ref().map(|c| c.status).unwrap_or(HealthStatus::Unknown)
                };
                HealthReport {
                    service_id: *id,
                    status,
                    degraded: state.degraded,
                    consecutive_failures: state.consecutive_failures,
                    last_check,
                    history: state.history.iter().cloned().collect(),
                }
            }
            None => HealthReport {
                service_id: *id,
                status: HealthStatus::Unknown,
                degraded: false,
                consecutive_failures: 0,
                last_check: None,
                history: Vec::new(),
            },
        }
    }

    pub fn consecutive_failures(&self, id: &ServiceId) -> u32 {
        self.states.get(id).map(|s| s.consecutive_failures).unwrap_or(0)
    }

    /// Forget an instance, e.g. once it is stopped or deleted
    pub fn reset(&self, id: &ServiceId) {
        self.states.remove(id);
    }
}
