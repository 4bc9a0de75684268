//! Monitor loop
//!
//! Wakes on a fixed tick, finds the health checks and metric samples that
//! are due across all running instances, and runs them on a bounded worker
//! pool. Nothing here requests a lifecycle transition.
//!
//! Work is only spawned once a worker permit is in hand, and an instance
//! never has two checks (or two samples) running at once. Due work that
//! cannot start is deferred to a later tick and reported as backlog on the
//! controller's `monitor` component.

use super::{HealthProbe, HealthTracker, HealthTransition, MetricsStore, ProbeResult};
use crate::error::{ControlError, Result};
use crate::events::ServiceEvent;
use crate::executor::ContainerRuntime;
use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::lifecycle::LifecycleManager;
use crate::models::{
    HealthCheck, HealthStatus, MetricType, ResourceUtilization, ServiceId, ServiceInstance,
    ServiceMetric, ServiceStatus,
};
use crate::observability::ControllerMetrics;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, info, warn};

/// Configuration for the monitor loop
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often due work is looked for (default: 1 second)
    pub tick: Duration,
    /// Metric sampling interval, independent of health checks (default: 15 seconds)
    pub metrics_interval: Duration,
    /// Checks and samples running at once across all instances
    pub workers: usize,
    /// Health checks kept per instance
    pub history_limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            metrics_interval: Duration::from_secs(15),
            workers: 16,
            history_limit: 50,
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Checks and samples spawned
    pub dispatched: usize,
    /// Due work held back: no free worker, or the previous run still going
    pub deferred: usize,
}

/// Ids with work in flight; the entry goes away with the guard
struct InFlight {
    set: Arc<DashSet<ServiceId>>,
    id: ServiceId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

/// Bookkeeping for one kind of periodic work
#[derive(Default)]
struct Schedule {
    next: DashMap<ServiceId, Instant>,
    running: Arc<DashSet<ServiceId>>,
}

enum Dispatch {
    NotDue,
    Deferred,
    Ready(OwnedSemaphorePermit, InFlight),
}

impl Schedule {
    /// Claim a worker for `id` if its work is due and not already running
    fn claim(&self, workers: &Arc<Semaphore>, id: ServiceId, now: Instant, every: Duration) -> Dispatch {
        let due = self.next.get(&id).map(|next| *next <= now).unwrap_or(true);
        if !due {
            return Dispatch::NotDue;
        }
        if self.running.contains(&id) {
            return Dispatch::Deferred;
        }
        let Ok(permit) = Arc::clone(workers).try_acquire_owned() else {
            return Dispatch::Deferred;
        };
        self.running.insert(id);
        self.next.insert(id, now + every);
        Dispatch::Ready(
            permit,
            InFlight {
                set: Arc::clone(&self.running),
                id,
            },
        )
    }

    fn retain(&self, live: &HashSet<ServiceId>) {
        self.next.retain(|id, _| live.contains(id));
    }

    fn remove(&self, id: &ServiceId) {
        self.next.remove(id);
    }
}

pub struct MonitorLoop {
    lifecycle: Arc<LifecycleManager>,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HealthProbe>,
    tracker: HealthTracker,
    samples: MetricsStore,
    config: MonitorConfig,
    workers: Arc<Semaphore>,
    checks: Schedule,
    sampling: Schedule,
    failed_samples: AtomicUsize,
    metrics: ControllerMetrics,
}

impl MonitorLoop {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HealthProbe>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            lifecycle,
            runtime,
            probe,
            tracker: HealthTracker::new(config.history_limit),
            samples: MetricsStore::new(),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            config,
            checks: Schedule::default(),
            sampling: Schedule::default(),
            failed_samples: AtomicUsize::new(0),
            metrics: ControllerMetrics::new(),
        }
    }

    pub fn tracker(&self) -> &HealthTracker {
        &self.tracker
    }

    pub fn samples(&self) -> &MetricsStore {
        &self.samples
    }

    /// Run until shutdown, reporting the loop's own state on `health`
    pub async fn run(self: Arc<Self>, health: HealthRegistry, mut shutdown: broadcast::Receiver<()>) {
        info!(
            tick_ms = self.config.tick.as_millis() as u64,
            metrics_interval_secs = self.config.metrics_interval.as_secs(),
            workers = self.config.workers,
            "Starting service monitor loop"
        );

        let mut ticker = interval(self.config.tick);
        let mut cycles = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.tick();
                    self.report(&health, summary).await;
                    cycles += 1;
                    if summary.dispatched > 0 && cycles % 60 == 0 {
                        debug!(dispatched = summary.dispatched, deferred = summary.deferred, "Monitor cycle complete");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down service monitor loop");
                    health.set_unhealthy(components::MONITOR, "monitor loop stopped").await;
                    break;
                }
            }
        }
    }

    /// Fold a tick's backlog and the samples failed since the last report
    /// into the `monitor` component
    pub async fn report(&self, health: &HealthRegistry, summary: TickSummary) {
        let failed = self.failed_samples.swap(0, Ordering::Relaxed);
        let mut problems = Vec::new();
        if summary.deferred > 0 {
            problems.push(format!(
                "{} due checks or samples deferred ({} workers)",
                summary.deferred, self.config.workers
            ));
        }
        if failed > 0 {
            problems.push(format!("{} metric samples failed", failed));
        }

        let degraded = !problems.is_empty();
        let was_healthy = health.status_of(components::MONITOR).await == Some(ComponentStatus::Healthy);
        if degraded {
            health.set_degraded(components::MONITOR, problems.join("; ")).await;
        } else if !was_healthy {
            health.set_healthy(components::MONITOR).await;
        }
    }

    /// Dispatch every check and sample that is due and can get a worker
    pub fn tick(self: &Arc<Self>) -> TickSummary {
        let running = self.lifecycle.store().list_status(ServiceStatus::Running);
        let live: HashSet<ServiceId> = running.iter().map(|i| i.id).collect();
        self.checks.retain(&live);
        self.sampling.retain(&live);

        let now = Instant::now();
        let mut summary = TickSummary::default();
        for instance in running {
            let check = &instance.config.health_check;
            if check.enabled {
                let every = Duration::from_secs(check.interval_seconds.max(1) as u64);
                match self.checks.claim(&self.workers, instance.id, now, every) {
                    Dispatch::NotDue => {}
                    Dispatch::Deferred => summary.deferred += 1,
                    Dispatch::Ready(permit, in_flight) => {
                        summary.dispatched += 1;
                        let monitor = Arc::clone(self);
                        let instance = instance.clone();
                        tokio::spawn(async move {
                            let _work = (permit, in_flight);
                            monitor.check_instance(&instance).await;
                        });
                    }
                }
            }

            match self
                .sampling
                .claim(&self.workers, instance.id, now, self.config.metrics_interval)
            {
                Dispatch::NotDue => {}
                Dispatch::Deferred => summary.deferred += 1,
                Dispatch::Ready(permit, in_flight) => {
                    summary.dispatched += 1;
                    let monitor = Arc::clone(self);
                    tokio::spawn(async move {
                        let _work = (permit, in_flight);
                        if let Err(e) = monitor.sample_instance(&instance).await {
                            monitor.failed_samples.fetch_add(1, Ordering::Relaxed);
                            debug!(service_id = %instance.id, error = %e, "Metric sample failed");
                        }
                    });
                }
            }
        }
        summary
    }

    /// Run the instance's health check now and record the result.
    ///
    /// A probe that outlives `timeout_seconds` counts as one unhealthy result.
    pub async fn check_instance(&self, instance: &ServiceInstance) -> HealthCheck {
        let config = &instance.config.health_check;
        let limit = Duration::from_secs(config.timeout_seconds.max(1) as u64);
        let result = match timeout(limit, self.probe.probe(instance)).await {
            Ok(result) => result,
            Err(_) => ProbeResult::unhealthy(format!("timed out after {}s", limit.as_secs())),
        };

        let now = Utc::now();
        let starting = instance
            .deployed_at
            .map(|at| now - at < chrono::Duration::seconds(config.start_period_seconds as i64))
            .unwrap_or(false);
        let status = match (result.healthy, starting) {
            (true, _) => HealthStatus::Healthy,
            (false, true) => HealthStatus::Starting,
            (false, false) => HealthStatus::Unhealthy,
        };

        let check = HealthCheck {
            service_id: instance.id,
            check_type: config.check_type,
            endpoint: config.endpoint.clone(),
            status,
            response_time_ms: result.response_time_ms,
            status_code: result.status_code,
            message: result.message,
            checked_at: now,
        };
        self.metrics.record_health_check(status.as_str());

        if let Some(response_time) = check.response_time_ms {
            self.samples.record(
                ServiceMetric {
                    service_id: instance.id,
                    metric_type: MetricType::ResponseTimeMs,
                    value: response_time,
                    unit: MetricType::ResponseTimeMs.unit().to_string(),
                    collected_at: now,
                },
                instance.config.metric_retention,
            );
        }

        if let Some(transition) = self.tracker.record(check.clone(), config.retries) {
            let (health, failures) = match transition {
                HealthTransition::Degraded {
                    consecutive_failures,
                } => (HealthStatus::Unhealthy, consecutive_failures),
                HealthTransition::Recovered => (HealthStatus::Healthy, 0),
            };
            self.lifecycle
                .logger()
                .log_health_change(instance.id, health == HealthStatus::Healthy, failures);
            self.lifecycle.broadcaster().publish(
                &instance.team_id,
                ServiceEvent::ServiceHealthChanged {
                    service_id: instance.id,
                    health,
                    consecutive_failures: failures,
                    timestamp: now,
                },
            );
        }
        if let Err(e) = self.lifecycle.touch_health_check(&instance.id) {
            debug!(service_id = %instance.id, error = %e, "Instance vanished during health check");
        }
        check
    }

    /// Sample the instance's resources now and publish the new utilization
    pub async fn sample_instance(&self, instance: &ServiceInstance) -> Result<ResourceUtilization> {
        let container = instance.container_id.as_deref().ok_or_else(|| {
            ControlError::Validation(format!("service {} has no container", instance.name))
        })?;
        let sample = match self.runtime.stats(container).await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(service_id = %instance.id, error = %e, "Runtime stats unavailable");
                return Err(e.into());
            }
        };

        let now = Utc::now();
        self.samples
            .record_sample(instance.id, &sample, instance.config.metric_retention, now);
        let utilization = self.samples.utilization(&instance.id);
        self.lifecycle.broadcaster().publish(
            &instance.team_id,
            ServiceEvent::ServiceMetricsUpdated {
                service_id: instance.id,
                metrics: utilization.clone(),
                timestamp: now,
            },
        );
        Ok(utilization)
    }

    /// Drop everything kept for an instance
    pub fn forget(&self, id: &ServiceId) {
        self.tracker.reset(id);
        self.samples.remove(id);
        self.checks.remove(id);
        self.sampling.remove(id);
    }
}
