use super::*;
use crate::events::ServiceEvent;
use crate::executor::tests::{new_instance, Harness, TEAM};
use crate::executor::InMemoryRuntime;
use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::lifecycle::OperationKind;
use crate::models::{HealthStatus, ResourceSample, ServiceInstance, ServiceStatus};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Probe that replays scripted outcomes, healthy once the script runs out
#[derive(Default)]
struct ScriptedProbe {
    script: Mutex<VecDeque<bool>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    fn new(outcomes: &[bool]) -> Self {
        Self {
            script: Mutex::new(outcomes.iter().copied().collect()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, _instance: &ServiceInstance) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let healthy = self.script.lock().unwrap().pop_front().unwrap_or(true);
        if healthy {
            ProbeResult::healthy(3.0).with_status_code(200)
        } else {
            ProbeResult::unhealthy("connection refused")
        }
    }
}

async fn running(h: &Harness, start_period_seconds: u32) -> ServiceInstance {
    let mut instance = new_instance("ws-1", "api", 8080);
    instance.config.health_check.start_period_seconds = start_period_seconds;
    let instance = h.create(instance);
    h.executor
        .deploy(instance.id, OperationKind::Deploy)
        .unwrap()
        .wait()
        .await;
    h.lifecycle.get(&instance.id).unwrap()
}

fn monitor(h: &Harness, probe: ScriptedProbe) -> Arc<MonitorLoop> {
    monitor_with(
        h,
        Arc::new(probe),
        MonitorConfig {
            tick: Duration::from_millis(10),
            ..MonitorConfig::default()
        },
    )
}

fn monitor_with(h: &Harness, probe: Arc<ScriptedProbe>, config: MonitorConfig) -> Arc<MonitorLoop> {
    Arc::new(MonitorLoop::new(
        Arc::clone(&h.lifecycle),
        h.runtime.clone(),
        probe,
        config,
    ))
}

fn health_events(rx: &mut broadcast::Receiver<ServiceEvent>) -> Vec<(HealthStatus, u32)> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ServiceEvent::ServiceHealthChanged {
            health,
            consecutive_failures,
            ..
        } = event
        {
            out.push((health, consecutive_failures));
        }
    }
    out
}

#[tokio::test]
async fn test_three_failures_degrade_exactly_once() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = running(&h, 0).await;
    let monitor = monitor(&h, ScriptedProbe::new(&[false, false, false, false, false]));
    let mut rx = h.lifecycle.broadcaster().subscribe(TEAM);

    for _ in 0..5 {
        monitor.check_instance(&instance).await;
    }

    assert_eq!(health_events(&mut rx), vec![(HealthStatus::Unhealthy, 3)]);
    let report = monitor.tracker().report(&instance.id);
    assert!(report.degraded);
    assert_eq!(report.consecutive_failures, 5);
    // Health never drives lifecycle status
    assert_eq!(h.lifecycle.get(&instance.id).unwrap().status, ServiceStatus::Running);
}

#[tokio::test]
async fn test_isolated_failures_are_absorbed() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = running(&h, 0).await;
    let monitor = monitor(&h, ScriptedProbe::new(&[false, false, true, false, true, false, false]));
    let mut rx = h.lifecycle.broadcaster().subscribe(TEAM);

    for _ in 0..7 {
        monitor.check_instance(&instance).await;
    }

    assert!(health_events(&mut rx).is_empty());
    assert_eq!(monitor.tracker().consecutive_failures(&instance.id), 2);
    assert_eq!(monitor.tracker().report(&instance.id).history.len(), 7);
}

#[tokio::test]
async fn test_recovery_is_broadcast_once() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = running(&h, 0).await;
    let monitor = monitor(&h, ScriptedProbe::new(&[false, false, false, true, true]));
    let mut rx = h.lifecycle.broadcaster().subscribe(TEAM);

    for _ in 0..5 {
        monitor.check_instance(&instance).await;
    }

    assert_eq!(
        health_events(&mut rx),
        vec![(HealthStatus::Unhealthy, 3), (HealthStatus::Healthy, 0)]
    );
    assert_eq!(monitor.tracker().report(&instance.id).status, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_retries_threshold_is_per_instance() {
    let h = Harness::new(InMemoryRuntime::new());
    let mut instance = running(&h, 0).await;
    instance.config.health_check.retries = 1;
    let monitor = monitor(&h, ScriptedProbe::new(&[false]));
    let mut rx = h.lifecycle.broadcaster().subscribe(TEAM);

    monitor.check_instance(&instance).await;

    assert_eq!(health_events(&mut rx), vec![(HealthStatus::Unhealthy, 1)]);
}

#[tokio::test]
async fn test_probe_timeout_counts_as_unhealthy() {
    let h = Harness::new(InMemoryRuntime::new());
    let mut instance = running(&h, 0).await;
    instance.config.health_check.timeout_seconds = 1;
    let probe = ScriptedProbe {
        delay: Duration::from_secs(3),
        ..ScriptedProbe::default()
    };
    let monitor = monitor(&h, probe);

    let check = monitor.check_instance(&instance).await;

    assert_eq!(check.status, HealthStatus::Unhealthy);
    assert!(check.message.unwrap().contains("timed out"));
    assert_eq!(monitor.tracker().consecutive_failures(&instance.id), 1);
}

#[tokio::test]
async fn test_failures_in_start_period_do_not_count() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = running(&h, 60).await;
    let monitor = monitor(&h, ScriptedProbe::new(&[false, false, false, false]));
    let mut rx = h.lifecycle.broadcaster().subscribe(TEAM);

    for _ in 0..4 {
        let check = monitor.check_instance(&instance).await;
        assert_eq!(check.status, HealthStatus::Starting);
    }

    assert!(health_events(&mut rx).is_empty());
    assert_eq!(monitor.tracker().consecutive_failures(&instance.id), 0);
}

#[tokio::test]
async fn test_check_records_timestamp_and_response_time() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = running(&h, 0).await;
    let monitor = monitor(&h, ScriptedProbe::new(&[true]));
    assert!(instance.last_health_check_at.is_none());

    monitor.check_instance(&instance).await;

    let after = h.lifecycle.get(&instance.id).unwrap();
    assert!(after.last_health_check_at.is_some());
    assert_eq!(monitor.samples().utilization(&instance.id).response_time_ms, Some(3.0));
}

#[tokio::test]
async fn test_sample_publishes_utilization() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = running(&h, 0).await;
    h.runtime.set_stats(ResourceSample {
        cpu_percent: 42.0,
        memory_percent: 10.0,
        ..ResourceSample::default()
    });
    let monitor = monitor(&h, ScriptedProbe::default());
    let mut rx = h.lifecycle.broadcaster().subscribe(TEAM);

    let util = monitor.sample_instance(&instance).await.unwrap();

    assert_eq!(util.cpu_percent, Some(42.0));
    match rx.try_recv().unwrap() {
        ServiceEvent::ServiceMetricsUpdated {
            service_id,
            metrics,
            ..
        } => {
            assert_eq!(service_id, instance.id);
            assert_eq!(metrics.memory_percent, Some(10.0));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_loop_checks_running_instances_until_shutdown() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = running(&h, 0).await;
    let idle = h.create(new_instance("ws-1", "idle", 8081));
    let monitor = monitor(&h, ScriptedProbe::default());
    let health = HealthRegistry::new();
    health.register_all().await;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let task = tokio::spawn(Arc::clone(&monitor).run(health.clone(), shutdown_rx));
    for _ in 0..200 {
        if h.lifecycle.get(&instance.id).unwrap().last_health_check_at.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("loop stops on shutdown")
        .unwrap();

    assert!(h.lifecycle.get(&instance.id).unwrap().last_health_check_at.is_some());
    // Only running instances are probed
    assert!(h.lifecycle.get(&idle.id).unwrap().last_health_check_at.is_none());
    // The interval keeps a second check from being due yet
    assert_eq!(monitor.tracker().report(&instance.id).history.len(), 1);
    assert_eq!(
        health.status_of(components::MONITOR).await,
        Some(ComponentStatus::Unhealthy)
    );
}

#[tokio::test]
async fn test_slow_probe_is_never_run_twice_at_once() {
    let h = Harness::new(InMemoryRuntime::new());
    let mut instance = new_instance("ws-1", "api", 8080);
    instance.config.health_check.interval_seconds = 1;
    instance.config.health_check.timeout_seconds = 5;
    let instance = h.create(instance);
    h.executor
        .deploy(instance.id, OperationKind::Deploy)
        .unwrap()
        .wait()
        .await;
    let probe = Arc::new(ScriptedProbe {
        delay: Duration::from_millis(1500),
        ..ScriptedProbe::default()
    });
    let monitor = monitor_with(
        &h,
        Arc::clone(&probe),
        MonitorConfig {
            workers: 1,
            ..MonitorConfig::default()
        },
    );
    let health = HealthRegistry::new();
    health.register_all().await;

    // The check takes the only worker; the sample waits for it
    let first = monitor.tick();
    assert_eq!(first, TickSummary { dispatched: 1, deferred: 1 });
    monitor.report(&health, first).await;
    assert_eq!(
        health.status_of(components::MONITOR).await,
        Some(ComponentStatus::Degraded)
    );

    // Next interval: the previous check is still running
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let second = monitor.tick();
    assert_eq!(second, TickSummary { dispatched: 0, deferred: 2 });
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

    // Once it finishes, deferred work gets the worker back
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(monitor.tracker().report(&instance.id).history.len(), 1);
    let third = monitor.tick();
    assert_eq!(third, TickSummary { dispatched: 1, deferred: 1 });
}

#[tokio::test]
async fn test_failed_samples_degrade_the_monitor_until_clean() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = running(&h, 0).await;
    let monitor = monitor(&h, ScriptedProbe::default());
    let health = HealthRegistry::new();
    health.register_all().await;

    // The runtime no longer knows the container, so stats fail
    h.lifecycle
        .update(&instance.id, |i| i.container_id = Some("ctr-gone".into()))
        .unwrap();
    let summary = monitor.tick();
    assert_eq!(summary, TickSummary { dispatched: 2, deferred: 0 });
    tokio::time::sleep(Duration::from_millis(50)).await;
    monitor.report(&health, summary).await;
    assert_eq!(
        health.status_of(components::MONITOR).await,
        Some(ComponentStatus::Degraded)
    );

    monitor.report(&health, TickSummary::default()).await;
    assert_eq!(
        health.status_of(components::MONITOR).await,
        Some(ComponentStatus::Healthy)
    );
}
