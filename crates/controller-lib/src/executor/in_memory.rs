//! Deterministic runtime that keeps containers in memory
//!
//! Failures, capacities and delays are scripted up front, which makes it
//! the test double for every executor, scaling and monitor scenario.

use super::{async_trait, ContainerRuntime, ScaleOutcome, ServiceRef};
use crate::error::RuntimeError;
use crate::models::{DeploymentConfig, ResourceSample, ServiceId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
struct FakeContainer {
    service: ServiceId,
    running: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    containers: BTreeMap<String, FakeContainer>,
    replicas: HashMap<ServiceId, u32>,
    build_failures: VecDeque<RuntimeError>,
    start_failures: VecDeque<RuntimeError>,
    stop_failures: VecDeque<RuntimeError>,
    restart_failures: VecDeque<RuntimeError>,
    exec_results: VecDeque<i32>,
    replica_capacity: Option<u32>,
    stats: ResourceSample,
    cancelled: Vec<ServiceId>,
    calls: Vec<String>,
    build_delay: Duration,
    start_delay: Duration,
    scale_delay: Duration,
}

/// In-memory [`ContainerRuntime`]
#[derive(Default)]
pub struct InMemoryRuntime {
    state: Mutex<State>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_build_delay(self, delay: Duration) -> Self {
        self.state().build_delay = delay;
        self
    }

    pub fn with_start_delay(self, delay: Duration) -> Self {
        self.state().start_delay = delay;
        self
    }

    pub fn with_scale_delay(self, delay: Duration) -> Self {
        self.state().scale_delay = delay;
        self
    }

    /// Cap the replicas any service can reach
    pub fn with_replica_capacity(self, capacity: u32) -> Self {
        self.state().replica_capacity = Some(capacity);
        self
    }

    pub fn fail_next_build(&self, error: RuntimeError) {
        self.state().build_failures.push_back(error);
    }

    pub fn fail_next_start(&self, error: RuntimeError) {
        self.state().start_failures.push_back(error);
    }

    pub fn fail_next_stop(&self, error: RuntimeError) {
        self.state().stop_failures.push_back(error);
    }

    pub fn fail_next_restart(&self, error: RuntimeError) {
        self.state().restart_failures.push_back(error);
    }

    /// Exit code returned by the next `exec`; defaults to 0
    pub fn push_exec_result(&self, code: i32) {
        self.state().exec_results.push_back(code);
    }

    pub fn set_stats(&self, sample: ResourceSample) {
        self.state().stats = sample;
    }

    /// Operation names in call order, e.g. `build`, `start`, `scale:3`
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn running_containers(&self) -> usize {
        self.state().containers.values().filter(|c| c.running).count()
    }

    pub fn replicas(&self, service: &ServiceId) -> u32 {
        self.state().replicas.get(service).copied().unwrap_or(0)
    }

    pub fn was_cancelled(&self, service: &ServiceId) -> bool {
        self.state().cancelled.contains(service)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn container_exists(&self, container: &str) -> Result<(), RuntimeError> {
        if self.state().containers.contains_key(container) {
            Ok(())
        } else {
            Err(RuntimeError::permanent(format!("no such container: {}", container)))
        }
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    async fn build(&self, service: &ServiceRef, _folder: &Path, build_file: &str) -> Result<String, RuntimeError> {
        let delay = {
            let mut state = self.state();
            state.calls.push("build".to_string());
            state.build_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(error) = state.build_failures.pop_front() {
            return Err(error);
        }
        if build_file.trim().is_empty() {
            return Err(RuntimeError::permanent("empty build file"));
        }
        state.next_id += 1;
        Ok(format!("fas/{}:{}", service.name, state.next_id))
    }

    async fn start(
        &self,
        service: &ServiceRef,
        _image: &str,
        _config: &DeploymentConfig,
    ) -> Result<String, RuntimeError> {
        let delay = {
            let mut state = self.state();
            state.calls.push("start".to_string());
            state.start_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(error) = state.start_failures.pop_front() {
            return Err(error);
        }
        state.next_id += 1;
        let container = format!("ctr-{}", state.next_id);
        state.containers.insert(
            container.clone(),
            FakeContainer {
                service: service.id,
                running: true,
            },
        );
        state.replicas.insert(service.id, 1);
        Ok(container)
    }

    async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push("stop".to_string());
        if let Some(error) = state.stop_failures.pop_front() {
            return Err(error);
        }
        let service = match state.containers.get_mut(container) {
            Some(c) => {
                c.running = false;
                c.service
            }
            None => return Err(RuntimeError::permanent(format!("no such container: {}", container))),
        };
        state.replicas.insert(service, 0);
        Ok(())
    }

    async fn restart(&self, container: &str) -> Result<(), RuntimeError> {
        self.container_exists(container)?;
        let mut state = self.state();
        state.calls.push("restart".to_string());
        if let Some(error) = state.restart_failures.pop_front() {
            if let Some(c) = state.containers.get_mut(container) {
                c.running = false;
            }
            return Err(error);
        }
        if let Some(c) = state.containers.get_mut(container) {
            c.running = true;
        }
        Ok(())
    }

    async fn scale(&self, service: &ServiceRef, replicas: u32) -> Result<ScaleOutcome, RuntimeError> {
        let delay = {
            let mut state = self.state();
            state.calls.push(format!("scale:{}", replicas));
            state.scale_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        let reachable = match state.replica_capacity {
            Some(capacity) => replicas.min(capacity),
            None => replicas,
        };
        state.replicas.insert(service.id, reachable);
        if reachable < replicas {
            Ok(ScaleOutcome::Partial(reachable))
        } else {
            Ok(ScaleOutcome::Complete)
        }
    }

    async fn stats(&self, container: &str) -> Result<ResourceSample, RuntimeError> {
        self.container_exists(container)?;
        Ok(self.state().stats.clone())
    }

    async fn logs(&self, container: &str, lines: usize) -> Result<String, RuntimeError> {
        self.container_exists(container)?;
        Ok((1..=lines.min(3))
            .map(|n| format!("[{}] line {}\n", container, n))
            .collect())
    }

    async fn exec(&self, container: &str, _command: &str) -> Result<i32, RuntimeError> {
        self.container_exists(container)?;
        Ok(self.state().exec_results.pop_front().unwrap_or(0))
    }

    async fn cancel(&self, service: &ServiceRef) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push("cancel".to_string());
        state.cancelled.push(service.id);
        for container in state.containers.values_mut() {
            if container.service == service.id {
                container.running = false;
            }
        }
        state.replicas.insert(service.id, 0);
        Ok(())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}
