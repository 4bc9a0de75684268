//! In-memory instance store with per-instance event logs

use super::persist::{PersistedRecord, PersistedState};
use crate::error::{ControlError, Result};
use crate::models::{DeploymentEvent, ServiceId, ServiceInstance, ServiceStatus};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// An instance together with its append-only event log
#[derive(Debug, Clone)]
pub(crate) struct Record {
    pub instance: ServiceInstance,
    pub events: Vec<DeploymentEvent>,
}

/// Data access for service instances.
///
/// Reads are open to every component; writes go through the lifecycle
/// manager, which is the only holder of the crate-private mutators.
#[derive(Default)]
pub struct ServiceStore {
    records: DashMap<ServiceId, Record>,
    /// Serializes uniqueness checks with the writes they guard
    index_lock: Mutex<()>,
    dirty: AtomicBool,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ServiceId) -> Option<ServiceInstance> {
        self.records.get(id).map(|r| r.instance.clone())
    }

    /// Authorization check run before every team-scoped call
    pub fn authorize(&self, team_id: &str, id: &ServiceId) -> Result<ServiceInstance> {
        let instance = self
            .get(id)
            .ok_or_else(|| ControlError::NotFound(format!("service {}", id)))?;
        if instance.team_id != team_id {
            return Err(ControlError::PermissionDenied(format!(
                "service {} does not belong to team {}",
                id, team_id
            )));
        }
        Ok(instance)
    }

    /// Non-deleted instances of a team, oldest first
    pub fn list_team(&self, team_id: &str) -> Vec<ServiceInstance> {
        self.collect(|i| i.team_id == team_id && !i.is_deleted())
    }

    /// Non-deleted instances in a workspace
    pub fn list_workspace(&self, workspace_id: &str) -> Vec<ServiceInstance> {
        self.collect(|i| i.workspace_id == workspace_id && !i.is_deleted())
    }

    /// Every record, deleted ones included
    pub fn list_all(&self) -> Vec<ServiceInstance> {
        self.collect(|_| true)
    }

    pub fn list_status(&self, status: ServiceStatus) -> Vec<ServiceInstance> {
        self.collect(|i| i.status == status)
    }

    pub fn events(&self, id: &ServiceId) -> Option<Vec<DeploymentEvent>> {
        self.records.get(id).map(|r| r.events.clone())
    }

    pub fn status_counts(&self) -> Vec<(ServiceStatus, i64)> {
        let mut counts: BTreeMap<&'static str, (ServiceStatus, i64)> = BTreeMap::new();
        for record in self.records.iter() {
            let status = record.instance.status;
            counts.entry(status.as_str()).or_insert((status, 0)).1 += 1;
        }
        counts.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Clear the dirty flag, returning whether anything changed since the last call
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Insert a new instance, enforcing one live instance per folder and
    /// unique names within a workspace
    pub(crate) fn insert(&self, instance: ServiceInstance) -> Result<ServiceInstance> {
        let _index = self.index_lock.lock().unwrap_or_else(PoisonError::into_inner);

        for other in self.list_workspace(&instance.workspace_id) {
            if other.folder_path == instance.folder_path {
                return Err(ControlError::Validation(format!(
                    "folder '{}' is already served by {}",
                    instance.folder_path, other.id
                )));
            }
            if other.name == instance.name {
                return Err(ControlError::Validation(format!(
                    "service name '{}' is already in use in workspace {}",
                    instance.name, instance.workspace_id
                )));
            }
        }

        self.records.insert(
            instance.id,
            Record {
                instance: instance.clone(),
                events: Vec::new(),
            },
        );
        self.mark_dirty();
        Ok(instance)
    }

    /// Name check and rename under the index lock
    pub(crate) fn rename(&self, id: &ServiceId, name: &str) -> Result<()> {
        let _index = self.index_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let workspace_id = self
            .get(id)
            .map(|i| i.workspace_id)
            .ok_or_else(|| ControlError::NotFound(format!("service {}", id)))?;
        if self
            .list_workspace(&workspace_id)
            .iter()
            .any(|other| other.id != *id && other.name == name)
        {
            return Err(ControlError::Validation(format!(
                "service name '{}' is already in use in workspace {}",
                name, workspace_id
            )));
        }

        self.with_record(id, |record| record.instance.name = name.to_string())
    }

    /// Run `f` with exclusive access to one record
    pub(crate) fn with_record<R>(&self, id: &ServiceId, f: impl FnOnce(&mut Record) -> R) -> Result<R> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| ControlError::NotFound(format!("service {}", id)))?;
        let out = f(&mut record);
        drop(record);
        self.mark_dirty();
        Ok(out)
    }

    pub(crate) fn snapshot(&self) -> PersistedState {
        let mut records: Vec<PersistedRecord> = self
            .records
            .iter()
            .map(|r| PersistedRecord {
                instance: r.instance.clone(),
                events: r.events.clone(),
            })
            .collect();
        records.sort_by_key(|r| (r.instance.created_at, r.instance.id));
        PersistedState::new(records)
    }

    pub(crate) fn load(&self, state: PersistedState) {
        for PersistedRecord { instance, events } in state.records {
            self.records.insert(instance.id, Record { instance, events });
        }
    }

    fn collect(&self, keep: impl Fn(&ServiceInstance) -> bool) -> Vec<ServiceInstance> {
        let mut out: Vec<ServiceInstance> = self
            .records
            .iter()
            .filter(|r| keep(&r.instance))
            .map(|r| r.instance.clone())
            .collect();
        out.sort_by_key(|i| (i.created_at, i.id));
        out
    }
}
