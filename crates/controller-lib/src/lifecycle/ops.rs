//! Per-instance single-writer slots
//!
//! At most one lifecycle operation may hold an instance's slot. A second
//! request is rejected with `Conflict`, except `stop` and `delete`, which
//! cancel the holder and take the slot over.

use crate::error::{ControlError, Result};
use crate::models::ServiceId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Detect,
    Deploy,
    Start,
    Stop,
    Restart,
    Scale,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Detect => "detect",
            OperationKind::Deploy => "deploy",
            OperationKind::Start => "start",
            OperationKind::Stop => "stop",
            OperationKind::Restart => "restart",
            OperationKind::Scale => "scale",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Slot {
    kind: OperationKind,
    generation: u64,
    cancel: watch::Sender<bool>,
}

/// Registry of in-flight operations keyed by instance
#[derive(Default)]
pub struct OperationSlots {
    slots: DashMap<ServiceId, Slot>,
    generation: AtomicU64,
}

impl OperationSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the instance's slot or fail with `Conflict`
    pub fn try_begin(self: &Arc<Self>, id: ServiceId, kind: OperationKind) -> Result<OperationGuard> {
        match self.slots.entry(id) {
            Entry::Occupied(held) => Err(ControlError::Conflict {
                service_id: id.to_string(),
                operation: held.get().kind.to_string(),
            }),
            Entry::Vacant(vacant) => {
                let (guard, slot) = self.new_guard(id, kind);
                vacant.insert(slot);
                Ok(guard)
            }
        }
    }

    /// Cancel whatever holds the slot and claim it
    pub fn preempt(self: &Arc<Self>, id: ServiceId, kind: OperationKind) -> (OperationGuard, Option<OperationKind>) {
        let (guard, slot) = self.new_guard(id, kind);
        let previous = self.slots.insert(id, slot).map(|old| {
            let _ = old.cancel.send(true);
            old.kind
        });
        (guard, previous)
    }

    /// Preempt the holder unless it is one of `spared`, in which case the
    /// holder's kind comes back as the error
    pub fn preempt_unless(
        self: &Arc<Self>,
        id: ServiceId,
        kind: OperationKind,
        spared: &[OperationKind],
    ) -> std::result::Result<(OperationGuard, Option<OperationKind>), OperationKind> {
        match self.slots.entry(id) {
            Entry::Occupied(mut held) => {
                let current = held.get().kind;
                if spared.contains(&current) {
                    return Err(current);
                }
                let (guard, slot) = self.new_guard(id, kind);
                let old = held.insert(slot);
                let _ = old.cancel.send(true);
                Ok((guard, Some(old.kind)))
            }
            Entry::Vacant(vacant) => {
                let (guard, slot) = self.new_guard(id, kind);
                vacant.insert(slot);
                Ok((guard, None))
            }
        }
    }

    /// Kind of the operation currently holding the slot
    pub fn in_flight(&self, id: &ServiceId) -> Option<OperationKind> {
        self.slots.get(id).map(|s| s.kind)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn new_guard(self: &Arc<Self>, id: ServiceId, kind: OperationKind) -> (OperationGuard, Slot) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel, cancelled) = watch::channel(false);
        let guard = OperationGuard {
            slots: Arc::clone(self),
            id,
            kind,
            generation,
            cancelled,
        };
        (
            guard,
            Slot {
                kind,
                generation,
                cancel,
            },
        )
    }
}

/// Holds an instance's slot until dropped
pub struct OperationGuard {
    slots: Arc<OperationSlots>,
    id: ServiceId,
    kind: OperationKind,
    generation: u64,
    cancelled: watch::Receiver<bool>,
}

impl OperationGuard {
    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Whether a preempting operation has cancelled this one
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once this operation is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without cancelling: the slot was released
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let generation = self.generation;
        self.slots
            .slots
            .remove_if(&self.id, |_, slot| slot.generation == generation);
    }
}

impl std::fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationGuard")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_second_operation_conflicts() {
        let slots = Arc::new(OperationSlots::new());
        let id = Uuid::new_v4();

        let _guard = slots.try_begin(id, OperationKind::Start).unwrap();
        match slots.try_begin(id, OperationKind::Scale) {
            Err(ControlError::Conflict { operation, .. }) => assert_eq!(operation, "start"),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_slot_released_on_drop() {
        let slots = Arc::new(OperationSlots::new());
        let id = Uuid::new_v4();

        drop(slots.try_begin(id, OperationKind::Deploy).unwrap());

        assert!(slots.in_flight(&id).is_none());
        assert!(slots.try_begin(id, OperationKind::Restart).is_ok());
    }

    #[tokio::test]
    async fn test_preempt_cancels_holder_and_keeps_new_slot() {
        let slots = Arc::new(OperationSlots::new());
        let id = Uuid::new_v4();
        let build = slots.try_begin(id, OperationKind::Deploy).unwrap();

        let (delete, previous) = slots.preempt(id, OperationKind::Delete);

        assert_eq!(previous, Some(OperationKind::Deploy));
        tokio::time::timeout(Duration::from_secs(1), build.cancelled())
            .await
            .expect("holder observes cancellation");
        assert!(build.is_cancelled());

        // The preempted guard must not free the new holder's slot
        drop(build);
        assert_eq!(slots.in_flight(&id), Some(OperationKind::Delete));
        assert!(!delete.is_cancelled());

        drop(delete);
        assert!(slots.is_empty());
    }

    #[test]
    fn test_preempt_unless_spares_listed_holders() {
        let slots = Arc::new(OperationSlots::new());
        let id = Uuid::new_v4();
        let spared = [OperationKind::Stop, OperationKind::Delete];

        let delete = slots.try_begin(id, OperationKind::Delete).unwrap();
        match slots.preempt_unless(id, OperationKind::Stop, &spared) {
            Err(holder) => assert_eq!(holder, OperationKind::Delete),
            Ok(_) => panic!("delete must not be preempted by stop"),
        }
        assert!(!delete.is_cancelled());
        drop(delete);

        let scale = slots.try_begin(id, OperationKind::Scale).unwrap();
        let (stop, previous) = slots.preempt_unless(id, OperationKind::Stop, &spared).unwrap();
        assert_eq!(previous, Some(OperationKind::Scale));
        assert!(scale.is_cancelled());
        drop(scale);
        assert_eq!(slots.in_flight(&id), Some(OperationKind::Stop));
        drop(stop);

        let (_stop, previous) = slots.preempt_unless(id, OperationKind::Stop, &spared).unwrap();
        assert!(previous.is_none());
    }
}
