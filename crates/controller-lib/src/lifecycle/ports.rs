//! Host port reservations, checked at the moment a deploy binds them

use crate::error::{ControlError, Result};
use crate::models::ServiceId;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Host ports held per workspace by instances that are deploying or running
#[derive(Debug, Default)]
pub struct PortRegistry {
    workspaces: DashMap<String, BTreeMap<u16, ServiceId>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve every port for `holder` or none of them.
    ///
    /// Ports already held by `holder` are kept; a port held by another
    /// instance fails the whole reservation.
    pub fn reserve(&self, workspace_id: &str, holder: ServiceId, ports: &[u16]) -> Result<()> {
        let mut held = self.workspaces.entry(workspace_id.to_string()).or_default();

        if let Some((port, owner)) = ports
            .iter()
            .find_map(|p| held.get(p).filter(|o| **o != holder).map(|o| (*p, *o)))
        {
            return Err(ControlError::PortConflict {
                port,
                holder: owner.to_string(),
            });
        }

        // Ports dropped from the config since the last reservation
        held.retain(|port, owner| *owner != holder || ports.contains(port));
        for port in ports {
            held.insert(*port, holder);
        }
        Ok(())
    }

    /// Release every port held by `holder`
    pub fn release(&self, workspace_id: &str, holder: ServiceId) {
        if let Some(mut held) = self.workspaces.get_mut(workspace_id) {
            held.retain(|_, owner| *owner != holder);
        }
        self.workspaces.remove_if(workspace_id, |_, held| held.is_empty());
    }

    /// Instance currently holding a port
    pub fn holder(&self, workspace_id: &str, port: u16) -> Option<ServiceId> {
        self.workspaces
            .get(workspace_id)
            .and_then(|held| held.get(&port).copied())
    }

    pub fn reserved(&self, workspace_id: &str) -> Vec<u16> {
        self.workspaces
            .get(workspace_id)
            .map(|held| held.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn test_reservation_is_all_or_nothing() {
        let ports = PortRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        ports.reserve("ws", a, &[8080]).unwrap();
        let err = ports.reserve("ws", b, &[8081, 8080]).unwrap_err();

        assert!(matches!(err, ControlError::PortConflict { port: 8080, .. }));
        assert_eq!(ports.holder("ws", 8081), None);
        assert_eq!(ports.reserved("ws"), vec![8080]);
    }

    #[test]
    fn test_workspaces_are_independent() {
        let ports = PortRegistry::new();

        ports.reserve("ws-1", Uuid::new_v4(), &[8080]).unwrap();
        ports.reserve("ws-2", Uuid::new_v4(), &[8080]).unwrap();
    }

    #[test]
    fn test_re_reserve_replaces_own_ports() {
        let ports = PortRegistry::new();
        let a = Uuid::new_v4();

        ports.reserve("ws", a, &[8080, 8081]).unwrap();
        ports.reserve("ws", a, &[8081, 9000]).unwrap();

        assert_eq!(ports.reserved("ws"), vec![8081, 9000]);
        ports.release("ws", a);
        assert!(ports.reserved("ws").is_empty());
    }

    #[test]
    fn test_concurrent_reservations_have_one_winner() {
        let ports = Arc::new(PortRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = Arc::clone(&ports);
                std::thread::spawn(move || ports.reserve("ws", Uuid::new_v4(), &[3000]).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }
}
