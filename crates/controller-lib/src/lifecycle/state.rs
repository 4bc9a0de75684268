//! Service status transition table

use crate::error::{ControlError, Result};
use crate::models::ServiceStatus;
use ServiceStatus::*;

/// Whether `from -> to` is a valid transition.
///
/// `stop` and `delete` are accepted from every non-deleted state; stopping
/// an already stopped instance is handled by the caller as a no-op.
pub fn is_allowed(from: ServiceStatus, to: ServiceStatus) -> bool {
    if from == Deleted {
        return false;
    }
    match to {
        Deleted => true,
        Stopped => from != Stopped,
        _ => matches!(
            (from, to),
            (Detecting, Pending)
                | (Detecting, Error)
                | (Pending, Building)
                | (Building, Deploying)
                | (Building, Error)
                | (Deploying, Running)
                | (Deploying, Error)
                | (Running, Restarting)
                | (Running, Scaling)
                | (Running, Error)
                | (Restarting, Running)
                | (Restarting, Error)
                | (Scaling, Running)
                | (Stopped, Pending)
                | (Error, Pending)
        ),
    }
}

/// Reject anything outside the table with `InvalidTransition`
pub fn check_transition(from: ServiceStatus, to: ServiceStatus) -> Result<()> {
    if is_allowed(from, to) {
        Ok(())
    } else {
        Err(ControlError::InvalidTransition { from, to })
    }
}
