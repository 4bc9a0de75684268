//! Service lifecycle: status transitions, single-writer slots, host port
//! reservations and the instance store

mod manager;
mod ops;
mod persist;
mod ports;
mod state;
mod store;


pub use manager::LifecycleManager;
pub use ops::{OperationGuard, OperationKind, OperationSlots};
pub use persist::{PersistedRecord, PersistedState, StateFile};
pub use ports::PortRegistry;
pub use state::{check_transition, is_allowed};
pub use store::ServiceStore;
