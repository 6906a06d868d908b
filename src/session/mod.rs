//! Call session state machine and coordination.

pub mod coordinator;
pub mod log;
pub mod registry;
pub mod state;

pub use coordinator::{CallSessionCoordinator, CoordinatorConfig};
pub use log::{CallLog, MemoryCallLog, NoopCallLog};
pub use registry::CoordinatorRegistry;
pub use state::{ActiveCallSession, CallPhase, CallTransition, InvalidTransition};
