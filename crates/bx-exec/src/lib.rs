//! # bx-exec
//!
//! Order execution for perpetual swaps: every entry ends either fully
//! protected by a stop-loss and a take-profit, or flat.
//!
//! - `executor`: market and limit entries, protection legs, rollback, closes
//! - `pending`: resting limit orders with bar-based expiry
//! - `registry`: tracked positions and per-strategy limits
//! - `scheduler`: the periodic tick that ties signals to execution
//! - `collaborators`: strategy, risk, trade-log and notification seams

pub mod collaborators;
pub mod executor;
pub mod locks;
pub mod pending;
pub mod registry;
pub mod scheduler;
pub mod sizing;

pub use executor::{ClosedPosition, ExecutionResult, LimitPlacement, OrderExecutor, RollbackOutcome};
pub use pending::{FilledOrder, PendingOrder, PendingOrderManager};
pub use registry::{Position, PositionFilter, PositionRegistry};
pub use scheduler::{Scheduler, TickReport};
