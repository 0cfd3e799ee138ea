//! Job lifecycle: the per-room record and the coordinator that drives it.

pub mod coordinator;
pub mod record;

pub use coordinator::JobCoordinator;
pub use record::JobRecord;
