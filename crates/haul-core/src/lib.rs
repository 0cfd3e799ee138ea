//! # haul-core
//!
//! Shared vocabulary for the haul image delivery service.
//!
//! - **Branded IDs**: `SessionToken`, `RoomId`, `JobId`, `ConnectionId` as newtypes
//! - **References**: [`ArtifactReference`](reference::ArtifactReference) parsing `[repo/]name[:tag]`
//! - **Phases**: the forward-only job lifecycle and per-phase progress
//! - **Events**: room-scoped job events and the wire envelope sent to clients
//! - **Errors**: `HaulError` with stable machine-readable codes

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod phase;
pub mod reference;

pub use errors::{HaulError, Result};
pub use events::{FailureInfo, JobEvent, JobSnapshot, ServerEvent};
pub use ids::{ConnectionId, JobId, RoomId, SessionToken};
pub use phase::{Phase, PhaseProgress};
pub use reference::ArtifactReference;
