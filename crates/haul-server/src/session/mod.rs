//! Durable browser sessions and their rooms.

pub mod registry;

pub use registry::{Session, SessionRegistry};
