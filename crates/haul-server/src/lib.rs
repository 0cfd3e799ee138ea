//! # haul-server
//!
//! Fetch-and-package server with a session-bound progress protocol.
//!
//! - Session registry: durable browser identity and room (re)attachment
//! - Validation debouncer: only the newest existence check per connection counts
//! - Job coordinator: `Validating → Pulling → Compressing → Ready`
//! - Progress broadcaster: ordered, room-scoped event delivery
//! - Completion handoff: each artifact is downloadable exactly once
//! - Axum HTTP API and `WebSocket` transport

#![deny(unsafe_code)]

pub mod api;
pub mod broadcast;
pub mod config;
pub mod handoff;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod source;
pub mod validation;
pub mod websocket;
