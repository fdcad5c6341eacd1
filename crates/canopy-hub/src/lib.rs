//! # canopy-hub
//!
//! Relay server for canopy.
//!
//! This crate provides:
//! - The WebSocket endpoint feeding the connection hub
//! - Read-only REST endpoints for health, device status, clients and history
//! - OpenAPI documentation via Swagger UI
//! - Periodic history persistence
//! - Structured logging to file and stdout

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod persistence;
pub mod state;

pub use api::create_router;
pub use state::{AppState, SharedState};
