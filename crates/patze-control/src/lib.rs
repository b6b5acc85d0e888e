//! Patze control plane.
//!
//! A stateless HTTP facade over the fleet subsystems: telemetry fan-in,
//! target sync, bridge commands, config applies, fleet policy, scheduled
//! tasks, SSH attachments, and bridge installs. The binary in `main.rs`
//! assembles [`state::AppState`], builds the router, and runs the server;
//! everything here is also reachable from integration tests.

#![forbid(unsafe_code)]

pub mod auth;
pub mod env;
pub mod error;
pub mod journal;
pub mod ratelimit;
pub mod routes;
pub mod settings;
pub mod sse;
pub mod state;

pub use auth::AuthConfig;
pub use env::EnvConfig;
pub use routes::build_router;
pub use state::{AppState, SharedState};
