//! Forwarding Engine - The heart of Relayman
//!
//! This module implements the task engine with:
//! - Per connection-class pacing with flood-wait handling
//! - Bounded retries with exponential backoff
//! - Resumable progress cursor (SQLite)
//! - Pause/resume/stop/delete lifecycle
//! - Restart recovery

mod bot_api;
mod forwarder;
mod manager;
mod memory;
mod persistence;
mod rate_limiter;
mod status;
mod transport;

pub use bot_api::*;
pub use forwarder::*;
pub use manager::*;
pub use memory::*;
pub use persistence::*;
pub use rate_limiter::*;
pub use status::*;
pub use transport::*;
