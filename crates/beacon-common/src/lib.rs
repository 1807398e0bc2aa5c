//! # beacon-common
//!
//! Shared identifiers, wire models, and configuration used across all Beacon crates.
//! This is the foundation layer: no signaling logic, just primitives and contracts.

pub mod config;
pub mod id;
pub mod models;

pub use id::{SessionId, SessionIdGenerator};
pub use models::{IceCandidate, PresenterInfo};
