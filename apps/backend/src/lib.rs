//! CanBridge backend.
//!
//! Accepts agent channels, relays CAN traffic between grouped dongles, runs
//! pairing against the agents and publishes what happens as resumable event
//! streams.

pub mod app;
pub mod config;
pub mod directory;
pub mod events;
pub mod hooks;
pub mod links;

pub use app::{Backend, BackendError};
pub use config::BackendConfig;
