//! routegate - decision core for a model-routing gateway
//!
//! Picks a backend model for each task from a domain-expertise matrix, tracks
//! backend health with per-backend circuit breakers, enforces per-user rate
//! limits, logs every routing decision, and compacts the shared on-disk state
//! that concurrent processes read and write.

pub mod cli;
pub mod compactor;
pub mod config;
pub mod decision_log;
pub mod error;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod router;
pub mod store;
pub mod telemetry;
