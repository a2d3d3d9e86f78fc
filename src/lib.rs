//! Readygate - a readiness-gating TCP proxy for a slow-starting backend
//!
//! This library fronts a single backend application server that takes a
//! while to boot:
//! - Spawns and supervises the backend process; its exit is fatal
//! - Probes the backend's loopback port until it accepts connections
//! - Serves a fixed placeholder page (and health-check success) while the
//!   backend is still starting
//! - Relays raw bytes between clients and the backend once it is ready

pub mod config;
pub mod proxy;
pub mod readiness;
pub mod supervisor;
