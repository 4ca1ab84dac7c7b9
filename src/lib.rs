//! Worldlink Server Library
//!
//! The real-time connection layer of a multiplayer world server: per-connection
//! actors, a hub that owns the participant directory and spatial index, and
//! area-scoped delivery over WebTransport or TCP.
//!
//! # Features
//!
//! - `metrics_extended` - Rolling p95/max timings for spatial area queries (enabled by default)

pub mod commands;
pub mod config;
pub mod consumer;
pub mod hub;
pub mod metrics;
pub mod net;
pub mod participant;
pub mod util;
