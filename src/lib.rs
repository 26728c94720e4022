//! Ringcache - an in-memory HTTP response cache with per-host ring buffers
//! and request coalescing

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod filter;
pub mod handlers;
pub mod metrics;
pub mod origin;
pub mod response;
pub mod ring_buffer;
pub mod worker;
