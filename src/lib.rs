//! garita — client-side data synchronization core for a sealed-transit
//! operator console.
//!
//! The console tracks customs-sealing transits, stock, and truck positions
//! against a remote backend. This crate is the layer that keeps that state
//! correct under flaky connectivity, overlapping requests, server push
//! events, and consumer teardown:
//!
//! - [`sync::CacheStore`] — synchronous TTL-aware cache over a pluggable
//!   [`sync::PersistentStore`] backend
//! - [`sync::ConnectionMonitor`] — host and push-transport connectivity
//! - [`sync::Resource`] — fetch orchestration for one logical resource:
//!   retry/backoff, cache fallback, request dedupe and sequencing,
//!   optimistic updates
//! - [`sync::AutoPoller`] / [`sync::ControlledPoller`] / [`sync::SmartPoller`]
//!   — recurring-invocation strategies over a shared scheduled-task primitive
//! - [`sync::RealtimeBridge`] — shared push transport with topic
//!   subscriptions, merging inbound events into held resources
//! - [`api`] — typed HTTP client and domain model for the tracked entities
//!
//! Presentation is someone else's job; consumers observe resources through
//! cheap snapshot channels and render however they like.

pub mod api;
pub mod config;
pub mod error;
pub mod sync;

pub use error::FetchError;
