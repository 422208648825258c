//! Ratewarden - Per-Identity Request Throttling
//!
//! This crate decides whether a request may proceed based on who sent it:
//! a caller-supplied credential when one is present, otherwise the source
//! address. Each identity is counted in fixed one-second windows and
//! blocked for a cooldown period once it exceeds its limit. Counters and
//! blocks live behind a pluggable store, either in-process or in Redis.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
