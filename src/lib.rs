//! Latchkey — a two-factor door-lock access backend.
//!
//! Card scans and face embeddings arrive asynchronously from field devices;
//! the coordinator resolves which door each report belongs to, runs
//! single-shot enrollment, matches faces against known identities, combines
//! factors under per-device OR/AND policies, and emits one trustworthy
//! decision plus an audit record per physical event.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod types;

pub mod matcher;
pub mod notify;
pub mod store;

pub mod coordinator;
pub mod gateway;
