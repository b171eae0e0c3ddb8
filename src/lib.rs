//! Custody Index
//!
//! Client-side indexing and realtime cache-consistency engine for physical
//! asset custody records: paged full indexing into a persisted snapshot cache,
//! change-notification reducers, cross-source merging, reference propagation
//! and a lock-constrained multi-select.

pub mod cli;
pub mod core;
