//! gather, a local-first feed aggregation engine.
//!
//! The engine periodically fetches many independent RSS/Atom feeds,
//! deduplicates their items into a single SQLite store, and adapts each
//! feed's polling cadence to its observed volume. All store mutations
//! are funneled through a single write serializer, and a running sweep
//! is tracked as a cancellable, observable job.
//!
//! Module layout:
//!
//! - [`storage`]: SQLite schema and feed/entry operations (sqlx)
//! - [`feed`]: fetching, parsing, and OPML import/export
//! - [`sweep`]: the sweep orchestrator, reconciler, job manager, and
//!   periodic scheduler
//! - [`engine`]: the facade tying the above together behind the
//!   write serializer
//! - [`config`]: TOML configuration with defaults for every knob

pub mod config;
pub mod engine;
pub mod feed;
pub mod storage;
pub mod sweep;
pub mod util;
