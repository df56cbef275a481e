//! Content ingestion and migration pipeline.
//!
//! Two entry points feed one canonical store: `parse_telegram` crawls a
//! channel's public preview incrementally, `import_from_dle` replays a
//! legacy DataLife Engine dump. Both stream raw records through a pure
//! normalizer into a dedup/upsert engine that writes batched transactions
//! to SQLite.

pub mod config;
pub mod db;
pub mod dle;
pub mod engine;
pub mod error;
pub mod model;
pub mod normalize;
pub mod run;
pub mod telegram;
