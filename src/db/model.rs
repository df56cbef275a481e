//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Decision
//! logic lives in the engine.

/// Per-source import checkpoint consulted by incremental runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub last_external_id: i64,
    pub total_imported: i64,
}

/// Slice of an existing post the engine needs for its upsert decision.
#[derive(Debug, Clone)]
pub struct PostRef {
    pub id: i64,
    pub fingerprint: String,
}
