//! Memory database migrations
//!
//! SQL migrations are embedded as strings and executed when the engine opens.

use rusqlite::Connection;
use crate::MemoryResult;

/// Memory tables SQL (001)
pub const MEMORY_TABLES_SQL: &str = include_str!("001_memory_tables.sql");

/// Cached tier and refinement tables SQL (002)
pub const CACHED_TIERS_SQL: &str = include_str!("002_cached_tiers.sql");

/// Run all memory migrations
pub fn run_migrations(conn: &Connection) -> MemoryResult<()> {
    conn.execute_batch(MEMORY_TABLES_SQL)?;
    conn.execute_batch(CACHED_TIERS_SQL)?;
    Ok(())
}
