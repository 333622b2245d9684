//! Distillation database migrations

use rusqlite::Connection;
use crate::MemoryResult;

/// Reflection, distilled knowledge and checkpoint tables SQL (001)
pub const DISTILLATION_TABLES_SQL: &str = include_str!("001_distillation_tables.sql");

/// Run all distillation migrations
pub fn run_migrations(conn: &Connection) -> MemoryResult<()> {
    conn.execute_batch(DISTILLATION_TABLES_SQL)?;
    Ok(())
}
