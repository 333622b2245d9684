//! Policy database migrations

use rusqlite::Connection;
use crate::MemoryResult;

/// Policy and audit tables SQL (001)
pub const POLICY_TABLES_SQL: &str = include_str!("001_policy_tables.sql");

/// Run all policy migrations
pub fn run_migrations(conn: &Connection) -> MemoryResult<()> {
    conn.execute_batch(POLICY_TABLES_SQL)?;
    Ok(())
}
