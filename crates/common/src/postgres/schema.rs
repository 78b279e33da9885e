use crate::postgres::PostgresClient;
use anyhow::{anyhow, Result};
use tracing::{debug, info};

/// A goose-formatted migration compiled into the binary
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration {
    /// Statements between `-- +goose Up` and `-- +goose Down`
    pub fn up_sql(&self) -> String {
        section(self.sql, "-- +goose Up", "-- +goose Down")
    }

    pub fn down_sql(&self) -> String {
        section(self.sql, "-- +goose Down", "-- +goose Up")
    }
}

fn section(sql: &str, start: &str, end: &str) -> String {
    let mut in_section = false;
    let mut out = String::new();
    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with(start) {
            in_section = true;
            continue;
        }
        if trimmed.starts_with(end) {
            in_section = false;
            continue;
        }
        if in_section && !trimmed.starts_with("-- +goose") {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "create_telemetry_tables",
    sql: include_str!("../../migrations/postgres/00001_create_telemetry_tables.sql"),
}];

/// Applies embedded migrations that have not been recorded yet.
///
/// Each migration runs in its own transaction together with its bookkeeping
/// row. Every statement is idempotent, so concurrent starts converge.
pub struct SchemaMigrator {
    client: PostgresClient,
    migrations: &'static [Migration],
}

impl SchemaMigrator {
    pub fn new(client: PostgresClient) -> Self {
        Self {
            client,
            migrations: MIGRATIONS,
        }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.client.get_connection().await?;

        conn.batch_execute(
            "CREATE TABLE IF NOT EXISTS fieldlink_schema_version (
                version BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .await?;

        for migration in self.migrations {
            let tx = conn.transaction().await?;

            let applied = tx
                .query_opt(
                    "SELECT version FROM fieldlink_schema_version WHERE version = $1",
                    &[&migration.version],
                )
                .await?
                .is_some();

            if applied {
                debug!(version = migration.version, "migration already applied");
                continue;
            }

            tx.batch_execute(&migration.up_sql()).await.map_err(|e| {
                anyhow!(
                    "migration {} ({}) failed: {}",
                    migration.version,
                    migration.name,
                    e
                )
            })?;
            tx.execute(
                "INSERT INTO fieldlink_schema_version (version, name) VALUES ($1, $2)
                 ON CONFLICT (version) DO NOTHING",
                &[&migration.version, &migration.name],
            )
            .await?;
            tx.commit().await?;

            info!(
                version = migration.version,
                name = migration.name,
                "applied migration"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_up_section_creates_all_tables() {
        let up = MIGRATIONS[0].up_sql();
        assert!(up.contains("CREATE TABLE IF NOT EXISTS devices"));
        assert!(up.contains("CREATE TABLE IF NOT EXISTS readings ("));
        assert!(up.contains("CREATE TABLE IF NOT EXISTS readings_flat"));
        assert!(up.contains("USING GIN (payload)"));
        assert!(!up.contains("DROP TABLE"));
    }

    #[test]
    fn test_down_section_only_drops() {
        let down = MIGRATIONS[0].down_sql();
        assert!(down.contains("DROP TABLE IF EXISTS readings_flat"));
        assert!(!down.contains("CREATE TABLE"));
    }

    #[test]
    fn test_migration_versions_are_increasing() {
        assert!(MIGRATIONS
            .windows(2)
            .all(|pair| pair[0].version < pair[1].version));
    }
}
