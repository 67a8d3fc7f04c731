use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Embedded SQL migration with version and both directions.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: include_str!("sql/001_init.up.sql"),
        down_sql: include_str!("sql/001_init.down.sql"),
    },
    Migration {
        version: 2,
        up_sql: include_str!("sql/002_daily_rollups.up.sql"),
        down_sql: include_str!("sql/002_daily_rollups.down.sql"),
    },
];

/// Latest schema version known to this build.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER NOT NULL,
            dirty INTEGER NOT NULL DEFAULT 0
        )",
    )
    .context("creating schema_migrations table")
}

/// Returns the current migration version and dirty flag.
pub fn status(conn: &Connection) -> Result<(u32, bool)> {
    ensure_migrations_table(conn)?;

    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT version, dirty FROM schema_migrations ORDER BY rowid DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("querying migration version")?;

    Ok(row
        .map(|(version, dirty)| (u32::try_from(version).unwrap_or(0), dirty != 0))
        .unwrap_or((0, false)))
}

fn set_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute("DELETE FROM schema_migrations", [])
        .context("clearing schema_migrations")?;
    if version > 0 {
        conn.execute(
            "INSERT INTO schema_migrations (version, dirty) VALUES (?1, 0)",
            params![version],
        )
        .context("inserting migration version")?;
    }
    Ok(())
}

/// Applies all pending forward migrations, each in its own transaction.
pub fn up(conn: &mut Connection) -> Result<()> {
    let (current_version, dirty) = status(conn)?;
    if dirty {
        bail!("migration version {current_version} is dirty, manual intervention required");
    }

    let mut applied = 0u32;
    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        tracing::debug!(version = migration.version, "applying migration");

        let tx = conn.transaction().context("beginning migration transaction")?;
        tx.execute_batch(migration.up_sql)
            .with_context(|| format!("applying migration version {}", migration.version))?;
        set_version(&tx, migration.version)?;
        tx.commit()
            .with_context(|| format!("committing migration version {}", migration.version))?;

        applied += 1;
    }

    if applied > 0 {
        tracing::info!(version = latest_version(), applied, "migrations completed");
    }

    Ok(())
}

/// Rolls back the most recently applied migration.
pub fn down(conn: &mut Connection) -> Result<()> {
    let (current_version, _) = status(conn)?;
    if current_version == 0 {
        tracing::info!("no migrations to roll back");
        return Ok(());
    }

    let migration = MIGRATIONS
        .iter()
        .find(|m| m.version == current_version)
        .with_context(|| format!("migration version {current_version} not found"))?;

    let prev_version = MIGRATIONS
        .iter()
        .filter(|m| m.version < current_version)
        .map(|m| m.version)
        .max()
        .unwrap_or(0);

    let tx = conn.transaction().context("beginning rollback transaction")?;
    tx.execute_batch(migration.down_sql)
        .with_context(|| format!("rolling back migration version {current_version}"))?;
    set_version(&tx, prev_version)?;
    tx.commit().context("committing rollback")?;

    tracing::info!(version = prev_version, "rollback completed");

    Ok(())
}
