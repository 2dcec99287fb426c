use sqlx::SqlitePool;

/// Creates the pool table if needed and adds columns introduced later.
pub async fn run_inline_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    tracing::info!("running pool migrations (inline schema)");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vms (
            id INTEGER PRIMARY KEY,
            name VARCHAR(255) NOT NULL DEFAULT '',
            in_use VARCHAR(1) NOT NULL DEFAULT 'f' CHECK (in_use IN ('t', 'f')),
            image_id VARCHAR(255) NOT NULL DEFAULT '',
            agent_id VARCHAR(255) NOT NULL DEFAULT '',
            timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    let columns: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info('vms')")
        .fetch_all(pool)
        .await?;
    let has = |c: &str| columns.iter().any(|(n,)| n == c);

    // Profile columns; older tables only carried the bookkeeping fields.
    let profile_columns = [
        ("cpu", "INTEGER NOT NULL DEFAULT 0"),
        ("memory_mb", "INTEGER NOT NULL DEFAULT 0"),
        ("ip", "VARCHAR(64) NOT NULL DEFAULT ''"),
        ("private_vlan", "INTEGER NOT NULL DEFAULT 0"),
        ("public_vlan", "INTEGER NOT NULL DEFAULT 0"),
    ];
    for (name, ddl) in profile_columns {
        if !has(name) {
            sqlx::query(&format!("ALTER TABLE vms ADD COLUMN {} {}", name, ddl))
                .execute(pool)
                .await?;
        }
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_vms_free_profile ON vms (in_use, cpu, memory_mb, private_vlan, public_vlan)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vms_agent_id ON vms (agent_id)")
        .execute(pool)
        .await?;

    Ok(())
}
