use {
    clap::Subcommand,
    sqlx::{SqlitePool, sqlite::SqlitePoolOptions},
    switchboard_config::SwitchboardConfig,
};

/// Tables owned by the pipeline components.
const TABLES: &[&str] = &[
    "idempotency_markers",
    "queue_jobs",
    "session_locks",
    "rate_windows",
];

#[derive(Subcommand)]
pub enum DbAction {
    /// Run all pending database migrations.
    Migrate,
    /// Delete all rows but keep the schema intact.
    Clear,
}

pub async fn handle_db(config: &SwitchboardConfig, action: DbAction) -> anyhow::Result<()> {
    let pool = connect(config).await?;
    let result = match action {
        DbAction::Migrate => migrate(&pool).await,
        DbAction::Clear => clear(&pool).await,
    };
    pool.close().await;
    result
}

async fn connect(config: &SwitchboardConfig) -> anyhow::Result<SqlitePool> {
    Ok(SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&config.store.database_url)
        .await?)
}

async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    switchboard_pipeline::run_migrations(pool)
        .await
        .map_err(|e| anyhow::anyhow!("migrations failed: {e}"))?;
    println!("All migrations complete.");
    Ok(())
}

async fn clear(pool: &SqlitePool) -> anyhow::Result<()> {
    for table in TABLES {
        let query = format!("DELETE FROM {table}");
        match sqlx::query(&query).execute(pool).await {
            Ok(done) => println!("Cleared {table} ({} rows)", done.rows_affected()),
            // Table might not exist if migrations haven't run.
            Err(e) => eprintln!("Warning: could not clear {table}: {e}"),
        }
    }
    Ok(())
}
