use anyhow::Result;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

use crate::store::DbPool;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Runs pending migrations over a blocking connection.
pub fn run_migrations(database_url: &str) -> Result<()> {
    info!("Running database migrations...");
    let mut conn = PgConnection::establish(database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");
    Ok(())
}

pub async fn build_pool(database_url: &str, max_size: u32) -> Result<DbPool> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool: DbPool = bb8::Pool::builder().max_size(max_size).build(config).await?;
    Ok(pool)
}
