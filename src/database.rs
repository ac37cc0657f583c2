use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use tracing::info;

use crate::error::StoreError;

static MIGRATOR: Migrator = sqlx::migrate!();

pub async fn setup_database(database_url: &str, max_connections: u32) -> Result<Pool<Postgres>, StoreError> {
  let pool = PgPoolOptions::new()
    .max_connections(max_connections)
    .connect(database_url)
    .await?;

  MIGRATOR.run(&pool).await?;
  info!("Database migrations complete");
  Ok(pool)
}
