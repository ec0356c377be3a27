use dotenvy::dotenv;
use query_gateway::{
    infrastructure::{config::Config, db},
    telemetry,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = Config::from_env()?;
    telemetry::init(config.server.mode);

    let pool = db::connect(&config.database).await?;
    db::run_migrations(&pool).await?;

    info!("database migrations completed");

    Ok(())
}
