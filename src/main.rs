use fact_drill::api::{app_router, ApiState};
use fact_drill::config::{SchedulerConfig, ServerConfig};
use fact_drill::db::Db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let server = ServerConfig::from_env();
    let config = SchedulerConfig::from_env()?;

    let db = Db::new(&server.database_url).await?;
    let state = ApiState::new(db.clone(), config, server.user_id.clone())?;
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(&server.bind_addr).await?;
    log::info!("serving {} on http://{}", server.user_id, server.bind_addr);
    axum::serve(listener, app).await?;
    db.close().await;

    Ok(())
}
