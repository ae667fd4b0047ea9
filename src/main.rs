use std::net::SocketAddr;
use nazr_faces::utils::config::Config;
use nazr_faces::utils::logging;
use nazr_faces::AppState;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cfg = Config::from_env();
    let port = cfg.port;
    info!(data = %cfg.data.display(), embed_model = %cfg.embed_model, metric = %cfg.distance_metric, "starting nazr-faces");

    let state = AppState::start(cfg).await?;
    let app = nazr_faces::api::routes::router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, app).await?;
    Ok(())
}
