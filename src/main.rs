use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use rmcp::transport::streamable_http_server::{
    StreamableHttpService, session::local::LocalSessionManager,
};
use tower_http::services::ServeDir;
use tracing::info;
use tracing_subscriber::EnvFilter;

use asset_derivatives::{config::AppConfig, mcp_server::MediaServer, pipeline::MediaPipeline, web};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bind_address = config.bind_address();
    let mcp_path = config.scoped_path("/mcp");
    let sites_path = config.scoped_path("/sites");
    let pipeline = MediaPipeline::from_config(&config);

    let pipeline_for_service = pipeline.clone();
    let service = StreamableHttpService::new(
        move || Ok(MediaServer::new(pipeline_for_service.clone())),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    let router = axum::Router::new()
        .route(
            &format!("{sites_path}/{{site}}/upload"),
            post(web::handle_upload).layer(DefaultBodyLimit::max(50 * 1024 * 1024)),
        )
        .route(
            &format!("{sites_path}/{{site}}/display/{{*path}}"),
            get(web::serve_display),
        )
        .route(
            &format!("{sites_path}/{{site}}/references"),
            put(web::update_references),
        )
        .nest_service(&mcp_path, service)
        .nest_service("/originals", ServeDir::new(config.originals_dir()))
        .with_state(pipeline);
    let tcp_listener = tokio::net::TcpListener::bind(&bind_address).await?;

    info!(
        data_dir = %config.data_dir.display(),
        cache_backend = ?config.cache_backend,
        "media pipeline MCP server started at http://{bind_address}{mcp_path}"
    );

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
