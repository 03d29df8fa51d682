use crate::modules::{
    handlers::{liveness, readiness, sync, AppState},
    migration::MIGRATOR,
};
use anyhow::Result;
use axum::{
    extract::Extension,
    http::header::CONTENT_TYPE,
    routing, Router, Server,
};
use clap::Args;
use std::{env, net::SocketAddr, sync::Arc};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

#[derive(Debug, Args)]
pub struct ServerArgs {
    #[arg(long)]
    port: Option<u16>,
}

pub async fn run(args: ServerArgs) -> Result<()> {
    let pool = super::connect_pool().await?;

    MIGRATOR.run(&pool).await?;

    let app = create_router(AppState { pool });
    let port = match args.port {
        Some(port) => port,
        None => {
            tracing::warn!("API server will be launched at default port number 8000");
            8000u16
        }
    };
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server start at port {}", port);
    Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to bind server.");

    Ok(())
}

fn create_router(state: AppState) -> Router {
    let origin = env::var("FRONTEND_ORIGIN_URL").unwrap_or_else(|_| {
        tracing::warn!("FRONTEND_ORIGIN_URL environment variable is not set. Default value `http://localhost:3000` will be used.");
        String::from("http://localhost:3000")
    });

    Router::new()
        .route("/api/sync", routing::post(sync))
        .route("/api/liveness", routing::get(liveness))
        .route("/api/readiness", routing::get(readiness))
        .layer(Extension(Arc::new(state)))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::exact(origin.parse().unwrap()))
                .allow_methods(Any)
                .allow_headers(vec![CONTENT_TYPE]),
        )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler.");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("SIGINT signal received, starting graceful shutdown.");
}
