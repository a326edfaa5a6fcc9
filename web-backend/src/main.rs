use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use anyhow::Result;
use std::time::Duration;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod error;
mod state;

use api::create_api_router;
use config::Settings;
use state::{AppState, Workers};

/// 停服时等待进行中扫描的最长时间
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vulnscan_web=debug,vulnscan_core=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    tracing::debug!(analysis_mode = ?settings.analysis_mode, workers = settings.worker_concurrency, "Loaded settings");

    // 初始化状态
    let (state, Workers { pool, jobs }) = AppState::new(&settings).await?;

    // 恢复上次中断的任务后再启动 worker
    pool.recover().await?;
    let worker = pool.spawn(jobs);

    let bind_address = settings.bind_address.clone();
    tracing::info!("VulnScan server listening on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(TracingLogger::default())
            .wrap(Cors::permissive())
            // API 路由
            .service(create_api_router())
            // 健康检查
            .route("/health", web::get().to(health_check))
    })
    .bind(&bind_address)?
    .run()
    .await?;

    // HTTP 停止后让 worker 收尾，未完成的扫描由下次启动时的恢复处理
    worker.shutdown(WORKER_SHUTDOWN_GRACE).await;
    tracing::info!("Server stopped");

    Ok(())
}
