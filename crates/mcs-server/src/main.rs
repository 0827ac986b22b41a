mod config;
mod serve_cmd;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use mcs_core::llm_gateway::{HttpGatewayConfig, HttpLlmGateway};
use mcs_core::LlmGateway;
use mcs_db::pool;

use config::ServerConfig;
use serve_cmd::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let resolved = ServerConfig::resolve().context("failed to resolve server configuration")?;

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let gateway: Arc<dyn LlmGateway> = Arc::new(HttpLlmGateway::new(HttpGatewayConfig {
        api_base: resolved.llm.api_base,
        api_key: resolved.llm.api_key,
        model: resolved.orchestration.llm_model.clone(),
        max_tokens: resolved.orchestration.llm_max_tokens,
        timeout: Duration::from_secs(120),
    })?);

    let state = AppState {
        pool: db_pool.clone(),
        config: Arc::new(resolved.orchestration),
        gateway,
    };

    let bind = resolved.bind.clone();
    let port = resolved.port;

    let sweep_handle = serve_cmd::spawn_expiry_sweep(state.clone(), Duration::from_secs(30));

    let result = serve_cmd::run_serve(state, &bind, port).await;

    sweep_handle.abort();
    db_pool.close().await;
    result
}
