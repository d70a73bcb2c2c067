use std::{
    net::SocketAddr,
    sync::Arc,
};

use admission::{
    api,
    clock::{Clock, SystemClock},
    config::{GatewayConfig, LogFormat},
    gateway::Gateway,
    ratelimit::cleanup::spawn_cleanup_task,
};
use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = GatewayConfig::from_env().context("failed to build gateway config")?;
    init_tracing(&cfg);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let gateway = Arc::new(
        Gateway::from_config(&cfg, clock.clone())
            .await
            .map_err(|e| anyhow::anyhow!(e.message()))
            .context("failed to initialise rate limit store")?,
    );

    let _cleanup = spawn_cleanup_task(
        gateway.backend(),
        clock,
        cfg.retention(),
        cfg.store.cleanup_interval,
    );

    let app = api::routes(gateway);

    let listener = TcpListener::bind(cfg.bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(
        addr = %cfg.bind_addr,
        upstream = cfg.upstream.as_ref().map(|u| u.base_url.as_str()),
        "admission gateway listening"
    );

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("gateway server error")?;

    Ok(())
}

fn init_tracing(cfg: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,reqwest=warn,redis=warn",
            cfg.log_level
        ))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match cfg.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}
