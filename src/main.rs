use anyhow::Result;
use std::sync::Arc;

use inbound_reconciler::config::Config;
use inbound_reconciler::imap::ImapClientFactory;
use inbound_reconciler::routes::{self, AppState};
use inbound_reconciler::secret::Base64Secrets;
use inbound_reconciler::services::scheduler::{self, Monitor};
use inbound_reconciler::{db, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let config = Config::from_env()?;
    tracing::debug!(?config, "configuration loaded");

    let pool = db::connect(&config.database_url).await?;

    let monitor = Arc::new(Monitor::new(
        pool.clone(),
        Arc::new(ImapClientFactory::new(config.imap_timeout())),
        Arc::new(Base64Secrets),
        config.monitor_settings(),
    ));
    let ticker = scheduler::start(monitor.clone());

    let app = routes::app(AppState {
        pool: pool.clone(),
        monitor,
    });

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ticker.abort();
    pool.close().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let term = async {
        if let Ok(mut s) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            s.recv().await;
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();
    tokio::select! { _ = ctrl_c => {}, _ = term => {} }
}
