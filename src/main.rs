// src/main.rs
use anyhow::Context;
use dotenvy::dotenv;
use oko_guard::config::AppConfig;
use oko_guard::connectors::bybit::BybitClient;
use oko_guard::connectors::paper::PaperExchange;
use oko_guard::connectors::traits::ExchangeAdapter;
use oko_guard::core::GuardEngine;
use oko_guard::storage::{JsonLedger, Ledger};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // 1. Load Configuration
    let config = AppConfig::new().context("loading configuration")?;

    // 2. Logging: console + daily rolling file. The guard flushes on drop.
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "oko_guard.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    info!("========================================");
    info!("       OKO GUARD - v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!(
        "Mode:   {}",
        if config.live_trading {
            "🚨 LIVE TRADING"
        } else {
            "📝 PAPER TRADING"
        }
    );

    // 3. Initialize Components
    let exchange: Arc<dyn ExchangeAdapter> = if config.live_trading {
        if config.exchange.api_key.is_empty() || config.exchange.secret_key.is_empty() {
            anyhow::bail!("live trading needs APP__EXCHANGE__API_KEY and APP__EXCHANGE__SECRET_KEY");
        }
        Arc::new(BybitClient::new(&config.exchange).context("building exchange client")?)
    } else {
        Arc::new(PaperExchange::new())
    };
    let ledger = Arc::new(
        JsonLedger::open(&config.ledger_path, config.engine.clone())
            .await
            .with_context(|| format!("opening ledger {}", config.ledger_path))?
            .with_retention(config.ledger_retention),
    );
    let settings = ledger.load_settings().await?;
    info!(
        "Exchange: {} | Ledger: {} | Interval: {}s",
        exchange.name(),
        config.ledger_path,
        config.monitor_interval_secs
    );

    let engine = GuardEngine::new(exchange, ledger, &settings);

    // 4. Run until Ctrl+C
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Ctrl+C handler failed: {}", e);
        }
    };
    let interval = Duration::from_secs(config.monitor_interval_secs.max(1));
    engine.run(interval, shutdown).await;

    warn!("Guard engine stopped");
    Ok(())
}
