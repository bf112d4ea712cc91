use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use tickwatch::config::Config;
use tickwatch::evaluator::required_symbols;
use tickwatch::feed::{TickStreamManager, WsConnector};
use tickwatch::model::condition::ConditionNode;
use tickwatch::price_store::PriceStore;
use tickwatch::runtime::watch::ConditionWatch;
use tickwatch::schedule::SystemClock;
use tickwatch::symbols::SymbolServiceClient;

fn load_tree(config: &Config) -> Result<ConditionNode> {
    let path = &config.strategy.tree_path;
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read condition tree {}", path.display()))?;
    ConditionNode::from_json(&text)
        .with_context(|| format!("failed to parse condition tree {}", path.display()))
}

async fn check_symbols(config: &Config, tree: &ConditionNode, market_open: bool) {
    let Some(base_url) = config.symbols.base_url.as_deref() else {
        return;
    };
    let client = SymbolServiceClient::new(base_url);
    match client.fetch_catalog(&config.feed.source, market_open).await {
        Ok(catalog) => {
            let required = required_symbols(tree);
            let unknown = catalog.unknown(&required);
            if unknown.is_empty() {
                tracing::info!(count = required.len(), "All tree symbols known to catalog");
            } else {
                tracing::warn!(unknown = ?unknown, broker = %catalog.broker(), "Tree references unknown symbols");
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Symbol catalog unavailable, skipping symbol check");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required by rustls 0.23+)
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            eprintln!("Set feed.ws_url in config/default.toml or TICKWATCH_FEED_URL in .env");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(false)
        .json()
        .init();

    let settings = config.feed_settings()?;
    let schedule = config.session.schedule()?;
    tracing::info!(
        ws_url = %settings.ws_url,
        source = %config.feed.source,
        timezone = %schedule.timezone(),
        "Starting tickwatch"
    );

    let tree = load_tree(&config)?;
    let clock = Arc::new(SystemClock);
    check_symbols(&config, &tree, schedule.is_open_now(clock.as_ref())).await;

    let store = Arc::new(PriceStore::new());
    let manager = Arc::new(TickStreamManager::spawn(
        settings,
        schedule,
        Arc::new(WsConnector),
        store,
        clock,
    ));

    let mut condition_watch =
        ConditionWatch::new(manager.clone(), config.feed.source.clone(), config.strategy.min_rules);
    condition_watch.set_tree(tree).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Ctrl+C handler
    let ctrl_c_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Ctrl+C received");
        let _ = ctrl_c_shutdown.send(true);
    });

    // Resume after suspension: timers may have slept through a session boundary.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let wake_manager = manager.clone();
        match signal(SignalKind::from_raw(libc::SIGCONT)) {
            Ok(mut wake) => {
                tokio::spawn(async move {
                    while wake.recv().await.is_some() {
                        tracing::info!("Process resumed, resynchronizing feed mode");
                        wake_manager.resync();
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "Could not install SIGCONT handler"),
        }
    }

    condition_watch.follow(shutdown_rx).await;

    manager.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
