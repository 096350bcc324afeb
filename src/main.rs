use std::error::Error;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use alertflow::api::binance::FeedGateway;
use alertflow::engine::{
    AlertEngine, ConditionEvaluator, PriceCache, SubscriberRegistry, SymbolHistory,
    TriggerController,
};
use alertflow::{
    AlertDefinition, Condition, Config, Direction, Metrics, MetricsReporter, WorkerPool,
};
use env_logger::Builder;
use log::{info, LevelFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    // Configure logger
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("alertflow", LevelFilter::Debug)
        .format(|buf, record| {
            let ts = chrono::Local::now().format("%H:%M:%S%.3f");
            writeln!(
                buf,
                "[{} {:<5} {}] {}",
                ts,
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr)
        .write_style(env_logger::WriteStyle::Always)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };

    info!("Starting alertflow...");

    let metrics = Arc::new(Metrics::new());
    let cache = Arc::new(PriceCache::new(Arc::clone(&metrics)));
    let registry = Arc::new(SubscriberRegistry::new(Arc::clone(&cache), &config.registry));
    let pool = Arc::new(WorkerPool::new(&config.pool));
    let history = Arc::new(SymbolHistory::new(config.evaluator.history_cap));
    let evaluator = Arc::new(ConditionEvaluator::new(
        Arc::clone(&pool),
        Arc::clone(&history),
        &config.evaluator,
    ));
    let trigger = Arc::new(TriggerController::new(config.trigger.history_cap));

    let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel(256);
    let engine = Arc::new(AlertEngine::new(
        Arc::clone(&registry),
        evaluator,
        trigger,
        history,
        Arc::clone(&metrics),
        notify_tx,
    ));
    let gateway = Arc::new(FeedGateway::new(
        config.feed.clone(),
        Arc::clone(&cache),
        Arc::clone(&registry),
        Arc::clone(&metrics),
    ));
    let reporter = MetricsReporter::new(
        Arc::clone(&metrics),
        Arc::clone(&pool),
        Duration::from_millis(config.metrics.report_interval_ms),
    );

    // Demo alerts; in the full system these come from the alert CRUD layer.
    engine.add_alert(AlertDefinition::new(
        1,
        "BTCUSDT",
        Condition::Price,
        Direction::Above,
        49_000.0,
    ))?;
    engine.add_alert(AlertDefinition::new(
        2,
        "ETHUSDT",
        Condition::Rsi { period: 14 },
        Direction::Above,
        70.0,
    ))?;
    engine.add_alert(AlertDefinition::new(
        3,
        "SOLUSDT",
        Condition::Volume {
            spike_factor: 3.0,
            lookback: 20,
        },
        Direction::Above,
        0.0,
    ))?;

    let registry_handle = registry.start();
    let engine_handle = engine.start();
    let gateway_handle = gateway.start();
    let reporter_handle = reporter.start();

    // Stand-in for the notification collaborator: log every trigger.
    let notify_handle = tokio::spawn(async move {
        while let Some(notification) = notify_rx.recv().await {
            info!(
                "NOTIFY alert {} on {}: {} (price {})",
                notification.alert_id,
                notification.symbol,
                notification.result.reason,
                notification.tick.price
            );
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received, shutting down"),
        _ = gateway_handle => info!("feed gateway exited"),
    }

    gateway.stop();
    engine.stop();
    registry.stop();
    reporter.stop();
    pool.stop();
    notify_handle.abort();
    let _ = engine_handle.await;
    let _ = registry_handle.await;
    let _ = reporter_handle.await;

    info!("Shutdown complete");
    Ok(())
}
