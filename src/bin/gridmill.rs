//! `gridmill run <config>`: load a grid configuration, wire the venue
//! adapter, and trade until SIGINT.

use std::env;
use std::sync::Arc;

use log::{error, info};
use rust_decimal::Decimal;

use gridmill::config::{GridConfig, GridSettings};
use gridmill::coordinator::GridCoordinator;
use gridmill::errors::{GridError, GridResult};
use gridmill::exchange::mock::MockExchange;
use gridmill::ExchangeAdapter;

fn load_settings(path: &str) -> GridResult<GridSettings> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(config::Environment::with_prefix("GRIDMILL").separator("__"))
        .build()?
        .try_deserialize::<GridSettings>()?;
    Ok(settings)
}

/// Adapter registry. The paper venue trades against an in-memory book
/// seeded at the corridor midpoint; real venue adapters plug in here.
fn build_exchange(config: &GridConfig) -> GridResult<Arc<dyn ExchangeAdapter>> {
    match config.exchange.as_str() {
        "paper" => {
            let mid = if config.upper_price() > Decimal::ZERO {
                (config.lower_price() + config.upper_price()) / Decimal::from(2)
            } else {
                Decimal::ONE_HUNDRED
            };
            Ok(Arc::new(MockExchange::new(mid)))
        }
        other => Err(GridError::InvalidConfig(format!(
            "no adapter registered for exchange '{other}'"
        ))),
    }
}

#[tokio::main]
async fn main() -> GridResult<()> {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let path = match args.as_slice() {
        [cmd, path] if cmd == "run" => path.clone(),
        _ => {
            eprintln!("usage: gridmill run <config_path>");
            std::process::exit(2);
        }
    };

    let settings = load_settings(&path)?;
    let config = GridConfig::from_settings(settings)?;
    info!(
        "loaded config: {} {} ({:?}, {} grids)",
        config.exchange, config.symbol, config.grid_type, config.grid_count
    );

    let exchange = build_exchange(&config)?;
    let mut coordinator = GridCoordinator::new(config, exchange);
    coordinator.start().await?;

    tokio::select! {
        result = coordinator.run() => {
            if let Err(e) = result {
                error!("event loop failed: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
    }

    let stats = coordinator.get_statistics().await;
    info!("final statistics: {}", serde_json::to_string(&stats)?);

    coordinator.stop().await?;
    Ok(())
}
