use crate::{
    bot::TradeBot,
    bridge::{Bridge, ShadowStates},
    chain::{Cache, EsploraConnector},
    config::Settings,
    database::Database,
    history::History,
    seed::Seed,
    wallet::Wallet,
};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Runs the daemon: wires the chain client, the wallet, the store and the
/// bridge together, then drives the state machine at the configured tick
/// interval until the process is stopped.
pub async fn trade(seed: &Seed, settings: Settings) -> Result<()> {
    let connector = EsploraConnector::new(
        settings.chain.esplora.base_url.clone(),
        settings.chain.request_timeout,
    )?;
    connector
        .validate_network(settings.chain.network)
        .await
        .context("could not validate the chain source")?;

    let cache = Cache::new(connector, settings.chain.windows);

    let wallet = Wallet::new(
        *seed,
        settings.chain.network,
        cache.clone(),
        settings.bot.fee_sat_per_vbyte,
        settings.chain.windows.address_history,
    )?;
    tracing::info!("wallet address: {}", wallet.address());

    #[cfg(not(test))]
    let db = Arc::new(Database::new(&settings.data.dir.join("database"))?);
    #[cfg(test)]
    let db = Arc::new(Database::new_test()?);

    let bridge = Arc::new(Bridge::new(db.clone(), ShadowStates::new()));
    bridge
        .seed()
        .await
        .context("could not seed the bridge from the store")?;

    let (updates, update_receiver) = Bridge::channel();
    tokio::spawn(bridge.clone().run(update_receiver));
    spawn_logging_subscriber(&bridge).await?;

    let history = History::new(settings.data.dir.join("history.csv").as_path())?;

    let mut bot = TradeBot::new(
        db,
        wallet,
        cache,
        settings.chain.network,
        settings.bot.fee_sat_per_vbyte,
        updates,
        Some(history),
    );

    let mut interval = tokio::time::interval(settings.bot.tick_interval);
    loop {
        interval.tick().await;
        bot.tick().await;
    }
}

/// Attaches a subscriber that logs every published state change.
async fn spawn_logging_subscriber(bridge: &Bridge) -> Result<()> {
    let mut subscription = bridge
        .subscribe()
        .await
        .context("could not subscribe to trade updates")?;

    tokio::spawn(async move {
        while let Some(batch) = subscription.next_batch().await {
            for record in batch {
                tracing::info!(id = %record.id, state = %record.state, "trade update");
            }
        }
    });

    Ok(())
}
