use anyhow::Result;
use tracing::{info, subscriber, Level};
use tracing_subscriber::FmtSubscriber;

pub fn init_tracing(level: Level) -> Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();

    subscriber::set_global_default(subscriber)?;
    info!("Initialized tracing with level: {}", level);

    Ok(())
}
