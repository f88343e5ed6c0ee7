#![warn(unused_extern_crates, missing_debug_implementations, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use swapd::{
    chain::{Cache, EsploraConnector},
    command::{self, Command, Options},
    config::{read_config, Settings},
    fs::default_config_path,
    trace,
    wallet::Wallet,
    Seed,
};

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::from_args();

    let file = read_config(&options.config_file, default_config_path)?;
    let settings = Settings::from_config_file_and_defaults(file, options.network)
        .context("could not initialize configuration")?;

    if let Command::DumpConfig = options.cmd {
        command::dump_config(settings).expect("dump config");
        std::process::exit(0);
    }

    trace::init_tracing(settings.logging.level).expect("initialize tracing");

    let seed = Seed::from_file_or_generate(&settings.data.dir)
        .expect("Could not retrieve/initialize seed");

    match options.cmd {
        Command::Trade => command::trade(&seed, settings).await.expect("Start trading"),
        Command::WalletInfo => {
            let wallet = chain_wallet(&seed, &settings).expect("could not initialise wallet");
            println!("{}", command::wallet_info(&wallet));
        }
        Command::Balance => {
            let wallet = chain_wallet(&seed, &settings).expect("could not initialise wallet");
            let balance = command::balance(&wallet).await.expect("get wallet balance");
            println!("{}", balance);
        }
        Command::DumpConfig => unreachable!(),
    };

    Ok(())
}

fn chain_wallet(seed: &Seed, settings: &Settings) -> Result<Wallet<Cache<EsploraConnector>>> {
    let connector = EsploraConnector::new(
        settings.chain.esplora.base_url.clone(),
        settings.chain.request_timeout,
    )?;
    let cache = Cache::new(connector, settings.chain.windows);

    Wallet::new(
        *seed,
        settings.chain.network,
        cache,
        settings.bot.fee_sat_per_vbyte,
        settings.chain.windows.address_history,
    )
}
