use std::path::PathBuf;
use structopt::StructOpt;

mod balance;
mod trade;
mod wallet_info;

use crate::{
    chain::Network,
    config::{File, Settings},
};

pub use balance::balance;
pub use trade::trade;
pub use wallet_info::wallet_info;

#[derive(StructOpt, Debug)]
pub struct Options {
    /// Path to configuration file
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    pub config_file: Option<PathBuf>,

    /// Which network to connect to
    #[structopt(short = "n", long = "network")]
    pub network: Option<Network>,

    /// Commands available
    #[structopt(subcommand)]
    pub cmd: Command,
}

impl Options {
    pub fn from_args() -> Self {
        StructOpt::from_args()
    }
}

#[derive(StructOpt, Debug, Clone)]
pub enum Command {
    /// Process the stored trades until the daemon is stopped
    Trade,
    /// Print the wallet address for funding and backup purposes
    WalletInfo,
    /// Print the current wallet balance
    Balance,
    /// Dump the current configuration
    DumpConfig,
}

pub fn dump_config(settings: Settings) -> anyhow::Result<()> {
    let file = File::from(settings);
    let serialized = toml::to_string(&file)?;
    println!("{}", serialized);
    Ok(())
}
