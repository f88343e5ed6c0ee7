use crate::{
    chain::{cache::Windows, Network},
    config::{file, Data, Esplora, File},
};
use anyhow::{Context, Result};
use std::time::Duration;
use url::Url;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Low flat rate that still confirms within a few blocks on the public
/// networks.
const DEFAULT_FEE_SAT_PER_VBYTE: u64 = 10;

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub data: Data,
    pub logging: Logging,
    pub chain: Chain,
    pub bot: Bot,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Chain {
    pub network: Network,
    pub esplora: Esplora,
    pub request_timeout: Duration,
    pub windows: Windows,
}

impl Chain {
    pub fn default_from_network(network: Network) -> Self {
        Chain {
            network,
            esplora: Esplora {
                base_url: default_esplora_url(network),
            },
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            windows: Windows::default(),
        }
    }

    fn from_file(chain: file::Chain, network_override: Option<Network>) -> Result<Self> {
        if let Some(network_override) = network_override {
            if network_override != chain.network {
                anyhow::bail!(
                    "CLI argument says network {} but the config file says {}",
                    network_override,
                    chain.network
                );
            }
        }

        let network = chain.network;
        let esplora = chain.esplora.unwrap_or_else(|| Esplora {
            base_url: default_esplora_url(network),
        });
        let request_timeout = chain
            .request_timeout_secs
            .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs);
        let defaults = Windows::default();
        let windows = Windows {
            median_time: chain
                .median_time_window_secs
                .map_or(defaults.median_time, Duration::from_secs),
            address_history: chain
                .address_history_window_secs
                .map_or(defaults.address_history, Duration::from_secs),
        };

        Ok(Chain {
            network,
            esplora,
            request_timeout,
            windows,
        })
    }
}

fn default_esplora_url(network: Network) -> Url {
    let url = match network {
        Network::Mainnet => "https://blockstream.info/api/",
        Network::Testnet => "https://blockstream.info/testnet/api/",
        Network::Regtest => "http://localhost:3000/",
    };

    url.parse().expect("static string to be a valid url")
}

impl From<Chain> for file::Chain {
    fn from(chain: Chain) -> Self {
        file::Chain {
            network: chain.network,
            esplora: Some(chain.esplora),
            request_timeout_secs: Some(chain.request_timeout.as_secs()),
            median_time_window_secs: Some(chain.windows.median_time.as_secs()),
            address_history_window_secs: Some(chain.windows.address_history.as_secs()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bot {
    pub tick_interval: Duration,
    pub fee_sat_per_vbyte: u64,
}

impl Default for Bot {
    fn default() -> Self {
        Bot {
            tick_interval: DEFAULT_TICK_INTERVAL,
            fee_sat_per_vbyte: DEFAULT_FEE_SAT_PER_VBYTE,
        }
    }
}

impl Bot {
    fn from_file(bot: file::Bot) -> Self {
        let defaults = Bot::default();

        Bot {
            tick_interval: bot
                .tick_interval_secs
                .map_or(defaults.tick_interval, Duration::from_secs),
            fee_sat_per_vbyte: bot
                .fee_sat_per_vbyte
                .unwrap_or(defaults.fee_sat_per_vbyte),
        }
    }
}

impl From<Bot> for file::Bot {
    fn from(bot: Bot) -> Self {
        file::Bot {
            tick_interval_secs: Some(bot.tick_interval.as_secs()),
            fee_sat_per_vbyte: Some(bot.fee_sat_per_vbyte),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, derivative::Derivative)]
#[derivative(Default)]
pub struct Logging {
    #[derivative(Default(value = "tracing::Level::INFO"))]
    pub level: tracing::Level,
}

impl From<Settings> for File {
    fn from(settings: Settings) -> Self {
        let Settings {
            data,
            logging: Logging { level },
            chain,
            bot,
        } = settings;

        File {
            data: Some(data),
            logging: Some(file::Logging {
                level: Some(level.into()),
            }),
            chain: Some(chain.into()),
            bot: Some(bot.into()),
        }
    }
}

impl Settings {
    pub fn from_config_file_and_defaults(
        config_file: File,
        network: Option<Network>,
    ) -> Result<Self> {
        let File {
            data,
            logging,
            chain,
            bot,
        } = config_file;

        Ok(Self {
            data: {
                let default_data_dir =
                    crate::fs::data_dir().context("unable to determine default data path")?;
                data.unwrap_or(Data {
                    dir: default_data_dir,
                })
            },
            logging: {
                match logging {
                    None => Logging::default(),
                    Some(file::Logging { level: None }) => Logging::default(),
                    Some(file::Logging { level: Some(level) }) => Logging {
                        level: level.into(),
                    },
                }
            },
            chain: chain.map_or_else(
                || {
                    Ok(Chain::default_from_network(
                        network.unwrap_or_default(),
                    ))
                },
                |file| Chain::from_file(file, network),
            )?,
            bot: bot.map_or_else(Bot::default, Bot::from_file),
        })
    }
}
