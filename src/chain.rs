pub mod cache;
pub mod connector;

pub use cache::Cache;
pub use connector::EsploraConnector;

use crate::timestamp::Timestamp;
use anyhow::Result;
use async_trait::async_trait;
use bitcoin::{consensus, Address, BlockHash, Transaction, Txid};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// The foreign chain a daemon instance trades against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_bitcoin(self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::Mainnet
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => anyhow::bail!("expected mainnet, testnet or regtest, got '{}'", other),
        }
    }
}

impl Serialize for Network {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> de::Visitor<'de> for Visitor {
            type Value = Network;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("mainnet, testnet or regtest")
            }

            fn visit_str<E>(self, v: &str) -> Result<Network, E>
            where
                E: de::Error,
            {
                v.parse().map_err(|_| {
                    de::Error::invalid_value(de::Unexpected::Str(v), &"mainnet, testnet or regtest")
                })
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

/// A transaction as the chain source hands it out: consensus bytes, not yet
/// parsed. Malformed entries are detected (and skipped) at the point of use.
#[derive(Clone, PartialEq, Eq)]
pub struct RawTransaction(Vec<u8>);

impl RawTransaction {
    pub fn new(bytes: Vec<u8>) -> Self {
        RawTransaction(bytes)
    }

    pub fn parse(&self) -> Result<Transaction, consensus::encode::Error> {
        consensus::deserialize(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&Transaction> for RawTransaction {
    fn from(transaction: &Transaction) -> Self {
        RawTransaction(consensus::serialize(transaction))
    }
}

impl fmt::Debug for RawTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawTransaction({} bytes)", self.0.len())
    }
}

/// A chain header reduced to the two fields median-time computation needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub hash: BlockHash,
    pub time: u32,
    /// Absent only for the genesis block.
    pub previous: Option<BlockHash>,
}

#[async_trait]
pub trait ChainTip {
    async fn chain_tip(&self) -> Result<BlockHash>;
}

#[async_trait]
pub trait BlockHeaderByHash {
    async fn block_header_by_hash(&self, hash: BlockHash) -> Result<BlockHeader>;
}

#[async_trait]
pub trait AddressHistory {
    /// All mined transactions touching `address`, as raw consensus bytes.
    ///
    /// An address nothing ever paid yields `Ok` with an empty vec; a failure
    /// to reach or decode the chain source is an `Err`.
    async fn address_history(&self, address: &Address) -> Result<Vec<RawTransaction>>;
}

#[async_trait]
pub trait BroadcastTransaction {
    async fn broadcast_transaction(&self, transaction: &Transaction) -> Result<Txid>;
}

#[async_trait]
pub trait LedgerTime {
    /// The chain's notion of "now", the clock lock times are enforced against.
    async fn ledger_time(&self) -> Result<Timestamp>;
}
