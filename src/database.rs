//! Persistent trade entry store.
//!
//! One sled tree, keyed by the raw 32 bytes of the trade secret key. Values
//! go through explicit mirror structs so the on-disk encoding stays stable
//! regardless of what the in-memory types do.

use crate::{
    chain::Network,
    secret::Secret,
    timestamp::Timestamp,
    trade::{HtlcParams, NativeTerms, Role, TradeEntry, TradeKey, TradeState},
};
use anyhow::{anyhow, Context, Result};
use bitcoin::{Amount, PubkeyHash, Txid};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug)]
pub struct Database {
    db: sled::Db,
    #[cfg(test)]
    tmp_dir: tempfile::TempDir,
}

impl Database {
    #[cfg(not(test))]
    pub fn new(path: &std::path::Path) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("the path is not valid utf-8: {:?}", path))?;
        let db =
            sled::open(path).with_context(|| format!("could not open the store at {}", path_str))?;

        Ok(Database { db })
    }

    #[cfg(test)]
    pub fn new_test() -> Result<Self> {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let db = sled::open(tmp_dir.path())
            .with_context(|| format!("could not open the store at {}", tmp_dir.path().display()))?;

        Ok(Database { db, tmp_dir })
    }

    /// Stores a new trade. A trade under the same key is an error.
    pub fn insert(&self, entry: &TradeEntry) -> Result<()> {
        let key = entry.key.as_bytes().to_vec();
        let new_value =
            serialize(&StoredTrade::from(entry)).context("could not serialize new trade value")?;

        self.db
            .compare_and_swap(key, Option::<Vec<u8>>::None, Some(new_value))
            .context("could not write to the store")?
            .with_context(|| format!("trade {} is already stored", entry.id()))?;

        self.flush()
    }

    /// Replaces an existing trade, guarded against concurrent writers and
    /// against erasing a learnt secret.
    pub fn update(&self, entry: &TradeEntry) -> Result<()> {
        let key = entry.key.as_bytes();
        let current = self
            .db
            .get(key)?
            .ok_or_else(|| anyhow!("trade {} is not stored", entry.id()))?;

        let stored =
            deserialize::<StoredTrade>(&current).context("could not deserialize stored trade")?;
        let new = StoredTrade::from(entry);
        if let (
            StoredRole::Responder {
                secret: Some(existing),
            },
            StoredRole::Responder { secret: new_secret },
        ) = (&stored.role, &new.role)
        {
            match new_secret {
                Some(new_secret) if new_secret == existing => {}
                _ => anyhow::bail!(
                    "refusing to clear or alter the learnt secret of trade {}",
                    entry.id()
                ),
            }
        }

        let new_value = serialize(&new).context("could not serialize new trade value")?;
        self.db
            .compare_and_swap(key, Some(current), Some(new_value))
            .context("could not write to the store")?
            .with_context(|| format!("trade {} changed concurrently, aborting update", entry.id()))?;

        self.flush()
    }

    pub fn get(&self, key: TradeKey) -> Result<Option<TradeEntry>> {
        let value = match self.db.get(key.as_bytes())? {
            Some(value) => value,
            None => return Ok(None),
        };

        let stored =
            deserialize::<StoredTrade>(&value).context("could not deserialize stored trade")?;

        Ok(Some(stored.into_entry(key)?))
    }

    /// Every stored trade. Any undecodable item is a store fault, not a
    /// skipped row.
    pub fn all(&self) -> Result<Vec<TradeEntry>> {
        self.db
            .iter()
            .map(|item| {
                let (key, value) = item.context("could not read from the store")?;

                let mut key_bytes = [0u8; 32];
                anyhow::ensure!(
                    key.len() == key_bytes.len(),
                    "store contains a key that is not a trade key"
                );
                key_bytes.copy_from_slice(&key);
                let key = TradeKey::from_bytes(key_bytes)
                    .context("store contains a key that is not a trade key")?;

                let stored = deserialize::<StoredTrade>(&value)
                    .context("could not deserialize stored trade")?;
                stored.into_entry(key)
            })
            .collect()
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map(|_| ()).context("could not flush the store")
    }
}

fn serialize<T>(t: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    Ok(serde_cbor::to_vec(t)?)
}

fn deserialize<'a, T>(v: &'a [u8]) -> Result<T>
where
    T: Deserialize<'a>,
{
    Ok(serde_cbor::from_slice(v)?)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTrade {
    network: Network,
    role: StoredRole,
    state: StoredState,
    secret_hash: String,
    own_htlc: StoredHtlc,
    their_htlc: StoredHtlc,
    native: StoredNative,
    created_at: Timestamp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum StoredRole {
    Initiator { secret: String },
    Responder { secret: Option<String> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum StoredState {
    Created,
    Funding { txid: String },
    Funded,
    WaitingForCounterpartyLock,
    CounterpartyLocked,
    SecretRevealed,
    Redeeming { txid: String },
    Redeemed { txid: String },
    Refunding { txid: String },
    Refunded { txid: String },
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredHtlc {
    value: u64,
    redeem_pubkey_hash: String,
    refund_pubkey_hash: String,
    expiry: Timestamp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredNative {
    address: String,
    amount: u64,
    lock_time: Timestamp,
}

impl From<&TradeEntry> for StoredTrade {
    fn from(entry: &TradeEntry) -> Self {
        StoredTrade {
            network: entry.network,
            role: match &entry.role {
                Role::Initiator { secret } => StoredRole::Initiator {
                    secret: hex::encode(secret.as_raw()),
                },
                Role::Responder { secret } => StoredRole::Responder {
                    secret: secret.map(|secret| hex::encode(secret.as_raw())),
                },
            },
            state: StoredState::from(entry.state),
            secret_hash: entry.secret_hash.to_string(),
            own_htlc: StoredHtlc::from(entry.own_htlc),
            their_htlc: StoredHtlc::from(entry.their_htlc),
            native: StoredNative {
                address: entry.native.address.clone(),
                amount: entry.native.amount,
                lock_time: entry.native.lock_time,
            },
            created_at: entry.created_at,
        }
    }
}

impl StoredTrade {
    fn into_entry(self, key: TradeKey) -> Result<TradeEntry> {
        Ok(TradeEntry {
            key,
            network: self.network,
            role: match self.role {
                StoredRole::Initiator { secret } => Role::Initiator {
                    secret: Secret::from_str(&secret)?,
                },
                StoredRole::Responder { secret } => Role::Responder {
                    secret: secret.as_deref().map(Secret::from_str).transpose()?,
                },
            },
            state: self.state.into_state()?,
            secret_hash: self.secret_hash.parse()?,
            own_htlc: self.own_htlc.into_params()?,
            their_htlc: self.their_htlc.into_params()?,
            native: NativeTerms {
                address: self.native.address,
                amount: self.native.amount,
                lock_time: self.native.lock_time,
            },
            created_at: self.created_at,
        })
    }
}

impl From<TradeState> for StoredState {
    fn from(state: TradeState) -> Self {
        match state {
            TradeState::Created => StoredState::Created,
            TradeState::Funding { txid } => StoredState::Funding {
                txid: txid.to_string(),
            },
            TradeState::Funded => StoredState::Funded,
            TradeState::WaitingForCounterpartyLock => StoredState::WaitingForCounterpartyLock,
            TradeState::CounterpartyLocked => StoredState::CounterpartyLocked,
            TradeState::SecretRevealed => StoredState::SecretRevealed,
            TradeState::Redeeming { txid } => StoredState::Redeeming {
                txid: txid.to_string(),
            },
            TradeState::Redeemed { txid } => StoredState::Redeemed {
                txid: txid.to_string(),
            },
            TradeState::Refunding { txid } => StoredState::Refunding {
                txid: txid.to_string(),
            },
            TradeState::Refunded { txid } => StoredState::Refunded {
                txid: txid.to_string(),
            },
            TradeState::Failed => StoredState::Failed,
        }
    }
}

impl StoredState {
    fn into_state(self) -> Result<TradeState> {
        let parse = |txid: String| -> Result<Txid> {
            txid.parse().context("could not parse stored txid")
        };

        Ok(match self {
            StoredState::Created => TradeState::Created,
            StoredState::Funding { txid } => TradeState::Funding { txid: parse(txid)? },
            StoredState::Funded => TradeState::Funded,
            StoredState::WaitingForCounterpartyLock => TradeState::WaitingForCounterpartyLock,
            StoredState::CounterpartyLocked => TradeState::CounterpartyLocked,
            StoredState::SecretRevealed => TradeState::SecretRevealed,
            StoredState::Redeeming { txid } => TradeState::Redeeming { txid: parse(txid)? },
            StoredState::Redeemed { txid } => TradeState::Redeemed { txid: parse(txid)? },
            StoredState::Refunding { txid } => TradeState::Refunding { txid: parse(txid)? },
            StoredState::Refunded { txid } => TradeState::Refunded { txid: parse(txid)? },
            StoredState::Failed => TradeState::Failed,
        })
    }
}

impl From<HtlcParams> for StoredHtlc {
    fn from(params: HtlcParams) -> Self {
        StoredHtlc {
            value: params.value.as_sat(),
            redeem_pubkey_hash: params.redeem_pubkey_hash.to_string(),
            refund_pubkey_hash: params.refund_pubkey_hash.to_string(),
            expiry: params.expiry,
        }
    }
}

impl StoredHtlc {
    fn into_params(self) -> Result<HtlcParams> {
        Ok(HtlcParams {
            value: Amount::from_sat(self.value),
            redeem_pubkey_hash: PubkeyHash::from_str(&self.redeem_pubkey_hash)
                .context("could not parse stored pubkey hash")?,
            refund_pubkey_hash: PubkeyHash::from_str(&self.refund_pubkey_hash)
                .context("could not parse stored pubkey hash")?,
            expiry: self.expiry,
        })
    }
}
