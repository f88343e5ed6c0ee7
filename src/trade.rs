//! Domain model of a single cross-chain trade.
//!
//! Both hash-locked contracts live on the foreign chain: each party funds
//! one P2SH that pays the counterparty on preimage reveal and refunds its
//! funder after an absolute expiry. The native leg is settled out of band
//! and only its terms are carried here.

use crate::{
    chain::Network,
    secret::{Secret, SecretHash},
    timestamp::Timestamp,
};
use anyhow::Result;
use bitcoin::{
    secp256k1::{self, Secp256k1, SecretKey},
    Address, Amount, PubkeyHash, Txid,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The per-trade key pair.
///
/// The secret key is the store key and the signing capability for both
/// contract spend paths. It never crosses the process boundary; [`TradeId`]
/// is the outward name of a trade.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TradeKey(SecretKey);

impl TradeKey {
    pub fn random() -> Result<TradeKey, rand::Error> {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; 32];
            rng.try_fill(&mut bytes[..])?;

            // Out-of-range scalars are astronomically unlikely, retry.
            if let Ok(key) = SecretKey::from_slice(&bytes) {
                return Ok(TradeKey(key));
            }
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Result<TradeKey, secp256k1::Error> {
        Ok(TradeKey(SecretKey::from_slice(&bytes)?))
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.0[..]);
        bytes
    }

    pub fn secret_key(&self) -> SecretKey {
        self.0
    }

    pub fn public_key(&self) -> bitcoin::PublicKey {
        let secp = Secp256k1::signing_only();
        bitcoin::PublicKey {
            compressed: true,
            key: secp256k1::PublicKey::from_secret_key(&secp, &self.0),
        }
    }

    pub fn id(&self) -> TradeId {
        TradeId(self.public_key().to_string())
    }
}

impl fmt::Debug for TradeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TradeKey([*****])")
    }
}

/// Outward identifier of a trade, the hex encoding of its public key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(String);

impl TradeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which side of the trade this daemon plays.
///
/// The initiator invented the secret and carries it from the start. The
/// responder learns it from the transaction that claims its own contract;
/// that slot is write-once.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Role {
    Initiator { secret: Secret },
    Responder { secret: Option<Secret> },
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Initiator { .. } => "INITIATOR",
            Role::Responder { .. } => "RESPONDER",
        }
    }

    pub fn secret(&self) -> Option<Secret> {
        match self {
            Role::Initiator { secret } => Some(*secret),
            Role::Responder { secret } => *secret,
        }
    }
}

/// Lifecycle of a trade entry.
///
/// Variants that put a transaction on the wire carry its txid.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TradeState {
    Created,
    Funding { txid: Txid },
    Funded,
    WaitingForCounterpartyLock,
    CounterpartyLocked,
    SecretRevealed,
    Redeeming { txid: Txid },
    Redeemed { txid: Txid },
    Refunding { txid: Txid },
    Refunded { txid: Txid },
    Failed,
}

impl TradeState {
    pub fn name(&self) -> &'static str {
        match self {
            TradeState::Created => "CREATED",
            TradeState::Funding { .. } => "FUNDING",
            TradeState::Funded => "FUNDED",
            TradeState::WaitingForCounterpartyLock => "WAITING_FOR_COUNTERPARTY_LOCK",
            TradeState::CounterpartyLocked => "COUNTERPARTY_LOCKED",
            TradeState::SecretRevealed => "SECRET_REVEALED",
            TradeState::Redeeming { .. } => "REDEEMING",
            TradeState::Redeemed { .. } => "REDEEMED",
            TradeState::Refunding { .. } => "REFUNDING",
            TradeState::Refunded { .. } => "REFUNDED",
            TradeState::Failed => "FAILED",
        }
    }

    /// Terminal states are never left, not even for a refund.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeState::Redeemed { .. } | TradeState::Refunded { .. } | TradeState::Failed
        )
    }

    pub fn txid(&self) -> Option<Txid> {
        match self {
            TradeState::Funding { txid }
            | TradeState::Redeeming { txid }
            | TradeState::Redeemed { txid }
            | TradeState::Refunding { txid }
            | TradeState::Refunded { txid } => Some(*txid),
            _ => None,
        }
    }
}

impl fmt::Display for TradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Terms of one hash-locked contract on the foreign chain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HtlcParams {
    pub value: Amount,
    pub redeem_pubkey_hash: PubkeyHash,
    pub refund_pubkey_hash: PubkeyHash,
    pub expiry: Timestamp,
}

/// Terms of the native leg, carried for bookkeeping and display only.
#[derive(Clone, Debug, PartialEq)]
pub struct NativeTerms {
    pub address: String,
    pub amount: u64,
    pub lock_time: Timestamp,
}

/// One trade as persisted in the store.
#[derive(Clone, Debug, PartialEq)]
pub struct TradeEntry {
    pub key: TradeKey,
    pub network: Network,
    pub role: Role,
    pub state: TradeState,
    pub secret_hash: SecretHash,
    pub own_htlc: HtlcParams,
    pub their_htlc: HtlcParams,
    pub native: NativeTerms,
    pub created_at: Timestamp,
}

impl TradeEntry {
    pub fn id(&self) -> TradeId {
        self.key.id()
    }

    /// Address of the contract this daemon funds and may refund.
    pub fn own_address(&self) -> Address {
        crate::htlc::address(&self.own_htlc, &self.secret_hash, self.network)
    }

    /// Address of the contract the counterparty funds and this daemon claims.
    pub fn their_address(&self) -> Address {
        crate::htlc::address(&self.their_htlc, &self.secret_hash, self.network)
    }

    pub fn secret(&self) -> Option<Secret> {
        self.role.secret()
    }

    /// Stores an extracted secret on a responder entry, exactly once.
    pub fn learn_secret(&mut self, secret: Secret) -> Result<()> {
        match &mut self.role {
            Role::Initiator { .. } => {
                anyhow::bail!("the initiator holds the secret from the start")
            }
            Role::Responder {
                secret: Some(existing),
            } => {
                anyhow::ensure!(
                    *existing == secret,
                    "refusing to replace an already learnt secret"
                );
                Ok(())
            }
            Role::Responder { secret: slot } => {
                *slot = Some(secret);
                Ok(())
            }
        }
    }
}


#[cfg(test)]
impl crate::StaticStub for TradeEntry {
    fn static_stub() -> Self {
        use std::str::FromStr;

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(
            &hex::decode("01010101010101000102030405060708ffff0000ffff00006363636363636363")
                .unwrap(),
        );
        let key = TradeKey::from_bytes(key_bytes).unwrap();

        let secret = Secret::from(*b"hello world, you are beautiful!!");
        let redeem_pubkey_hash =
            PubkeyHash::from_str("c021f17be99c6adfbcba5d38ee0d292c0399d2f5").unwrap();
        let refund_pubkey_hash =
            PubkeyHash::from_str("d38ee0d292c0399d2f5c021f17be99c6adfbcba5").unwrap();

        TradeEntry {
            key,
            network: Network::Regtest,
            role: Role::Initiator { secret },
            state: TradeState::Created,
            secret_hash: SecretHash::new(secret),
            own_htlc: HtlcParams {
                value: Amount::from_sat(123_456),
                redeem_pubkey_hash,
                refund_pubkey_hash,
                expiry: Timestamp::from(1_600_000_000),
            },
            their_htlc: HtlcParams {
                value: Amount::from_sat(654_321),
                redeem_pubkey_hash: refund_pubkey_hash,
                refund_pubkey_hash: redeem_pubkey_hash,
                expiry: Timestamp::from(1_600_050_000),
            },
            native: NativeTerms {
                address: "NATIVE8160Ado3xCmrKkBp6e7jnK7Gkfsfp".to_string(),
                amount: 80_808,
                lock_time: Timestamp::from(1_599_990_000),
            },
            created_at: Timestamp::from(1_599_980_000),
        }
    }
}
