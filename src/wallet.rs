//! Single-key P2WPKH wallet recovered from the address-history view of the
//! chain.
//!
//! Unspent outputs are whatever the history pays to the wallet script and
//! does not spend again, minus outpoints committed by broadcasts of this
//! session. Building a spend commits nothing; only broadcasting does.

use crate::{
    chain::{AddressHistory, BroadcastTransaction, Network},
    seed::Seed,
};
use anyhow::{Context, Result};
use bitcoin::{
    hashes::{hash160, Hash},
    secp256k1::{self, Message, Secp256k1, SecretKey},
    util::bip143,
    Address, Amount, OutPoint, PubkeyHash, Script, SigHashType, Transaction, TxIn, TxOut, Txid,
};
use std::{
    collections::HashSet,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

// Worst-case vbyte shapes of a P2WPKH spend, good enough for a
// fixed-rate wallet.
const BASE_VBYTES: u64 = 11;
const INPUT_VBYTES: u64 = 68;
const OUTPUT_VBYTES: u64 = 31;

/// Change below this is folded into the fee instead of paid back.
const DUST_SATS: u64 = 546;

#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("insufficient funds: needed {needed} but only {available} available")]
pub struct InsufficientFunds {
    pub needed: Amount,
    pub available: Amount,
}

#[derive(Debug)]
pub struct Wallet<C> {
    pub connector: C,
    key: SecretKey,
    public_key: bitcoin::PublicKey,
    address: Address,
    fee_rate: u64,
    balance_window: Duration,
    balance: Mutex<Option<(Amount, Instant)>>,
    committed_outpoints: Mutex<HashSet<OutPoint>>,
}

#[derive(Clone, Copy, Debug)]
struct Utxo {
    outpoint: OutPoint,
    value: Amount,
}

impl<C> Wallet<C> {
    pub fn new(
        seed: Seed,
        network: Network,
        connector: C,
        fee_rate: u64,
        balance_window: Duration,
    ) -> Result<Self> {
        let key = SecretKey::from_slice(&seed.sha256_with_seed(&[b"WALLET"]))
            .context("failed to derive the wallet key from the seed")?;
        let secp = Secp256k1::signing_only();
        let public_key = bitcoin::PublicKey {
            compressed: true,
            key: secp256k1::PublicKey::from_secret_key(&secp, &key),
        };
        let address = Address::p2wpkh(&public_key, network.as_bitcoin())
            .context("failed to derive the wallet address")?;

        Ok(Wallet {
            connector,
            key,
            public_key,
            address,
            fee_rate,
            balance_window,
            balance: Mutex::new(None),
            committed_outpoints: Mutex::new(HashSet::new()),
        })
    }

    /// Where to send funds so this wallet can spend them.
    pub fn address(&self) -> Address {
        self.address.clone()
    }

    fn script_pubkey(&self) -> Script {
        self.address.script_pubkey()
    }

    fn pubkey_hash(&self) -> PubkeyHash {
        let digest = hash160::Hash::hash(&self.public_key.to_bytes());
        PubkeyHash::from_slice(&digest.into_inner()).expect("hash160 digest is pubkey hash sized")
    }

    fn estimate_fee(&self, inputs: usize, outputs: usize) -> Amount {
        let vbytes = BASE_VBYTES + INPUT_VBYTES * inputs as u64 + OUTPUT_VBYTES * outputs as u64;
        Amount::from_sat(self.fee_rate * vbytes)
    }
}

impl<C> Wallet<C>
where
    C: AddressHistory + Send + Sync,
{
    pub async fn balance(&self) -> Result<Amount> {
        let mut slot = self.balance.lock().await;

        if let Some((cached, fetched_at)) = *slot {
            if fetched_at.elapsed() < self.balance_window {
                return Ok(cached);
            }
        }

        let total = self
            .unspent_outputs()
            .await?
            .iter()
            .map(|utxo| utxo.value.as_sat())
            .sum();
        let balance = Amount::from_sat(total);
        *slot = Some((balance, Instant::now()));

        Ok(balance)
    }

    /// Builds and signs a spend of `amount` to `recipient` without
    /// committing anything. Unchanged wallet state yields the same
    /// transaction again.
    pub async fn build_spend(&self, recipient: &Script, amount: Amount) -> Result<Transaction> {
        let mut utxos = self.unspent_outputs().await?;
        utxos.sort_by(|a, b| {
            b.value
                .cmp(&a.value)
                .then_with(|| a.outpoint.cmp(&b.outpoint))
        });
        let available = Amount::from_sat(utxos.iter().map(|utxo| utxo.value.as_sat()).sum());

        let mut candidates = utxos.into_iter();
        let mut selected: Vec<Utxo> = Vec::new();
        let mut total = Amount::from_sat(0);
        let fee = loop {
            let fee = self.estimate_fee(selected.len().max(1), 2);
            if total >= amount + fee {
                break fee;
            }
            match candidates.next() {
                Some(utxo) => {
                    total = total + utxo.value;
                    selected.push(utxo);
                }
                None => {
                    return Err(InsufficientFunds {
                        needed: amount + fee,
                        available,
                    }
                    .into())
                }
            }
        };

        let mut outputs = vec![TxOut {
            value: amount.as_sat(),
            script_pubkey: recipient.clone(),
        }];
        let change = total - amount - fee;
        if change.as_sat() >= DUST_SATS {
            outputs.push(TxOut {
                value: change.as_sat(),
                script_pubkey: self.script_pubkey(),
            });
        }

        let mut transaction = Transaction {
            version: 2,
            lock_time: 0,
            input: selected
                .iter()
                .map(|utxo| TxIn {
                    previous_output: utxo.outpoint,
                    script_sig: Script::new(),
                    sequence: 0xFFFF_FFFF,
                    witness: Vec::new(),
                })
                .collect(),
            output: outputs,
        };

        let script_code = Script::new_p2pkh(&self.pubkey_hash());
        let secp = Secp256k1::signing_only();
        let mut sighashes = Vec::with_capacity(selected.len());
        {
            let mut cache = bip143::SigHashCache::new(&transaction);
            for (index, utxo) in selected.iter().enumerate() {
                sighashes.push(cache.signature_hash(
                    index,
                    &script_code,
                    utxo.value.as_sat(),
                    SigHashType::All,
                ));
            }
        }
        for (index, sighash) in sighashes.into_iter().enumerate() {
            let signature = secp.sign(&Message::from_slice(&sighash[..])?, &self.key);
            let mut signature_bytes = signature.serialize_der().to_vec();
            #[allow(clippy::cast_possible_truncation)]
            signature_bytes.push(SigHashType::All.as_u32() as u8);
            transaction.input[index].witness = vec![signature_bytes, self.public_key.to_bytes()];
        }

        Ok(transaction)
    }

    async fn unspent_outputs(&self) -> Result<Vec<Utxo>> {
        let history = self.connector.address_history(&self.address).await?;

        let mut transactions = Vec::with_capacity(history.len());
        for raw in &history {
            match raw.parse() {
                Ok(transaction) => transactions.push(transaction),
                Err(error) => {
                    tracing::warn!("skipping undecodable transaction in wallet history: {:#}", error)
                }
            }
        }

        let spent: HashSet<OutPoint> = transactions
            .iter()
            .flat_map(|transaction| transaction.input.iter().map(|input| input.previous_output))
            .collect();
        let committed = self.committed_outpoints.lock().await;

        let script = self.script_pubkey();
        let mut utxos = Vec::new();
        for transaction in &transactions {
            let txid = transaction.txid();
            for (vout, output) in transaction.output.iter().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                let outpoint = OutPoint {
                    txid,
                    vout: vout as u32,
                };
                if output.script_pubkey == script
                    && !spent.contains(&outpoint)
                    && !committed.contains(&outpoint)
                {
                    utxos.push(Utxo {
                        outpoint,
                        value: Amount::from_sat(output.value),
                    });
                }
            }
        }

        Ok(utxos)
    }
}

impl<C> Wallet<C>
where
    C: AddressHistory + BroadcastTransaction + Send + Sync,
{
    /// Broadcasts a previously built spend, committing its inputs so no
    /// later build selects them again.
    pub async fn broadcast_spend(&self, transaction: &Transaction) -> Result<Txid> {
        let txid = self.connector.broadcast_transaction(transaction).await?;

        {
            let mut committed = self.committed_outpoints.lock().await;
            for input in &transaction.input {
                committed.insert(input.previous_output);
            }
        }
        // A just-spent output must never show up in a served balance again.
        *self.balance.lock().await = None;

        Ok(txid)
    }
}
