//! The per-tick trade state machine.
//!
//! Each tick loads every stored trade and advances each one by at most one
//! state. A transition is persisted before it is published. A failing entry
//! is logged and left as it is; the tick moves on to the next entry.

use crate::{
    chain::{AddressHistory, BroadcastTransaction, LedgerTime, Network, RawTransaction},
    database::Database,
    history::{FinishedTrade, History},
    htlc,
    trade::{TradeEntry, TradeState},
    wallet::Wallet,
};
use anyhow::{Context, Result};
use bitcoin::{Address, Amount, OutPoint, Script, Transaction, Txid};
use futures::{channel::mpsc, SinkExt};
use std::sync::Arc;
use tracing::{error_span, Instrument};

/// Legacy P2SH contract spend with one input and one output.
const HTLC_SPEND_VBYTES: u64 = 300;

#[derive(Debug)]
pub struct TradeBot<C> {
    db: Arc<Database>,
    wallet: Wallet<C>,
    chain: C,
    network: Network,
    fee_rate: u64,
    updates: mpsc::Sender<TradeEntry>,
    history: Option<History>,
}

impl<C> TradeBot<C>
where
    C: AddressHistory + BroadcastTransaction + LedgerTime + Send + Sync,
{
    pub fn new(
        db: Arc<Database>,
        wallet: Wallet<C>,
        chain: C,
        network: Network,
        fee_rate: u64,
        updates: mpsc::Sender<TradeEntry>,
        history: Option<History>,
    ) -> Self {
        TradeBot {
            db,
            wallet,
            chain,
            network,
            fee_rate,
            updates,
            history,
        }
    }

    /// One pass over every stored trade.
    pub async fn tick(&mut self) {
        let entries = match self.db.all() {
            Ok(entries) => entries,
            Err(error) => {
                tracing::error!("could not load the stored trades: {:#}", error);
                return;
            }
        };

        for entry in entries {
            if entry.state.is_terminal() {
                continue;
            }

            let id = entry.id();
            if let Err(error) = self
                .process(entry)
                .instrument(error_span!("trade", %id))
                .await
            {
                tracing::warn!(%id, "trade left unchanged, will retry: {:#}", error);
            }
        }
    }

    async fn process(&mut self, mut entry: TradeEntry) -> Result<()> {
        if entry.network != self.network {
            tracing::warn!(
                "trade belongs to {} but the daemon runs on {}, skipping",
                entry.network,
                self.network
            );
            return Ok(());
        }

        let own_address = entry.own_address();
        let own_raw = self.chain.address_history(&own_address).await?;
        let own_history = parse_history(&own_raw);

        // In-flight transactions only wait for their confirmation.
        match entry.state {
            TradeState::Refunding { txid } => {
                if contains_txid(&own_history, txid) {
                    return self.commit(entry, TradeState::Refunded { txid }).await;
                }
                return Ok(());
            }
            TradeState::Redeeming { txid } => {
                let their_history = parse_history(
                    &self.chain.address_history(&entry.their_address()).await?,
                );
                if contains_txid(&their_history, txid) {
                    return self.commit(entry, TradeState::Redeemed { txid }).await;
                }
                return Ok(());
            }
            _ => {}
        }

        let now = self.chain.ledger_time().await?;
        if now >= entry.own_htlc.expiry {
            if let Some(next) = self
                .expiry_step(&mut entry, &own_address, &own_raw, &own_history)
                .await?
            {
                return self.commit(entry, next).await;
            }
            // No expiry transition applies, either because the secret is
            // already out or because the contract output is not visible
            // yet. The success path below may still move the trade.
        }

        if let Some(next) = self.advance(&mut entry, &own_address, &own_raw, &own_history).await? {
            return self.commit(entry, next).await;
        }

        Ok(())
    }

    /// The expiry branch. Refunds the own contract while its output is
    /// still unspent; a spent output either reveals the secret or ends the
    /// trade. A missing output is final only for a trade that never
    /// broadcast anything.
    async fn expiry_step(
        &self,
        entry: &mut TradeEntry,
        own_address: &Address,
        own_raw: &[RawTransaction],
        own_history: &[Transaction],
    ) -> Result<Option<TradeState>> {
        let output = find_contract_output(own_history, own_address, entry.own_htlc.value);

        match output {
            Some((outpoint, value)) if !outpoint_is_spent(own_history, outpoint) => {
                let refund = htlc::build_refund(
                    &entry.key,
                    &entry.own_htlc,
                    &entry.secret_hash,
                    outpoint,
                    value,
                    &self.wallet.address(),
                    self.contract_spend_fee(),
                )?;
                let txid = self.chain.broadcast_transaction(&refund).await?;
                tracing::info!(%txid, "contract expired, refund broadcast");
                Ok(Some(TradeState::Refunding { txid }))
            }
            Some(_) => {
                let secret = entry.secret().or_else(|| {
                    htlc::extract_secret(own_address, own_raw, &entry.secret_hash)
                });
                match secret {
                    Some(secret) => {
                        if entry.secret().is_none() {
                            entry.learn_secret(secret)?;
                        }
                        match entry.state {
                            TradeState::SecretRevealed => Ok(None),
                            _ => Ok(Some(TradeState::SecretRevealed)),
                        }
                    }
                    None => {
                        tracing::error!(
                            "contract output was spent without revealing the secret and the \
                             expiry has passed, trade failed"
                        );
                        Ok(Some(TradeState::Failed))
                    }
                }
            }
            None => match entry.state {
                TradeState::Created => {
                    tracing::error!(
                        "contract was never funded and its expiry has passed, trade failed"
                    );
                    Ok(Some(TradeState::Failed))
                }
                // An unconfirmed funding broadcast and a reorged-away output
                // look the same from here, and neither can be refunded yet.
                // The entry stays live; the tick that first sees the output
                // again refunds it.
                _ => {
                    tracing::warn!("contract output is not in the history, waiting for it");
                    Ok(None)
                }
            },
        }
    }

    async fn advance(
        &self,
        entry: &mut TradeEntry,
        own_address: &Address,
        own_raw: &[RawTransaction],
        own_history: &[Transaction],
    ) -> Result<Option<TradeState>> {
        match entry.state {
            TradeState::Created => {
                let script = own_address.script_pubkey();
                let funding = self.wallet.build_spend(&script, entry.own_htlc.value).await?;
                let txid = self.wallet.broadcast_spend(&funding).await?;
                tracing::info!(%txid, "own contract funding broadcast");
                Ok(Some(TradeState::Funding { txid }))
            }
            TradeState::Funding { txid } => {
                Ok(contains_txid(own_history, txid).then(|| TradeState::Funded))
            }
            TradeState::Funded => Ok(Some(TradeState::WaitingForCounterpartyLock)),
            TradeState::WaitingForCounterpartyLock => {
                let their_history = parse_history(
                    &self.chain.address_history(&entry.their_address()).await?,
                );
                let locked = find_contract_output(
                    &their_history,
                    &entry.their_address(),
                    entry.their_htlc.value,
                );
                Ok(locked.map(|_| TradeState::CounterpartyLocked))
            }
            TradeState::CounterpartyLocked => match entry.secret() {
                Some(_) => Ok(Some(TradeState::SecretRevealed)),
                None => {
                    match htlc::extract_secret(own_address, own_raw, &entry.secret_hash) {
                        Some(secret) => {
                            entry.learn_secret(secret)?;
                            Ok(Some(TradeState::SecretRevealed))
                        }
                        None => Ok(None),
                    }
                }
            },
            TradeState::SecretRevealed => {
                let secret = entry
                    .secret()
                    .context("no secret on a secret-revealed trade")?;
                let their_address = entry.their_address();
                let their_history =
                    parse_history(&self.chain.address_history(&their_address).await?);
                let (outpoint, value) = match find_contract_output(
                    &their_history,
                    &their_address,
                    entry.their_htlc.value,
                ) {
                    Some(output) => output,
                    None => return Ok(None),
                };
                if outpoint_is_spent(&their_history, outpoint) {
                    tracing::warn!(
                        "counterparty contract output is already spent, cannot claim it"
                    );
                    return Ok(None);
                }

                let claim = htlc::build_claim(
                    &entry.key,
                    &entry.their_htlc,
                    &entry.secret_hash,
                    secret,
                    outpoint,
                    value,
                    &self.wallet.address(),
                    self.contract_spend_fee(),
                )?;
                let txid = self.chain.broadcast_transaction(&claim).await?;
                tracing::info!(%txid, "claim of the counterparty contract broadcast");
                Ok(Some(TradeState::Redeeming { txid }))
            }
            TradeState::Refunding { .. }
            | TradeState::Redeeming { .. }
            | TradeState::Redeemed { .. }
            | TradeState::Refunded { .. }
            | TradeState::Failed => Ok(None),
        }
    }

    /// Persists the transition, publishes it and, for a terminal state,
    /// appends the finished-trade row.
    async fn commit(&mut self, mut entry: TradeEntry, next: TradeState) -> Result<()> {
        let previous = entry.state;
        entry.state = next;
        self.db.update(&entry)?;
        tracing::info!("trade advanced from {} to {}", previous, entry.state);

        if let Err(error) = self.updates.send(entry.clone()).await {
            tracing::warn!("could not publish the trade update: {}", error);
        }

        if entry.state.is_terminal() {
            if let Some(history) = self.history.as_mut() {
                if let Err(error) = history.write(FinishedTrade::from(&entry)) {
                    tracing::error!("could not record the finished trade: {:#}", error);
                }
            }
        }

        Ok(())
    }

    fn contract_spend_fee(&self) -> Amount {
        Amount::from_sat(self.fee_rate * HTLC_SPEND_VBYTES)
    }
}

fn parse_history(history: &[RawTransaction]) -> Vec<Transaction> {
    let mut transactions = Vec::with_capacity(history.len());
    for raw in history {
        match raw.parse() {
            Ok(transaction) => transactions.push(transaction),
            Err(error) => tracing::warn!("skipping undecodable transaction in history: {:#}", error),
        }
    }
    transactions
}

#[allow(clippy::cast_possible_truncation)]
fn find_contract_output(
    transactions: &[Transaction],
    address: &Address,
    minimum: Amount,
) -> Option<(OutPoint, Amount)> {
    let script: Script = address.script_pubkey();

    transactions.iter().find_map(|transaction| {
        let txid = transaction.txid();
        transaction
            .output
            .iter()
            .enumerate()
            .find_map(|(vout, output)| {
                if output.script_pubkey == script && output.value >= minimum.as_sat() {
                    Some((
                        OutPoint {
                            txid,
                            vout: vout as u32,
                        },
                        Amount::from_sat(output.value),
                    ))
                } else {
                    None
                }
            })
    })
}

fn outpoint_is_spent(transactions: &[Transaction], outpoint: OutPoint) -> bool {
    transactions
        .iter()
        .flat_map(|transaction| transaction.input.iter())
        .any(|input| input.previous_output == outpoint)
}

fn contains_txid(transactions: &[Transaction], txid: Txid) -> bool {
    transactions.iter().any(|transaction| transaction.txid() == txid)
}
