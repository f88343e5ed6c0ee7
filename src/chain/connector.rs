use crate::chain::{
    AddressHistory, BlockHeader, BlockHeaderByHash, BroadcastTransaction, ChainTip, Network,
    RawTransaction,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bitcoin::{consensus, Address, BlockHash, Transaction, Txid};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Connector against an Esplora-compatible HTTP index (blockstream.info or a
/// local electrs).
///
/// History lookups return the first page of confirmed transactions only,
/// which covers the handful of transactions a trade contract ever sees.
#[derive(Debug, Clone)]
pub struct EsploraConnector {
    base_url: Url,
    client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
#[error("GET request to {0} failed")]
pub struct GetRequestFailed(Url);

#[derive(Debug, thiserror::Error)]
#[error("POST request to {0} failed")]
pub struct PostRequestFailed(Url);

#[derive(Debug, thiserror::Error)]
#[error("{url} responded with status {status}: {body}")]
pub struct UnexpectedStatus {
    url: Url,
    status: reqwest::StatusCode,
    body: String,
}

#[derive(Debug, thiserror::Error)]
#[error("chain source genesis {actual} does not belong to the configured network {configured}")]
pub struct NetworkMismatch {
    configured: Network,
    actual: BlockHash,
}

impl EsploraConnector {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        // Url::join treats the last path segment as a file unless it ends in
        // a slash.
        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;

        Ok(EsploraConnector { base_url, client })
    }

    /// Fail early if the index serves a different chain than the one this
    /// daemon is configured for.
    pub async fn validate_network(&self, configured: Network) -> Result<()> {
        let actual = self.genesis_hash().await?;
        let expected =
            bitcoin::blockdata::constants::genesis_block(configured.as_bitcoin()).block_hash();

        if actual != expected {
            return Err(NetworkMismatch { configured, actual }.into());
        }

        Ok(())
    }

    pub async fn genesis_hash(&self) -> Result<BlockHash> {
        let body = self.get_text(self.genesis_url()?).await?;
        body.trim()
            .parse()
            .context("genesis response is not a block hash")
    }

    fn tip_hash_url(&self) -> Result<Url> {
        Ok(self.base_url.join("blocks/tip/hash")?)
    }

    fn genesis_url(&self) -> Result<Url> {
        Ok(self.base_url.join("block-height/0")?)
    }

    fn block_url(&self, hash: BlockHash) -> Result<Url> {
        Ok(self.base_url.join(&format!("block/{}", hash))?)
    }

    fn address_txs_url(&self, address: &Address) -> Result<Url> {
        Ok(self
            .base_url
            .join(&format!("address/{}/txs/chain", address))?)
    }

    fn tx_hex_url(&self, txid: &str) -> Result<Url> {
        Ok(self.base_url.join(&format!("tx/{}/hex", txid))?)
    }

    fn broadcast_url(&self) -> Result<Url> {
        Ok(self.base_url.join("tx")?)
    }

    async fn get_text(&self, url: Url) -> Result<String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| GetRequestFailed(url.clone()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| GetRequestFailed(url.clone()))?;

        if !status.is_success() {
            return Err(UnexpectedStatus { url, status, body }.into());
        }

        Ok(body)
    }

    async fn post_text(&self, url: Url, body: String) -> Result<String> {
        let response = self
            .client
            .post(url.clone())
            .body(body)
            .send()
            .await
            .with_context(|| PostRequestFailed(url.clone()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| PostRequestFailed(url.clone()))?;

        if !status.is_success() {
            return Err(UnexpectedStatus { url, status, body }.into());
        }

        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
struct TxSummary {
    txid: String,
    status: TxStatus,
}

#[derive(Debug, Deserialize)]
struct TxStatus {
    confirmed: bool,
}

#[derive(Debug, Deserialize)]
struct BlockSummary {
    id: String,
    timestamp: u32,
    previousblockhash: Option<String>,
}

#[async_trait]
impl ChainTip for EsploraConnector {
    async fn chain_tip(&self) -> Result<BlockHash> {
        let body = self.get_text(self.tip_hash_url()?).await?;
        body.trim()
            .parse()
            .context("tip response is not a block hash")
    }
}

#[async_trait]
impl BlockHeaderByHash for EsploraConnector {
    async fn block_header_by_hash(&self, hash: BlockHash) -> Result<BlockHeader> {
        let body = self.get_text(self.block_url(hash)?).await?;
        let summary = serde_json::from_str::<BlockSummary>(&body)
            .context("failed to decode block summary")?;

        let previous = summary
            .previousblockhash
            .map(|hash| hash.parse::<BlockHash>())
            .transpose()
            .context("previous block hash is malformed")?;

        Ok(BlockHeader {
            hash: summary.id.parse().context("block id is malformed")?,
            time: summary.timestamp,
            previous,
        })
    }
}

#[async_trait]
impl AddressHistory for EsploraConnector {
    async fn address_history(&self, address: &Address) -> Result<Vec<RawTransaction>> {
        let body = self.get_text(self.address_txs_url(address)?).await?;
        let summaries = serde_json::from_str::<Vec<TxSummary>>(&body)
            .context("failed to decode address history")?;

        let mut transactions = Vec::with_capacity(summaries.len());
        for summary in summaries.into_iter().filter(|summary| summary.status.confirmed) {
            let hex = self.get_text(self.tx_hex_url(&summary.txid)?).await?;
            let bytes = hex::decode(hex.trim())
                .with_context(|| format!("transaction {} is not valid hex", summary.txid))?;
            transactions.push(RawTransaction::new(bytes));
        }

        Ok(transactions)
    }
}

#[async_trait]
impl BroadcastTransaction for EsploraConnector {
    async fn broadcast_transaction(&self, transaction: &Transaction) -> Result<Txid> {
        let hex = hex::encode(consensus::serialize(transaction));
        let body = self.post_text(self.broadcast_url()?, hex).await?;

        body.trim()
            .parse::<Txid>()
            .context("broadcast response is not a txid")
    }
}
