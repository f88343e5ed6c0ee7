use crate::{
    chain::{
        AddressHistory, BlockHeader, BlockHeaderByHash, BroadcastTransaction, ChainTip, LedgerTime,
        RawTransaction,
    },
    timestamp::Timestamp,
};
use anyhow::Result;
use async_trait::async_trait;
use bitcoin::{Address, BlockHash, Transaction, Txid};
use derivative::Derivative;
use lru::LruCache;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

/// Roughly one day of headers.
const HEADER_CACHE_CAPACITY: usize = 144;

/// How many trailing block timestamps the chain's notion of "now" is the
/// median of.
const MEDIAN_TIME_SPAN: usize = 11;

/// Validity windows for the expiring query slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Windows {
    pub median_time: Duration,
    pub address_history: Duration,
}

impl Default for Windows {
    fn default() -> Self {
        Windows {
            median_time: Duration::from_secs(60),
            address_history: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<(T, Instant)>,
}

impl<T: Clone> Slot<T> {
    fn empty() -> Self {
        Slot { value: None }
    }

    fn fresh(&self, window: Duration) -> Option<T> {
        match &self.value {
            Some((value, fetched_at)) if fetched_at.elapsed() < window => Some(value.clone()),
            _ => None,
        }
    }

    fn store(&mut self, value: T) {
        self.value = Some((value, Instant::now()));
    }
}

/// Wraps a connector so that expensive queries are amortized.
///
/// Headers are content-addressed and never expire; the median-time and
/// per-address history slots each hold a value plus its fetch instant and are
/// refetched once older than their window. Every slot has its own lock and a
/// caller arriving during a refresh waits for that refresh instead of
/// starting a second one.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct Cache<C> {
    pub connector: C,
    windows: Windows,
    #[derivative(Debug = "ignore")]
    header_cache: Arc<Mutex<LruCache<BlockHash, BlockHeader>>>,
    #[derivative(Debug = "ignore")]
    median_time: Arc<Mutex<Slot<Timestamp>>>,
    #[derivative(Debug = "ignore")]
    histories: Arc<Mutex<HashMap<String, Arc<Mutex<Slot<Vec<RawTransaction>>>>>>>,
}

impl<C> Cache<C> {
    pub fn new(connector: C, windows: Windows) -> Self {
        Cache {
            connector,
            windows,
            header_cache: Arc::new(Mutex::new(LruCache::new(HEADER_CACHE_CAPACITY))),
            median_time: Arc::new(Mutex::new(Slot::empty())),
            histories: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<C> Cache<C>
where
    C: BlockHeaderByHash + Send + Sync,
{
    async fn header(&self, hash: BlockHash) -> Result<BlockHeader> {
        if let Some(header) = self.header_cache.lock().await.get(&hash) {
            return Ok(*header);
        }

        let header = self.connector.block_header_by_hash(hash).await?;
        self.header_cache.lock().await.put(hash, header);

        Ok(header)
    }
}

impl<C> Cache<C>
where
    C: ChainTip + BlockHeaderByHash + Send + Sync,
{
    /// Median timestamp of the [`MEDIAN_TIME_SPAN`] most recent blocks,
    /// served from the slot while it is fresh.
    pub async fn median_time(&self) -> Result<Timestamp> {
        let mut slot = self.median_time.lock().await;

        if let Some(cached) = slot.fresh(self.windows.median_time) {
            return Ok(cached);
        }

        let median = self.compute_median_time().await?;
        slot.store(median);

        Ok(median)
    }

    async fn compute_median_time(&self) -> Result<Timestamp> {
        let tip = self.connector.chain_tip().await?;

        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(tip);
        while times.len() < MEDIAN_TIME_SPAN {
            let hash = match cursor {
                Some(hash) => hash,
                None => break,
            };
            let header = self.header(hash).await?;
            times.push(header.time);
            cursor = header.previous;
        }

        anyhow::ensure!(!times.is_empty(), "chain source returned no headers");

        times.sort_unstable();
        Ok(Timestamp::from(times[times.len() / 2]))
    }
}

#[async_trait]
impl<C> ChainTip for Cache<C>
where
    C: ChainTip + Send + Sync,
{
    async fn chain_tip(&self) -> Result<BlockHash> {
        self.connector.chain_tip().await
    }
}

#[async_trait]
impl<C> BlockHeaderByHash for Cache<C>
where
    C: BlockHeaderByHash + Send + Sync,
{
    async fn block_header_by_hash(&self, hash: BlockHash) -> Result<BlockHeader> {
        self.header(hash).await
    }
}

#[async_trait]
impl<C> AddressHistory for Cache<C>
where
    C: AddressHistory + Send + Sync,
{
    async fn address_history(&self, address: &Address) -> Result<Vec<RawTransaction>> {
        let slot = {
            let mut histories = self.histories.lock().await;
            histories
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Slot::empty())))
                .clone()
        };

        let mut slot = slot.lock().await;

        if let Some(cached) = slot.fresh(self.windows.address_history) {
            return Ok(cached);
        }

        let history = self.connector.address_history(address).await?;
        slot.store(history.clone());

        Ok(history)
    }
}

#[async_trait]
impl<C> BroadcastTransaction for Cache<C>
where
    C: BroadcastTransaction + Send + Sync,
{
    async fn broadcast_transaction(&self, transaction: &Transaction) -> Result<Txid> {
        self.connector.broadcast_transaction(transaction).await
    }
}

#[async_trait]
impl<C> LedgerTime for Cache<C>
where
    C: ChainTip + BlockHeaderByHash + Send + Sync,
{
    async fn ledger_time(&self) -> Result<Timestamp> {
        self.median_time().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::FakeChain;
    use spectral::prelude::*;

    fn eleven_block_chain() -> FakeChain {
        // Timestamps deliberately out of order; the median must sort them.
        FakeChain::with_header_chain(vec![
            100, 109, 101, 108, 102, 107, 103, 106, 104, 110, 105,
        ])
    }

    #[tokio::test]
    async fn median_time_is_the_median_of_the_last_eleven_blocks() {
        let cache = Cache::new(eleven_block_chain(), Windows::default());

        let median = cache.median_time().await.unwrap();

        assert_eq!(median, Timestamp::from(105));
    }

    #[tokio::test]
    async fn median_time_of_a_short_chain_uses_what_exists() {
        let cache = Cache::new(FakeChain::with_header_chain(vec![50, 70, 60]), Windows::default());

        let median = cache.median_time().await.unwrap();

        assert_eq!(median, Timestamp::from(60));
    }

    #[tokio::test]
    async fn repeated_median_time_is_equal_and_served_from_the_slot() {
        let chain = eleven_block_chain().with_latency(Duration::from_millis(50));
        let cache = Cache::new(chain, Windows::default());

        let started = Instant::now();
        let first = cache.median_time().await.unwrap();
        let first_latency = started.elapsed();

        let started = Instant::now();
        let second = cache.median_time().await.unwrap();
        let second_latency = started.elapsed();

        assert_eq!(first, second);
        assert_that(&second_latency).is_less_than(&first_latency);
        assert_eq!(cache.connector.tip_requests(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_a_single_refresh() {
        let cache = Cache::new(eleven_block_chain(), Windows::default());

        let (first, second) = tokio::join!(cache.median_time(), cache.median_time());

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(cache.connector.tip_requests(), 1);
    }

    #[tokio::test]
    async fn stale_median_time_triggers_a_refetch() {
        let windows = Windows {
            median_time: Duration::from_secs(0),
            ..Windows::default()
        };
        let cache = Cache::new(eleven_block_chain(), windows);

        cache.median_time().await.unwrap();
        cache.median_time().await.unwrap();

        assert_eq!(cache.connector.tip_requests(), 2);
    }

    #[tokio::test]
    async fn headers_are_cached_across_median_recomputations() {
        let windows = Windows {
            median_time: Duration::from_secs(0),
            ..Windows::default()
        };
        let cache = Cache::new(eleven_block_chain(), windows);

        cache.median_time().await.unwrap();
        let after_first = cache.connector.header_requests();
        cache.median_time().await.unwrap();

        assert_eq!(after_first, 11);
        assert_eq!(cache.connector.header_requests(), 11);
    }

    #[tokio::test]
    async fn address_history_is_cached_per_address() {
        let chain = FakeChain::new();
        let left = chain.fund_address(10_000);
        let right = chain.fund_address(20_000);
        let cache = Cache::new(chain, Windows::default());

        cache.address_history(&left).await.unwrap();
        cache.address_history(&left).await.unwrap();
        cache.address_history(&right).await.unwrap();

        assert_eq!(cache.connector.history_requests(), 2);
    }

    #[tokio::test]
    async fn unknown_address_history_is_empty_not_an_error() {
        let chain = FakeChain::new();
        let unwatched = chain.fresh_address();
        let cache = Cache::new(chain, Windows::default());

        let history = cache.address_history(&unwatched).await.unwrap();

        assert_that(&history).is_empty();
    }
}
