//! An in-memory chain that tests script instead of talking to Esplora.

use crate::{
    chain::{
        AddressHistory, BlockHeader, BlockHeaderByHash, BroadcastTransaction, ChainTip,
        LedgerTime, Network, RawTransaction,
    },
    timestamp::Timestamp,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bitcoin::{
    hashes::Hash, Address, BlockHash, OutPoint, Script, Transaction, TxIn, TxOut, Txid,
};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// A fixed value of a type, for tests that need one but do not care which.
pub trait StaticStub {
    fn static_stub() -> Self;
}

const GENESIS_TIME: u32 = 1_500_000_000;

/// A scriptable chain. Clones share the same underlying state, so a handle
/// can keep steering the chain after another clone moved into the code under
/// test.
#[derive(Clone)]
pub struct FakeChain {
    inner: Arc<Inner>,
    latency: Option<Duration>,
    auto_mine: bool,
}

struct Inner {
    headers: Mutex<Vec<BlockHeader>>,
    /// Watched scripts and every mined transaction touching them. A script
    /// becomes watched the first time it is paid or queried.
    histories: Mutex<HashMap<Script, Vec<RawTransaction>>>,
    /// Script behind every output that ever entered a history, for matching
    /// spends back to the addresses they drain.
    output_scripts: Mutex<HashMap<OutPoint, Script>>,
    failing: Mutex<HashSet<Script>>,
    /// Broadcast but not yet mined transactions, kept while auto-mine is
    /// off until a test mines them.
    pending: Mutex<Vec<Transaction>>,
    time: Mutex<Timestamp>,
    next_seed: AtomicU64,
    tip_requests: AtomicUsize,
    header_requests: AtomicUsize,
    history_requests: AtomicUsize,
}

impl FakeChain {
    pub fn new() -> Self {
        let genesis = BlockHeader {
            hash: block_hash(1),
            time: GENESIS_TIME,
            previous: None,
        };

        FakeChain {
            inner: Arc::new(Inner {
                headers: Mutex::new(vec![genesis]),
                histories: Mutex::new(HashMap::new()),
                output_scripts: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashSet::new()),
                pending: Mutex::new(Vec::new()),
                time: Mutex::new(Timestamp::from(GENESIS_TIME)),
                next_seed: AtomicU64::new(1),
                tip_requests: AtomicUsize::new(0),
                header_requests: AtomicUsize::new(0),
                history_requests: AtomicUsize::new(0),
            }),
            latency: None,
            auto_mine: false,
        }
    }

    /// A chain whose blocks carry the given timestamps, oldest first.
    pub fn with_header_chain(times: Vec<u32>) -> Self {
        let chain = FakeChain::new();

        let mut headers = Vec::with_capacity(times.len());
        let mut previous = None;
        for (height, time) in times.into_iter().enumerate() {
            let hash = block_hash(height as u64 + 1);
            headers.push(BlockHeader {
                hash,
                time,
                previous,
            });
            previous = Some(hash);
        }
        *chain.inner.headers.lock().unwrap() = headers;

        chain
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Broadcast transactions land in the histories immediately.
    pub fn with_auto_mine(mut self) -> Self {
        self.auto_mine = true;
        self
    }

    pub fn with_time(self, seconds: u32) -> Self {
        self.set_time(seconds);
        self
    }

    pub fn set_time(&self, seconds: u32) {
        *self.inner.time.lock().unwrap() = Timestamp::from(seconds);
    }

    /// Every history query for this address fails from now on.
    pub fn fail_for(&self, address: &Address) {
        self.inner
            .failing
            .lock()
            .unwrap()
            .insert(address.script_pubkey());
    }

    /// Pays `value` to a new address and returns it.
    pub fn fund_address(&self, value: u64) -> Address {
        let address = self.fresh_address();
        self.pay(&address, value);
        address
    }

    /// An address the chain has never seen.
    pub fn fresh_address(&self) -> Address {
        let seed = self.inner.next_seed.fetch_add(1, Ordering::SeqCst);

        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&seed.to_le_bytes());
        bytes[31] = 1;
        let key = bitcoin::secp256k1::SecretKey::from_slice(&bytes).unwrap();
        let public_key = bitcoin::PublicKey {
            compressed: true,
            key: bitcoin::secp256k1::PublicKey::from_secret_key(
                &bitcoin::secp256k1::Secp256k1::signing_only(),
                &key,
            ),
        };

        Address::p2pkh(&public_key, Network::Regtest.as_bitcoin())
    }

    /// Mines a transaction paying `value` to `address`.
    pub fn pay(&self, address: &Address, value: u64) -> OutPoint {
        let seed = self.inner.next_seed.fetch_add(1, Ordering::SeqCst);
        let transaction = Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: fake_txid(seed),
                    vout: 0,
                },
                script_sig: Script::new(),
                sequence: 0xFFFF_FFFF,
                witness: Vec::new(),
            }],
            output: vec![TxOut {
                value,
                script_pubkey: address.script_pubkey(),
            }],
        };

        self.watch(address.script_pubkey());
        self.admit(&transaction);

        OutPoint {
            txid: transaction.txid(),
            vout: 0,
        }
    }

    /// Mines a transaction that spends `outpoint` to nowhere, making the
    /// spend visible in `address`'s history.
    pub fn spend_in_history(&self, address: &Address, outpoint: OutPoint) {
        let transaction = Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: Script::new(),
                sequence: 0xFFFF_FFFF,
                witness: Vec::new(),
            }],
            output: vec![TxOut {
                value: 0,
                script_pubkey: Script::new(),
            }],
        };

        self.watch(address.script_pubkey());
        self.admit(&transaction);
    }

    /// Mines an externally built transaction, as a broadcast would with
    /// auto-mine on.
    pub fn broadcast(&self, transaction: &Transaction) -> Txid {
        self.admit(transaction);
        transaction.txid()
    }

    /// Mines every transaction broadcast while auto-mine was off.
    pub fn mine_pending(&self) {
        let pending: Vec<Transaction> = self.inner.pending.lock().unwrap().drain(..).collect();
        for transaction in &pending {
            self.admit(transaction);
        }
    }

    /// The mined history of `address`, without counting as a request.
    pub fn history_of(&self, address: &Address) -> Vec<RawTransaction> {
        self.inner
            .histories
            .lock()
            .unwrap()
            .get(&address.script_pubkey())
            .cloned()
            .unwrap_or_default()
    }

    pub fn tip_requests(&self) -> usize {
        self.inner.tip_requests.load(Ordering::SeqCst)
    }

    pub fn header_requests(&self) -> usize {
        self.inner.header_requests.load(Ordering::SeqCst)
    }

    pub fn history_requests(&self) -> usize {
        self.inner.history_requests.load(Ordering::SeqCst)
    }

    fn watch(&self, script: Script) {
        self.inner
            .histories
            .lock()
            .unwrap()
            .entry(script)
            .or_default();
    }

    /// Appends the transaction to the history of every watched script it
    /// touches, by paying it or by spending one of its outputs.
    fn admit(&self, transaction: &Transaction) {
        let raw = RawTransaction::from(transaction);
        let txid = transaction.txid();

        let mut output_scripts = self.inner.output_scripts.lock().unwrap();
        let mut histories = self.inner.histories.lock().unwrap();

        let mut touched = HashSet::new();
        for output in &transaction.output {
            touched.insert(output.script_pubkey.clone());
        }
        for input in &transaction.input {
            if let Some(script) = output_scripts.get(&input.previous_output) {
                touched.insert(script.clone());
            }
        }

        for (vout, output) in transaction.output.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let outpoint = OutPoint {
                txid,
                vout: vout as u32,
            };
            output_scripts.insert(outpoint, output.script_pubkey.clone());
        }

        for script in touched {
            if let Some(history) = histories.get_mut(&script) {
                history.push(raw.clone());
            }
        }
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for FakeChain {
    fn default() -> Self {
        FakeChain::new()
    }
}

impl fmt::Debug for FakeChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FakeChain")
    }
}

#[async_trait]
impl ChainTip for FakeChain {
    async fn chain_tip(&self) -> Result<BlockHash> {
        self.pause().await;
        self.inner.tip_requests.fetch_add(1, Ordering::SeqCst);

        let headers = self.inner.headers.lock().unwrap();
        headers
            .last()
            .map(|header| header.hash)
            .ok_or_else(|| anyhow!("the scripted chain has no blocks"))
    }
}

#[async_trait]
impl BlockHeaderByHash for FakeChain {
    async fn block_header_by_hash(&self, hash: BlockHash) -> Result<BlockHeader> {
        self.pause().await;
        self.inner.header_requests.fetch_add(1, Ordering::SeqCst);

        let headers = self.inner.headers.lock().unwrap();
        headers
            .iter()
            .find(|header| header.hash == hash)
            .copied()
            .ok_or_else(|| anyhow!("no scripted block {}", hash))
    }
}

#[async_trait]
impl AddressHistory for FakeChain {
    async fn address_history(&self, address: &Address) -> Result<Vec<RawTransaction>> {
        self.pause().await;
        self.inner.history_requests.fetch_add(1, Ordering::SeqCst);

        let script = address.script_pubkey();
        if self.inner.failing.lock().unwrap().contains(&script) {
            return Err(anyhow!("scripted failure for {}", address));
        }

        let mut histories = self.inner.histories.lock().unwrap();
        Ok(histories.entry(script).or_default().clone())
    }
}

#[async_trait]
impl BroadcastTransaction for FakeChain {
    async fn broadcast_transaction(&self, transaction: &Transaction) -> Result<Txid> {
        self.pause().await;

        if self.auto_mine {
            self.admit(transaction);
        } else {
            self.inner.pending.lock().unwrap().push(transaction.clone());
        }

        Ok(transaction.txid())
    }
}

#[async_trait]
impl LedgerTime for FakeChain {
    async fn ledger_time(&self) -> Result<Timestamp> {
        self.pause().await;
        Ok(*self.inner.time.lock().unwrap())
    }
}

fn block_hash(seed: u64) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&seed.to_le_bytes());
    BlockHash::from_slice(&bytes).unwrap()
}

fn fake_txid(seed: u64) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&seed.to_le_bytes());
    bytes[8] = 0xFE;
    Txid::from_slice(&bytes).unwrap()
}
