//! Outward notification bridge.
//!
//! The state machine publishes every persisted entry over a channel. A
//! single consumer task compares each entry against the shadow map of
//! last-seen states and fans genuinely new states out to subscribers, so
//! per trade every state is delivered at most once per subscriber and in
//! persistence order. New subscribers get a full snapshot batch first.

use crate::{
    database::Database,
    timestamp::Timestamp,
    trade::{TradeEntry, TradeId, TradeState},
};
use anyhow::Result;
use futures::{channel::mpsc, StreamExt};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

const PUBLISH_BUFFER: usize = 256;
const SUBSCRIBER_BUFFER: usize = 64;

/// What one application of a state to the shadow map decided.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Transition {
    Changed,
    Unchanged,
}

/// Mutual-exclusion wrapper around the id to last-seen-state map.
///
/// The compare and the update happen under a single lock scope; the map
/// itself is never handed out.
#[derive(Debug, Default)]
pub struct ShadowStates {
    states: Mutex<HashMap<TradeId, TradeState>>,
}

impl ShadowStates {
    pub fn new() -> Self {
        ShadowStates {
            states: Mutex::new(HashMap::new()),
        }
    }

    pub async fn apply(&self, id: TradeId, state: TradeState) -> Transition {
        let mut states = self.states.lock().await;
        match states.insert(id, state) {
            Some(previous) if previous == state => Transition::Unchanged,
            _ => Transition::Changed,
        }
    }
}

/// Failure modes of [`Bridge::subscribe`], mapped to the close statuses
/// transport-level consumers expect.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("could not assemble the trade snapshot: {0:#}")]
    Repository(anyhow::Error),
    #[error("could not deliver the trade snapshot")]
    Transport,
}

impl SubscribeError {
    pub fn close_code(&self) -> u16 {
        match self {
            SubscribeError::Repository(_) => 4001,
            SubscribeError::Transport => 4002,
        }
    }
}

/// Outward encoding of one trade. Carries the identifying token and the
/// public terms, never the trade key and never a secret.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TradeRecord {
    pub id: TradeId,
    pub role: &'static str,
    pub state: &'static str,
    pub own_address: String,
    pub their_address: String,
    pub own_value: u64,
    pub their_value: u64,
    pub own_expiry: Timestamp,
    pub their_expiry: Timestamp,
    pub native_address: String,
    pub native_amount: u64,
    pub native_lock_time: Timestamp,
    pub secret_hash: String,
    pub txid: Option<String>,
}

impl From<&TradeEntry> for TradeRecord {
    fn from(entry: &TradeEntry) -> Self {
        TradeRecord {
            id: entry.id(),
            role: entry.role.name(),
            state: entry.state.name(),
            own_address: entry.own_address().to_string(),
            their_address: entry.their_address().to_string(),
            own_value: entry.own_htlc.value.as_sat(),
            their_value: entry.their_htlc.value.as_sat(),
            own_expiry: entry.own_htlc.expiry,
            their_expiry: entry.their_htlc.expiry,
            native_address: entry.native.address.clone(),
            native_amount: entry.native.amount,
            native_lock_time: entry.native.lock_time,
            secret_hash: entry.secret_hash.to_string(),
            txid: entry.state.txid().map(|txid| txid.to_string()),
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    sender: mpsc::Sender<Vec<TradeRecord>>,
}

/// A feed of trade record batches: the full snapshot first, then one
/// single-record batch per observed state change.
#[derive(Debug)]
pub struct Subscription {
    records: mpsc::Receiver<Vec<TradeRecord>>,
}

impl Subscription {
    pub async fn next_batch(&mut self) -> Option<Vec<TradeRecord>> {
        self.records.next().await
    }
}

#[derive(Debug)]
pub struct Bridge {
    db: Arc<Database>,
    shadow: ShadowStates,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Bridge {
    pub fn new(db: Arc<Database>, shadow: ShadowStates) -> Self {
        Bridge {
            db,
            shadow,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn channel() -> (mpsc::Sender<TradeEntry>, mpsc::Receiver<TradeEntry>) {
        mpsc::channel(PUBLISH_BUFFER)
    }

    /// Marks every stored trade's current state as seen so a restart does
    /// not replay old transitions to subscribers.
    pub async fn seed(&self) -> Result<()> {
        for entry in self.db.all()? {
            self.shadow.apply(entry.id(), entry.state).await;
        }
        Ok(())
    }

    /// Consumes published entries until the sending side closes.
    pub async fn run(self: Arc<Self>, mut updates: mpsc::Receiver<TradeEntry>) {
        while let Some(entry) = updates.next().await {
            self.publish(&entry).await;
        }
        tracing::debug!("update channel closed, bridge stops");
    }

    /// Registers a subscriber. The snapshot is assembled and queued while
    /// holding the subscriber list, so no delta published afterwards can be
    /// missed and none already applied can be duplicated.
    pub async fn subscribe(&self) -> Result<Subscription, SubscribeError> {
        let mut subscribers = self.subscribers.lock().await;

        let snapshot = self.snapshot().map_err(SubscribeError::Repository)?;
        let (mut sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        sender
            .try_send(snapshot)
            .map_err(|_| SubscribeError::Transport)?;
        subscribers.push(Subscriber { sender });

        Ok(Subscription { records: receiver })
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    async fn publish(&self, entry: &TradeEntry) {
        // Subscribers before shadow, same order as subscribe.
        let mut subscribers = self.subscribers.lock().await;

        if self.shadow.apply(entry.id(), entry.state).await == Transition::Unchanged {
            return;
        }

        let batch = vec![TradeRecord::from(entry)];
        let mut healthy = Vec::with_capacity(subscribers.len());
        for mut subscriber in subscribers.drain(..) {
            match subscriber.sender.try_send(batch.clone()) {
                Ok(()) => healthy.push(subscriber),
                Err(error) => {
                    tracing::debug!("dropping trade subscriber: {}", error);
                }
            }
        }
        *subscribers = healthy;
    }

    fn snapshot(&self) -> Result<Vec<TradeRecord>> {
        let mut entries = self.db.all()?;
        entries.sort_by(|a, b| a.id().cmp(&b.id()));

        Ok(entries.iter().map(TradeRecord::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        trade::{Role, TradeKey},
        StaticStub,
    };
    use futures::SinkExt;
    use spectral::prelude::*;
    use std::time::Duration;

    fn funding_txid() -> bitcoin::Txid {
        "2222222222222222222222222222222222222222222222222222222222222222"
            .parse()
            .unwrap()
    }

    fn second_entry() -> TradeEntry {
        TradeEntry {
            key: TradeKey::from_bytes([0x44; 32]).unwrap(),
            role: Role::Responder { secret: None },
            ..TradeEntry::static_stub()
        }
    }

    async fn bridge_with(entries: &[TradeEntry]) -> Arc<Bridge> {
        let db = Arc::new(Database::new_test().unwrap());
        for entry in entries {
            db.insert(entry).unwrap();
        }
        let bridge = Arc::new(Bridge::new(db, ShadowStates::new()));
        bridge.seed().await.unwrap();
        bridge
    }

    async fn assert_no_batch_within(subscription: &mut Subscription, wait: Duration) {
        let outcome = tokio::time::timeout(wait, subscription.next_batch()).await;
        assert_that(&outcome.is_err()).is_true();
    }

    #[tokio::test]
    async fn apply_reports_changed_then_unchanged() {
        let shadow = ShadowStates::new();
        let entry = TradeEntry::static_stub();

        assert_eq!(
            shadow.apply(entry.id(), TradeState::Funded).await,
            Transition::Changed
        );
        assert_eq!(
            shadow.apply(entry.id(), TradeState::Funded).await,
            Transition::Unchanged
        );
        assert_eq!(
            shadow.apply(entry.id(), TradeState::SecretRevealed).await,
            Transition::Changed
        );
    }

    #[tokio::test]
    async fn each_distinct_state_is_delivered_exactly_once() {
        let mut entry = TradeEntry::static_stub();
        let bridge = bridge_with(&[entry.clone()]).await;
        let (mut sender, receiver) = Bridge::channel();
        tokio::spawn(bridge.clone().run(receiver));

        let mut subscription = bridge.subscribe().await.unwrap();
        let snapshot = subscription.next_batch().await.unwrap();
        assert_eq!(snapshot.len(), 1);

        entry.state = TradeState::Funded;
        sender.send(entry.clone()).await.unwrap();
        sender.send(entry.clone()).await.unwrap();

        let delta = subscription.next_batch().await.unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].state, "FUNDED");

        assert_no_batch_within(&mut subscription, Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn deltas_arrive_in_persistence_order() {
        let mut entry = TradeEntry::static_stub();
        let bridge = bridge_with(&[entry.clone()]).await;
        let (mut sender, receiver) = Bridge::channel();
        tokio::spawn(bridge.clone().run(receiver));

        let mut subscription = bridge.subscribe().await.unwrap();
        subscription.next_batch().await.unwrap();

        entry.state = TradeState::Funding {
            txid: funding_txid(),
        };
        sender.send(entry.clone()).await.unwrap();
        entry.state = TradeState::Funded;
        sender.send(entry.clone()).await.unwrap();
        entry.state = TradeState::WaitingForCounterpartyLock;
        sender.send(entry.clone()).await.unwrap();

        assert_eq!(subscription.next_batch().await.unwrap()[0].state, "FUNDING");
        assert_eq!(subscription.next_batch().await.unwrap()[0].state, "FUNDED");
        assert_eq!(
            subscription.next_batch().await.unwrap()[0].state,
            "WAITING_FOR_COUNTERPARTY_LOCK"
        );
    }

    #[tokio::test]
    async fn a_new_subscriber_gets_the_snapshot_ordered_by_id() {
        let first = TradeEntry::static_stub();
        let second = second_entry();
        let bridge = bridge_with(&[first, second]).await;

        let mut subscription = bridge.subscribe().await.unwrap();
        let snapshot = subscription.next_batch().await.unwrap();

        assert_eq!(snapshot.len(), 2);
        let mut ids: Vec<_> = snapshot.iter().map(|record| record.id.clone()).collect();
        let sorted = {
            let mut sorted = ids.clone();
            sorted.sort();
            sorted
        };
        assert_eq!(ids, sorted);
        ids.dedup();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn seeded_states_are_not_replayed_as_deltas() {
        let entry = TradeEntry::static_stub();
        let bridge = bridge_with(&[entry.clone()]).await;
        let (mut sender, receiver) = Bridge::channel();
        tokio::spawn(bridge.clone().run(receiver));

        let mut subscription = bridge.subscribe().await.unwrap();
        subscription.next_batch().await.unwrap();

        // Same state as seeded from the store.
        sender.send(entry).await.unwrap();

        assert_no_batch_within(&mut subscription, Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn only_the_dead_subscriber_is_removed() {
        let mut entry = TradeEntry::static_stub();
        let bridge = bridge_with(&[entry.clone()]).await;
        let (mut sender, receiver) = Bridge::channel();
        tokio::spawn(bridge.clone().run(receiver));

        let dead = bridge.subscribe().await.unwrap();
        let mut alive = bridge.subscribe().await.unwrap();
        alive.next_batch().await.unwrap();
        drop(dead);
        assert_eq!(bridge.subscriber_count().await, 2);

        entry.state = TradeState::Funded;
        sender.send(entry).await.unwrap();

        let delta = alive.next_batch().await.unwrap();
        assert_eq!(delta[0].state, "FUNDED");
        assert_eq!(bridge.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn close_codes_distinguish_repository_and_transport_faults() {
        let repository = SubscribeError::Repository(anyhow::anyhow!("store is broken"));
        let transport = SubscribeError::Transport;

        assert_eq!(repository.close_code(), 4001);
        assert_eq!(transport.close_code(), 4002);
    }

    #[tokio::test]
    async fn records_leak_neither_key_nor_secret() {
        let entry = TradeEntry::static_stub();
        let key_hex = hex::encode(entry.key.as_bytes());
        let secret_hex = hex::encode(entry.secret().unwrap().as_raw());

        let record = TradeRecord::from(&entry);
        let encoded = serde_json::to_string(&record).unwrap();

        assert_that(&encoded.contains(&key_hex)).is_false();
        assert_that(&encoded.contains(&secret_hex)).is_false();
        assert_that(&encoded.contains(entry.id().as_str())).is_true();
    }
}
