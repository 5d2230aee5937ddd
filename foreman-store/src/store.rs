//! The versioned config store actor and its client handle.
//!
//! The store owns the canonical key/value mapping and the version counter.
//! All access goes through [`StoreHandle`], a cloneable proxy that sends
//! commands over an mpsc queue and awaits oneshot replies; the actor is the
//! single writer and assigns a strict total order to every committed
//! mutation regardless of which client issued it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use foreman_core::types::{ConfigKey, ConfigSnapshot, ConfigValue, ConfigVersion};

use crate::backend::ConfigBackend;
use crate::error::StoreError;

/// Command queue depth between handles and the actor.
const COMMAND_QUEUE_DEPTH: usize = 64;

/// One committed change, delivered to matching subscribers in commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub version: ConfigVersion,
    pub key: ConfigKey,
    pub value: ConfigValue,
}

/// What a subscriber wants to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubscriptionFilter {
    /// Every committed write.
    All,
    /// Writes to exactly this key.
    Key { key: ConfigKey },
    /// Writes to any key starting with this prefix.
    Prefix { prefix: String },
}

impl SubscriptionFilter {
    pub fn matches(&self, key: &ConfigKey) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Key { key: wanted } => wanted == key,
            SubscriptionFilter::Prefix { prefix } => key.0.starts_with(prefix.as_str()),
        }
    }
}

enum Command {
    Get {
        key: ConfigKey,
        respond_to: oneshot::Sender<Option<ConfigValue>>,
    },
    Set {
        key: ConfigKey,
        value: ConfigValue,
        respond_to: oneshot::Sender<ConfigVersion>,
    },
    Merge {
        key: ConfigKey,
        value: ConfigValue,
        respond_to: oneshot::Sender<ConfigVersion>,
    },
    Snapshot {
        respond_to: oneshot::Sender<ConfigSnapshot>,
    },
    Subscribe {
        filter: SubscriptionFilter,
        respond_to: oneshot::Sender<Subscription>,
    },
}

/// Cloneable client proxy to the store actor.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<Command>,
}

impl StoreHandle {
    /// Current value for `key`, or [`StoreError::NotFound`].
    ///
    /// Never blocks on writers; the returned value is consistent at some
    /// version at least as new as when the call started.
    pub async fn get(&self, key: impl Into<ConfigKey>) -> Result<ConfigValue, StoreError> {
        let key = key.into();
        let (tx, rx) = oneshot::channel();
        self.send(Command::Get {
            key: key.clone(),
            respond_to: tx,
        })
        .await?;
        let value = rx
            .await
            .map_err(|_| StoreError::ChannelClosed("get reply"))?;
        value.ok_or(StoreError::NotFound { key })
    }

    /// Replace the value under `key` entirely; returns the committed version.
    pub async fn set(
        &self,
        key: impl Into<ConfigKey>,
        value: ConfigValue,
    ) -> Result<ConfigVersion, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Set {
            key: key.into(),
            value,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| StoreError::ChannelClosed("set reply"))
    }

    /// Deep-merge `value` into the value under `key` (explicit merge
    /// operation; objects merge key-by-key, everything else replaces).
    pub async fn merge(
        &self,
        key: impl Into<ConfigKey>,
        value: ConfigValue,
    ) -> Result<ConfigVersion, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Merge {
            key: key.into(),
            value,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| StoreError::ChannelClosed("merge reply"))
    }

    /// Full mapping copy at one consistent version.
    pub async fn snapshot(&self) -> Result<ConfigSnapshot, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot { respond_to: tx }).await?;
        rx.await
            .map_err(|_| StoreError::ChannelClosed("snapshot reply"))
    }

    /// Subscribe to committed writes matching `filter`.
    pub async fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            filter,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| StoreError::ChannelClosed("subscribe reply"))
    }

    async fn send(&self, command: Command) -> Result<(), StoreError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| StoreError::ChannelClosed("store commands"))
    }
}

/// A lazy, infinite, cancelable sequence of [`ConfigChange`] events.
///
/// Cancellation is cooperative: drop (or [`Subscription::cancel`]) stops
/// future deliveries; events already queued are still yielded first.
pub struct Subscription {
    rx: mpsc::Receiver<ConfigChange>,
    overflowed: Arc<AtomicBool>,
}

impl Subscription {
    /// Next change event in commit order.
    ///
    /// `Ok(None)` means the store shut down. A subscriber that fell behind
    /// its bounded queue gets [`StoreError::SubscriberOverflow`] after the
    /// already-buffered events are drained, and must resubscribe.
    pub async fn next(&mut self) -> Result<Option<ConfigChange>, StoreError> {
        match self.rx.recv().await {
            Some(change) => Ok(Some(change)),
            None => {
                if self.overflowed.load(Ordering::Acquire) {
                    Err(StoreError::SubscriberOverflow)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Cancel the subscription. Equivalent to dropping it.
    pub fn cancel(self) {}
}

struct SubscriberEntry {
    filter: SubscriptionFilter,
    tx: mpsc::Sender<ConfigChange>,
    overflowed: Arc<AtomicBool>,
}

/// The single-writer store actor.
pub struct ConfigStore {
    entries: BTreeMap<ConfigKey, ConfigValue>,
    version: ConfigVersion,
    subscribers: Vec<SubscriberEntry>,
    queue_limit: usize,
    backend: Option<Box<dyn ConfigBackend + Send>>,
}

impl ConfigStore {
    /// Spawn the store actor and return its handle and join handle.
    ///
    /// When a backend is given, the initial mapping and version are restored
    /// from it before the first command is served.
    pub fn spawn(
        queue_limit: usize,
        mut backend: Option<Box<dyn ConfigBackend + Send>>,
    ) -> Result<(StoreHandle, JoinHandle<()>), StoreError> {
        let (version, entries) = match backend.as_mut() {
            Some(backend) => backend.load_initial()?,
            None => (ConfigVersion::ZERO, BTreeMap::new()),
        };

        let mut actor = ConfigStore {
            entries,
            version,
            subscribers: Vec::new(),
            queue_limit,
            backend,
        };

        let (tx, mut rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let join = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                actor.handle(command);
            }
            tracing::debug!("config store actor stopped");
        });

        Ok((StoreHandle { tx }, join))
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Get { key, respond_to } => {
                let _ = respond_to.send(self.entries.get(&key).cloned());
            }
            Command::Set {
                key,
                value,
                respond_to,
            } => {
                let version = self.commit(key, value);
                let _ = respond_to.send(version);
            }
            Command::Merge {
                key,
                value,
                respond_to,
            } => {
                let merged = match self.entries.get(&key) {
                    Some(current) => {
                        let mut base = current.clone();
                        deep_merge(&mut base, value);
                        base
                    }
                    None => value,
                };
                let version = self.commit(key, merged);
                let _ = respond_to.send(version);
            }
            Command::Snapshot { respond_to } => {
                let _ = respond_to.send(ConfigSnapshot {
                    version: self.version,
                    entries: self.entries.clone(),
                });
            }
            Command::Subscribe { filter, respond_to } => {
                let (tx, rx) = mpsc::channel(self.queue_limit.max(1));
                let overflowed = Arc::new(AtomicBool::new(false));
                self.subscribers.push(SubscriberEntry {
                    filter,
                    tx,
                    overflowed: overflowed.clone(),
                });
                let _ = respond_to.send(Subscription { rx, overflowed });
            }
        }
    }

    /// Commit one write: bump the version, store the value, fan out to
    /// subscribers, persist.
    fn commit(&mut self, key: ConfigKey, value: ConfigValue) -> ConfigVersion {
        self.version = self.version.next();
        self.entries.insert(key.clone(), value.clone());

        let change = ConfigChange {
            version: self.version,
            key,
            value,
        };
        self.notify(&change);
        self.persist();
        self.version
    }

    /// Fan a committed change out to matching subscribers. The store never
    /// blocks its own writer on a slow subscriber: a full queue abandons
    /// that subscriber and flags the overflow for its next `recv`.
    fn notify(&mut self, change: &ConfigChange) {
        self.subscribers.retain(|entry| {
            if !entry.filter.matches(&change.key) {
                return true;
            }
            match entry.tx.try_send(change.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.overflowed.store(true, Ordering::Release);
                    tracing::warn!(
                        key = %change.key,
                        version = %change.version,
                        "subscriber queue overflowed; abandoning subscriber",
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn persist(&mut self) {
        let Some(backend) = self.backend.as_mut() else {
            return;
        };
        let snapshot = ConfigSnapshot {
            version: self.version,
            entries: self.entries.clone(),
        };
        // Persist failures never fail the committed write; durability is
        // best-effort and the mapping stays authoritative in memory.
        if let Err(err) = backend.persist(&snapshot) {
            tracing::warn!(version = %snapshot.version, error = %err, "config persist failed");
        }
    }
}

/// Recursive merge: objects merge key-by-key, everything else replaces.
fn deep_merge(base: &mut ConfigValue, incoming: ConfigValue) {
    match (base, incoming) {
        (ConfigValue::Object(base_map), ConfigValue::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, incoming) => *base = incoming,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn spawn_store() -> StoreHandle {
        let (handle, _join) = ConfigStore::spawn(8, None).expect("spawn store");
        handle
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let store = spawn_store();
        let err = store.get("absent").await.expect_err("missing key");
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn set_then_get_returns_latest_value() {
        let store = spawn_store();
        let v1 = store.set("db.host", json!("alpha")).await.expect("set");
        let v2 = store.set("db.host", json!("beta")).await.expect("set");
        assert_eq!(v1, ConfigVersion(1));
        assert_eq!(v2, ConfigVersion(2));
        assert_eq!(store.get("db.host").await.expect("get"), json!("beta"));
    }

    #[tokio::test]
    async fn set_is_total_replacement() {
        let store = spawn_store();
        store
            .set("svc", json!({"host": "a", "port": 1}))
            .await
            .expect("set");
        store.set("svc", json!({"host": "b"})).await.expect("set");
        assert_eq!(
            store.get("svc").await.expect("get"),
            json!({"host": "b"}),
            "set never merges"
        );
    }

    #[tokio::test]
    async fn merge_is_deep_for_objects() {
        let store = spawn_store();
        store
            .set("svc", json!({"host": "a", "limits": {"cpu": 1, "mem": 2}}))
            .await
            .expect("set");
        store
            .merge("svc", json!({"limits": {"mem": 4}, "port": 99}))
            .await
            .expect("merge");
        assert_eq!(
            store.get("svc").await.expect("get"),
            json!({"host": "a", "limits": {"cpu": 1, "mem": 4}, "port": 99}),
        );
    }

    #[tokio::test]
    async fn merge_replaces_non_objects() {
        let store = spawn_store();
        store.set("flag", json!([1, 2, 3])).await.expect("set");
        store.merge("flag", json!([9])).await.expect("merge");
        assert_eq!(store.get("flag").await.expect("get"), json!([9]));
    }

    #[tokio::test]
    async fn merge_on_missing_key_behaves_like_set() {
        let store = spawn_store();
        let version = store.merge("new", json!({"a": 1})).await.expect("merge");
        assert_eq!(version, ConfigVersion(1));
        assert_eq!(store.get("new").await.expect("get"), json!({"a": 1}));
    }

    #[tokio::test]
    async fn snapshot_is_pinned_and_unaffected_by_later_writes() {
        let store = spawn_store();
        store.set("x", json!(1)).await.expect("set");
        let snapshot = store.snapshot().await.expect("snapshot");

        store.set("x", json!(2)).await.expect("set");
        store.set("y", json!(3)).await.expect("set");

        assert_eq!(snapshot.version, ConfigVersion(1));
        assert_eq!(snapshot.get(&ConfigKey::from("x")), Some(&json!(1)));
        assert_eq!(snapshot.get(&ConfigKey::from("y")), None);

        let fresh = store.snapshot().await.expect("snapshot");
        assert_eq!(fresh.version, ConfigVersion(3));
        assert_eq!(fresh.get(&ConfigKey::from("x")), Some(&json!(2)));
    }

    #[tokio::test]
    async fn subscriber_sees_every_commit_in_order() {
        let store = spawn_store();
        let mut sub = store
            .subscribe(SubscriptionFilter::Key {
                key: ConfigKey::from("x"),
            })
            .await
            .expect("subscribe");

        store.set("x", json!(1)).await.expect("set");
        store.set("other", json!("ignored")).await.expect("set");
        store.set("x", json!(2)).await.expect("set");

        let first = sub.next().await.expect("recv").expect("event");
        assert_eq!((first.version, first.value), (ConfigVersion(1), json!(1)));
        let second = sub.next().await.expect("recv").expect("event");
        assert_eq!((second.version, second.value), (ConfigVersion(3), json!(2)));
    }

    #[tokio::test]
    async fn prefix_filter_matches_namespace() {
        let store = spawn_store();
        let mut sub = store
            .subscribe(SubscriptionFilter::Prefix {
                prefix: "db.".to_string(),
            })
            .await
            .expect("subscribe");

        store.set("db.host", json!("h")).await.expect("set");
        store.set("log.level", json!("info")).await.expect("set");
        store.set("db.port", json!(5432)).await.expect("set");

        let first = sub.next().await.expect("recv").expect("event");
        assert_eq!(first.key, ConfigKey::from("db.host"));
        let second = sub.next().await.expect("recv").expect("event");
        assert_eq!(second.key, ConfigKey::from("db.port"));
    }

    #[tokio::test]
    async fn slow_subscriber_overflows_and_writers_never_block() {
        let (store, _join) = ConfigStore::spawn(2, None).expect("spawn store");
        let mut sub = store
            .subscribe(SubscriptionFilter::All)
            .await
            .expect("subscribe");

        // Queue limit is 2; five writes overflow the unread subscriber
        // without ever blocking the writer.
        for n in 0..5 {
            store.set("k", json!(n)).await.expect("set");
        }

        // Buffered prefix drains first, then the overflow surfaces.
        assert!(sub.next().await.expect("recv").is_some());
        assert!(sub.next().await.expect("recv").is_some());
        let err = sub.next().await.expect_err("overflow");
        assert!(matches!(err, StoreError::SubscriberOverflow));

        // The store is still healthy; a fresh subscription works.
        let mut fresh = store
            .subscribe(SubscriptionFilter::All)
            .await
            .expect("resubscribe");
        store.set("k", json!(99)).await.expect("set");
        let event = fresh.next().await.expect("recv").expect("event");
        assert_eq!(event.value, json!(99));
    }

    #[tokio::test]
    async fn canceled_subscription_stops_cleanly() {
        let store = spawn_store();
        let sub = store
            .subscribe(SubscriptionFilter::All)
            .await
            .expect("subscribe");
        sub.cancel();
        // Writes after cancel must not error or leak the dead subscriber.
        store.set("x", json!(1)).await.expect("set");
        store.set("x", json!(2)).await.expect("set");
    }

    #[tokio::test]
    async fn concurrent_writers_get_a_strict_total_order() {
        let store = spawn_store();
        let clients = 4;
        let writes_per_client = 25;

        let mut tasks = Vec::new();
        for client in 0..clients {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut committed = Vec::new();
                for n in 0..writes_per_client {
                    let value = json!(format!("c{client}-{n}"));
                    let version = store.set("contended", value.clone()).await.expect("set");
                    committed.push((version, value));
                }
                committed
            }));
        }

        let mut all: Vec<(ConfigVersion, ConfigValue)> = Vec::new();
        for task in tasks {
            all.extend(task.await.expect("join"));
        }

        // Versions over the single key's writes are unique and dense.
        let mut versions: Vec<u64> = all.iter().map(|(v, _)| v.0).collect();
        versions.sort_unstable();
        let expected: Vec<u64> = (1..=(clients * writes_per_client) as u64).collect();
        assert_eq!(versions, expected, "no duplicates, no gaps");

        // The final value is the one committed at the highest version.
        let (_, winning_value) = all.iter().max_by_key(|(v, _)| *v).expect("nonempty");
        assert_eq!(&store.get("contended").await.expect("get"), winning_value);
    }

    #[rstest]
    #[case(SubscriptionFilter::All, "anything", true)]
    #[case(SubscriptionFilter::Key { key: ConfigKey(String::from("a.b")) }, "a.b", true)]
    #[case(SubscriptionFilter::Key { key: ConfigKey(String::from("a.b")) }, "a.c", false)]
    #[case(SubscriptionFilter::Prefix { prefix: String::from("a.") }, "a.c", true)]
    #[case(SubscriptionFilter::Prefix { prefix: String::from("a.") }, "b.a", false)]
    fn filter_matching(
        #[case] filter: SubscriptionFilter,
        #[case] key: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(filter.matches(&ConfigKey::from(key)), expected);
    }

    #[test]
    fn deep_merge_nested_objects() {
        let mut base = json!({"a": {"x": 1, "y": {"deep": true}}, "b": 2});
        deep_merge(&mut base, json!({"a": {"y": {"deep": false}, "z": 3}}));
        assert_eq!(
            base,
            json!({"a": {"x": 1, "y": {"deep": false}, "z": 3}, "b": 2})
        );
    }
}
