//! Framed proxy protocol for the config store.
//!
//! One connection serves request/response pairs until the client either
//! goes away or sends `Subscribe`, after which the connection becomes a
//! dedicated event stream. Cancellation is the client closing its endpoint.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use foreman_core::types::{ConfigKey, ConfigSnapshot, ConfigValue, ConfigVersion};
use foreman_transport::{Endpoint, TransportError};

use crate::error::StoreError;
use crate::store::{ConfigChange, StoreHandle, SubscriptionFilter};

/// Client-to-store messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreRequest {
    Get { key: ConfigKey },
    Set { key: ConfigKey, value: ConfigValue },
    Merge { key: ConfigKey, value: ConfigValue },
    Snapshot,
    Subscribe { filter: SubscriptionFilter },
}

/// Store-to-client messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum StoreReply {
    Value { value: ConfigValue },
    NotFound { key: ConfigKey },
    Committed { version: ConfigVersion },
    Snapshot { snapshot: ConfigSnapshot },
    Subscribed,
    Event { change: ConfigChange },
    Overflowed,
    Error { message: String },
}

/// Serve one client connection against the store.
///
/// Returns `Ok(())` when the peer disconnects; protocol-level failures are
/// reported to the peer as [`StoreReply::Error`] and do not end the
/// connection.
pub async fn serve_connection(
    mut endpoint: Endpoint,
    store: StoreHandle,
) -> Result<(), StoreError> {
    loop {
        let request: StoreRequest = match endpoint.recv_wait().await {
            Ok(request) => request,
            Err(TransportError::Closed) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let reply = match request {
            StoreRequest::Get { key } => match store.get(key).await {
                Ok(value) => StoreReply::Value { value },
                Err(StoreError::NotFound { key }) => StoreReply::NotFound { key },
                Err(err) => StoreReply::Error {
                    message: err.to_string(),
                },
            },
            StoreRequest::Set { key, value } => match store.set(key, value).await {
                Ok(version) => StoreReply::Committed { version },
                Err(err) => StoreReply::Error {
                    message: err.to_string(),
                },
            },
            StoreRequest::Merge { key, value } => match store.merge(key, value).await {
                Ok(version) => StoreReply::Committed { version },
                Err(err) => StoreReply::Error {
                    message: err.to_string(),
                },
            },
            StoreRequest::Snapshot => match store.snapshot().await {
                Ok(snapshot) => StoreReply::Snapshot { snapshot },
                Err(err) => StoreReply::Error {
                    message: err.to_string(),
                },
            },
            StoreRequest::Subscribe { filter } => {
                return stream_events(endpoint, store, filter).await;
            }
        };

        match endpoint.send(&reply).await {
            Ok(()) => {}
            Err(TransportError::Closed) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
}

/// After `Subscribe`, the connection carries only `Event` frames until the
/// client closes its endpoint, the store shuts down, or the subscriber
/// overflows.
async fn stream_events(
    mut endpoint: Endpoint,
    store: StoreHandle,
    filter: SubscriptionFilter,
) -> Result<(), StoreError> {
    let mut subscription = match store.subscribe(filter).await {
        Ok(subscription) => subscription,
        Err(err) => {
            let _ = endpoint
                .send(&StoreReply::Error {
                    message: err.to_string(),
                })
                .await;
            return Err(err);
        }
    };

    if let Err(TransportError::Closed) = endpoint.send(&StoreReply::Subscribed).await {
        return Ok(());
    }

    loop {
        match subscription.next().await {
            Ok(Some(change)) => match endpoint.send(&StoreReply::Event { change }).await {
                Ok(()) => {}
                Err(TransportError::Closed) => return Ok(()),
                Err(err) => return Err(err.into()),
            },
            Ok(None) => {
                endpoint.close().await;
                return Ok(());
            }
            Err(StoreError::SubscriberOverflow) => {
                let _ = endpoint.send(&StoreReply::Overflowed).await;
                endpoint.close().await;
                return Ok(());
            }
            Err(err) => return Err(err),
        }
    }
}

/// Worker-side proxy to a remote config store.
pub struct RemoteStore {
    endpoint: Endpoint,
    timeout: Duration,
}

impl RemoteStore {
    /// Wrap an already-connected endpoint (in-process deployments, tests).
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }

    /// Connect to the store's Unix socket.
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self, StoreError> {
        let endpoint = Endpoint::connect_unix(path).await?;
        Ok(Self::new(endpoint, timeout))
    }

    pub async fn get(&mut self, key: impl Into<ConfigKey>) -> Result<ConfigValue, StoreError> {
        let key = key.into();
        match self.call(StoreRequest::Get { key }).await? {
            StoreReply::Value { value } => Ok(value),
            StoreReply::NotFound { key } => Err(StoreError::NotFound { key }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set(
        &mut self,
        key: impl Into<ConfigKey>,
        value: ConfigValue,
    ) -> Result<ConfigVersion, StoreError> {
        match self
            .call(StoreRequest::Set {
                key: key.into(),
                value,
            })
            .await?
        {
            StoreReply::Committed { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    pub async fn merge(
        &mut self,
        key: impl Into<ConfigKey>,
        value: ConfigValue,
    ) -> Result<ConfigVersion, StoreError> {
        match self
            .call(StoreRequest::Merge {
                key: key.into(),
                value,
            })
            .await?
        {
            StoreReply::Committed { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    pub async fn snapshot(&mut self) -> Result<ConfigSnapshot, StoreError> {
        match self.call(StoreRequest::Snapshot).await? {
            StoreReply::Snapshot { snapshot } => Ok(snapshot),
            other => Err(unexpected(other)),
        }
    }

    /// Turn this connection into an event stream. The connection cannot be
    /// used for request/response calls afterwards.
    pub async fn subscribe(
        mut self,
        filter: SubscriptionFilter,
    ) -> Result<RemoteSubscription, StoreError> {
        match self.call(StoreRequest::Subscribe { filter }).await? {
            StoreReply::Subscribed => Ok(RemoteSubscription {
                endpoint: self.endpoint,
            }),
            other => Err(unexpected(other)),
        }
    }

    async fn call(&mut self, request: StoreRequest) -> Result<StoreReply, StoreError> {
        self.endpoint.send(&request).await?;
        let reply: StoreReply = self.endpoint.recv(self.timeout).await?;
        if let StoreReply::Error { message } = reply {
            return Err(StoreError::Protocol(message));
        }
        Ok(reply)
    }
}

/// Remote side of a subscription stream.
pub struct RemoteSubscription {
    endpoint: Endpoint,
}

impl RemoteSubscription {
    /// Next change event in commit order; `Ok(None)` when the store side
    /// closed the stream.
    pub async fn next(&mut self) -> Result<Option<ConfigChange>, StoreError> {
        match self.endpoint.recv_wait::<StoreReply>().await {
            Ok(StoreReply::Event { change }) => Ok(Some(change)),
            Ok(StoreReply::Overflowed) => Err(StoreError::SubscriberOverflow),
            Ok(other) => Err(unexpected(other)),
            Err(TransportError::Closed) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Cancel by closing the endpoint; the store side cleans up on its next
    /// delivery attempt.
    pub async fn cancel(mut self) {
        self.endpoint.close().await;
    }
}

fn unexpected(reply: StoreReply) -> StoreError {
    StoreError::Protocol(format!("unexpected reply: {reply:?}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConfigStore;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn remote_pair() -> (RemoteStore, StoreHandle) {
        let (handle, _join) = ConfigStore::spawn(8, None).expect("spawn store");
        let (server_end, client_end) = Endpoint::pair();
        tokio::spawn(serve_connection(server_end, handle.clone()));
        (RemoteStore::new(client_end, TIMEOUT), handle)
    }

    #[tokio::test]
    async fn remote_set_and_get() {
        let (mut remote, _handle) = remote_pair();
        let version = remote.set("db.host", json!("alpha")).await.expect("set");
        assert_eq!(version, ConfigVersion(1));
        assert_eq!(remote.get("db.host").await.expect("get"), json!("alpha"));
    }

    #[tokio::test]
    async fn remote_get_missing_is_not_found() {
        let (mut remote, _handle) = remote_pair();
        let err = remote.get("absent").await.expect_err("missing");
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn remote_merge_and_snapshot() {
        let (mut remote, _handle) = remote_pair();
        remote.set("svc", json!({"a": 1})).await.expect("set");
        remote.merge("svc", json!({"b": 2})).await.expect("merge");

        let snapshot = remote.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.version, ConfigVersion(2));
        assert_eq!(
            snapshot.get(&ConfigKey::from("svc")),
            Some(&json!({"a": 1, "b": 2}))
        );
    }

    #[tokio::test]
    async fn remote_subscription_streams_commits_in_order() {
        let (remote, handle) = remote_pair();
        let mut events = remote
            .subscribe(SubscriptionFilter::Key {
                key: ConfigKey::from("x"),
            })
            .await
            .expect("subscribe");

        handle.set("x", json!(1)).await.expect("set");
        handle.set("y", json!("ignored")).await.expect("set");
        handle.set("x", json!(2)).await.expect("set");

        let first = events.next().await.expect("recv").expect("event");
        assert_eq!((first.version, first.value), (ConfigVersion(1), json!(1)));
        let second = events.next().await.expect("recv").expect("event");
        assert_eq!((second.version, second.value), (ConfigVersion(3), json!(2)));
    }

    #[tokio::test]
    async fn canceled_remote_subscription_leaves_store_healthy() {
        let (remote, handle) = remote_pair();
        let events = remote
            .subscribe(SubscriptionFilter::All)
            .await
            .expect("subscribe");
        events.cancel().await;

        // Store still commits and serves new connections.
        handle.set("x", json!(1)).await.expect("set");
        let (server_end, client_end) = Endpoint::pair();
        tokio::spawn(serve_connection(server_end, handle.clone()));
        let mut remote = RemoteStore::new(client_end, TIMEOUT);
        assert_eq!(remote.get("x").await.expect("get"), json!(1));
    }

    #[tokio::test]
    async fn worker_pinned_snapshot_is_isolated_from_later_writes() {
        let (mut remote, handle) = remote_pair();
        remote.set("x", json!("at-spawn")).await.expect("set");

        // Worker takes its startup snapshot, pinned at version 1.
        let pinned = remote.snapshot().await.expect("snapshot");

        // Later writes land after the pin.
        handle.set("x", json!("after-spawn")).await.expect("set");

        assert_eq!(pinned.version, ConfigVersion(1));
        assert_eq!(pinned.get(&ConfigKey::from("x")), Some(&json!("at-spawn")));

        // Re-snapshotting observes the new state.
        let fresh = remote.snapshot().await.expect("snapshot");
        assert_eq!(fresh.version, ConfigVersion(2));
        assert_eq!(fresh.get(&ConfigKey::from("x")), Some(&json!("after-spawn")));
    }
}
