//! Public-id resolution for direct publishing.
//!
//! Publishing to a user requires their signed public channel id. The
//! resolver keeps a validity-aware cache and batches every cache miss
//! of one publish into a single list call.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::method_client::{METHOD_PUBLIC_LIST, MethodClient};

/// A signed public channel id for one user, valid for a time window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIdDescriptor {
    /// The user this id addresses.
    pub user_id: u64,
    /// Public channel id.
    pub public_id: String,
    /// Server signature over the id.
    pub signature: String,
    /// Unix seconds from which the id is valid.
    pub valid_from: i64,
    /// Unix seconds until which the id is valid.
    pub valid_to: i64,
}

impl PublicIdDescriptor {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() < self.valid_to
    }
}

/// Validity-aware cache over the public-id list method.
pub struct ChannelResolver {
    client: Arc<dyn MethodClient>,
    cache: DashMap<u64, PublicIdDescriptor>,
}

impl ChannelResolver {
    /// Build a resolver over a method client.
    pub fn new(client: Arc<dyn MethodClient>) -> Self {
        Self {
            client,
            cache: DashMap::new(),
        }
    }

    /// Resolve public ids for a set of users.
    ///
    /// Cache hits are served locally; every miss goes out in one
    /// batched call. Resolution never fails the publish: users the
    /// server does not return are simply absent from the result.
    pub async fn resolve(&self, user_ids: &[u64]) -> HashMap<u64, PublicIdDescriptor> {
        let now = Utc::now();
        let mut resolved = HashMap::new();
        let mut misses = Vec::new();
        for &user_id in user_ids {
            match self.cache.get(&user_id) {
                Some(entry) if entry.is_valid(now) => {
                    let _ = resolved.insert(user_id, entry.clone());
                }
                _ => misses.push(user_id),
            }
        }
        if misses.is_empty() {
            return resolved;
        }

        let response = self
            .client
            .call(METHOD_PUBLIC_LIST, json!({ "userIds": misses }))
            .await;
        let result = match response {
            Ok(response) => response.result,
            Err(err) => {
                warn!(%err, "public id lookup failed, publishing to cached subset");
                return resolved;
            }
        };
        let fetched: Vec<PublicIdDescriptor> = match serde_json::from_value(result) {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(%err, "unusable public id list payload");
                return resolved;
            }
        };
        for descriptor in fetched {
            if !descriptor.is_valid(now) {
                debug!(user_id = descriptor.user_id, "server returned expired public id");
                continue;
            }
            let _ = self.cache.insert(descriptor.user_id, descriptor.clone());
            let _ = resolved.insert(descriptor.user_id, descriptor);
        }
        resolved
    }

    /// Drop every cached id (restart).
    pub fn clear(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pulse_core::PulseError;
    use serde_json::Value;

    use crate::method_client::MethodResponse;

    struct ListClient {
        calls: Mutex<Vec<Value>>,
        response: Mutex<Result<Value, PulseError>>,
    }

    impl ListClient {
        fn returning(result: Value) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                response: Mutex::new(Ok(result)),
            })
        }
    }

    #[async_trait]
    impl MethodClient for ListClient {
        async fn call(&self, method: &str, params: Value) -> Result<MethodResponse, PulseError> {
            assert_eq!(method, METHOD_PUBLIC_LIST);
            self.calls.lock().push(params);
            match &*self.response.lock() {
                Ok(result) => Ok(MethodResponse {
                    result: result.clone(),
                    server_time: None,
                }),
                Err(_) => Err(PulseError::transport("list down")),
            }
        }
    }

    fn descriptor(user_id: u64, valid_to: i64) -> Value {
        json!({
            "userId": user_id,
            "publicId": format!("pub{user_id}"),
            "signature": "sig",
            "validFrom": 0,
            "validTo": valid_to,
        })
    }

    fn far_future() -> i64 {
        Utc::now().timestamp() + 86_400
    }

    #[tokio::test]
    async fn misses_go_out_in_one_batched_call() {
        let client = ListClient::returning(json!([
            descriptor(1, far_future()),
            descriptor(2, far_future()),
        ]));
        let resolver = ChannelResolver::new(client.clone());

        let resolved = resolver.resolve(&[1, 2]).await;
        assert_eq!(resolved.len(), 2);
        assert_eq!(client.calls.lock().len(), 1);
        assert_eq!(client.calls.lock()[0]["userIds"], json!([1, 2]));
    }

    #[tokio::test]
    async fn cache_hit_skips_the_network() {
        let client = ListClient::returning(json!([descriptor(1, far_future())]));
        let resolver = ChannelResolver::new(client.clone());

        let _ = resolver.resolve(&[1]).await;
        let resolved = resolver.resolve(&[1]).await;
        assert_eq!(resolved[&1].public_id, "pub1");
        assert_eq!(client.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn expired_cache_entry_is_refetched() {
        let client = ListClient::returning(json!([descriptor(1, 1)]));
        let resolver = ChannelResolver::new(client.clone());

        // First fetch returns an already-expired id, which is not kept.
        let resolved = resolver.resolve(&[1]).await;
        assert!(resolved.is_empty());
        let _ = resolver.resolve(&[1]).await;
        assert_eq!(client.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn lookup_failure_returns_cached_subset() {
        let client = ListClient::returning(json!([descriptor(1, far_future())]));
        let resolver = ChannelResolver::new(client.clone());
        let _ = resolver.resolve(&[1]).await;

        *client.response.lock() = Err(PulseError::transport("down"));
        let resolved = resolver.resolve(&[1, 2]).await;
        assert_eq!(resolved.len(), 1);
        assert!(resolved.contains_key(&1));
    }

    #[tokio::test]
    async fn clear_drops_cached_ids() {
        let client = ListClient::returning(json!([descriptor(1, far_future())]));
        let resolver = ChannelResolver::new(client.clone());
        let _ = resolver.resolve(&[1]).await;
        resolver.clear();
        let _ = resolver.resolve(&[1]).await;
        assert_eq!(client.calls.lock().len(), 2);
    }
}
