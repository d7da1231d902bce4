//! Per-user entitlement change notifications
//!
//! The registry is an explicit object owned by [`crate::BillingService`];
//! subscribers hold `tokio::sync::broadcast` receivers that close when the
//! registry shuts down.

use std::collections::{BTreeSet, HashMap};

use kindred_shared::Tier;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::entitlement::Feature;

const CHANNEL_CAPACITY: usize = 16;

/// Published after an entitlement recompute changed something
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitlementChanged {
    pub user_id: Uuid,
    pub previous_tier: Tier,
    pub tier: Tier,
    pub features: BTreeSet<Feature>,
    pub boosts_remaining: i32,
    pub super_likes_remaining: i32,
    pub changed_at: OffsetDateTime,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<Uuid, broadcast::Sender<EntitlementChanged>>,
    closed: bool,
}

/// Registry of per-user broadcast channels
#[derive(Default)]
pub struct EntitlementBroadcaster {
    registry: Mutex<Registry>,
}

impl EntitlementBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive future changes for one user. `None` once shut down.
    pub async fn subscribe(&self, user_id: Uuid) -> Option<broadcast::Receiver<EntitlementChanged>> {
        let mut registry = self.registry.lock().await;
        if registry.closed {
            return None;
        }
        let sender = registry
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Some(sender.subscribe())
    }

    /// Deliver to current subscribers; returns how many received it
    pub async fn publish(&self, change: EntitlementChanged) -> usize {
        let mut registry = self.registry.lock().await;
        let user_id = change.user_id;
        let Some(sender) = registry.channels.get(&user_id) else {
            return 0;
        };

        match sender.send(change) {
            Ok(receivers) => receivers,
            Err(_) => {
                // Every receiver is gone
                registry.channels.remove(&user_id);
                tracing::debug!(user_id = %user_id, "Dropped idle entitlement channel");
                0
            }
        }
    }

    /// Close every channel and refuse new subscriptions
    pub async fn shutdown(&self) {
        let mut registry = self.registry.lock().await;
        registry.closed = true;
        let count = registry.channels.len();
        registry.channels.clear();
        tracing::info!(channels = count, "Entitlement broadcaster shut down");
    }

    pub async fn subscriber_count(&self, user_id: Uuid) -> usize {
        self.registry
            .lock()
            .await
            .channels
            .get(&user_id)
            .map_or(0, |s| s.receiver_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(user_id: Uuid) -> EntitlementChanged {
        EntitlementChanged {
            user_id,
            previous_tier: Tier::Basic,
            tier: Tier::Premium,
            features: crate::entitlement::enabled_features(Tier::Premium),
            boosts_remaining: 1,
            super_likes_remaining: 0,
            changed_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_own_changes_only() {
        let broadcaster = EntitlementBroadcaster::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut rx = broadcaster.subscribe(alice).await.unwrap();

        assert_eq!(broadcaster.publish(change(bob)).await, 0);
        assert_eq!(broadcaster.publish(change(alice)).await, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.user_id, alice);
        assert_eq!(received.tier, Tier::Premium);
    }

    #[tokio::test]
    async fn test_idle_channel_is_dropped() {
        let broadcaster = EntitlementBroadcaster::new();
        let user_id = Uuid::new_v4();
        drop(broadcaster.subscribe(user_id).await.unwrap());

        assert_eq!(broadcaster.publish(change(user_id)).await, 0);
        assert_eq!(broadcaster.subscriber_count(user_id).await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_receivers() {
        let broadcaster = EntitlementBroadcaster::new();
        let user_id = Uuid::new_v4();
        let mut rx = broadcaster.subscribe(user_id).await.unwrap();

        broadcaster.shutdown().await;

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(broadcaster.subscribe(user_id).await.is_none());
    }
}
