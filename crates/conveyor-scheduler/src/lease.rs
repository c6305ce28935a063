//! Single-holder leases for maintenance passes.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use conveyor_core::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Proof of holding a lease until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseToken {
    pub key: String,
    pub id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl LeaseToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Mutual exclusion with a bounded hold time.
///
/// A lease that was never released becomes available again once it expires.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take the lease on `key` for `ttl`, or fail with [`Error::LeaseTaken`].
    ///
    /// A `ttl` that would expire past the end of representable time fails
    /// with [`Error::LeaseOutOfRange`].
    async fn try_obtain(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> Result<LeaseToken>;

    /// Give the lease back. Returns false if it expired and someone else took it.
    async fn release(&self, token: &LeaseToken) -> bool;
}

#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, LeaseToken>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_obtain(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> Result<LeaseToken> {
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| Error::LeaseOutOfRange {
                key: key.to_string(),
            })?;

        let mut leases = self.leases.lock().await;
        if let Some(held) = leases.get(key) {
            if !held.is_expired(now) {
                return Err(Error::LeaseTaken {
                    key: key.to_string(),
                });
            }
        }

        let token = LeaseToken {
            key: key.to_string(),
            id: Uuid::new_v4(),
            expires_at,
        };
        leases.insert(key.to_string(), token.clone());
        Ok(token)
    }

    async fn release(&self, token: &LeaseToken) -> bool {
        let mut leases = self.leases.lock().await;
        match leases.get(&token.key) {
            Some(held) if held.id == token.id => {
                leases.remove(&token.key);
                true
            }
            _ => false,
        }
    }
}
