//! Named async locks serializing mutations of shared host state.
//!
//! Editing the OpenLiteSpeed config, php.ini, or the ufw rule set from
//! two requests at once corrupts files or loses writes. Every mutating
//! operation acquires the lock for the resource it touches and holds the
//! guard until both the external change and the panel record are done.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held for the duration of a mutate sequence; released on drop.
pub type ResourceGuard = OwnedMutexGuard<()>;

/// Lock key for all backup create/delete/restore operations.
pub const BACKUP_KEY: &str = "backup";
/// Lock key for redis.conf edits and redis-server control.
pub const REDIS_KEY: &str = "redis";
/// Lock key for php.ini rewrites.
pub const PHP_INI_KEY: &str = "php.ini";
/// Lock key for httpd_config.conf edits not tied to a single vhost.
pub const HTTPD_CONF_KEY: &str = "httpd.conf";

pub fn vhost_key(domain: &str) -> String {
    format!("vhost:{domain}")
}

pub fn ssl_key(domain: &str) -> String {
    format!("ssl:{domain}")
}

pub fn firewall_key(rule_id: &str) -> String {
    format!("fw:{rule_id}")
}

pub fn extension_key(name: &str) -> String {
    format!("ext:{name}")
}

pub fn database_key(name: &str) -> String {
    format!("db:{name}")
}

/// Registry of named locks, created on first use.
#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the named lock, waiting if another task holds it.
    pub async fn acquire(&self, key: &str) -> ResourceGuard {
        let slot = {
            let mut locks = self.locks.lock().await;
            locks.entry(key.to_string()).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Drop entries no task holds or waits on. Returns how many were
    /// removed. Called from the maintenance loop so per-domain keys do
    /// not accumulate forever.
    pub async fn purge_unused(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_same_key_serializes_and_other_keys_do_not() {
        let registry = LockRegistry::new();
        let guard = registry.acquire(&vhost_key("example.com")).await;

        let blocked = timeout(
            Duration::from_millis(20),
            registry.acquire(&vhost_key("example.com")),
        )
        .await;
        assert!(blocked.is_err());

        let _other = timeout(
            Duration::from_millis(20),
            registry.acquire(&vhost_key("other.net")),
        )
        .await
        .unwrap();

        drop(guard);
        let reacquired = timeout(
            Duration::from_millis(20),
            registry.acquire(&vhost_key("example.com")),
        )
        .await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_purge_keeps_held_locks() {
        let registry = LockRegistry::new();
        let held = registry.acquire(BACKUP_KEY).await;
        let released = registry.acquire(REDIS_KEY).await;
        drop(released);

        assert_eq!(registry.purge_unused().await, 1);

        drop(held);
        assert_eq!(registry.purge_unused().await, 1);
    }
}
