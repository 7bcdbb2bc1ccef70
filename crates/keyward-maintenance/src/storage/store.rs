//! Storage seams consumed by the maintenance engines.
//!
//! The engines only see these traits; [`Database`] is the production
//! implementation. Correlation id uniqueness is enforced by the store.

use async_trait::async_trait;

use super::db::{Database, DatabaseError};
use super::models::{Host, Key, NewKey};

/// Read-only source of configured hosts.
#[async_trait]
pub trait HostRegistry: Send + Sync {
    async fn list_hosts(&self) -> Result<Vec<Host>, DatabaseError>;
}

/// Settings that may change while the orchestrator runs.
#[async_trait]
pub trait LiveSettings: Send + Sync {
    /// `None` when unset or not a positive integer.
    async fn snapshot_interval_days(&self) -> Result<Option<u32>, DatabaseError>;
}

/// CRUD over locally persisted keys.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn list_by_host(&self, host_name: &str) -> Result<Vec<Key>, DatabaseError>;

    async fn list_all(&self) -> Result<Vec<Key>, DatabaseError>;

    async fn get_key(&self, key_id: i64) -> Result<Key, DatabaseError>;

    async fn get_by_correlation_id(&self, correlation_id: &str)
    -> Result<Option<Key>, DatabaseError>;

    async fn add_key(&self, key: &NewKey<'_>) -> Result<Key, DatabaseError>;

    async fn update_remote_link(
        &self,
        key_id: i64,
        remote_id: &str,
        expiry_ms: i64,
    ) -> Result<(), DatabaseError>;

    /// Replace host, remote id and expiry in one write.
    async fn migrate_host(
        &self,
        key_id: i64,
        host_name: &str,
        remote_id: &str,
        expiry_ms: i64,
    ) -> Result<(), DatabaseError>;

    /// Returns `false` if the key did not exist.
    async fn delete_key(&self, key_id: i64) -> Result<bool, DatabaseError>;

    async fn user_exists(&self, user_id: i64) -> Result<bool, DatabaseError>;
}

#[async_trait]
impl HostRegistry for Database {
    async fn list_hosts(&self) -> Result<Vec<Host>, DatabaseError> {
        self.all_hosts().await
    }
}

#[async_trait]
impl KeyStore for Database {
    async fn list_by_host(&self, host_name: &str) -> Result<Vec<Key>, DatabaseError> {
        self.list_keys_by_host(host_name).await
    }

    async fn list_all(&self) -> Result<Vec<Key>, DatabaseError> {
        self.list_keys().await
    }

    async fn get_key(&self, key_id: i64) -> Result<Key, DatabaseError> {
        self.find_key(key_id).await
    }

    async fn get_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Key>, DatabaseError> {
        self.find_key_by_correlation_id(correlation_id).await
    }

    async fn add_key(&self, key: &NewKey<'_>) -> Result<Key, DatabaseError> {
        self.create_key(key).await
    }

    async fn update_remote_link(
        &self,
        key_id: i64,
        remote_id: &str,
        expiry_ms: i64,
    ) -> Result<(), DatabaseError> {
        self.set_remote_link(key_id, remote_id, expiry_ms).await
    }

    async fn migrate_host(
        &self,
        key_id: i64,
        host_name: &str,
        remote_id: &str,
        expiry_ms: i64,
    ) -> Result<(), DatabaseError> {
        self.move_key(key_id, host_name, remote_id, expiry_ms).await
    }

    async fn delete_key(&self, key_id: i64) -> Result<bool, DatabaseError> {
        self.remove_key(key_id).await
    }

    async fn user_exists(&self, user_id: i64) -> Result<bool, DatabaseError> {
        self.has_user(user_id).await
    }
}

#[async_trait]
impl LiveSettings for Database {
    async fn snapshot_interval_days(&self) -> Result<Option<u32>, DatabaseError> {
        Self::snapshot_interval_days(self).await
    }
}
