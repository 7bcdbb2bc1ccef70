//! Admin operations that change a key outside the reconciliation loop:
//! issuing, renewing and moving keys between hosts.
//!
//! Each operation writes to the remote panel first and to the local store
//! second, so a failed remote write leaves the local record unchanged.

use std::sync::Arc;

use keyward_core::db::MS_PER_DAY;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::correlation::{CorrelationError, CorrelationId};
use crate::panel::{PanelError, RemotePanel};
use crate::storage::{DatabaseError, Host, HostRegistry, Key, KeyStore, NewKey};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Store(#[from] DatabaseError),

    #[error(transparent)]
    Panel(#[from] PanelError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Unknown user: {0}")]
    UnknownUser(i64),

    #[error("Key {key_id} already lives on {host}")]
    SameHost { key_id: i64, host: String },

    #[error("Duration must be at least one day")]
    InvalidDays,
}

/// Result of [`KeyLifecycle::migrate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub key: Key,
    pub source_host: String,
    /// Whether the credential was removed from the source panel.
    pub source_removed: bool,
}

pub struct KeyLifecycle {
    hosts: Arc<dyn HostRegistry>,
    keys: Arc<dyn KeyStore>,
    panel: Arc<dyn RemotePanel>,
}

impl KeyLifecycle {
    pub fn new(
        hosts: Arc<dyn HostRegistry>,
        keys: Arc<dyn KeyStore>,
        panel: Arc<dyn RemotePanel>,
    ) -> Self {
        Self { hosts, keys, panel }
    }

    async fn host(&self, name: &str) -> Result<Host, LifecycleError> {
        self.hosts
            .list_hosts()
            .await?
            .into_iter()
            .find(|h| h.name == name)
            .ok_or_else(|| LifecycleError::UnknownHost(name.to_string()))
    }

    /// Create a key for `user_id` on `host_name`, valid for `days`.
    #[instrument(skip(self, comment))]
    pub async fn issue(
        &self,
        user_id: i64,
        host_name: &str,
        days: u32,
        comment: &str,
        now_ms: i64,
    ) -> Result<Key, LifecycleError> {
        let span = validity_ms(days)?;
        if !self.keys.user_exists(user_id).await? {
            return Err(LifecycleError::UnknownUser(user_id));
        }
        let host = self.host(host_name).await?;
        let correlation_id = CorrelationId::generate(user_id)?.to_string();
        let expiry_ms = now_ms.saturating_add(span);

        let session = self.panel.connect(&host).await?;
        let remote_id = session
            .create_or_update(host.inbound_id, &correlation_id, expiry_ms)
            .await?;

        let key = self
            .keys
            .add_key(&NewKey {
                user_id,
                host_name: &host.name,
                correlation_id: &correlation_id,
                remote_id: Some(&remote_id),
                expiry_ms,
                comment,
                is_gift: false,
            })
            .await?;
        info!(key_id = key.id, %correlation_id, "Key issued");
        Ok(key)
    }

    /// Extend a key by `days`, counted from its expiry or from now if it
    /// already lapsed.
    #[instrument(skip(self))]
    pub async fn renew(&self, key_id: i64, days: u32, now_ms: i64) -> Result<Key, LifecycleError> {
        let span = validity_ms(days)?;
        let key = self.keys.get_key(key_id).await?;
        let host = self.host(&key.host_name).await?;
        let expiry_ms = key.expiry_ms.max(now_ms).saturating_add(span);

        let session = self.panel.connect(&host).await?;
        let remote_id = session
            .create_or_update(host.inbound_id, &key.correlation_id, expiry_ms)
            .await?;
        self.keys
            .update_remote_link(key.id, &remote_id, expiry_ms)
            .await?;

        info!(expiry_ms, "Key renewed");
        Ok(Key {
            remote_id: Some(remote_id),
            expiry_ms,
            ..key
        })
    }

    /// Move a key to `target_host`, keeping its correlation id and expiry.
    /// Removal from the source host is best-effort and reported in
    /// [`Migration::source_removed`].
    #[instrument(skip(self))]
    pub async fn migrate(
        &self,
        key_id: i64,
        target_host: &str,
    ) -> Result<Migration, LifecycleError> {
        let key = self.keys.get_key(key_id).await?;
        if key.host_name == target_host {
            return Err(LifecycleError::SameHost {
                key_id,
                host: key.host_name,
            });
        }
        let target = self.host(target_host).await?;

        let session = self.panel.connect(&target).await?;
        let remote_id = session
            .create_or_update(target.inbound_id, &key.correlation_id, key.expiry_ms)
            .await?;
        self.keys
            .migrate_host(key.id, &target.name, &remote_id, key.expiry_ms)
            .await?;

        let source_removed = match self.remove_from_source(&key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(source = %key.host_name, error = %e, "Removing key from source host failed");
                false
            }
        };

        info!(source = %key.host_name, target = %target.name, source_removed, "Key migrated");
        let source_host = key.host_name.clone();
        Ok(Migration {
            key: Key {
                host_name: target.name,
                remote_id: Some(remote_id),
                ..key
            },
            source_host,
            source_removed,
        })
    }

    async fn remove_from_source(&self, key: &Key) -> Result<bool, LifecycleError> {
        let source = self.host(&key.host_name).await?;
        let session = self.panel.connect(&source).await?;

        let remote_id = match &key.remote_id {
            Some(id) => id.clone(),
            None => {
                let found = session
                    .list_credentials(source.inbound_id)
                    .await?
                    .into_iter()
                    .find(|c| c.correlation_id == key.correlation_id);
                match found {
                    Some(c) => c.remote_id,
                    None => return Ok(false),
                }
            }
        };
        session.delete(source.inbound_id, &remote_id).await?;
        Ok(true)
    }
}

fn validity_ms(days: u32) -> Result<i64, LifecycleError> {
    if days == 0 {
        return Err(LifecycleError::InvalidDays);
    }
    Ok(i64::from(days) * MS_PER_DAY)
}
