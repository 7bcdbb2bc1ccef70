//! Database queries for users, hosts and keys.

use keyward_core::db::{unix_timestamp, unix_timestamp_ms};

use super::db::{Database, DatabaseError};
use super::models::{Host, Key, NewKey, User};

/// Parameters for registering a host.
#[derive(Debug, Clone, Default)]
pub struct NewHost<'a> {
    pub name: &'a str,
    pub panel_url: &'a str,
    pub panel_username: &'a str,
    pub panel_password: &'a str,
    pub inbound_id: i64,
    pub ssh_host: Option<&'a str>,
    pub ssh_port: Option<u16>,
    pub ssh_user: Option<&'a str>,
    pub ssh_identity_file: Option<&'a str>,
}

impl Database {
    // =========================================================================
    // User queries
    // =========================================================================

    /// Create a user, or leave an existing one untouched.
    pub async fn ensure_user(
        &self,
        id: i64,
        username: Option<&str>,
    ) -> Result<User, DatabaseError> {
        sqlx::query("INSERT OR IGNORE INTO users (id, username, created_at) VALUES (?, ?, ?)")
            .bind(id)
            .bind(username)
            .bind(unix_timestamp())
            .execute(self.pool())
            .await?;

        self.get_user(id).await
    }

    pub async fn get_user(&self, id: i64) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User {id}")))
    }

    pub async fn has_user(&self, id: i64) -> Result<bool, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE id = ?")
            .bind(id)
            .fetch_one(self.pool())
            .await?;
        Ok(row.0 > 0)
    }

    // =========================================================================
    // Host queries
    // =========================================================================

    /// Register a host.
    pub async fn create_host(&self, host: &NewHost<'_>) -> Result<Host, DatabaseError> {
        sqlx::query(
            "INSERT INTO hosts (name, panel_url, panel_username, panel_password, inbound_id, \
             ssh_host, ssh_port, ssh_user, ssh_identity_file, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(host.name)
        .bind(host.panel_url)
        .bind(host.panel_username)
        .bind(host.panel_password)
        .bind(host.inbound_id)
        .bind(host.ssh_host)
        .bind(host.ssh_port.map(i64::from))
        .bind(host.ssh_user)
        .bind(host.ssh_identity_file)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_host(host.name).await
    }

    pub async fn get_host(&self, name: &str) -> Result<Host, DatabaseError> {
        sqlx::query_as::<_, Host>("SELECT * FROM hosts WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Host {name}")))
    }

    pub async fn all_hosts(&self) -> Result<Vec<Host>, DatabaseError> {
        let hosts = sqlx::query_as::<_, Host>("SELECT * FROM hosts ORDER BY name")
            .fetch_all(self.pool())
            .await?;
        Ok(hosts)
    }

    // =========================================================================
    // Key queries
    // =========================================================================

    /// Insert a key. A duplicate correlation id yields [`DatabaseError::Conflict`].
    pub async fn create_key(&self, key: &NewKey<'_>) -> Result<Key, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO keys (user_id, host_name, correlation_id, remote_id, expiry_ms, \
             created_at_ms, comment, is_gift) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(key.user_id)
        .bind(key.host_name)
        .bind(key.correlation_id)
        .bind(key.remote_id)
        .bind(key.expiry_ms)
        .bind(unix_timestamp_ms())
        .bind(key.comment)
        .bind(key.is_gift)
        .execute(self.pool())
        .await?;

        self.find_key(result.last_insert_rowid()).await
    }

    pub async fn find_key(&self, id: i64) -> Result<Key, DatabaseError> {
        sqlx::query_as::<_, Key>("SELECT * FROM keys WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Key {id}")))
    }

    pub async fn find_key_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Key>, DatabaseError> {
        let key = sqlx::query_as::<_, Key>("SELECT * FROM keys WHERE correlation_id = ?")
            .bind(correlation_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(key)
    }

    pub async fn list_keys_by_host(&self, host_name: &str) -> Result<Vec<Key>, DatabaseError> {
        let keys = sqlx::query_as::<_, Key>("SELECT * FROM keys WHERE host_name = ? ORDER BY id")
            .bind(host_name)
            .fetch_all(self.pool())
            .await?;
        Ok(keys)
    }

    pub async fn list_keys(&self) -> Result<Vec<Key>, DatabaseError> {
        let keys = sqlx::query_as::<_, Key>("SELECT * FROM keys ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(keys)
    }

    /// Overwrite the remote link and expiry of a key.
    pub async fn set_remote_link(
        &self,
        id: i64,
        remote_id: &str,
        expiry_ms: i64,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE keys SET remote_id = ?, expiry_ms = ? WHERE id = ?")
            .bind(remote_id)
            .bind(expiry_ms)
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Key {id}")));
        }
        Ok(())
    }

    /// Move a key to another host, replacing host, remote id and expiry together.
    pub async fn move_key(
        &self,
        id: i64,
        host_name: &str,
        remote_id: &str,
        expiry_ms: i64,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE keys SET host_name = ?, remote_id = ?, expiry_ms = ? WHERE id = ?",
        )
        .bind(host_name)
        .bind(remote_id)
        .bind(expiry_ms)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Key {id}")));
        }
        Ok(())
    }

    /// Remove a key. Returns `false` if it was already gone.
    pub async fn remove_key(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM keys WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
