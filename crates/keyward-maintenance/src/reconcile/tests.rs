//! Reconciler tests against an in-memory store and a fake panel.

use std::sync::Arc;

use async_trait::async_trait;
use keyward_core::db::MS_PER_DAY;
use tokio::sync::watch;

use super::{
    FailureClass, HostStage, HostStatus, KeyOutcome, OrphanMiss, ReconcilePolicy, Reconciler,
};
use crate::panel::RemoteCredential;
use crate::storage::{Database, DatabaseError, Key, KeyStore, NewHost, NewKey};
use crate::testing::FakePanel;

const NOW: i64 = 1_700_000_000_000;

const POLICY: ReconcilePolicy = ReconcilePolicy {
    grace_period_ms: 5 * MS_PER_DAY,
    drift_tolerance_ms: 1000,
};

/// Key store that refuses to delete one key.
struct StuckDelete {
    db: Database,
    stuck: i64,
}

#[async_trait]
impl KeyStore for StuckDelete {
    async fn list_by_host(&self, host_name: &str) -> Result<Vec<Key>, DatabaseError> {
        self.db.list_by_host(host_name).await
    }

    async fn list_all(&self) -> Result<Vec<Key>, DatabaseError> {
        self.db.list_all().await
    }

    async fn get_key(&self, key_id: i64) -> Result<Key, DatabaseError> {
        self.db.get_key(key_id).await
    }

    async fn get_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Key>, DatabaseError> {
        self.db.get_by_correlation_id(correlation_id).await
    }

    async fn add_key(&self, key: &NewKey<'_>) -> Result<Key, DatabaseError> {
        self.db.add_key(key).await
    }

    async fn update_remote_link(
        &self,
        key_id: i64,
        remote_id: &str,
        expiry_ms: i64,
    ) -> Result<(), DatabaseError> {
        self.db.update_remote_link(key_id, remote_id, expiry_ms).await
    }

    async fn migrate_host(
        &self,
        key_id: i64,
        host_name: &str,
        remote_id: &str,
        expiry_ms: i64,
    ) -> Result<(), DatabaseError> {
        self.db
            .migrate_host(key_id, host_name, remote_id, expiry_ms)
            .await
    }

    async fn delete_key(&self, key_id: i64) -> Result<bool, DatabaseError> {
        if key_id == self.stuck {
            return Err(DatabaseError::Connection("database is locked".into()));
        }
        self.db.delete_key(key_id).await
    }

    async fn user_exists(&self, user_id: i64) -> Result<bool, DatabaseError> {
        self.db.user_exists(user_id).await
    }
}

struct Fixture {
    db: Database,
    panel: FakePanel,
    reconciler: Reconciler,
}

async fn fixture(hosts: &[&str]) -> Fixture {
    let db = Database::open_in_memory().await.unwrap();
    db.ensure_user(7, Some("alice")).await.unwrap();
    for &name in hosts {
        db.create_host(&NewHost {
            name,
            panel_url: "https://panel.example.net",
            panel_username: "admin",
            panel_password: "pw",
            inbound_id: 1,
            ..NewHost::default()
        })
        .await
        .unwrap();
    }
    let panel = FakePanel::new();
    let reconciler = Reconciler::new(
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        Arc::new(panel.clone()),
        POLICY,
    );
    Fixture {
        db,
        panel,
        reconciler,
    }
}

fn cred(remote_id: &str, correlation_id: &str, expiry_ms: i64) -> RemoteCredential {
    RemoteCredential {
        remote_id: remote_id.into(),
        correlation_id: correlation_id.into(),
        expiry_ms,
        reset_days: 0,
        enabled: true,
    }
}

async fn add_key(
    db: &Database,
    host: &str,
    correlation_id: &str,
    remote_id: &str,
    expiry_ms: i64,
) -> i64 {
    db.add_key(&NewKey {
        user_id: 7,
        host_name: host,
        correlation_id,
        remote_id: Some(remote_id),
        expiry_ms,
        comment: "laptop",
        is_gift: false,
    })
    .await
    .unwrap()
    .id
}

#[tokio::test]
async fn matched_keys_within_tolerance_are_untouched() {
    let f = fixture(&["fra-1"]).await;
    let expiry = NOW + 10 * MS_PER_DAY;
    let id = add_key(&f.db, "fra-1", "u7-a", "r1", expiry).await;
    f.panel.insert("fra-1", cred("r1", "u7-a", expiry + 999));

    let report = f.reconciler.reconcile(NOW).await.unwrap();

    assert_eq!(report.affected(), 0);
    assert_eq!(
        report.host("fra-1").unwrap().outcomes,
        vec![KeyOutcome::Unchanged { key_id: id }]
    );
    assert_eq!(f.db.get_key(id).await.unwrap().expiry_ms, expiry);
}

#[tokio::test]
async fn drift_is_corrected_from_remote() {
    let f = fixture(&["fra-1"]).await;
    let expiry = NOW + 10 * MS_PER_DAY;
    let drifted = add_key(&f.db, "fra-1", "u7-a", "r1", expiry).await;
    let close = add_key(&f.db, "fra-1", "u7-b", "r2", expiry).await;
    f.panel.insert("fra-1", cred("r1", "u7-a", expiry + 1500));
    f.panel.insert("fra-1", cred("r2", "u7-b", expiry + 500));

    let report = f.reconciler.reconcile(NOW).await.unwrap();

    assert_eq!(report.affected(), 1);
    assert_eq!(f.db.get_key(drifted).await.unwrap().expiry_ms, expiry + 1500);
    assert_eq!(f.db.get_key(close).await.unwrap().expiry_ms, expiry);
}

#[tokio::test]
async fn expired_key_deleted_even_when_remote_delete_fails() {
    let f = fixture(&["fra-1"]).await;
    let expiry = NOW - 6 * MS_PER_DAY;
    let id = add_key(&f.db, "fra-1", "u7-a", "r1", expiry).await;
    f.panel.insert("fra-1", cred("r1", "u7-a", expiry));
    f.panel.fail_delete("fra-1", true);

    let report = f.reconciler.reconcile(NOW).await.unwrap();

    assert_eq!(
        report.host("fra-1").unwrap().outcomes,
        vec![KeyOutcome::Expired {
            key_id: id,
            remote_deleted: false,
        }]
    );
    assert!(f.db.list_all().await.unwrap().is_empty());
    assert_eq!(f.panel.deletes(), vec![("fra-1".to_string(), "r1".to_string())]);
    // Still on the panel, but never adopted back.
    assert!(f.panel.find("fra-1", "u7-a").is_some());
}

#[tokio::test]
async fn key_missing_remotely_is_dropped() {
    let f = fixture(&["fra-1"]).await;
    let id = add_key(&f.db, "fra-1", "u7-a", "r1", NOW + MS_PER_DAY).await;

    let report = f.reconciler.reconcile(NOW).await.unwrap();

    assert_eq!(
        report.host("fra-1").unwrap().outcomes,
        vec![KeyOutcome::Dropped { key_id: id }]
    );
    assert!(f.db.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn orphan_adopted_once() {
    let f = fixture(&["fra-1"]).await;
    f.panel.insert("fra-1", cred("r-orphan", "u7-k3x9", NOW + 3 * MS_PER_DAY));

    let first = f.reconciler.reconcile(NOW).await.unwrap();
    assert_eq!(first.affected(), 1);
    let keys = f.db.list_all().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].user_id, 7);
    assert_eq!(keys[0].remote_id.as_deref(), Some("r-orphan"));
    assert_eq!(keys[0].expiry_ms, NOW + 3 * MS_PER_DAY);

    let second = f.reconciler.reconcile(NOW + 60_000).await.unwrap();
    assert_eq!(second.affected(), 0);
    assert_eq!(f.db.list_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn orphans_for_unknown_or_undecodable_users_are_left_alone() {
    let f = fixture(&["fra-1"]).await;
    f.panel.insert("fra-1", cred("r1", "u999-abc", NOW + MS_PER_DAY));
    f.panel.insert("fra-1", cred("r2", "bob@example.com", NOW + MS_PER_DAY));

    let report = f.reconciler.reconcile(NOW).await.unwrap();

    assert_eq!(report.affected(), 0);
    let outcomes = &report.host("fra-1").unwrap().outcomes;
    assert!(outcomes.contains(&KeyOutcome::OrphanIgnored {
        correlation_id: "u999-abc".into(),
        reason: OrphanMiss::UnknownUser,
    }));
    assert!(outcomes.contains(&KeyOutcome::OrphanIgnored {
        correlation_id: "bob@example.com".into(),
        reason: OrphanMiss::Undecodable,
    }));
    assert!(f.db.list_all().await.unwrap().is_empty());
    assert_eq!(f.panel.credentials("fra-1").len(), 2);
}

#[tokio::test]
async fn auth_failure_on_one_host_does_not_block_another() {
    let f = fixture(&["ams-1", "fra-1"]).await;
    let ams_key = add_key(&f.db, "ams-1", "u7-a", "r1", NOW + MS_PER_DAY).await;
    f.panel.fail_auth("ams-1", true);
    f.panel.insert("fra-1", cred("r2", "u7-b", NOW + MS_PER_DAY));

    let report = f.reconciler.reconcile(NOW).await.unwrap();

    let ams = report.host("ams-1").unwrap();
    assert!(matches!(
        ams.status,
        HostStatus::Skipped {
            stage: HostStage::Authenticate,
            class: FailureClass::Permanent,
            ..
        }
    ));
    // No local mutation for the skipped host.
    assert!(f.db.get_key(ams_key).await.is_ok());

    let fra = report.host("fra-1").unwrap();
    assert_eq!(fra.status, HostStatus::Reconciled);
    assert_eq!(fra.affected(), 1);
    assert_eq!(f.db.list_by_host("fra-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn listing_failure_is_transient_skip() {
    let f = fixture(&["fra-1"]).await;
    add_key(&f.db, "fra-1", "u7-a", "r1", NOW + MS_PER_DAY).await;
    f.panel.fail_listing("fra-1", true);

    let report = f.reconciler.reconcile(NOW).await.unwrap();

    assert!(matches!(
        report.host("fra-1").unwrap().status,
        HostStatus::Skipped {
            stage: HostStage::ListRemote,
            class: FailureClass::Transient,
            ..
        }
    ));
    assert_eq!(f.db.list_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn second_pass_is_a_noop() {
    let f = fixture(&["fra-1"]).await;
    let expiry = NOW + 4 * MS_PER_DAY;
    add_key(&f.db, "fra-1", "u7-a", "r1", expiry).await;
    add_key(&f.db, "fra-1", "u7-b", "r2", NOW - 8 * MS_PER_DAY).await;
    f.panel.insert("fra-1", cred("r1", "u7-a", expiry + 5_000));
    f.panel.insert("fra-1", cred("r3", "u7-c", expiry));

    let first = f.reconciler.reconcile(NOW).await.unwrap();
    assert_eq!(first.affected(), 3);

    let second = f.reconciler.reconcile(NOW).await.unwrap();
    assert_eq!(second.affected(), 0);
}

#[tokio::test]
async fn shutdown_stops_between_hosts() {
    let mut f = fixture(&["ams-1", "fra-1"]).await;
    let (tx, rx) = watch::channel(false);
    f.reconciler.set_shutdown(rx);
    tx.send(true).unwrap();

    let report = f.reconciler.reconcile(NOW).await.unwrap();

    assert!(report.cancelled);
    assert!(report.hosts.is_empty());
    assert!(f.panel.connects().is_empty());
}

#[tokio::test]
async fn failing_key_does_not_stop_the_rest_of_the_host() {
    let f = fixture(&["fra-1"]).await;
    let first = add_key(&f.db, "fra-1", "u7-a", "r1", NOW + MS_PER_DAY).await;
    let stuck = add_key(&f.db, "fra-1", "u7-b", "r2", NOW + MS_PER_DAY).await;
    let last = add_key(&f.db, "fra-1", "u7-c", "r3", NOW + MS_PER_DAY).await;
    let reconciler = Reconciler::new(
        Arc::new(f.db.clone()),
        Arc::new(StuckDelete {
            db: f.db.clone(),
            stuck,
        }),
        Arc::new(f.panel.clone()),
        POLICY,
    );

    let report = reconciler.reconcile(NOW).await.unwrap();

    let host = report.host("fra-1").unwrap();
    assert_eq!(host.status, HostStatus::Reconciled);
    assert_eq!(host.affected(), 2);
    assert_eq!(host.failures(), 1);
    assert!(host.outcomes.contains(&KeyOutcome::Dropped { key_id: first }));
    assert!(host.outcomes.contains(&KeyOutcome::Dropped { key_id: last }));
    assert!(host.outcomes.iter().any(|o| matches!(
        o,
        KeyOutcome::Failed {
            key_id: Some(id),
            class: FailureClass::Transient,
            ..
        } if *id == stuck
    )));
    let left: Vec<i64> = f.db.list_all().await.unwrap().iter().map(|k| k.id).collect();
    assert_eq!(left, vec![stuck]);
}

#[tokio::test]
async fn orphan_owned_by_another_host_is_left_alone() {
    let f = fixture(&["ams-1", "fra-1"]).await;
    let expiry = NOW + 10 * MS_PER_DAY;
    let moved = add_key(&f.db, "fra-1", "u7-moved", "r-fra", expiry).await;
    f.panel.insert("fra-1", cred("r-fra", "u7-moved", expiry));
    // Left behind on the source panel by a migration whose delete failed.
    f.panel.insert("ams-1", cred("r-ams", "u7-moved", expiry));

    for pass in 0..2 {
        let report = f.reconciler.reconcile(NOW + pass * 60_000).await.unwrap();
        let ams = report.host("ams-1").unwrap();
        assert_eq!(
            ams.outcomes,
            vec![KeyOutcome::OrphanIgnored {
                correlation_id: "u7-moved".into(),
                reason: OrphanMiss::OwnedElsewhere,
            }]
        );
        assert_eq!(ams.failures(), 0);
        assert_eq!(report.affected(), 0);
    }
    let key = f.db.get_key(moved).await.unwrap();
    assert_eq!(key.host_name, "fra-1");
    assert_eq!(f.db.list_all().await.unwrap().len(), 1);
}
