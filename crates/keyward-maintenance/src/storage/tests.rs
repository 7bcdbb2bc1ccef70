//! Storage layer tests.

use super::db::{Database, DatabaseError};
use super::models::{LOCAL_SOURCE, NewKey, ProbeKind, ProbeRecord, TelemetryPoint};
use super::queries::NewHost;
use super::store::{HostRegistry, KeyStore};
use super::SNAPSHOT_INTERVAL_SETTING;

async fn test_db() -> Database {
    let db = Database::open_in_memory().await.unwrap();
    db.ensure_user(100, Some("alice")).await.unwrap();
    db.create_host(&NewHost {
        name: "fra-1",
        panel_url: "https://fra.example.net:2053/panel",
        panel_username: "admin",
        panel_password: "secret",
        inbound_id: 1,
        ..NewHost::default()
    })
    .await
    .unwrap();
    db
}

fn new_key<'a>(correlation_id: &'a str, expiry_ms: i64) -> NewKey<'a> {
    NewKey {
        user_id: 100,
        host_name: "fra-1",
        correlation_id,
        remote_id: None,
        expiry_ms,
        comment: "phone",
        is_gift: false,
    }
}

// === User tests ===

#[tokio::test]
async fn ensure_user_is_idempotent() {
    let db = test_db().await;
    let again = db.ensure_user(100, Some("renamed")).await.unwrap();
    assert_eq!(again.username.as_deref(), Some("alice"));
    assert!(db.user_exists(100).await.unwrap());
    assert!(!db.user_exists(200).await.unwrap());
}

// === Host tests ===

#[tokio::test]
async fn hosts_listed_by_name() {
    let db = test_db().await;
    db.create_host(&NewHost {
        name: "ams-1",
        panel_url: "https://ams.example.net",
        panel_username: "admin",
        panel_password: "pw",
        inbound_id: 3,
        ssh_user: Some("root"),
        ssh_port: Some(2222),
        ..NewHost::default()
    })
    .await
    .unwrap();

    let hosts = HostRegistry::list_hosts(&db).await.unwrap();
    let names: Vec<_> = hosts.iter().map(|h| h.name.as_str()).collect();
    assert_eq!(names, vec!["ams-1", "fra-1"]);

    let ssh = hosts[0].ssh_target().unwrap();
    assert_eq!(ssh.address, "ams.example.net");
    assert_eq!(ssh.port, 2222);
    assert!(hosts[1].ssh_target().is_none());
}

#[tokio::test]
async fn host_debug_redacts_password() {
    let db = test_db().await;
    let host = db.get_host("fra-1").await.unwrap();
    let rendered = format!("{host:?}");
    assert!(!rendered.contains("secret"));
    assert!(rendered.contains("fra-1"));
}

// === Key tests ===

#[tokio::test]
async fn create_and_find_key() {
    let db = test_db().await;
    let key = db.add_key(&new_key("u100-aaaa", 5_000)).await.unwrap();

    assert_eq!(key.user_id, 100);
    assert_eq!(key.host_name, "fra-1");
    assert!(key.remote_id.is_none());
    assert!(!key.is_gift);

    let found = db.get_by_correlation_id("u100-aaaa").await.unwrap().unwrap();
    assert_eq!(found, key);
    assert!(db.get_by_correlation_id("u100-bbbb").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_correlation_id_conflicts() {
    let db = test_db().await;
    db.add_key(&new_key("u100-aaaa", 5_000)).await.unwrap();
    let err = db.add_key(&new_key("u100-aaaa", 9_000)).await.unwrap_err();
    assert!(matches!(err, DatabaseError::Conflict(_)), "got {err:?}");
}

#[tokio::test]
async fn key_for_unknown_user_rejected() {
    let db = test_db().await;
    let mut key = new_key("u999-aaaa", 5_000);
    key.user_id = 999;
    assert!(db.add_key(&key).await.is_err());
}

#[tokio::test]
async fn update_remote_link_overwrites_expiry() {
    let db = test_db().await;
    let key = db.add_key(&new_key("u100-aaaa", 5_000)).await.unwrap();

    db.update_remote_link(key.id, "uuid-1", 8_000).await.unwrap();
    let updated = KeyStore::get_key(&db, key.id).await.unwrap();
    assert_eq!(updated.remote_id.as_deref(), Some("uuid-1"));
    assert_eq!(updated.expiry_ms, 8_000);

    let missing = db.update_remote_link(key.id + 1, "uuid-2", 1).await;
    assert!(matches!(missing, Err(DatabaseError::NotFound(_))));
}

#[tokio::test]
async fn migrate_host_replaces_all_three_fields() {
    let db = test_db().await;
    db.create_host(&NewHost {
        name: "ams-1",
        panel_url: "https://ams.example.net",
        panel_username: "admin",
        panel_password: "pw",
        inbound_id: 3,
        ..NewHost::default()
    })
    .await
    .unwrap();
    let key = db.add_key(&new_key("u100-aaaa", 5_000)).await.unwrap();

    db.migrate_host(key.id, "ams-1", "uuid-ams", 7_000)
        .await
        .unwrap();
    let moved = db.find_key(key.id).await.unwrap();
    assert_eq!(moved.host_name, "ams-1");
    assert_eq!(moved.remote_id.as_deref(), Some("uuid-ams"));
    assert_eq!(moved.expiry_ms, 7_000);
    assert!(db.list_by_host("fra-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_key_reports_presence() {
    let db = test_db().await;
    let key = db.add_key(&new_key("u100-aaaa", 5_000)).await.unwrap();
    assert!(db.delete_key(key.id).await.unwrap());
    assert!(!db.delete_key(key.id).await.unwrap());
    assert!(db.list_all().await.unwrap().is_empty());
}

// === Job tables ===

#[tokio::test]
async fn probe_results_newest_first() {
    let db = test_db().await;
    for (i, kind) in [ProbeKind::Light, ProbeKind::Thorough].into_iter().enumerate() {
        db.insert_probe_result(&ProbeRecord {
            host_name: "fra-1".into(),
            kind,
            ok: i == 0,
            latency_ms: Some(12.5),
            download_mbps: None,
            upload_mbps: None,
            error: (i == 1).then(|| "timeout".to_string()),
            measured_at_ms: 1_000 + i64::try_from(i).unwrap(),
        })
        .await
        .unwrap();
    }

    let rows = db.recent_probe_results("fra-1", 10).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].kind, "thorough");
    assert!(!rows[0].ok);
    assert_eq!(rows[0].error.as_deref(), Some("timeout"));
    assert_eq!(rows[1].kind, "light");
}

#[tokio::test]
async fn telemetry_is_append_only_series() {
    let db = test_db().await;
    for t in [10, 20, 30] {
        db.insert_telemetry_point(&TelemetryPoint {
            source: LOCAL_SOURCE.into(),
            load1: 0.5,
            load5: 0.4,
            load15: 0.3,
            mem_total_kb: 2_048_000,
            mem_available_kb: 1_024_000,
            recorded_at_ms: t,
        })
        .await
        .unwrap();
    }

    let points = db.telemetry_since(LOCAL_SOURCE, 20).await.unwrap();
    let times: Vec<_> = points.iter().map(|p| p.recorded_at_ms).collect();
    assert_eq!(times, vec![20, 30]);
    assert!(db.telemetry_since("fra-1", 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn snapshot_interval_setting_parses_positive_days() {
    let db = test_db().await;
    assert_eq!(db.snapshot_interval_days().await.unwrap(), None);

    db.set_setting(SNAPSHOT_INTERVAL_SETTING, "3").await.unwrap();
    assert_eq!(db.snapshot_interval_days().await.unwrap(), Some(3));

    db.set_setting(SNAPSHOT_INTERVAL_SETTING, "0").await.unwrap();
    assert_eq!(db.snapshot_interval_days().await.unwrap(), None);

    db.set_setting(SNAPSHOT_INTERVAL_SETTING, "weekly").await.unwrap();
    assert_eq!(db.snapshot_interval_days().await.unwrap(), None);
}

#[tokio::test]
async fn vacuum_into_writes_a_copy() {
    let db = test_db().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("copy.db");
    db.vacuum_into(&path).await.unwrap();

    let copy = Database::open(&path).await.unwrap();
    assert_eq!(copy.all_hosts().await.unwrap().len(), 1);
}
