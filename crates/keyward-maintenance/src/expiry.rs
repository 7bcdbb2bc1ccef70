//! Expiry warnings, at most once per key per threshold.
//!
//! Dedup state lives in the [`ExpiryNotifier`] instance and is not persisted;
//! a restart may repeat the warning for the window currently open.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use keyward_core::db::MS_PER_HOUR;
use tracing::{debug, info, warn};

use crate::notify::Notifier;
use crate::storage::{DatabaseError, Key, KeyStore};

/// Thresholds already fired for one key.
#[derive(Debug, Clone)]
struct SentRecord {
    /// Expiry the thresholds were fired against. A renewal resets the set.
    expiry_ms: i64,
    thresholds: BTreeSet<u32>,
}

/// One delivered warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub user_id: i64,
    pub key_id: i64,
    pub threshold_hours: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    pub sent: Vec<Notice>,
    /// Deliveries that failed and will be retried.
    pub failed: usize,
    /// Matches suppressed because they were already delivered.
    pub suppressed: usize,
    /// Dedup entries dropped because their key is gone.
    pub collected: usize,
}

/// Remaining whole hours, counting the hour in progress.
pub const fn remaining_hours(expiry_ms: i64, now_ms: i64) -> i64 {
    (expiry_ms - now_ms).div_euclid(MS_PER_HOUR) + 1
}

/// First threshold `T` (descending) with `T-1 < remaining <= T`.
pub fn matching_threshold(thresholds: &[u32], remaining: i64) -> Option<u32> {
    thresholds.iter().copied().find(|&t| {
        let t = i64::from(t);
        t - 1 < remaining && remaining <= t
    })
}

pub struct ExpiryNotifier {
    keys: Arc<dyn KeyStore>,
    notifier: Arc<dyn Notifier>,
    /// Sorted descending, no duplicates.
    thresholds: Vec<u32>,
    sent: HashMap<i64, HashMap<i64, SentRecord>>,
}

impl ExpiryNotifier {
    pub fn new(keys: Arc<dyn KeyStore>, notifier: Arc<dyn Notifier>, thresholds: &[u32]) -> Self {
        let mut thresholds = thresholds.to_vec();
        thresholds.sort_unstable_by(|a, b| b.cmp(a));
        thresholds.dedup();
        Self {
            keys,
            notifier,
            thresholds,
            sent: HashMap::new(),
        }
    }

    pub fn thresholds(&self) -> &[u32] {
        &self.thresholds
    }

    /// Number of keys with dedup state.
    pub fn tracked_keys(&self) -> usize {
        self.sent.values().map(HashMap::len).sum()
    }

    /// Scan all keys and warn owners whose key entered a threshold window.
    pub async fn check_expiring(&mut self, now_ms: i64) -> Result<ExpiryReport, DatabaseError> {
        let keys = self.keys.list_all().await?;
        let mut report = ExpiryReport {
            collected: self.collect_garbage(&keys),
            ..ExpiryReport::default()
        };

        for key in keys.iter().filter(|k| !k.is_expired(now_ms)) {
            let remaining = remaining_hours(key.expiry_ms, now_ms);
            let Some(threshold) = matching_threshold(&self.thresholds, remaining) else {
                continue;
            };

            if self.already_sent(key, threshold) {
                report.suppressed += 1;
                continue;
            }

            let text = warning_text(key, threshold);
            let delivered = self.notifier.send(key.user_id, &text).await;
            match delivered {
                Ok(()) => {
                    self.mark_sent(key, threshold);
                    debug!(key_id = key.id, threshold, "Expiry warning delivered");
                    report.sent.push(Notice {
                        user_id: key.user_id,
                        key_id: key.id,
                        threshold_hours: threshold,
                    });
                }
                Err(e) => {
                    warn!(
                        key_id = key.id,
                        user_id = key.user_id,
                        threshold,
                        error = %e,
                        "Expiry warning delivery failed"
                    );
                    report.failed += 1;
                }
            }
        }

        if !report.sent.is_empty() || report.failed > 0 {
            info!(
                sent = report.sent.len(),
                failed = report.failed,
                "Expiry check complete"
            );
        }
        Ok(report)
    }

    fn collect_garbage(&mut self, keys: &[Key]) -> usize {
        let live: HashSet<(i64, i64)> = keys.iter().map(|k| (k.user_id, k.id)).collect();
        let mut collected = 0;
        self.sent.retain(|user_id, per_key| {
            let before = per_key.len();
            per_key.retain(|key_id, _| live.contains(&(*user_id, *key_id)));
            collected += before - per_key.len();
            !per_key.is_empty()
        });
        collected
    }

    fn already_sent(&self, key: &Key, threshold: u32) -> bool {
        self.sent
            .get(&key.user_id)
            .and_then(|per_key| per_key.get(&key.id))
            .is_some_and(|r| r.expiry_ms == key.expiry_ms && r.thresholds.contains(&threshold))
    }

    fn mark_sent(&mut self, key: &Key, threshold: u32) {
        let record = self
            .sent
            .entry(key.user_id)
            .or_default()
            .entry(key.id)
            .or_insert_with(|| SentRecord {
                expiry_ms: key.expiry_ms,
                thresholds: BTreeSet::new(),
            });
        if record.expiry_ms != key.expiry_ms {
            record.expiry_ms = key.expiry_ms;
            record.thresholds.clear();
        }
        record.thresholds.insert(threshold);
    }
}

fn warning_text(key: &Key, threshold: u32) -> String {
    let label = if key.comment.is_empty() {
        format!("#{}", key.id)
    } else {
        format!("\"{}\"", key.comment)
    };
    let span = if threshold == 1 {
        "1 hour".to_string()
    } else {
        format!("{threshold} hours")
    };
    format!(
        "Your key {label} on {} expires in less than {span}. Renew it to keep access.",
        key.host_name
    )
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::{Database, NewHost, NewKey};
    use crate::testing::RecordingNotifier;

    const NOW: i64 = 1_700_000_000_000;
    const MINUTE: i64 = 60_000;

    async fn setup(expiry_ms: i64) -> (Database, Arc<RecordingNotifier>, ExpiryNotifier, i64) {
        let db = Database::open_in_memory().await.unwrap();
        db.ensure_user(5, None).await.unwrap();
        db.create_host(&NewHost {
            name: "fra-1",
            panel_url: "https://fra.example.net",
            panel_username: "admin",
            panel_password: "pw",
            inbound_id: 1,
            ..NewHost::default()
        })
        .await
        .unwrap();
        let key = db
            .add_key(&NewKey {
                user_id: 5,
                host_name: "fra-1",
                correlation_id: "u5-abc",
                remote_id: Some("r1"),
                expiry_ms,
                comment: "phone",
                is_gift: false,
            })
            .await
            .unwrap();
        let recorder = Arc::new(RecordingNotifier::new());
        let engine =
            ExpiryNotifier::new(Arc::new(db.clone()), recorder.clone(), &[24, 72, 1, 48, 24]);
        (db, recorder, engine, key.id)
    }

    #[test]
    fn remaining_hours_counts_the_current_hour() {
        assert_eq!(remaining_hours(NOW + 47 * MS_PER_HOUR, NOW), 48);
        assert_eq!(remaining_hours(NOW + 47 * MS_PER_HOUR + 1, NOW), 48);
        assert_eq!(remaining_hours(NOW + 48 * MS_PER_HOUR - 1, NOW), 48);
        assert_eq!(remaining_hours(NOW + 1, NOW), 1);
    }

    #[test]
    fn threshold_window_is_half_open() {
        let thresholds = [72, 48, 24, 1];
        assert_eq!(matching_threshold(&thresholds, 48), Some(48));
        assert_eq!(matching_threshold(&thresholds, 47), None);
        assert_eq!(matching_threshold(&thresholds, 1), Some(1));
        assert_eq!(matching_threshold(&thresholds, 100), None);
    }

    #[tokio::test]
    async fn thresholds_sorted_descending_without_duplicates() {
        let (_db, _rec, engine, _) = setup(NOW).await;
        assert_eq!(engine.thresholds(), &[72, 48, 24, 1]);
    }

    #[tokio::test]
    async fn fires_once_then_suppresses() {
        let (_db, rec, mut engine, key_id) = setup(NOW + 47 * MS_PER_HOUR + 30 * MINUTE).await;

        let first = engine.check_expiring(NOW).await.unwrap();
        assert_eq!(
            first.sent,
            vec![Notice {
                user_id: 5,
                key_id,
                threshold_hours: 48,
            }]
        );
        assert!(rec.sent()[0].1.contains("48 hours"));
        assert!(rec.sent()[0].1.contains("\"phone\""));

        let later = engine.check_expiring(NOW + 10 * MINUTE).await.unwrap();
        assert!(later.sent.is_empty());
        assert_eq!(later.suppressed, 1);
        assert_eq!(rec.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_is_retried() {
        let (_db, rec, mut engine, _) = setup(NOW + 23 * MS_PER_HOUR).await;
        rec.set_failing(true);

        let failed = engine.check_expiring(NOW).await.unwrap();
        assert_eq!(failed.failed, 1);
        assert_eq!(engine.tracked_keys(), 0);

        rec.set_failing(false);
        let retried = engine.check_expiring(NOW + MINUTE).await.unwrap();
        assert_eq!(retried.sent.len(), 1);
        assert_eq!(rec.attempts(), 2);
    }

    #[tokio::test]
    async fn each_threshold_fires_exactly_once_across_a_simulated_countdown() {
        let expiry = NOW + 80 * MS_PER_HOUR;
        let (_db, rec, mut engine, _) = setup(expiry).await;

        let mut now = NOW;
        while now < expiry {
            engine.check_expiring(now).await.unwrap();
            now += 15 * MINUTE;
        }

        let fired: Vec<u32> = rec
            .sent()
            .iter()
            .map(|(_, text)| {
                engine
                    .thresholds()
                    .iter()
                    .copied()
                    .find(|t| {
                        let span = if *t == 1 {
                            "1 hour".to_string()
                        } else {
                            format!("{t} hours")
                        };
                        text.contains(&format!("less than {span}."))
                    })
                    .unwrap()
            })
            .collect();
        assert_eq!(fired, vec![72, 48, 24, 1]);
    }

    #[tokio::test]
    async fn renewal_resets_dedup_state() {
        let (db, rec, mut engine, key_id) = setup(NOW + 23 * MS_PER_HOUR).await;
        engine.check_expiring(NOW).await.unwrap();
        assert_eq!(rec.sent().len(), 1);

        // Renewed by 30 days, then the clock catches up to the new 24h window.
        let renewed = NOW + 23 * MS_PER_HOUR + 30 * 24 * MS_PER_HOUR;
        db.update_remote_link(key_id, "r1", renewed).await.unwrap();
        engine.check_expiring(renewed - 23 * MS_PER_HOUR).await.unwrap();
        assert_eq!(rec.sent().len(), 2);
    }

    #[tokio::test]
    async fn deleted_keys_are_garbage_collected() {
        let (db, _rec, mut engine, key_id) = setup(NOW + 23 * MS_PER_HOUR).await;
        engine.check_expiring(NOW).await.unwrap();
        assert_eq!(engine.tracked_keys(), 1);

        db.delete_key(key_id).await.unwrap();
        let report = engine.check_expiring(NOW + MINUTE).await.unwrap();
        assert_eq!(report.collected, 1);
        assert_eq!(engine.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn expired_keys_are_not_warned() {
        let (_db, rec, mut engine, _) = setup(NOW).await;
        engine.check_expiring(NOW).await.unwrap();
        assert!(rec.sent().is_empty());
    }
}
