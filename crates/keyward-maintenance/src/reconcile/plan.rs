//! Pure diff of one host's local keys against its remote credentials.
//!
//! No I/O happens here: [`plan_host`] takes snapshots of both sides and
//! returns the actions the engine should apply.

use std::collections::HashMap;

use keyward_core::config::MaintenanceConfig;

use crate::correlation::CorrelationId;
use crate::panel::RemoteCredential;
use crate::storage::Key;

/// Tunables that shape a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    pub grace_period_ms: i64,
    pub drift_tolerance_ms: i64,
}

impl ReconcilePolicy {
    pub fn from_config(config: &MaintenanceConfig) -> Self {
        Self {
            grace_period_ms: config.grace_period_ms(),
            drift_tolerance_ms: config.drift_tolerance_ms,
        }
    }
}

/// What to do with one local key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    /// Matched and within tolerance.
    Keep { key_id: i64 },
    /// Matched; overwrite the local remote id and expiry from the panel.
    Relink {
        key_id: i64,
        remote_id: String,
        expiry_ms: i64,
    },
    /// Past expiry plus grace. Best-effort remote delete, then local delete.
    Expire {
        key_id: i64,
        remote_id: Option<String>,
    },
    /// No remote counterpart while still inside grace.
    DropUnmatched { key_id: i64 },
}

impl KeyAction {
    pub const fn key_id(&self) -> i64 {
        match self {
            Self::Keep { key_id }
            | Self::Relink { key_id, .. }
            | Self::Expire { key_id, .. }
            | Self::DropUnmatched { key_id } => *key_id,
        }
    }
}

/// An orphan whose correlation id decodes to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adoption {
    pub user_id: i64,
    pub correlation_id: String,
    pub remote_id: String,
    pub expiry_ms: i64,
}

/// Why an orphan was left alone at planning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanSkip {
    /// Correlation id is not in the structured form.
    Undecodable,
    /// Panel reports no fixed expiry for it.
    NoFixedExpiry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredOrphan {
    pub correlation_id: String,
    pub reason: OrphanSkip,
}

/// Everything the engine should do for one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPlan {
    pub actions: Vec<KeyAction>,
    /// Sorted by correlation id.
    pub adoptions: Vec<Adoption>,
    pub ignored_orphans: Vec<IgnoredOrphan>,
}

impl HostPlan {
    /// Actions that will mutate local state.
    pub fn mutation_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| !matches!(a, KeyAction::Keep { .. }))
            .count()
            + self.adoptions.len()
    }
}

/// Diff `local` against `remote` at `now_ms`.
pub fn plan_host(
    local: &[Key],
    remote: Vec<RemoteCredential>,
    now_ms: i64,
    policy: &ReconcilePolicy,
) -> HostPlan {
    let mut by_correlation: HashMap<String, RemoteCredential> = remote
        .into_iter()
        .map(|c| (c.correlation_id.clone(), c))
        .collect();

    let mut plan = HostPlan::default();

    for key in local {
        let matched = by_correlation.remove(&key.correlation_id);

        if now_ms > key.expiry_ms.saturating_add(policy.grace_period_ms) {
            let remote_id = matched
                .map(|c| c.remote_id)
                .or_else(|| key.remote_id.clone());
            plan.actions.push(KeyAction::Expire {
                key_id: key.id,
                remote_id,
            });
            continue;
        }

        let action = match matched {
            Some(cred) => plan_matched(key, &cred, policy),
            None => KeyAction::DropUnmatched { key_id: key.id },
        };
        plan.actions.push(action);
    }

    let mut orphans: Vec<RemoteCredential> = by_correlation.into_values().collect();
    orphans.sort_by(|a, b| a.correlation_id.cmp(&b.correlation_id));

    for orphan in orphans {
        let Ok(id) = orphan.correlation_id.parse::<CorrelationId>() else {
            plan.ignored_orphans.push(IgnoredOrphan {
                correlation_id: orphan.correlation_id,
                reason: OrphanSkip::Undecodable,
            });
            continue;
        };
        if !orphan.has_fixed_expiry() {
            plan.ignored_orphans.push(IgnoredOrphan {
                correlation_id: orphan.correlation_id,
                reason: OrphanSkip::NoFixedExpiry,
            });
            continue;
        }
        let expiry_ms = orphan.effective_expiry_ms();
        plan.adoptions.push(Adoption {
            user_id: id.user_id(),
            correlation_id: orphan.correlation_id,
            remote_id: orphan.remote_id,
            expiry_ms,
        });
    }

    plan
}

fn plan_matched(key: &Key, cred: &RemoteCredential, policy: &ReconcilePolicy) -> KeyAction {
    if !cred.has_fixed_expiry() {
        return KeyAction::Keep { key_id: key.id };
    }
    let effective = cred.effective_expiry_ms();
    let drifted = effective.abs_diff(key.expiry_ms) > policy.drift_tolerance_ms.unsigned_abs();
    if drifted || key.remote_id.is_none() {
        KeyAction::Relink {
            key_id: key.id,
            remote_id: cred.remote_id.clone(),
            expiry_ms: effective,
        }
    } else {
        KeyAction::Keep { key_id: key.id }
    }
}
