//! Applies reconciliation plans host by host.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::plan::{Adoption, HostPlan, KeyAction, OrphanSkip, ReconcilePolicy, plan_host};
use crate::panel::{PanelError, PanelSession, RemotePanel};
use crate::storage::{DatabaseError, Host, HostRegistry, KeyStore, NewKey};

/// Whether a failure is worth retrying without operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

impl From<&PanelError> for FailureClass {
    fn from(e: &PanelError) -> Self {
        if e.is_transient() {
            Self::Transient
        } else {
            Self::Permanent
        }
    }
}

impl From<&DatabaseError> for FailureClass {
    fn from(e: &DatabaseError) -> Self {
        match e {
            DatabaseError::Connection(_) | DatabaseError::Io(_) => Self::Transient,
            _ => Self::Permanent,
        }
    }
}

/// Why an orphan produced no local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanMiss {
    Undecodable,
    NoFixedExpiry,
    UnknownUser,
    /// The correlation id already belongs to a key on another host.
    OwnedElsewhere,
}

impl From<OrphanSkip> for OrphanMiss {
    fn from(skip: OrphanSkip) -> Self {
        match skip {
            OrphanSkip::Undecodable => Self::Undecodable,
            OrphanSkip::NoFixedExpiry => Self::NoFixedExpiry,
        }
    }
}

/// Result of one unit of work within a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    Unchanged {
        key_id: i64,
    },
    Relinked {
        key_id: i64,
    },
    Expired {
        key_id: i64,
        remote_deleted: bool,
    },
    Dropped {
        key_id: i64,
    },
    Adopted {
        key_id: i64,
        user_id: i64,
    },
    OrphanIgnored {
        correlation_id: String,
        reason: OrphanMiss,
    },
    Failed {
        key_id: Option<i64>,
        correlation_id: Option<String>,
        class: FailureClass,
        error: String,
    },
}

impl KeyOutcome {
    /// Whether a local record was created, changed, or removed.
    pub const fn is_affected(&self) -> bool {
        matches!(
            self,
            Self::Relinked { .. }
                | Self::Expired { .. }
                | Self::Dropped { .. }
                | Self::Adopted { .. }
        )
    }
}

/// Stage at which a host was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStage {
    Authenticate,
    ListRemote,
    ListLocal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostStatus {
    Reconciled,
    Skipped {
        stage: HostStage,
        class: FailureClass,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReport {
    pub host: String,
    pub status: HostStatus,
    pub outcomes: Vec<KeyOutcome>,
}

impl HostReport {
    pub fn affected(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_affected()).count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, KeyOutcome::Failed { .. }))
            .count()
    }

    fn skipped(host: &str, stage: HostStage, class: FailureClass, error: String) -> Self {
        Self {
            host: host.to_string(),
            status: HostStatus::Skipped {
                stage,
                class,
                error,
            },
            outcomes: Vec::new(),
        }
    }
}

/// Aggregate of one full pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub hosts: Vec<HostReport>,
    /// Shutdown was observed before every host was visited.
    pub cancelled: bool,
}

impl ReconcileReport {
    /// Total local records affected across all hosts.
    pub fn affected(&self) -> usize {
        self.hosts.iter().map(HostReport::affected).sum()
    }

    pub fn host(&self, name: &str) -> Option<&HostReport> {
        self.hosts.iter().find(|h| h.host == name)
    }
}

/// Converges the key store against every host's panel.
pub struct Reconciler {
    hosts: Arc<dyn HostRegistry>,
    keys: Arc<dyn KeyStore>,
    panel: Arc<dyn RemotePanel>,
    policy: ReconcilePolicy,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Reconciler {
    pub fn new(
        hosts: Arc<dyn HostRegistry>,
        keys: Arc<dyn KeyStore>,
        panel: Arc<dyn RemotePanel>,
        policy: ReconcilePolicy,
    ) -> Self {
        Self {
            hosts,
            keys,
            panel,
            policy,
            shutdown: None,
        }
    }

    /// Stop between hosts once `shutdown` flips to `true`.
    pub fn set_shutdown(&mut self, shutdown: watch::Receiver<bool>) {
        self.shutdown = Some(shutdown);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// One full pass over all hosts.
    ///
    /// Only a failure to list hosts is returned as an error; everything
    /// below that is recorded in the report.
    pub async fn reconcile(&self, now_ms: i64) -> Result<ReconcileReport, DatabaseError> {
        let hosts = self.hosts.list_hosts().await?;
        let mut report = ReconcileReport::default();

        for host in &hosts {
            if self.shutdown_requested() {
                info!("Shutdown requested, stopping reconciliation between hosts");
                report.cancelled = true;
                break;
            }
            report.hosts.push(self.reconcile_host(host, now_ms).await);
        }

        info!(
            hosts = report.hosts.len(),
            affected = report.affected(),
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    #[instrument(skip_all, fields(host = %host.name))]
    async fn reconcile_host(&self, host: &Host, now_ms: i64) -> HostReport {
        let session = match self.panel.connect(host).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Panel authentication failed, skipping host");
                return HostReport::skipped(
                    &host.name,
                    HostStage::Authenticate,
                    (&e).into(),
                    e.to_string(),
                );
            }
        };

        let remote = match session.list_credentials(host.inbound_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Listing remote credentials failed, skipping host");
                return HostReport::skipped(
                    &host.name,
                    HostStage::ListRemote,
                    (&e).into(),
                    e.to_string(),
                );
            }
        };

        let local = match self.keys.list_by_host(&host.name).await {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, "Listing local keys failed, skipping host");
                return HostReport::skipped(
                    &host.name,
                    HostStage::ListLocal,
                    (&e).into(),
                    e.to_string(),
                );
            }
        };

        let plan = plan_host(&local, remote, now_ms, &self.policy);
        let outcomes = self.apply(host, session.as_ref(), plan).await;
        let report = HostReport {
            host: host.name.clone(),
            status: HostStatus::Reconciled,
            outcomes,
        };
        info!(
            affected = report.affected(),
            failures = report.failures(),
            "Host reconciled"
        );
        report
    }

    async fn apply(
        &self,
        host: &Host,
        session: &dyn PanelSession,
        plan: HostPlan,
    ) -> Vec<KeyOutcome> {
        let mut outcomes = Vec::with_capacity(plan.actions.len() + plan.adoptions.len());

        for action in plan.actions {
            outcomes.push(self.apply_action(host, session, action).await);
        }
        for adoption in plan.adoptions {
            outcomes.push(self.adopt(host, adoption).await);
        }
        outcomes.extend(
            plan.ignored_orphans
                .into_iter()
                .map(|o| KeyOutcome::OrphanIgnored {
                    correlation_id: o.correlation_id,
                    reason: o.reason.into(),
                }),
        );
        outcomes
    }

    async fn apply_action(
        &self,
        host: &Host,
        session: &dyn PanelSession,
        action: KeyAction,
    ) -> KeyOutcome {
        let key_id = action.key_id();
        let result = match action {
            KeyAction::Keep { .. } => return KeyOutcome::Unchanged { key_id },
            KeyAction::Relink {
                remote_id,
                expiry_ms,
                ..
            } => self
                .keys
                .update_remote_link(key_id, &remote_id, expiry_ms)
                .await
                .map(|()| KeyOutcome::Relinked { key_id }),
            KeyAction::Expire { remote_id, .. } => {
                let remote_deleted = match remote_id {
                    Some(rid) => match session.delete(host.inbound_id, &rid).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(
                                key_id,
                                error = %e,
                                "Remote delete of expired key failed, deleting locally anyway"
                            );
                            false
                        }
                    },
                    None => false,
                };
                self.keys
                    .delete_key(key_id)
                    .await
                    .map(|_| KeyOutcome::Expired {
                        key_id,
                        remote_deleted,
                    })
            }
            KeyAction::DropUnmatched { .. } => self
                .keys
                .delete_key(key_id)
                .await
                .map(|_| KeyOutcome::Dropped { key_id }),
        };

        result.unwrap_or_else(|e| {
            warn!(key_id, error = %e, "Key reconciliation failed");
            KeyOutcome::Failed {
                key_id: Some(key_id),
                correlation_id: None,
                class: (&e).into(),
                error: e.to_string(),
            }
        })
    }

    async fn adopt(&self, host: &Host, adoption: Adoption) -> KeyOutcome {
        let result = async {
            if !self.keys.user_exists(adoption.user_id).await? {
                return Ok(KeyOutcome::OrphanIgnored {
                    correlation_id: adoption.correlation_id.clone(),
                    reason: OrphanMiss::UnknownUser,
                });
            }
            if let Some(owner) = self
                .keys
                .get_by_correlation_id(&adoption.correlation_id)
                .await?
            {
                debug!(
                    correlation_id = %adoption.correlation_id,
                    owner_host = %owner.host_name,
                    "Orphan belongs to a key on another host, leaving it alone"
                );
                return Ok(KeyOutcome::OrphanIgnored {
                    correlation_id: adoption.correlation_id.clone(),
                    reason: OrphanMiss::OwnedElsewhere,
                });
            }
            let key = self
                .keys
                .add_key(&NewKey {
                    user_id: adoption.user_id,
                    host_name: &host.name,
                    correlation_id: &adoption.correlation_id,
                    remote_id: Some(&adoption.remote_id),
                    expiry_ms: adoption.expiry_ms,
                    comment: "",
                    is_gift: false,
                })
                .await?;
            info!(
                key_id = key.id,
                user_id = adoption.user_id,
                "Adopted orphan credential"
            );
            Ok::<_, DatabaseError>(KeyOutcome::Adopted {
                key_id: key.id,
                user_id: adoption.user_id,
            })
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!(correlation_id = %adoption.correlation_id, error = %e, "Orphan adoption failed");
            KeyOutcome::Failed {
                key_id: None,
                correlation_id: Some(adoption.correlation_id.clone()),
                class: (&e).into(),
                error: e.to_string(),
            }
        })
    }
}
