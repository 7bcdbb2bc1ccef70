//! Keyward maintenance orchestrator
//!
//! Runs the reconciliation / expiry / host-job loop, or performs a single
//! operator action against the key registry.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use keyward_core::Config;
use keyward_core::config::load_config;
use keyward_core::db::unix_timestamp_ms;
use keyward_core::tracing_init::{default_filter, init_tracing};
use keyward_maintenance::expiry::ExpiryNotifier;
use keyward_maintenance::jobs::{NetworkProber, SqliteSnapshotter, SshRunner, SystemTelemetry};
use keyward_maintenance::lifecycle::KeyLifecycle;
use keyward_maintenance::notify::{DisabledNotifier, Notifier, NotifyError, TelegramNotifier};
use keyward_maintenance::panel::{RemotePanel, XuiPanel};
use keyward_maintenance::reconcile::{ReconcilePolicy, Reconciler};
use keyward_maintenance::scheduler::{Scheduler, SchedulerParts, SchedulerTimings, SnapshotPolicy};
use keyward_maintenance::storage::{Database, NewHost, SNAPSHOT_INTERVAL_SETTING};

#[derive(Parser, Debug)]
#[command(name = "keyward")]
#[command(version, about = "Keyward maintenance orchestrator")]
struct Args {
    /// Explicit config file, layered over the global one
    #[arg(long, global = true, env = "KEYWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Database file path
    #[arg(long, global = true, env = "KEYWARD_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "KEYWARD_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the maintenance loop until interrupted (default)
    Run,
    /// Run exactly one maintenance cycle and exit
    Once,
    /// Register a host
    AddHost {
        #[arg(long)]
        name: String,
        #[arg(long)]
        panel_url: String,
        #[arg(long)]
        panel_username: String,
        #[arg(long, env = "KEYWARD_PANEL_PASSWORD")]
        panel_password: String,
        /// Traffic profile keys on this host belong to
        #[arg(long)]
        inbound_id: i64,
        #[arg(long)]
        ssh_host: Option<String>,
        #[arg(long)]
        ssh_port: Option<u16>,
        #[arg(long)]
        ssh_user: Option<String>,
        #[arg(long)]
        ssh_identity_file: Option<String>,
    },
    /// Register a user
    AddUser {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        username: Option<String>,
    },
    /// Issue a new key
    Issue {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        host: String,
        #[arg(long)]
        days: u32,
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Extend a key
    Renew {
        #[arg(long)]
        key_id: i64,
        #[arg(long)]
        days: u32,
    },
    /// Move a key to another host
    Migrate {
        #[arg(long)]
        key_id: i64,
        #[arg(long)]
        to_host: String,
    },
    /// Change the live snapshot interval
    SetSnapshotInterval {
        #[arg(long)]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.maintenance.log_level);
    init_tracing(&default_filter("keyward-maintenance", log_level), args.log_json);

    let db = open_database(&args, &config).await?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_forever(&config, db).await,
        Command::Once => {
            let mut scheduler = build_scheduler(&config, db).await?;
            let report = scheduler.run_cycle(unix_timestamp_ms()).await;
            info!(
                reconciled = report.reconcile.as_ref().map_or(0, |r| r.hosts.len()),
                affected = report.reconcile.as_ref().map_or(0, |r| r.affected()),
                warnings = report.expiry.as_ref().map_or(0, |r| r.sent.len()),
                "Single cycle complete"
            );
            Ok(())
        }
        Command::AddHost {
            name,
            panel_url,
            panel_username,
            panel_password,
            inbound_id,
            ssh_host,
            ssh_port,
            ssh_user,
            ssh_identity_file,
        } => {
            let host = db
                .create_host(&NewHost {
                    name: &name,
                    panel_url: &panel_url,
                    panel_username: &panel_username,
                    panel_password: &panel_password,
                    inbound_id,
                    ssh_host: ssh_host.as_deref(),
                    ssh_port,
                    ssh_user: ssh_user.as_deref(),
                    ssh_identity_file: ssh_identity_file.as_deref(),
                })
                .await?;
            info!(host = %host.name, ssh = host.ssh_target().is_some(), "Host registered");
            Ok(())
        }
        Command::AddUser { id, username } => {
            db.ensure_user(id, username.as_deref()).await?;
            info!(user_id = id, "User registered");
            Ok(())
        }
        Command::Issue {
            user_id,
            host,
            days,
            comment,
        } => {
            let key = lifecycle(&config, db)
                .issue(user_id, &host, days, &comment, unix_timestamp_ms())
                .await?;
            info!(
                key_id = key.id,
                correlation_id = %key.correlation_id,
                expiry_ms = key.expiry_ms,
                "Key issued"
            );
            Ok(())
        }
        Command::Renew { key_id, days } => {
            let key = lifecycle(&config, db)
                .renew(key_id, days, unix_timestamp_ms())
                .await?;
            info!(key_id, expiry_ms = key.expiry_ms, "Key renewed");
            Ok(())
        }
        Command::Migrate { key_id, to_host } => {
            let migration = lifecycle(&config, db).migrate(key_id, &to_host).await?;
            if !migration.source_removed {
                warn!(
                    key_id,
                    source = %migration.source_host,
                    "Key still present on source host; remove it manually"
                );
            }
            info!(key_id, host = %migration.key.host_name, "Key migrated");
            Ok(())
        }
        Command::SetSnapshotInterval { days } => {
            anyhow::ensure!(days > 0, "Snapshot interval must be at least one day");
            db.set_setting(SNAPSHOT_INTERVAL_SETTING, &days.to_string())
                .await?;
            info!(days, "Snapshot interval updated");
            Ok(())
        }
    }
}

async fn run_forever(config: &Config, db: Database) -> anyhow::Result<()> {
    let scheduler = build_scheduler(config, db).await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(scheduler.start(shutdown_rx));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
    info!("Keyward stopped");
    Ok(())
}

async fn open_database(args: &Args, config: &Config) -> anyhow::Result<Database> {
    let path = args
        .db_path
        .clone()
        .or_else(|| config.storage.database_path.clone())
        .or_else(keyward_core::config::database_path)
        .or_else(|| dirs::home_dir().map(|h| h.join(".keyward").join("keyward.db")))
        .context("Cannot determine database path")?;
    Ok(Database::open(&path).await?)
}

fn panel(config: &Config) -> Arc<dyn RemotePanel> {
    Arc::new(XuiPanel::new(config.panel.clone()))
}

fn lifecycle(config: &Config, db: Database) -> KeyLifecycle {
    KeyLifecycle::new(Arc::new(db.clone()), Arc::new(db), panel(config))
}

/// A verified bot, or `None` when no token is configured.
async fn telegram(config: &Config) -> anyhow::Result<Option<Arc<TelegramNotifier>>> {
    match TelegramNotifier::new(&config.telegram) {
        Ok(bot) => {
            if let Err(e) = bot.verify().await {
                warn!(error = %e, "Telegram bot inactive; verification retried each cycle");
            }
            Ok(Some(Arc::new(bot)))
        }
        Err(NotifyError::Config(reason)) => {
            warn!(
                %reason,
                "Telegram not configured; expiry warnings and snapshot delivery disabled"
            );
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

async fn build_scheduler(config: &Config, db: Database) -> anyhow::Result<Scheduler> {
    let bot = telegram(config).await?;
    let notifier: Arc<dyn Notifier> = match &bot {
        Some(bot) => bot.clone(),
        None => Arc::new(DisabledNotifier),
    };

    let reconciler = Reconciler::new(
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        panel(config),
        ReconcilePolicy::from_config(&config.maintenance),
    );

    let expiry = ExpiryNotifier::new(
        Arc::new(db.clone()),
        Arc::clone(&notifier),
        &config.maintenance.notification_thresholds_hours,
    );

    let ssh = SshRunner::new(
        config.maintenance.ssh_command_timeout(),
        config.panel.connect_timeout(),
    );
    let snapshot_dir = config
        .snapshot
        .directory
        .clone()
        .or_else(keyward_core::config::snapshot_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".keyward").join("snapshots")))
        .context("Cannot determine snapshot directory")?;
    let mut snapshotter = SqliteSnapshotter::new(db.clone(), snapshot_dir);
    if let Some(bot) = &bot {
        snapshotter = snapshotter.with_sender(bot.clone());
    }

    Ok(Scheduler::new(SchedulerParts {
        reconciler,
        expiry,
        notifier,
        hosts: Arc::new(db.clone()),
        settings: Arc::new(db.clone()),
        probe: Arc::new(NetworkProber::new(
            db.clone(),
            ssh.clone(),
            config.panel.connect_timeout(),
        )),
        telemetry: Arc::new(SystemTelemetry::new(db.clone(), ssh)),
        snapshot: Arc::new(snapshotter),
        snapshot_policy: SnapshotPolicy {
            recipients: config.telegram.admin_ids.clone(),
            retention: config.snapshot.retention,
        },
        timings: SchedulerTimings::from_config(config),
    }))
}
