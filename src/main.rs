//! replica-locks - Replica lock reconciliation
//!
//! One-shot entry point for transfer daemons and operators:
//!
//! ```text
//! replica-locks [--env dev] init-schema
//! replica-locks [--env dev] success --scope S --name N --rse RSE_ID
//! replica-locks [--env dev] failure --scope S --name N --rse RSE_ID --error MSG
//!               [--broken-rule RULE_ID [--broken-message MSG]]
//! replica-locks [--env dev] touch --input requests.json
//! replica-locks [--env dev] dataset-locks --scope S --name N
//! ```

use std::sync::Arc;

use anyhow::{Context, bail};
use futures::TryStreamExt;
use uuid::Uuid;

use replica_locks::config::AppConfig;
use replica_locks::db::Database;
use replica_locks::lock::{
    FixedLifetimePolicy, HistoryRuleNotifier, LockQueryService, LockTouchService, TouchRequest,
    TransferFailure, TransferReconciler, init_schema,
};

fn get_env() -> String {
    get_arg("--env")
        .or_else(|| get_arg("-e"))
        .unwrap_or_else(|| "dev".to_string())
}

fn get_arg(flag: &str) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

fn require_arg(flag: &str) -> anyhow::Result<String> {
    get_arg(flag).with_context(|| format!("missing required argument {}", flag))
}

fn get_command() -> Option<String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        if args[i].starts_with('-') {
            i += 2;
            continue;
        }
        return Some(args[i].clone());
    }
    None
}

fn parse_uuid(flag: &str) -> anyhow::Result<Uuid> {
    let raw = require_arg(flag)?;
    Uuid::parse_str(&raw).with_context(|| format!("{} is not a valid id: {}", flag, raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().any(|a| a == "--version") {
        println!("replica-locks {} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
        return Ok(());
    }

    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = replica_locks::logging::init_logging(&app_config);

    let Some(command) = get_command() else {
        bail!("usage: replica-locks [--env ENV] <init-schema|success|failure|touch|dataset-locks> ...");
    };
    tracing::info!(env = %env, command = %command, git = env!("GIT_HASH"), "Starting replica-locks");

    let db = Database::from_config(&app_config).await?;
    if command != "init-schema" && !db.schema_ready().await? {
        bail!("lock tables missing, run `replica-locks init-schema` first");
    }

    let store = Arc::new(db.lock_store());
    let directory = Arc::new(db.directory());
    let locks = &app_config.locks;

    match command.as_str() {
        "init-schema" => {
            init_schema(db.pool()).await?;
            println!("schema ready");
        }
        "success" => {
            let reconciler = TransferReconciler::new(
                store,
                directory.clone(),
                directory,
                Arc::new(HistoryRuleNotifier::new()),
            );
            let summary = reconciler
                .successful_transfer(
                    &require_arg("--scope")?,
                    &require_arg("--name")?,
                    parse_uuid("--rse")?,
                    locks.success_mode(),
                )
                .await?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        "failure" => {
            let mut failure = TransferFailure::new(require_arg("--error")?);
            if get_arg("--broken-rule").is_some() {
                let broken_rule = parse_uuid("--broken-rule")?;
                failure = match get_arg("--broken-message") {
                    Some(message) => failure.broken(broken_rule, message),
                    None => TransferFailure {
                        broken_rule_id: Some(broken_rule),
                        ..failure
                    },
                };
            }

            let reconciler = TransferReconciler::new(
                store,
                directory.clone(),
                directory,
                Arc::new(HistoryRuleNotifier::new()),
            );
            let summary = reconciler
                .failed_transfer(
                    &require_arg("--scope")?,
                    &require_arg("--name")?,
                    parse_uuid("--rse")?,
                    &failure,
                    locks.failure_mode(),
                )
                .await?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        "touch" => {
            let path = require_arg("--input")?;
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path))?;
            let requests: Vec<TouchRequest> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path))?;

            let touch = LockTouchService::new(
                store,
                Arc::new(FixedLifetimePolicy::from_days(locks.default_lifetime_days)),
            );
            if !touch.touch(&requests).await? {
                bail!("touch aborted part way, see log for the failing item");
            }
            println!("touched {}", requests.len());
        }
        "dataset-locks" => {
            let query = LockQueryService::new(store, directory.clone(), directory)
                .with_batch_size(locks.stream_batch_size);
            let mut stream = query.dataset_locks(&require_arg("--scope")?, &require_arg("--name")?);
            while let Some(lock) = stream.try_next().await? {
                println!("{}", serde_json::to_string(&lock)?);
            }
        }
        other => bail!("unknown command: {}", other),
    }

    Ok(())
}
