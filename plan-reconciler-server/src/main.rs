//! Plan Reconciler Server: JSON-lines front end for the reconciliation engine.
//!
//! Reads one JSON command per line on stdin and writes one JSON response per
//! line on stdout. Logs go to stderr.
//!
//! # Commands
//!
//! - a `ReconcileRequest` object (`action`, `userId`, `targetPlanTitle`, ...)
//! - `{"seedUser": {"id": "...", "email": "..."}}` to create an account
//! - `{"preview": {"userId": "...", "targetPlanTitle": "..."}}` to price an upgrade
//! - `{"planState": "<user id>"}` to report lifecycle state
//! - `{"health": true}` for a health report
//!
//! # Usage
//!
//! ```text
//! PAYMENT_GATEWAY_SECRET=... plan-reconciler-server [config.toml]
//! ```

mod observability;

use std::{process::ExitCode, sync::Arc, time::Instant};

use observability::{HealthReport, LogFormat, init_observability};
use plan_reconciler::{
    EngineConfig, ErrorKind, ReconcileError, ReconcileRequest, ReconcileResult,
    SubscriptionReconciler,
    entitlement::{InMemoryEntitlementStore, UserAccount},
    notify::LogNotifier,
    payment::PaymentVerifier,
    security::redact_identifier,
};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

#[derive(Debug, Error)]
enum ServerError {
    #[error(transparent)]
    Engine(#[from] ReconcileError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewParams {
    user_id: String,
    target_plan_title: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Command {
    SeedUser {
        #[serde(rename = "seedUser")]
        seed_user: UserAccount,
    },
    Preview {
        preview: PreviewParams,
    },
    PlanState {
        #[serde(rename = "planState")]
        plan_state: String,
    },
    Health {
        #[allow(dead_code, reason = "presence of the key selects the command")]
        health: bool,
    },
    Reconcile(ReconcileRequest),
}

type Engine = SubscriptionReconciler<InMemoryEntitlementStore, LogNotifier>;

struct App {
    config: EngineConfig,
    store: Arc<InMemoryEntitlementStore>,
    reconciler: Engine,
    secret_loaded: bool,
    started: Instant,
}

impl App {
    fn new(config: EngineConfig, secret: Vec<u8>) -> Result<Self, ServerError> {
        let catalog = Arc::new(config.catalog()?);
        let store = Arc::new(InMemoryEntitlementStore::new());
        let secret_loaded = !secret.is_empty();
        let reconciler = SubscriptionReconciler::new(
            catalog,
            Arc::clone(&store),
            Arc::new(LogNotifier),
            PaymentVerifier::new(secret),
        )
        .with_settings(config.settings());

        Ok(Self { config, store, reconciler, secret_loaded, started: Instant::now() })
    }

    async fn handle_line(&self, line: &str) -> Value {
        let command = match serde_json::from_str::<Command>(line) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Unrecognized command");
                return invalid_request();
            }
        };

        match command {
            Command::SeedUser { seed_user } => self.seed(seed_user),
            Command::Preview { preview } => respond(
                self.reconciler
                    .preview_upgrade(&preview.user_id, &preview.target_plan_title)
                    .await,
            ),
            Command::PlanState { plan_state } => {
                respond(self.reconciler.plan_state(&plan_state).await)
            }
            Command::Health { .. } => {
                let report = HealthReport::collect(
                    &self.config,
                    self.secret_loaded,
                    self.started.elapsed().as_secs(),
                );
                serde_json::to_value(report).unwrap_or(Value::Null)
            }
            Command::Reconcile(request) => {
                serde_json::to_value(self.reconciler.reconcile(&request).await)
                    .unwrap_or(Value::Null)
            }
        }
    }

    /// Creates a fresh Free account. Paid state only arrives through
    /// reconciliation, so seeds carrying plan state or negative counters are
    /// refused, as are ids already in use.
    fn seed(&self, user: UserAccount) -> Value {
        let user_id = redact_identifier(user.id.as_str());
        if user.active_plan_id.is_some() || !user.is_consistent() {
            warn!(user_id = %user_id, "Refusing seed with plan state");
            return invalid_request();
        }
        if !self.store.insert_new_user(user) {
            warn!(user_id = %user_id, "Refusing seed for existing user");
            return invalid_request();
        }
        info!(user_id = %user_id, "Seeded user");
        json!({"success": true})
    }
}

fn invalid_request() -> Value {
    serde_json::to_value(ReconcileResult::failure(ErrorKind::InvalidRequest)).unwrap_or(Value::Null)
}

/// Wraps a query result; errors expose only their kind.
fn respond<T: serde::Serialize>(result: plan_reconciler::Result<T>) -> Value {
    match result.map(serde_json::to_value) {
        Ok(Ok(value)) => json!({"success": true, "data": value}),
        Ok(Err(_)) => Value::Null,
        Err(e) => serde_json::to_value(ReconcileResult::failure(e.kind())).unwrap_or(Value::Null),
    }
}

async fn run() -> Result<(), ServerError> {
    let config = match std::env::args_os().nth(1) {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let secret = config.payment.load_secret()?;
    let app = App::new(config, secret)?;
    info!(
        catalog_version = app.reconciler.catalog().version(),
        renewal_window_days = ?app.reconciler.settings().renewal_window_days,
        "Plan reconciler ready"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut out = serde_json::to_vec(&app.handle_line(&line).await)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    info!("Input closed, shutting down");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_observability(LogFormat::from_env()) {
        eprintln!("failed to install log subscriber: {e}");
        return ExitCode::FAILURE;
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}
