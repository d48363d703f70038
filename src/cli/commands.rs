//! CLI command implementations
//!
//! `simulate` drives a [`RealtimeClient`] over the in-memory provider
//! through subscribe, deliver, link drop, reconnect and shutdown, and
//! prints the observable state after every step.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::realtime::{
    ChangeEvent, EventFilter, EventType, MemoryProvider, RealtimeClient, RealtimeConfig,
    ReconnectOutcome, SubscriptionStatus,
};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Upper bound on waiting for any single simulation step
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Main CLI entry point
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Simulate {
            config,
            subscriptions,
        } => simulate(config.as_deref(), subscriptions),
        Command::CheckConfig { config } => check_config(&config),
    }
}

/// Validate a configuration file and print the effective configuration
pub fn check_config(config_path: &Path) -> CliResult<()> {
    let config = RealtimeConfig::load(config_path)?;
    write_response(serde_json::to_value(&config)?)
}

/// Run the scripted session, one JSON line per step
pub fn simulate(config_path: Option<&Path>, subscriptions: usize) -> CliResult<()> {
    let config = match config_path {
        Some(path) => RealtimeConfig::load(path)?,
        None => RealtimeConfig::default(),
    };

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::runtime_error(format!("Failed to create tokio runtime: {}", e)))?;

    rt.block_on(run_simulation(config, subscriptions, write_response))?;
    Ok(())
}

/// Scripted session against a fresh [`MemoryProvider`].
///
/// Every step is handed to `report` as it completes. Returns the number of
/// change events delivered.
pub async fn run_simulation<F>(
    config: RealtimeConfig,
    subscriptions: usize,
    mut report: F,
) -> CliResult<usize>
where
    F: FnMut(Value) -> CliResult<()>,
{
    let provider = Arc::new(MemoryProvider::new());
    let client = RealtimeClient::new(provider.clone(), config)?;
    let delivered = Arc::new(AtomicUsize::new(0));

    client.start();
    require(
        wait_until(|| client.is_connected(), STEP_TIMEOUT).await,
        "client never reported connected",
    )?;
    report(step("connected", &client, json!({})))?;

    let tables: Vec<String> = (1..=subscriptions).map(|i| format!("table_{}", i)).collect();
    for table in &tables {
        let counter = Arc::clone(&delivered);
        client.subscribe(
            table,
            EventFilter::All,
            move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            },
            None,
        )?;
    }
    require(
        wait_until(|| all_subscribed(&client), STEP_TIMEOUT).await,
        "subscriptions did not join",
    )?;
    report(step("subscribed", &client, json!({})))?;

    let routed = emit_round(&provider, &tables, 1);
    report(step(
        "events_delivered",
        &client,
        json!({ "routed": routed, "delivered": delivered.load(Ordering::Relaxed) }),
    ))?;

    provider.drop_link();
    let (derived, _) = client.monitor().evaluate();
    report(step(
        "link_dropped",
        &client,
        json!({ "derived_status": derived }),
    ))?;

    let detail = match client.reconnect().await? {
        ReconnectOutcome::Completed(outcome) => json!({
            "resubscribed": outcome.resubscribed.len(),
            "failed": outcome.failed.len(),
        }),
        ReconnectOutcome::AlreadyInFlight => {
            require(
                wait_until(|| client.is_connected(), STEP_TIMEOUT).await,
                "background reconnect did not finish",
            )?;
            json!({ "already_in_flight": true })
        }
    };
    require(
        wait_until(|| all_subscribed(&client), STEP_TIMEOUT).await,
        "subscriptions did not rejoin",
    )?;
    report(step("reconnected", &client, detail))?;

    let routed = emit_round(&provider, &tables, 2);
    report(step(
        "events_after_reconnect",
        &client,
        json!({ "routed": routed, "delivered": delivered.load(Ordering::Relaxed) }),
    ))?;

    client.shutdown();
    report(step("shutdown", &client, json!({})))?;

    Ok(delivered.load(Ordering::Relaxed))
}

fn emit_round(provider: &MemoryProvider, tables: &[String], round: u64) -> usize {
    tables
        .iter()
        .map(|table| {
            provider.emit(ChangeEvent::new(
                EventType::Insert,
                table.as_str(),
                json!({ "id": round, "table": table }),
            ))
        })
        .sum()
}

fn all_subscribed(client: &RealtimeClient) -> bool {
    client
        .subscription_ids()
        .iter()
        .all(|id| client.subscription_status(id) == Some(SubscriptionStatus::Subscribed))
}

fn step(name: &str, client: &RealtimeClient, extra: Value) -> Value {
    let subscriptions: Vec<Value> = client
        .subscription_ids()
        .iter()
        .filter_map(|id| client.subscription(id))
        .map(|s| json!({ "id": s.id, "table": s.spec.table, "status": s.status }))
        .collect();

    let mut value = json!({
        "step": name,
        "connection": client.connection(),
        "subscriptions": subscriptions,
    });
    if let (Value::Object(map), Value::Object(extra)) = (&mut value, extra) {
        map.extend(extra);
    }
    value
}

async fn wait_until(mut condition: impl FnMut() -> bool, limit: Duration) -> bool {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

fn require(ok: bool, message: &str) -> CliResult<()> {
    if ok {
        Ok(())
    } else {
        Err(CliError::simulation_failed(message))
    }
}

#[cfg(test)]
mod tests {
    use super::super::errors::CliErrorCode;
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_simulation_steps() {
        let mut steps = Vec::new();
        let delivered = run_simulation(RealtimeConfig::default(), 3, |step| {
            steps.push(step);
            Ok(())
        })
        .await
        .unwrap();

        let names: Vec<&str> = steps.iter().map(|s| s["step"].as_str().unwrap()).collect();
        assert_eq!(
            names,
            vec![
                "connected",
                "subscribed",
                "events_delivered",
                "link_dropped",
                "reconnected",
                "events_after_reconnect",
                "shutdown",
            ]
        );
        assert_eq!(delivered, 6);

        assert_eq!(steps[1]["subscriptions"].as_array().unwrap().len(), 3);
        assert_eq!(steps[2]["delivered"], 3);
        assert_eq!(steps[3]["derived_status"], "disconnected");
        assert_eq!(steps[4]["connection"]["status"], "connected");
        assert_eq!(steps[4]["resubscribed"], 3);
        assert_eq!(steps[5]["delivered"], 6);
        assert!(steps[6]["subscriptions"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_simulation_keeps_ids_across_reconnect() {
        let mut steps = Vec::new();
        run_simulation(RealtimeConfig::default(), 2, |step| {
            steps.push(step);
            Ok(())
        })
        .await
        .unwrap();

        let ids = |step: &Value| -> Vec<Value> {
            step["subscriptions"]
                .as_array()
                .unwrap()
                .iter()
                .map(|s| s["id"].clone())
                .collect()
        };
        assert_eq!(ids(&steps[1]), ids(&steps[4]));
    }

    #[test]
    fn test_check_config_rejects_zero_poll_interval() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("realtime.json");
        fs::write(&config_path, json!({ "poll_interval_ms": 0 }).to_string()).unwrap();

        let result = check_config(&config_path);
        assert_eq!(result.unwrap_err().code(), &CliErrorCode::ConfigError);
    }

    #[test]
    fn test_check_config_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = check_config(&temp_dir.path().join("absent.json"));
        assert_eq!(result.unwrap_err().code(), &CliErrorCode::ConfigError);
    }

    #[test]
    fn test_check_config_accepts_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("realtime.json");
        fs::write(&config_path, json!({ "schema": "audit" }).to_string()).unwrap();

        check_config(&config_path).unwrap();
    }
}
