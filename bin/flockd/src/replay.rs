//! ---
//! flk_section: "05-networking-external-interfaces"
//! flk_subsection: "binary"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Command-line tool driving the fleet driver from captures."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
//! Replay of newline-delimited JSON packet captures through the driver.
//!
//! Each line holds an object with an `action` of `inbound` (fields `source`
//! and `packet`) or `command` (fields `vehicle` and `command`), plus an
//! optional `delay_ms` slept before the record is applied.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flock_driver::{DispatchOutcome, FleetDriver};
use flock_msg::{Packet, Source};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const COMMAND_START_POLLS: usize = 1_000;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ReplayAction {
    Inbound { source: Source, packet: Packet },
    Command { vehicle: String, command: String },
}

#[derive(Debug, Deserialize)]
struct ReplayRecord {
    #[serde(default)]
    delay_ms: Option<u64>,
    #[serde(flatten)]
    action: ReplayAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub vehicle: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ReplaySummary {
    pub records: usize,
    pub outcomes: BTreeMap<String, usize>,
    pub commands: Vec<CommandResult>,
}

struct InFlight {
    vehicle: String,
    command: String,
    handle: JoinHandle<flock_driver::Result<String>>,
}

/// Feed every record of the capture to the driver and collect the outcome
/// of each issued command.
pub async fn replay_file(driver: Arc<FleetDriver>, path: &Path) -> Result<ReplaySummary> {
    let file = File::open(path).with_context(|| format!("unable to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut summary = ReplaySummary::default();
    let mut in_flight = Vec::new();

    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ReplayRecord = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: malformed replay record", path.display(), number + 1))?;
        if let Some(delay) = record.delay_ms {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match record.action {
            ReplayAction::Inbound { source, packet } => {
                let outcome = driver.handle_inbound_packet(&packet, &source);
                *summary.outcomes.entry(outcome_label(outcome).to_owned()).or_default() += 1;
            }
            ReplayAction::Command { vehicle, command } => {
                in_flight.push(start_command(&driver, vehicle, command).await);
            }
        }
        summary.records += 1;
    }

    for InFlight { vehicle, command, handle } in in_flight {
        let result = handle.await.context("command task panicked")?;
        debug!(vehicle = %vehicle, command = %command, ok = result.is_ok(), "replayed command finished");
        let (response, error) = match result {
            Ok(text) => (Some(text), None),
            Err(err) => (None, Some(err.to_string())),
        };
        summary.commands.push(CommandResult {
            vehicle,
            command,
            response,
            error,
        });
    }

    info!(records = summary.records, commands = summary.commands.len(), "replay finished");
    Ok(summary)
}

/// Spawn the command and give it the chance to open its slot before the
/// next record, so responses later in the capture find it pending.
async fn start_command(driver: &Arc<FleetDriver>, vehicle: String, command: String) -> InFlight {
    let task_driver = driver.clone();
    let (task_vehicle, task_command) = (vehicle.clone(), command.clone());
    let handle = tokio::spawn(async move {
        task_driver.execute_command(&task_vehicle, &task_command).await
    });
    for _ in 0..COMMAND_START_POLLS {
        if handle.is_finished() || driver.commands().is_pending(&vehicle) {
            break;
        }
        tokio::task::yield_now().await;
    }
    InFlight {
        vehicle,
        command,
        handle,
    }
}

fn outcome_label(outcome: DispatchOutcome) -> &'static str {
    match outcome {
        DispatchOutcome::Handled => "handled",
        DispatchOutcome::Ignored => "ignored",
        DispatchOutcome::Unhandled => "unhandled",
        DispatchOutcome::Rejected => "rejected",
    }
}
