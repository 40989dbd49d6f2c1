//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Fleet driver core: dispatch, reassembly and command tracking."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
//! Per-vehicle registry of in-flight commands.
//!
//! Each vehicle has at most one pending command. A pending command is a
//! one-shot channel: [`CommandFutureMap::fulfill`] resolves it with the
//! response text, preemption or [`CommandFutureMap::cancel`] resolves it with
//! [`CommandOutcome::Cancelled`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{DriverError, Result};

/// Text handed back to callers whose command was preempted or cancelled.
pub const EXECUTION_CANCELLED: &str = "Execution cancelled";

/// How a pending command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The vehicle answered with this text.
    Completed(String),
    /// The command was preempted or cancelled before an answer arrived.
    Cancelled,
}

impl CommandOutcome {
    /// Response text, or [`EXECUTION_CANCELLED`] for cancelled commands.
    pub fn into_text(self) -> String {
        match self {
            CommandOutcome::Completed(text) => text,
            CommandOutcome::Cancelled => EXECUTION_CANCELLED.to_owned(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CommandOutcome::Cancelled)
    }
}

#[derive(Debug)]
struct PendingCommand {
    slot_id: u64,
    created_at: Instant,
    resolver: oneshot::Sender<CommandOutcome>,
}

#[derive(Debug, Default)]
struct CommandTable {
    next_slot_id: u64,
    pending: HashMap<String, PendingCommand>,
}

/// Registry of pending commands keyed by vehicle id.
#[derive(Debug, Clone, Default)]
pub struct CommandFutureMap {
    table: Arc<Mutex<CommandTable>>,
}

impl CommandFutureMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a command slot for the vehicle.
    ///
    /// With `strict` set, an existing pending command makes this fail with
    /// [`DriverError::CommandAlreadyInProgress`] and is left untouched.
    /// Otherwise the existing command is cancelled and replaced while the
    /// table lock is held.
    pub fn begin(&self, vehicle_id: &str, strict: bool) -> Result<CommandSlot> {
        let mut table = self.table.lock();

        if strict && table.pending.contains_key(vehicle_id) {
            debug!(vehicle_id, "command rejected; another command is pending");
            return Err(DriverError::CommandAlreadyInProgress(vehicle_id.to_owned()));
        }

        table.next_slot_id = table.next_slot_id.wrapping_add(1);
        let slot_id = table.next_slot_id;
        let (resolver, receiver) = oneshot::channel();
        let replaced = table.pending.insert(
            vehicle_id.to_owned(),
            PendingCommand {
                slot_id,
                created_at: Instant::now(),
                resolver,
            },
        );
        drop(table);

        if let Some(previous) = replaced {
            info!(
                vehicle_id,
                preempted_slot = previous.slot_id,
                "pending command preempted by a newer one"
            );
            let _ = previous.resolver.send(CommandOutcome::Cancelled);
        }

        Ok(CommandSlot {
            vehicle_id: vehicle_id.to_owned(),
            slot_id,
            receiver,
            table: self.table.clone(),
        })
    }

    /// Resolve the pending command of the vehicle with the response text.
    ///
    /// Returns `false` when nothing was waiting; the response is then stale
    /// and only logged.
    pub fn fulfill(&self, vehicle_id: &str, text: impl Into<String>) -> bool {
        let pending = self.table.lock().pending.remove(vehicle_id);
        let Some(pending) = pending else {
            warn!(vehicle_id, "dropped stale command response");
            return false;
        };
        let latency = pending.created_at.elapsed();
        if pending
            .resolver
            .send(CommandOutcome::Completed(text.into()))
            .is_err()
        {
            warn!(vehicle_id, "command waiter went away before the response arrived");
            return false;
        }
        debug!(vehicle_id, latency_ms = latency.as_millis() as u64, "command fulfilled");
        true
    }

    /// Cancel the pending command of the vehicle, if any.
    pub fn cancel(&self, vehicle_id: &str) -> bool {
        let pending = self.table.lock().pending.remove(vehicle_id);
        match pending {
            Some(pending) => {
                info!(vehicle_id, slot = pending.slot_id, "pending command cancelled");
                let _ = pending.resolver.send(CommandOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, vehicle_id: &str) -> bool {
        self.table.lock().pending.contains_key(vehicle_id)
    }

    pub fn pending_count(&self) -> usize {
        self.table.lock().pending.len()
    }

    /// Age of the pending command of the vehicle.
    pub fn pending_for(&self, vehicle_id: &str) -> Option<Duration> {
        self.table
            .lock()
            .pending
            .get(vehicle_id)
            .map(|p| p.created_at.elapsed())
    }
}

/// Handle to one pending command.
///
/// Dropping the slot removes the map entry, but only while the entry still
/// belongs to this slot; a newer command for the same vehicle is never
/// removed by an older slot.
#[derive(Debug)]
pub struct CommandSlot {
    vehicle_id: String,
    slot_id: u64,
    receiver: oneshot::Receiver<CommandOutcome>,
    table: Arc<Mutex<CommandTable>>,
}

impl CommandSlot {
    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    /// Wait until the command is fulfilled or cancelled.
    pub async fn wait(mut self) -> CommandOutcome {
        (&mut self.receiver)
            .await
            .unwrap_or(CommandOutcome::Cancelled)
    }
}

impl Drop for CommandSlot {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        let owned = table
            .pending
            .get(&self.vehicle_id)
            .is_some_and(|p| p.slot_id == self.slot_id);
        if owned {
            table.pending.remove(&self.vehicle_id);
            debug!(vehicle_id = %self.vehicle_id, slot = self.slot_id, "command slot released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fulfilled_command_resolves_with_text() {
        let map = CommandFutureMap::new();
        let slot = map.begin("V-01", false).expect("slot");
        assert!(map.is_pending("V-01"));
        assert!(map.fulfill("V-01", "ok"));
        assert_eq!(slot.wait().await, CommandOutcome::Completed("ok".into()));
        assert_eq!(map.pending_count(), 0);
    }

    #[tokio::test]
    async fn lenient_mode_preempts_previous_command() {
        let map = CommandFutureMap::new();
        let first = map.begin("V-01", false).expect("first slot");
        let second = map.begin("V-01", false).expect("second slot");

        let first_outcome = first.wait().await;
        assert!(first_outcome.is_cancelled());
        assert_eq!(first_outcome.into_text(), EXECUTION_CANCELLED);

        assert!(map.is_pending("V-01"), "replacement survives old slot cleanup");
        assert!(map.fulfill("V-01", "done"));
        assert_eq!(second.wait().await, CommandOutcome::Completed("done".into()));
    }

    #[tokio::test]
    async fn strict_mode_rejects_and_keeps_existing() {
        let map = CommandFutureMap::new();
        let first = map.begin("V-01", true).expect("first slot");
        let err = map.begin("V-01", true).expect_err("second rejected");
        assert!(matches!(err, DriverError::CommandAlreadyInProgress(ref id) if id == "V-01"));

        assert!(map.fulfill("V-01", "still alive"));
        assert_eq!(
            first.wait().await,
            CommandOutcome::Completed("still alive".into())
        );
    }

    #[test]
    fn stale_fulfillment_is_a_noop() {
        let map = CommandFutureMap::new();
        assert!(!map.fulfill("V-02", "late"));
        let _slot = map.begin("V-03", false).unwrap();
        assert!(!map.fulfill("V-02", "late"));
        assert!(map.is_pending("V-03"));
    }

    #[test]
    fn dropping_slot_releases_entry() {
        let map = CommandFutureMap::new();
        let slot = map.begin("V-01", true).unwrap();
        drop(slot);
        assert!(!map.is_pending("V-01"));
        map.begin("V-01", true).expect("slot free again");
    }

    #[test]
    fn old_slot_drop_keeps_successor() {
        let map = CommandFutureMap::new();
        let first = map.begin("V-01", false).unwrap();
        let _second = map.begin("V-01", false).unwrap();
        drop(first);
        assert!(map.is_pending("V-01"));
    }

    #[tokio::test]
    async fn explicit_cancel_wakes_waiter() {
        let map = CommandFutureMap::new();
        let slot = map.begin("V-01", true).unwrap();
        assert!(map.cancel("V-01"));
        assert!(!map.cancel("V-01"));
        assert_eq!(slot.wait().await, CommandOutcome::Cancelled);
    }

    #[tokio::test]
    async fn slots_for_different_vehicles_are_independent() {
        let map = CommandFutureMap::new();
        let a = map.begin("V-01", true).unwrap();
        let b = map.begin("V-02", true).unwrap();
        assert_eq!(map.pending_count(), 2);
        assert!(map.fulfill("V-02", "b"));
        assert_eq!(b.wait().await, CommandOutcome::Completed("b".into()));
        assert!(map.is_pending("V-01"));
        assert!(map.pending_for("V-01").is_some());
        drop(a);
        assert_eq!(map.pending_count(), 0);
    }
}
