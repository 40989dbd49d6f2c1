//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Fleet driver core: dispatch, reassembly and command tracking."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
//! Device tree collaborator: named sensor channels the driver writes into.

use std::collections::BTreeMap;
use std::fmt;

use flock_msg::GpsCoordinate;
use parking_lot::RwLock;
use serde::Serialize;

/// Hierarchical channel name, `<vehicle>/<device>/<channel>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelPath(String);

impl ChannelPath {
    pub fn new(vehicle: &str, device: &str, channel: &str) -> Self {
        Self(format!("{vehicle}/{device}/{channel}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value tagged with the position it was measured at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amsl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agl: Option<f64>,
    pub value: Option<f64>,
}

impl Measurement {
    pub fn at(position: &GpsCoordinate, value: Option<f64>) -> Self {
        Self {
            lat: position.lat,
            lon: position.lon,
            amsl: position.amsl,
            agl: position.agl,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelUpdate {
    pub channel: ChannelPath,
    pub value: Measurement,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceTreeError {
    #[error("channel {0} has not been declared")]
    UndeclaredChannel(ChannelPath),
    #[error("device tree rejected update batch: {0}")]
    Rejected(String),
}

/// Store of named channels owned outside the driver.
pub trait DeviceTree: Send + Sync {
    /// Declare a channel before the first write to it.
    fn declare_channel(&self, path: &ChannelPath, unit: Option<&str>);

    /// Apply a batch of updates; either all of them land or none does.
    fn commit(&self, updates: Vec<ChannelUpdate>) -> Result<(), DeviceTreeError>;
}

/// Collects channel writes for one packet; nothing reaches the tree until
/// the batch is committed.
#[derive(Debug, Default)]
pub struct DeviceTreeMutator {
    updates: Vec<ChannelUpdate>,
}

impl DeviceTreeMutator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, channel: &ChannelPath, value: Measurement) {
        self.updates.push(ChannelUpdate {
            channel: channel.clone(),
            value,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Channels written so far, in write order.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelPath> {
        self.updates.iter().map(|u| &u.channel)
    }

    pub fn value_of(&self, channel: &ChannelPath) -> Option<&Measurement> {
        self.updates
            .iter()
            .rev()
            .find(|u| &u.channel == channel)
            .map(|u| &u.value)
    }

    pub fn commit_to(self, tree: &dyn DeviceTree) -> Result<usize, DeviceTreeError> {
        let written = self.updates.len();
        if written > 0 {
            tree.commit(self.updates)?;
        }
        Ok(written)
    }
}

#[derive(Debug, Clone, Default)]
struct ChannelRecord {
    unit: Option<String>,
    value: Option<Measurement>,
    writes: u64,
}

/// In-process device tree used by the CLI and tests.
#[derive(Debug, Default)]
pub struct InMemoryDeviceTree {
    channels: RwLock<BTreeMap<ChannelPath, ChannelRecord>>,
}

impl InMemoryDeviceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, path: &ChannelPath) -> Option<Measurement> {
        self.channels.read().get(path).and_then(|c| c.value)
    }

    pub fn unit(&self, path: &ChannelPath) -> Option<String> {
        self.channels.read().get(path).and_then(|c| c.unit.clone())
    }

    pub fn writes(&self, path: &ChannelPath) -> u64 {
        self.channels.read().get(path).map_or(0, |c| c.writes)
    }

    pub fn is_declared(&self, path: &ChannelPath) -> bool {
        self.channels.read().contains_key(path)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Channels that hold a value, with that value.
    pub fn snapshot(&self) -> BTreeMap<ChannelPath, Measurement> {
        self.channels
            .read()
            .iter()
            .filter_map(|(path, record)| record.value.map(|v| (path.clone(), v)))
            .collect()
    }
}

impl DeviceTree for InMemoryDeviceTree {
    fn declare_channel(&self, path: &ChannelPath, unit: Option<&str>) {
        self.channels
            .write()
            .entry(path.clone())
            .or_insert_with(|| ChannelRecord {
                unit: unit.map(str::to_owned),
                ..ChannelRecord::default()
            });
    }

    fn commit(&self, updates: Vec<ChannelUpdate>) -> Result<(), DeviceTreeError> {
        let mut channels = self.channels.write();
        if let Some(missing) = updates.iter().find(|u| !channels.contains_key(&u.channel)) {
            return Err(DeviceTreeError::UndeclaredChannel(missing.channel.clone()));
        }
        for update in updates {
            if let Some(record) = channels.get_mut(&update.channel) {
                record.value = Some(update.value);
                record.writes += 1;
            }
        }
        Ok(())
    }
}
