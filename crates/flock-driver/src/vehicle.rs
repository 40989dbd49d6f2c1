//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Fleet driver core: dispatch, reassembly and command tracking."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flock_msg::{ErrorClass, GpsCoordinate, VelocityNed};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::device_tree::ChannelPath;

pub const MAX_GEIGER_TUBE_COUNT: usize = 2;
pub const MAX_CAMERA_FEATURE_COUNT: usize = 32;

/// Device tree channels owned by one vehicle.
#[derive(Debug, Clone)]
pub struct SensorChannels {
    pub dose_rate: ChannelPath,
    pub raw_counts: Vec<ChannelPath>,
    pub rates: Vec<ChannelPath>,
    pub camera_features: Vec<ChannelPath>,
}

impl SensorChannels {
    pub fn for_vehicle(vehicle_id: &str) -> Self {
        let geiger = |name: String| ChannelPath::new(vehicle_id, "geiger_counter", &name);
        Self {
            dose_rate: geiger("dose_rate".to_owned()),
            raw_counts: (0..MAX_GEIGER_TUBE_COUNT)
                .map(|i| geiger(format!("raw_count_{i}")))
                .collect(),
            rates: (0..MAX_GEIGER_TUBE_COUNT)
                .map(|i| geiger(format!("rate_{i}")))
                .collect(),
            camera_features: (0..MAX_CAMERA_FEATURE_COUNT)
                .map(|i| ChannelPath::new(vehicle_id, "camera", &format!("feature_{i}")))
                .collect(),
        }
    }

    /// Every channel with its unit, for declaration in the device tree.
    pub fn declarations(&self) -> Vec<(&ChannelPath, Option<&'static str>)> {
        let mut out = vec![(&self.dose_rate, Some("mGy/h"))];
        out.extend(self.raw_counts.iter().map(|p| (p, None)));
        out.extend(self.rates.iter().map(|p| (p, Some("count/sec"))));
        out.extend(self.camera_features.iter().map(|p| (p, None)));
        out
    }
}

/// Last reported kinematic and health state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VehicleStatus {
    pub position: Option<GpsCoordinate>,
    pub velocity: Option<VelocityNed>,
    pub heading: Option<f64>,
    pub algorithm: Option<String>,
    pub error: ErrorClass,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Fields carried by one status report.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub position: GpsCoordinate,
    pub velocity: VelocityNed,
    pub heading: f64,
    pub algorithm: String,
    pub error: ErrorClass,
}

/// Previous Geiger reading, kept to derive count rates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeigerSample {
    pub itow: u32,
    pub raw_counts: Vec<u32>,
}

#[derive(Debug, Default)]
struct VehicleState {
    status: VehicleStatus,
    last_geiger_sample: Option<GeigerSample>,
}

/// A vehicle managed by the driver.
#[derive(Debug)]
pub struct Vehicle {
    id: String,
    channels: SensorChannels,
    state: Mutex<VehicleState>,
}

impl Vehicle {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            channels: SensorChannels::for_vehicle(&id),
            id,
            state: Mutex::new(VehicleState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channels(&self) -> &SensorChannels {
        &self.channels
    }

    pub fn status(&self) -> VehicleStatus {
        self.state.lock().status.clone()
    }

    pub fn position(&self) -> Option<GpsCoordinate> {
        self.state.lock().status.position
    }

    pub fn update_status(&self, update: StatusUpdate) {
        let mut state = self.state.lock();
        state.status = VehicleStatus {
            position: Some(update.position),
            velocity: Some(update.velocity),
            heading: Some(update.heading),
            algorithm: (!update.algorithm.is_empty()).then_some(update.algorithm),
            error: update.error,
            updated_at: Some(Utc::now()),
        };
    }

    pub fn geiger_sample(&self) -> Option<GeigerSample> {
        self.state.lock().last_geiger_sample.clone()
    }

    /// `None` forgets the previous reading, so no rate spans the gap.
    pub fn set_geiger_sample(&self, sample: Option<GeigerSample>) {
        self.state.lock().last_geiger_sample = sample;
    }
}

/// Registry of vehicles owned outside the driver.
pub trait VehicleRegistry: Send + Sync {
    fn exists(&self, id: &str) -> bool;
    fn create(&self, id: &str) -> Arc<Vehicle>;
    fn find(&self, id: &str) -> Option<Arc<Vehicle>>;
}

/// In-process vehicle registry used by the CLI and tests.
#[derive(Debug, Default)]
pub struct InMemoryVehicleRegistry {
    vehicles: RwLock<HashMap<String, Arc<Vehicle>>>,
}

impl InMemoryVehicleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Vehicle>> {
        self.vehicles.write().remove(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.vehicles.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.vehicles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.read().is_empty()
    }
}

impl VehicleRegistry for InMemoryVehicleRegistry {
    fn exists(&self, id: &str) -> bool {
        self.vehicles.read().contains_key(id)
    }

    fn create(&self, id: &str) -> Arc<Vehicle> {
        let vehicle = Arc::new(Vehicle::new(id));
        self.vehicles
            .write()
            .insert(id.to_owned(), vehicle.clone());
        vehicle
    }

    fn find(&self, id: &str) -> Option<Arc<Vehicle>> {
        self.vehicles.read().get(id).cloned()
    }
}
