//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Fleet driver core: dispatch, reassembly and command tracking."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
//! Algorithm data packets turned into device tree channel writes.

use std::collections::HashMap;
use std::sync::Arc;

use flock_msg::{
    AlgorithmDataPacket, AlgorithmPayload, CameraFeatureData, GeigerCounterData, GpsCoordinate,
    Packet, Source,
};
use tracing::debug;

use crate::device_tree::{DeviceTree, DeviceTreeMutator, Measurement};
use crate::driver::FleetDriver;
use crate::error::Result;
use crate::vehicle::{GeigerSample, Vehicle, MAX_CAMERA_FEATURE_COUNT, MAX_GEIGER_TUBE_COUNT};

/// Onboard algorithm whose data the driver knows how to store.
pub trait Algorithm: Send + Sync {
    /// Name carried in [`AlgorithmDataPacket::algorithm`].
    fn name(&self) -> &'static str;

    /// Stage writes for one payload. `position` is the last known position
    /// of the vehicle.
    fn process(
        &self,
        vehicle: &Vehicle,
        position: &GpsCoordinate,
        payload: &AlgorithmPayload,
        mutator: &mut DeviceTreeMutator,
    );

    /// Called once the staged writes for `payload` have been committed.
    fn committed(&self, _vehicle: &Vehicle, _payload: &AlgorithmPayload) {}
}

/// Algorithms by name.
#[derive(Clone, Default)]
pub struct AlgorithmRegistry {
    algorithms: HashMap<&'static str, Arc<dyn Algorithm>>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Geiger counter and camera algorithms.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GeigerCounterAlgorithm));
        registry.register(Arc::new(CameraAlgorithm));
        registry
    }

    pub fn register(&mut self, algorithm: Arc<dyn Algorithm>) {
        self.algorithms.insert(algorithm.name(), algorithm);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Algorithm>> {
        self.algorithms.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.algorithms.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgorithmRegistry")
            .field("algorithms", &self.names())
            .finish()
    }
}

/// Count rate per tube between two samples, in counts per second.
///
/// A tube gets `None` when time did not advance or its counter went
/// backwards.
pub fn counter_rates(previous: &GeigerSample, current: &GeigerSample) -> Vec<Option<f64>> {
    let dt = (f64::from(current.itow) - f64::from(previous.itow)) / 1000.0;
    current
        .raw_counts
        .iter()
        .zip(&previous.raw_counts)
        .map(|(&new, &old)| {
            (dt > 0.0 && new >= old).then(|| (f64::from(new) - f64::from(old)) / dt)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GeigerCounterAlgorithm;

impl GeigerCounterAlgorithm {
    fn stage(
        &self,
        vehicle: &Vehicle,
        position: &GpsCoordinate,
        data: &GeigerCounterData,
        mutator: &mut DeviceTreeMutator,
    ) {
        let channels = vehicle.channels();
        mutator.update(&channels.dose_rate, Measurement::at(position, data.dose_rate));

        let Some(raw_counts) = &data.raw_counts else {
            return;
        };
        for (channel, count) in channels.raw_counts.iter().zip(raw_counts) {
            mutator.update(channel, Measurement::at(position, Some(f64::from(*count))));
        }

        // The stored sample only advances in `committed`.
        let (Some(previous), Some(current)) = (vehicle.geiger_sample(), Self::sample_of(data)) else {
            return;
        };
        for (channel, rate) in channels.rates.iter().zip(counter_rates(&previous, &current)) {
            if let Some(rate) = rate {
                mutator.update(channel, Measurement::at(position, Some(rate)));
            }
        }
    }

    fn sample_of(data: &GeigerCounterData) -> Option<GeigerSample> {
        let counts = data.raw_counts.as_ref()?;
        Some(GeigerSample {
            itow: data.itow,
            raw_counts: counts.iter().copied().take(MAX_GEIGER_TUBE_COUNT).collect(),
        })
    }
}

impl Algorithm for GeigerCounterAlgorithm {
    fn name(&self) -> &'static str {
        "geiger_counter"
    }

    fn process(
        &self,
        vehicle: &Vehicle,
        position: &GpsCoordinate,
        payload: &AlgorithmPayload,
        mutator: &mut DeviceTreeMutator,
    ) {
        match payload {
            AlgorithmPayload::GeigerCounter(data) => self.stage(vehicle, position, data, mutator),
            _ => debug!(vehicle_id = vehicle.id(), "geiger_counter packet without geiger payload"),
        }
    }

    fn committed(&self, vehicle: &Vehicle, payload: &AlgorithmPayload) {
        if let AlgorithmPayload::GeigerCounter(data) = payload {
            vehicle.set_geiger_sample(Self::sample_of(data));
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CameraAlgorithm;

impl CameraAlgorithm {
    fn stage(&self, vehicle: &Vehicle, data: &CameraFeatureData, mutator: &mut DeviceTreeMutator) {
        let channels = &vehicle.channels().camera_features;
        if data.features.len() > MAX_CAMERA_FEATURE_COUNT {
            debug!(
                vehicle_id = vehicle.id(),
                features = data.features.len(),
                "camera features beyond channel capacity ignored"
            );
        }
        for (channel, feature) in channels.iter().zip(&data.features) {
            mutator.update(channel, Measurement::at(feature, Some(f64::from(data.itow))));
        }
    }
}

impl Algorithm for CameraAlgorithm {
    fn name(&self) -> &'static str {
        "camera"
    }

    fn process(
        &self,
        vehicle: &Vehicle,
        _position: &GpsCoordinate,
        payload: &AlgorithmPayload,
        mutator: &mut DeviceTreeMutator,
    ) {
        match payload {
            AlgorithmPayload::CameraFeatures(data) => self.stage(vehicle, data, mutator),
            _ => debug!(vehicle_id = vehicle.id(), "camera packet without feature payload"),
        }
    }
}

/// Run the named algorithm over the packet and commit its writes as one
/// batch. Returns the number of channel writes.
pub fn handle_algorithm_data_packet(
    algorithms: &AlgorithmRegistry,
    tree: &dyn DeviceTree,
    vehicle: &Vehicle,
    packet: &AlgorithmDataPacket,
) -> Result<usize> {
    let Some(position) = vehicle.position() else {
        debug!(vehicle_id = vehicle.id(), "algorithm data before first position ignored");
        return Ok(0);
    };
    let Some(algorithm) = algorithms.get(&packet.algorithm) else {
        debug!(
            vehicle_id = vehicle.id(),
            algorithm = %packet.algorithm,
            "no handler for algorithm"
        );
        return Ok(0);
    };

    let mut mutator = DeviceTreeMutator::new();
    algorithm.process(vehicle, &position, &packet.payload, &mut mutator);
    let written = mutator.commit_to(tree)?;
    algorithm.committed(vehicle, &packet.payload);
    Ok(written)
}

pub(crate) fn route_algorithm_data(
    driver: &FleetDriver,
    packet: &Packet,
    _source: &Source,
) -> Result<()> {
    let Packet::AlgorithmData(data) = packet else {
        return Ok(());
    };
    let vehicle = driver.get_or_create_vehicle(data.uav_id);
    let written =
        handle_algorithm_data_packet(driver.algorithms(), driver.device_tree(), &vehicle, data)?;
    debug!(vehicle_id = vehicle.id(), algorithm = %data.algorithm, written, "algorithm data stored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_tree::InMemoryDeviceTree;
    use crate::vehicle::StatusUpdate;
    use flock_msg::{ErrorClass, VelocityNed};

    fn sample(itow: u32, counts: &[u32]) -> GeigerSample {
        GeigerSample {
            itow,
            raw_counts: counts.to_vec(),
        }
    }

    fn positioned_vehicle(tree: &InMemoryDeviceTree) -> Vehicle {
        let vehicle = Vehicle::new("V-01");
        for (path, unit) in vehicle.channels().declarations() {
            tree.declare_channel(path, unit);
        }
        vehicle.update_status(StatusUpdate {
            position: GpsCoordinate::new(47.5, 19.0).with_agl(12.0),
            velocity: VelocityNed::default(),
            heading: 0.0,
            algorithm: "geiger_counter".into(),
            error: ErrorClass::NoError,
        });
        vehicle
    }

    fn geiger(itow: u32, counts: Vec<u32>) -> AlgorithmDataPacket {
        AlgorithmDataPacket {
            uav_id: 1,
            algorithm: "geiger_counter".into(),
            payload: AlgorithmPayload::GeigerCounter(GeigerCounterData {
                itow,
                dose_rate: Some(0.25),
                raw_counts: Some(counts),
            }),
        }
    }

    #[test]
    fn rate_is_count_delta_per_second() {
        let rates = counter_rates(&sample(1000, &[100, 10]), &sample(2000, &[150, 10]));
        assert_eq!(rates, vec![Some(50.0), Some(0.0)]);
    }

    #[test]
    fn decreasing_count_has_no_rate() {
        let rates = counter_rates(&sample(1000, &[100]), &sample(2000, &[90]));
        assert_eq!(rates, vec![None]);
    }

    #[test]
    fn non_advancing_time_has_no_rate() {
        let rates = counter_rates(&sample(2000, &[100]), &sample(2000, &[150]));
        assert_eq!(rates, vec![None]);
    }

    #[test]
    fn geiger_packets_write_counts_and_rates() {
        let tree = InMemoryDeviceTree::new();
        let vehicle = positioned_vehicle(&tree);
        let algorithms = AlgorithmRegistry::with_defaults();
        let channels = vehicle.channels().clone();

        let first = handle_algorithm_data_packet(&algorithms, &tree, &vehicle, &geiger(1000, vec![100, 7]))
            .expect("first");
        assert_eq!(first, 3);
        assert!(tree.value(&channels.rates[0]).is_none());

        handle_algorithm_data_packet(&algorithms, &tree, &vehicle, &geiger(2000, vec![150, 7]))
            .expect("second");
        let rate = tree.value(&channels.rates[0]).expect("rate written");
        assert_eq!(rate.value, Some(50.0));
        assert_eq!(rate.agl, Some(12.0));
        assert_eq!(tree.value(&channels.raw_counts[0]).and_then(|m| m.value), Some(150.0));
        assert_eq!(tree.value(&channels.dose_rate).and_then(|m| m.value), Some(0.25));

        handle_algorithm_data_packet(&algorithms, &tree, &vehicle, &geiger(3000, vec![90, 7]))
            .expect("third");
        assert_eq!(tree.value(&channels.rates[0]).and_then(|m| m.value), Some(50.0));
        assert_eq!(tree.writes(&channels.rates[0]), 1);
    }

    #[test]
    fn disabled_counter_writes_null_dose_rate() {
        let tree = InMemoryDeviceTree::new();
        let vehicle = positioned_vehicle(&tree);
        let packet = AlgorithmDataPacket {
            uav_id: 1,
            algorithm: "geiger_counter".into(),
            payload: AlgorithmPayload::GeigerCounter(GeigerCounterData {
                itow: 5,
                dose_rate: None,
                raw_counts: None,
            }),
        };
        let written =
            handle_algorithm_data_packet(&AlgorithmRegistry::with_defaults(), &tree, &vehicle, &packet)
                .unwrap();
        assert_eq!(written, 1);
        let dose = tree.value(&vehicle.channels().dose_rate).expect("written");
        assert_eq!(dose.value, None);
    }

    #[test]
    fn failed_commit_keeps_previous_sample() {
        let tree = InMemoryDeviceTree::new();
        let vehicle = Vehicle::new("V-01");
        let channels = vehicle.channels().clone();
        for (path, unit) in channels.declarations() {
            if path != &channels.rates[0] {
                tree.declare_channel(path, unit);
            }
        }
        vehicle.update_status(StatusUpdate {
            position: GpsCoordinate::new(47.5, 19.0),
            velocity: VelocityNed::default(),
            heading: 0.0,
            algorithm: "geiger_counter".into(),
            error: ErrorClass::NoError,
        });
        let algorithms = AlgorithmRegistry::with_defaults();

        handle_algorithm_data_packet(&algorithms, &tree, &vehicle, &geiger(1000, vec![100]))
            .expect("no rate on first sample");
        assert!(handle_algorithm_data_packet(&algorithms, &tree, &vehicle, &geiger(2000, vec![150]))
            .is_err());
        assert_eq!(vehicle.geiger_sample(), Some(sample(1000, &[100])));
        assert_eq!(tree.value(&channels.raw_counts[0]).and_then(|m| m.value), Some(100.0));

        tree.declare_channel(&channels.rates[0], Some("count/sec"));
        handle_algorithm_data_packet(&algorithms, &tree, &vehicle, &geiger(3000, vec![250]))
            .expect("rate across both seconds");
        assert_eq!(tree.value(&channels.rates[0]).and_then(|m| m.value), Some(75.0));
    }

    #[test]
    fn disabled_counter_forgets_previous_sample() {
        let tree = InMemoryDeviceTree::new();
        let vehicle = positioned_vehicle(&tree);
        let algorithms = AlgorithmRegistry::with_defaults();
        let rate = vehicle.channels().rates[0].clone();

        handle_algorithm_data_packet(&algorithms, &tree, &vehicle, &geiger(1000, vec![100])).unwrap();
        let disabled = AlgorithmDataPacket {
            uav_id: 1,
            algorithm: "geiger_counter".into(),
            payload: AlgorithmPayload::GeigerCounter(GeigerCounterData {
                itow: 2000,
                dose_rate: None,
                raw_counts: None,
            }),
        };
        handle_algorithm_data_packet(&algorithms, &tree, &vehicle, &disabled).unwrap();
        assert!(vehicle.geiger_sample().is_none());

        handle_algorithm_data_packet(&algorithms, &tree, &vehicle, &geiger(9000, vec![800])).unwrap();
        assert!(tree.value(&rate).is_none());
        assert_eq!(vehicle.geiger_sample(), Some(sample(9000, &[800])));
    }

    #[test]
    fn camera_features_carry_their_own_position() {
        let tree = InMemoryDeviceTree::new();
        let vehicle = positioned_vehicle(&tree);
        let packet = AlgorithmDataPacket {
            uav_id: 1,
            algorithm: "camera".into(),
            payload: AlgorithmPayload::CameraFeatures(CameraFeatureData {
                itow: 4242,
                features: vec![GpsCoordinate::new(1.0, 2.0), GpsCoordinate::new(3.0, 4.0)],
            }),
        };
        let written =
            handle_algorithm_data_packet(&AlgorithmRegistry::with_defaults(), &tree, &vehicle, &packet)
                .unwrap();
        assert_eq!(written, 2);
        let second = tree.value(&vehicle.channels().camera_features[1]).unwrap();
        assert_eq!((second.lat, second.lon), (3.0, 4.0));
        assert_eq!(second.value, Some(4242.0));
    }

    #[test]
    fn unknown_algorithm_and_missing_position_are_noops() {
        let tree = InMemoryDeviceTree::new();
        let algorithms = AlgorithmRegistry::with_defaults();

        let unpositioned = Vehicle::new("V-02");
        assert_eq!(
            handle_algorithm_data_packet(&algorithms, &tree, &unpositioned, &geiger(1, vec![1])).unwrap(),
            0
        );

        let vehicle = positioned_vehicle(&tree);
        let packet = AlgorithmDataPacket {
            uav_id: 1,
            algorithm: "spectrometer".into(),
            payload: AlgorithmPayload::Raw { bytes: vec![1, 2] },
        };
        assert_eq!(
            handle_algorithm_data_packet(&algorithms, &tree, &vehicle, &packet).unwrap(),
            0
        );
        assert!(tree.snapshot().is_empty());
    }
}
