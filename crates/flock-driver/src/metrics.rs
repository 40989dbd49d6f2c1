//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Fleet driver core: dispatch, reassembly and command tracking."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Prometheus metric handles for driver activity.
#[derive(Clone)]
pub struct DriverMetrics {
    packets: IntCounterVec,
    dropped: IntCounterVec,
    stale_responses: IntCounter,
    address_conflicts: IntCounter,
    addresses_in_use: IntCounter,
    commands: IntCounterVec,
    vehicles: IntGauge,
}

impl DriverMetrics {
    /// Register driver metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let packets = IntCounterVec::new(
            Opts::new("flock_packets_received_total", "Inbound packets by kind"),
            &["kind"],
        )?;
        let dropped = IntCounterVec::new(
            Opts::new("flock_packets_dropped_total", "Inbound packets dropped by reason"),
            &["reason"],
        )?;
        let stale_responses = IntCounter::with_opts(Opts::new(
            "flock_stale_responses_total",
            "Command responses with no pending command",
        ))?;
        let address_conflicts = IntCounter::with_opts(Opts::new(
            "flock_address_conflicts_total",
            "Status packets refused because of an address conflict",
        ))?;
        let addresses_in_use = IntCounter::with_opts(Opts::new(
            "flock_address_in_use_total",
            "Status packets refused because another vehicle owns the source address",
        ))?;
        let commands = IntCounterVec::new(
            Opts::new("flock_commands_total", "Commands by outcome"),
            &["outcome"],
        )?;
        let vehicles = IntGauge::with_opts(Opts::new(
            "flock_vehicles_known",
            "Vehicles resolved by the driver",
        ))?;

        registry.register(Box::new(packets.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(stale_responses.clone()))?;
        registry.register(Box::new(address_conflicts.clone()))?;
        registry.register(Box::new(addresses_in_use.clone()))?;
        registry.register(Box::new(commands.clone()))?;
        registry.register(Box::new(vehicles.clone()))?;

        Ok(Self {
            packets,
            dropped,
            stale_responses,
            address_conflicts,
            addresses_in_use,
            commands,
            vehicles,
        })
    }

    pub fn observe_packet(&self, kind: &str) {
        self.packets.with_label_values(&[kind]).inc();
    }

    pub fn observe_drop(&self, reason: &str) {
        self.dropped.with_label_values(&[reason]).inc();
    }

    pub fn observe_stale_response(&self) {
        self.stale_responses.inc();
    }

    pub fn observe_address_conflict(&self) {
        self.address_conflicts.inc();
    }

    pub fn observe_address_in_use(&self) {
        self.addresses_in_use.inc();
    }

    pub fn observe_command(&self, outcome: &str) {
        self.commands.with_label_values(&[outcome]).inc();
    }

    pub fn set_vehicle_count(&self, count: usize) {
        self.vehicles.set(count as i64);
    }
}

impl std::fmt::Debug for DriverMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_registry() {
        let registry = Registry::new();
        let metrics = DriverMetrics::register(&registry).expect("register");
        metrics.observe_packet("status");
        metrics.observe_packet("status");
        metrics.observe_drop("unknown_source");
        metrics.observe_command("completed");

        let families = registry.gather();
        let packets = families
            .iter()
            .find(|f| f.get_name() == "flock_packets_received_total")
            .expect("packet family");
        assert_eq!(packets.get_metric()[0].get_counter().get_value(), 2.0);
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        DriverMetrics::register(&registry).expect("first");
        assert!(DriverMetrics::register(&registry).is_err());
    }
}
