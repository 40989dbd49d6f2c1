//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Fleet driver core: dispatch, reassembly and command tracking."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use flock_common::{AppConfig, IdFormat};
use flock_driver::{
    ChannelPath, DispatchOutcome, DriverCollaborators, DriverError, DriverMetrics, FleetDriver,
    InMemoryDeviceTree, InMemoryPacketSink, InMemoryVehicleRegistry, VehicleRegistry,
    EXECUTION_CANCELLED,
};
use flock_msg::{
    Address, AlgorithmDataPacket, AlgorithmPayload, CommandResponseChunk, GeigerCounterData,
    GpsCoordinate, MissionInfoPacket, Packet, PrearmStatusPacket, Source, StatusPacket,
    VelocityNed,
};
use prometheus::Registry;
use tokio::task::JoinHandle;

struct Harness {
    driver: Arc<FleetDriver>,
    sink: InMemoryPacketSink,
    vehicles: Arc<InMemoryVehicleRegistry>,
    tree: Arc<InMemoryDeviceTree>,
}

fn config(strict: bool) -> AppConfig {
    let mut config = AppConfig::default();
    config.driver.id_format = IdFormat::parse("V-{0:02}").expect("valid format");
    config.driver.allow_multiple_commands_per_vehicle = !strict;
    config
}

fn harness_with(config: AppConfig) -> Harness {
    let sink = InMemoryPacketSink::new();
    let vehicles = Arc::new(InMemoryVehicleRegistry::new());
    let tree = Arc::new(InMemoryDeviceTree::new());
    let driver = FleetDriver::new(
        &config,
        DriverCollaborators {
            vehicles: vehicles.clone(),
            device_tree: tree.clone(),
            sink: Arc::new(sink.clone()),
        },
    );
    Harness {
        driver: Arc::new(driver),
        sink,
        vehicles,
        tree,
    }
}

fn harness(strict: bool) -> Harness {
    harness_with(config(strict))
}

fn wireless(address: &str) -> Source {
    Source::new("wireless", address)
}

fn status(id: u32) -> Packet {
    Packet::Status(StatusPacket {
        id,
        location: GpsCoordinate::new(47.4733, 19.0622).with_agl(15.0),
        velocity: VelocityNed::default(),
        heading: 180.0,
        algorithm_name: "geiger_counter".into(),
        error: 0,
    })
}

fn response(sequence_id: u8, index: u8, total: u8, body: &[u8]) -> Packet {
    Packet::CommandResponse(CommandResponseChunk {
        sequence_id,
        chunk_index: index,
        total_chunks: total,
        body: body.to_vec(),
    })
}

fn spawn_command(driver: &Arc<FleetDriver>, vehicle: &str, command: &str) -> JoinHandle<flock_driver::Result<String>> {
    let driver = driver.clone();
    let vehicle = vehicle.to_owned();
    let command = command.to_owned();
    tokio::spawn(async move { driver.send_command(&vehicle, &command).await })
}

async fn wait_for_sends(sink: &InMemoryPacketSink, count: usize) {
    for _ in 0..100 {
        if sink.len() >= count {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("expected {count} sent packets, saw {}", sink.len());
}

#[tokio::test]
async fn address_conflict_keeps_first_address() {
    let h = harness(false);
    assert_eq!(
        h.driver.handle_inbound_packet(&status(7), &wireless("addrA")),
        DispatchOutcome::Handled
    );
    assert!(h.vehicles.exists("V-07"));

    let err = h
        .driver
        .dispatch(&status(7), &wireless("addrB"))
        .expect_err("conflict");
    match err {
        DriverError::AddressConflict { vehicle, existing, incoming, .. } => {
            assert_eq!(vehicle, "V-07");
            assert_eq!(existing, Address::new("addrA"));
            assert_eq!(incoming, Address::new("addrB"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        h.driver.handle_inbound_packet(&status(7), &wireless("addrB")),
        DispatchOutcome::Rejected
    );
    assert_eq!(
        h.driver.addresses().addresses_of("V-07").get("wireless"),
        Some(&Address::new("addrA"))
    );
}

#[tokio::test]
async fn land_resolves_with_two_chunk_response() {
    let h = harness(false);
    h.driver.handle_inbound_packet(&status(7), &wireless("addrA"));

    let pending = spawn_command(&h.driver, "V-07", "land");
    wait_for_sends(&h.sink, 1).await;
    assert_eq!(h.sink.sent_commands(), vec!["land".to_owned()]);
    assert_eq!(h.sink.sent()[0].destination, wireless("addrA"));

    h.driver
        .handle_inbound_packet(&response(1, 0, 2, b"landing "), &wireless("addrA"));
    assert!(h.driver.commands().is_pending("V-07"));
    h.driver
        .handle_inbound_packet(&response(1, 1, 2, b"started"), &wireless("addrA"));

    let text = pending.await.expect("join").expect("command");
    assert_eq!(text, "landing started");
    assert!(!h.driver.commands().is_pending("V-07"));
}

#[tokio::test]
async fn compressed_response_is_inflated() {
    let h = harness(false);
    h.driver.handle_inbound_packet(&status(3), &wireless("addrC"));

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"rth acknowledged").expect("compress");
    let compressed = encoder.finish().expect("finish");

    let pending = spawn_command(&h.driver, "V-03", "rth");
    wait_for_sends(&h.sink, 1).await;
    let packet = Packet::CompressedCommandResponse(CommandResponseChunk {
        sequence_id: 9,
        chunk_index: 0,
        total_chunks: 1,
        body: compressed,
    });
    assert_eq!(
        h.driver.handle_inbound_packet(&packet, &wireless("addrC")),
        DispatchOutcome::Handled
    );
    assert_eq!(pending.await.unwrap().unwrap(), "rth acknowledged");
}

#[tokio::test]
async fn lenient_mode_cancels_previous_command() {
    let h = harness(false);
    h.driver.handle_inbound_packet(&status(1), &wireless("addr1"));

    let first = spawn_command(&h.driver, "V-01", "motoron");
    wait_for_sends(&h.sink, 1).await;
    let second = spawn_command(&h.driver, "V-01", "land");
    wait_for_sends(&h.sink, 2).await;

    assert_eq!(first.await.unwrap().unwrap(), EXECUTION_CANCELLED);

    h.driver
        .handle_inbound_packet(&response(2, 0, 1, b"ok"), &wireless("addr1"));
    assert_eq!(second.await.unwrap().unwrap(), "ok");
}

#[tokio::test]
async fn strict_mode_rejects_second_command_without_sending() {
    let h = harness(true);
    h.driver.handle_inbound_packet(&status(1), &wireless("addr1"));

    let first = spawn_command(&h.driver, "V-01", "motoron");
    wait_for_sends(&h.sink, 1).await;

    let err = h
        .driver
        .send_command("V-01", "land")
        .await
        .expect_err("busy");
    assert!(matches!(err, DriverError::CommandAlreadyInProgress(ref id) if id == "V-01"));
    assert_eq!(h.sink.len(), 1);

    h.driver
        .handle_inbound_packet(&response(4, 0, 1, b"motors on"), &wireless("addr1"));
    assert_eq!(first.await.unwrap().unwrap(), "motors on");
}

#[tokio::test]
async fn response_from_unknown_source_is_dropped() {
    let registry = Registry::new();
    let metrics = DriverMetrics::register(&registry).expect("metrics");
    let sink = InMemoryPacketSink::new();
    let driver = Arc::new(
        FleetDriver::new(
            &config(false),
            DriverCollaborators {
                vehicles: Arc::new(InMemoryVehicleRegistry::new()),
                device_tree: Arc::new(InMemoryDeviceTree::new()),
                sink: Arc::new(sink.clone()),
            },
        )
        .with_metrics(metrics),
    );
    driver.handle_inbound_packet(&status(1), &wireless("addr1"));

    let pending = spawn_command(&driver, "V-01", "land");
    wait_for_sends(&sink, 1).await;

    assert_eq!(
        driver.handle_inbound_packet(&response(1, 0, 1, b"spoofed"), &wireless("stranger")),
        DispatchOutcome::Handled
    );
    assert!(driver.commands().is_pending("V-01"));

    driver.handle_inbound_packet(&response(1, 0, 1, b"landed"), &wireless("addr1"));
    assert_eq!(pending.await.unwrap().unwrap(), "landed");

    // A late duplicate has nobody waiting for it.
    driver.handle_inbound_packet(&response(2, 0, 1, b"landed"), &wireless("addr1"));

    let families = registry.gather();
    let counter = |name: &str| {
        families
            .iter()
            .find(|f| f.get_name() == name)
            .map(|f| f.get_metric().iter().map(|m| m.get_counter().get_value()).sum::<f64>())
            .unwrap_or_default()
    };
    assert_eq!(counter("flock_packets_dropped_total"), 1.0);
    assert_eq!(counter("flock_stale_responses_total"), 1.0);
}

#[tokio::test]
async fn claims_on_owned_address_are_counted() {
    let registry = Registry::new();
    let metrics = DriverMetrics::register(&registry).expect("metrics");
    let driver = FleetDriver::new(
        &config(false),
        DriverCollaborators {
            vehicles: Arc::new(InMemoryVehicleRegistry::new()),
            device_tree: Arc::new(InMemoryDeviceTree::new()),
            sink: Arc::new(InMemoryPacketSink::new()),
        },
    )
    .with_metrics(metrics);

    driver.handle_inbound_packet(&status(1), &wireless("shared"));
    assert_eq!(
        driver.handle_inbound_packet(&status(2), &wireless("shared")),
        DispatchOutcome::Rejected
    );
    driver.handle_inbound_packet(&status(1), &wireless("other"));

    let families = registry.gather();
    let counter = |name: &str| {
        families
            .iter()
            .find(|f| f.get_name() == name)
            .map(|f| f.get_metric().iter().map(|m| m.get_counter().get_value()).sum::<f64>())
            .unwrap_or_default()
    };
    assert_eq!(counter("flock_address_in_use_total"), 1.0);
    assert_eq!(counter("flock_address_conflicts_total"), 1.0);
}

#[tokio::test]
async fn geiger_rates_follow_count_deltas() {
    let h = harness(false);
    h.driver.handle_inbound_packet(&status(2), &wireless("addr2"));

    let geiger = |itow: u32, count: u32| {
        Packet::AlgorithmData(AlgorithmDataPacket {
            uav_id: 2,
            algorithm: "geiger_counter".into(),
            payload: AlgorithmPayload::GeigerCounter(GeigerCounterData {
                itow,
                dose_rate: Some(0.12),
                raw_counts: Some(vec![count]),
            }),
        })
    };
    let rate = ChannelPath::new("V-02", "geiger_counter", "rate_0");

    h.driver.handle_inbound_packet(&geiger(1000, 100), &wireless("addr2"));
    assert!(h.tree.value(&rate).is_none());

    h.driver.handle_inbound_packet(&geiger(2000, 150), &wireless("addr2"));
    assert_eq!(h.tree.value(&rate).and_then(|m| m.value), Some(50.0));

    h.driver.handle_inbound_packet(&geiger(3000, 90), &wireless("addr2"));
    assert_eq!(h.tree.writes(&rate), 1);
    let raw = ChannelPath::new("V-02", "geiger_counter", "raw_count_0");
    assert_eq!(h.tree.value(&raw).and_then(|m| m.value), Some(90.0));
}

#[tokio::test]
async fn vehicle_ids_stay_stable_after_registry_purge() {
    let h = harness(false);
    assert_eq!(h.driver.vehicle_id_for(7), "V-07");
    h.driver.handle_inbound_packet(&status(7), &wireless("addrA"));

    h.vehicles.remove("V-07");
    assert!(!h.vehicles.exists("V-07"));

    assert_eq!(
        h.driver.handle_inbound_packet(&status(7), &wireless("addrA")),
        DispatchOutcome::Handled
    );
    assert!(h.vehicles.exists("V-07"));
    assert_eq!(h.driver.vehicle_id_for(7), "V-07");
}

#[tokio::test]
async fn invalid_characters_in_formatted_ids_are_replaced() {
    let mut config = config(false);
    config.driver.id_format = IdFormat::parse("uav #{0}").unwrap();
    let h = harness_with(config);
    assert_eq!(h.driver.vehicle_id_for(4), "uav__4");
}

#[tokio::test]
async fn unrouted_packets_are_not_fatal() {
    let h = harness(false);
    let source = wireless("addr9");
    assert_eq!(
        h.driver.handle_inbound_packet(
            &Packet::Other {
                type_code: 42,
                payload: vec![1, 2, 3],
            },
            &source
        ),
        DispatchOutcome::Unhandled
    );
    assert_eq!(
        h.driver
            .handle_inbound_packet(&Packet::command_request("land"), &source),
        DispatchOutcome::Unhandled
    );
    assert_eq!(
        h.driver.handle_inbound_packet(
            &Packet::PrearmStatus(PrearmStatusPacket { id: 1, flags: 3 }),
            &source
        ),
        DispatchOutcome::Ignored
    );
    assert_eq!(
        h.driver.handle_inbound_packet(
            &Packet::MissionInfo(MissionInfoPacket {
                id: 1,
                name: "survey".into(),
            }),
            &source
        ),
        DispatchOutcome::Ignored
    );
    assert!(h.vehicles.is_empty());
    assert_eq!(
        h.driver.handle_inbound_packet(&status(9), &source),
        DispatchOutcome::Handled
    );
}

#[tokio::test]
async fn command_times_out_and_releases_slot() {
    let mut config = config(true);
    config.driver.command_timeout = Duration::from_millis(50);
    let h = harness_with(config);
    h.driver.handle_inbound_packet(&status(5), &wireless("addr5"));

    let err = h.driver.land("V-05").await.expect_err("timeout");
    assert!(matches!(err, DriverError::CommandTimeout { ref vehicle, .. } if vehicle == "V-05"));
    assert!(!h.driver.commands().is_pending("V-05"));
    assert_eq!(h.sink.sent_commands(), vec!["land".to_owned()]);
}

#[tokio::test]
async fn commands_need_a_known_vehicle_and_address() {
    let h = harness(false);
    let err = h.driver.send_command("V-44", "land").await.expect_err("unknown");
    assert!(matches!(err, DriverError::UnknownVehicle(_)));

    h.driver
        .handle_inbound_packet(&status(6), &Source::new("serial", "/dev/ttyUSB0"));
    let err = h.driver.send_command("V-06", "land").await.expect_err("no address");
    assert!(matches!(err, DriverError::NoKnownAddress(ref id) if id == "V-06"));
    assert!(h.sink.is_empty());
}

#[tokio::test]
async fn failed_send_releases_slot() {
    let h = harness(true);
    h.driver.handle_inbound_packet(&status(8), &wireless("addr8"));
    h.sink.set_failing(true);

    let err = h.driver.send_command("V-08", "halt").await.expect_err("link down");
    assert!(matches!(err, DriverError::Transport(_)));
    assert!(!h.driver.commands().is_pending("V-08"));
}

#[tokio::test]
async fn generic_commands_join_arguments() {
    let h = harness(false);
    h.driver.handle_inbound_packet(&status(1), &wireless("addr1"));

    let args = vec!["alt".to_owned(), "30".to_owned()];
    h.driver
        .validate_command("set", &args, &BTreeMap::new())
        .expect("valid");
    let mut kwargs = BTreeMap::new();
    kwargs.insert("speed".to_owned(), "3".to_owned());
    assert!(matches!(
        h.driver.validate_command("set", &args, &kwargs),
        Err(DriverError::InvalidCommand(_))
    ));

    let driver = h.driver.clone();
    let pending = tokio::spawn(async move {
        driver.handle_generic_command("V-01", "set", &args).await
    });
    wait_for_sends(&h.sink, 1).await;
    assert_eq!(h.sink.sent_commands(), vec!["set alt 30".to_owned()]);
    h.driver
        .handle_inbound_packet(&response(1, 0, 1, b"done"), &wireless("addr1"));
    assert_eq!(pending.await.unwrap().unwrap(), "done");
}

#[tokio::test]
async fn status_updates_are_broadcast() {
    let h = harness(false);
    let mut notices = h.driver.subscribe_status();
    h.driver.handle_inbound_packet(&status(7), &wireless("addrA"));

    let notice = notices.recv().await.expect("notice");
    assert_eq!(notice.vehicle_id, "V-07");
    let vehicle = h.vehicles.find("V-07").expect("vehicle");
    let status = vehicle.status();
    assert_eq!(status.heading, Some(180.0));
    assert_eq!(status.algorithm.as_deref(), Some("geiger_counter"));
}
