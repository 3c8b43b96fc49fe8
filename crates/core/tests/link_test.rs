//! End-to-end streaming: pairing, then a BLE link through the simulated central.

use cgm_link_core::calibration::Calibration;
use cgm_link_core::connection::{Clock, ConnectionMachine, LinkAction, LinkConfig, LinkInput, SensorBinding};
use cgm_link_core::driver::spawn_link;
use cgm_link_core::events::{ConnectionState, LinkError, LinkErrorKind, LinkEvent};
use cgm_link_core::metrics::LinkMetrics;
use cgm_link_core::pairing::{start_pairing, PairingConfig, PairingRequest};
use cgm_link_core::profile::{
    sensor_address, Advertisement, BridgeProfile, DirectProfile, LinkProfile, PeripheralId, BRIDGE_SERVICE,
    DIRECT_SERVICE, DIRECT_WRITE,
};
use cgm_link_core::reading::GlucoseReading;
use cgm_link_core::sim::{
    libre2_identity, CentralLog, CentralScript, LinkConditions, LinkSimulator, SensorSimulator, SimulatedCentral,
    SimulatedTag, TagFaults,
};
use cgm_link_core::store::{KeyValueStore, MemoryStore, UnlockCounter};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Run {
    events: Vec<LinkEvent>,
    metrics: LinkMetrics,
    central: Arc<Mutex<CentralLog>>,
    sensor: Arc<Mutex<SensorSimulator>>,
    counter: UnlockCounter,
}

impl Run {
    fn readings(&self) -> Vec<&GlucoseReading> {
        self.events
            .iter()
            .filter_map(|event| match event {
                LinkEvent::Readings(batch) => Some(batch.trend.iter().chain(&batch.history)),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn batches(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, LinkEvent::Readings(_)))
            .count()
    }
}

/// Radio trouble injected by the simulated central.
#[derive(Default)]
struct RadioFaults {
    disconnect_after: Option<usize>,
    failing_writes: usize,
}

/// Pair with a simulated sensor, then stream `frames` frames from it.
async fn stream(
    profile: Box<dyn LinkProfile>,
    conditions: LinkConditions,
    frames: usize,
    faults: RadioFaults,
    flagged: &[u32],
) -> Run {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let counter = UnlockCounter::new(store.clone());

    let mut simulator = SensorSimulator::new(libre2_identity(), 21);
    for &age in flagged {
        simulator.flag(age);
    }
    let tag = SimulatedTag::new(&simulator, TagFaults::default()).unwrap();
    let request = PairingRequest {
        enable_streaming: true,
        activate: false,
    };
    let paired = start_pairing(tag, request, PairingConfig::default(), store.clone(), counter.clone())
        .wait()
        .await
        .unwrap();
    let enable_time = paired.streaming.unwrap().enable_time;

    let binding = SensorBinding::new(
        paired.identity,
        Calibration::factory(paired.factory_calibration),
        enable_time,
    );
    let services = profile.services().unwrap();
    let layout = profile.fragment_layout().unwrap();
    let config = LinkConfig {
        expected_address: Some(sensor_address(&paired.identity)),
        ..LinkConfig::default()
    };
    let tick_period = config.tick_period;
    let machine = ConnectionMachine::new(profile, config, Some(binding), store.clone(), counter.clone());

    let sensor = Arc::new(Mutex::new(simulator));
    let link = Arc::new(Mutex::new(LinkSimulator::new(conditions)));
    let script = CentralScript {
        peripheral: PeripheralId("sensor-1".into()),
        address: Some(sensor_address(&paired.identity)),
        service: services.service,
        layout,
        frame_period: Duration::from_secs(60),
        frames,
        disconnect_after: faults.disconnect_after,
        failing_connects: 0,
        failing_writes: faults.failing_writes,
    };

    let (events_tx, mut events_rx) = mpsc::channel(4096);
    let mut central_log = None;
    let handle = spawn_link(
        machine,
        tick_period,
        |inputs| {
            let central = SimulatedCentral::new(inputs, sensor.clone(), link.clone(), script);
            central_log = Some(central.log());
            central
        },
        None,
        events_tx,
    );
    handle.send(LinkInput::PoweredOn).await.unwrap();
    handle.connect().await.unwrap();

    // every frame takes one simulated minute; leave room for the last one
    let budget = Duration::from_secs(60 * (frames as u64 + 5));
    tokio::time::sleep(budget).await;

    let metrics = handle.shutdown().await.unwrap();
    let mut events = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        events.push(event);
    }

    Run {
        events,
        metrics,
        central: central_log.unwrap(),
        sensor,
        counter,
    }
}

#[tokio::test(start_paused = true)]
async fn test_direct_stream_end_to_end() {
    let run = stream(Box::new(DirectProfile), LinkConditions::perfect(1), 5, RadioFaults::default(), &[]).await;

    let states: Vec<ConnectionState> = run
        .events
        .iter()
        .filter_map(|event| match event {
            LinkEvent::State(state) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        &states[..4],
        &[
            ConnectionState::Disconnected,
            ConnectionState::Scanning,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );

    assert_eq!(run.batches(), 5);
    assert_eq!(run.metrics.frames_decoded, 5);
    assert_eq!(run.metrics.frames_failed_crc, 0);

    let sensor = run.sensor.lock();
    for reading in run.readings() {
        let age = reading.age_minutes.unwrap();
        assert!((reading.mg_dl - sensor.expected_mg_dl(age)).abs() < 0.1, "age {age}");
    }

    // pairing used counter value 1 as enable time; the BLE login used 2
    assert_eq!(run.counter.current().unwrap(), 2);
    let central = run.central.lock();
    assert_eq!(central.writes.len(), 1);
    assert_eq!(central.writes[0].0, DIRECT_WRITE);
    assert_eq!(central.writes[0].1.len(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_batches_are_sorted_and_clean() {
    // ages 1444 and 1446 fall inside the frames streamed at 1441..=1450
    let run = stream(Box::new(DirectProfile), LinkConditions::perfect(2), 10, RadioFaults::default(), &[1444, 1446]).await;

    for event in &run.events {
        if let LinkEvent::Readings(batch) = event {
            for window in [&batch.trend, &batch.history] {
                assert!(window.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
                assert!(window.iter().all(|r| r.raw.is_some_and(|raw| raw.is_valid())));
                assert!(window.iter().all(|r| r.age_minutes != Some(1444) && r.age_minutes != Some(1446)));
            }
        }
    }
    assert!(run.metrics.readings_dropped > 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_link_loss() {
    let faults = RadioFaults {
        disconnect_after: Some(2),
        ..RadioFaults::default()
    };
    let run = stream(Box::new(DirectProfile), LinkConditions::perfect(3), 4, faults, &[]).await;

    assert_eq!(run.metrics.disconnects, 1);
    assert_eq!(run.metrics.reconnect_attempts, 1);
    // two frames before the drop, four after reconnecting by id
    assert_eq!(run.batches(), 6);

    let central = run.central.lock();
    assert_eq!(central.scans, 1);
    assert_eq!(central.connects, 2);
    assert_eq!(central.writes.len(), 2);
    // each login carries a fresh counter value
    assert_ne!(central.writes[0].1, central.writes[1].1);
}

#[tokio::test(start_paused = true)]
async fn test_recovers_from_failed_unlock_write() {
    let faults = RadioFaults {
        failing_writes: 1,
        ..RadioFaults::default()
    };
    let run = stream(Box::new(DirectProfile), LinkConditions::perfect(5), 4, faults, &[]).await;

    let errors: Vec<&LinkError> = run
        .events
        .iter()
        .filter_map(|event| match event {
            LinkEvent::Error(error) => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, LinkErrorKind::Radio);
    assert!(!errors[0].critical);

    assert_eq!(run.metrics.radio_failures, 1);
    assert_eq!(run.metrics.disconnects, 1);
    assert_eq!(run.metrics.reconnect_attempts, 1);
    // every frame of the second connection arrives
    assert_eq!(run.batches(), 4);

    let central = run.central.lock();
    assert_eq!(central.scans, 1);
    assert_eq!(central.connects, 2);
    assert_eq!(central.writes.len(), 1);
    // the failed login consumed a counter value too
    assert_eq!(run.counter.current().unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_bridge_forwards_whole_payloads() {
    let run = stream(Box::new(BridgeProfile), LinkConditions::perfect(4), 3, RadioFaults::default(), &[]).await;
    assert_eq!(run.batches(), 3);
    assert!(run.central.lock().writes.is_empty());
    assert_eq!(run.metrics.fragments_received, 3);
}

#[tokio::test(start_paused = true)]
async fn test_lossy_link_never_surfaces_bad_frames() {
    let conditions = LinkConditions {
        drop_rate: 0.1,
        reorder_rate: 0.1,
        corrupt_rate: 0.3,
        seed: 77,
    };
    let run = stream(Box::new(DirectProfile), conditions, 60, RadioFaults::default(), &[]).await;

    assert!(run.batches() > 0);
    assert!(run.metrics.frames_failed_crc > 0);
    let sensor = run.sensor.lock();
    for reading in run.readings() {
        let age = reading.age_minutes.unwrap();
        assert!((reading.mg_dl - sensor.expected_mg_dl(age)).abs() < 0.1);
    }

    let ages: Vec<u32> = run
        .events
        .iter()
        .filter_map(|event| match event {
            LinkEvent::Lifecycle { age_minutes, .. } => Some(*age_minutes),
            _ => None,
        })
        .collect();
    assert!(ages.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_service_ids_match_profiles() {
    assert_eq!(DirectProfile.services().unwrap().service, DIRECT_SERVICE);
    assert_eq!(BridgeProfile.services().unwrap().service, BRIDGE_SERVICE);
}

fn random_input(rng: &mut ChaCha8Rng, powered: bool) -> LinkInput {
    let peripheral = PeripheralId("p1".into());
    match rng.gen_range(0..9) {
        0 => LinkInput::Connect,
        1 => LinkInput::Disconnect,
        2 if powered => LinkInput::PoweredOff,
        2 => LinkInput::PoweredOn,
        3 => LinkInput::Discovered(Advertisement {
            id: peripheral,
            name: None,
            address: None,
            services: vec![DIRECT_SERVICE],
        }),
        4 => LinkInput::Connected(peripheral),
        5 => LinkInput::ConnectFailed {
            peripheral,
            reason: "timeout".into(),
        },
        6 | 7 => LinkInput::Disconnected {
            peripheral,
            reason: Some("link loss".into()),
        },
        _ => LinkInput::Tick,
    }
}

#[test]
fn test_machine_policy_under_random_inputs() {
    for seed in 0..20 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let counter = UnlockCounter::new(store.clone());
        let mut machine = ConnectionMachine::new(Box::new(DirectProfile), LinkConfig::default(), None, store, counter);

        let mut powered = false;
        let mut user_disconnected = false;
        for step in 0..500 {
            let input = random_input(&mut rng, powered);
            match input {
                LinkInput::PoweredOn => powered = true,
                LinkInput::PoweredOff => powered = false,
                LinkInput::Connect => user_disconnected = false,
                LinkInput::Disconnect => user_disconnected = true,
                _ => {}
            }

            let actions = machine.handle(input, Clock::now());
            let state = machine.state();

            if powered && machine.stay_connected() {
                assert!(
                    matches!(
                        state,
                        ConnectionState::Scanning | ConnectionState::Connecting | ConnectionState::Connected
                    ),
                    "seed {seed} step {step}: idle in {state} while asked to stay connected"
                );
            }
            if user_disconnected {
                assert!(
                    !actions
                        .iter()
                        .any(|a| matches!(a, LinkAction::Connect(_) | LinkAction::StartScan { .. })),
                    "seed {seed} step {step}: reconnecting after an explicit disconnect"
                );
                if powered {
                    assert_eq!(state, ConnectionState::Disconnected, "seed {seed} step {step}");
                }
            }
        }
    }
}
