//! cgm-link: demo driver for the cgm-link telemetry engine.
//!
//! `pair` reads a simulated sensor over NFC, `stream` pairs and then follows
//! the sensor over a simulated, lossy BLE link, and `relay` follows a relay
//! account (scripted by default, the real service with `--live`).

mod config;

use anyhow::{Context, Result};
use cgm_link_core::calibration::Calibration;
use cgm_link_core::connection::{ConnectionMachine, LinkConfig, LinkInput, SensorBinding};
use cgm_link_core::driver::{spawn_link, NullCentral};
use cgm_link_core::events::{LinkErrorKind, LinkEvent};
use cgm_link_core::pairing::{start_pairing, PairingConfig, PairingRequest, PairingResult};
use cgm_link_core::profile::{sensor_address, BridgeProfile, DirectProfile, LinkProfile, PeripheralId, RelayProfile};
use cgm_link_core::reading::ReadingBatch;
use cgm_link_core::relay::{
    relay_spawner, Credentials, HttpRelayTransport, RelayClient, RelayConfig, RelayPoller, RelayTransport,
};
use cgm_link_core::sim::{
    libre2_identity, CentralScript, LinkSimulator, SensorSimulator, SimulatedCentral, SimulatedRelay, SimulatedTag,
    TagFaults,
};
use cgm_link_core::store::{JsonFileStore, KeyValueStore, MemoryStore, UnlockCounter};
use cgm_link_core::LinkHandle;
use clap::Parser;
use config::{Cli, Command, Config, PairArgs, ProfileKind, RelayArgs, StreamArgs};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "cgm_link=info,cgm_link_core=info";
const EVENT_QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::resolve(Cli::parse());
    if config.print_config {
        config.print();
    }

    let store = open_store(config.store.as_deref())?;
    match config.command.clone() {
        Command::Pair(args) => run_pair(&config, &args, store).await,
        Command::Stream(args) => run_stream(&config, &args, store).await,
        Command::Relay(args) => run_relay(&config, &args, store).await,
    }
}

fn open_store(path: Option<&Path>) -> Result<Arc<dyn KeyValueStore>> {
    Ok(match path {
        Some(path) => Arc::new(
            JsonFileStore::open(path).with_context(|| format!("failed to open store {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    })
}

async fn pair(sensor: &SensorSimulator, request: PairingRequest, store: Arc<dyn KeyValueStore>) -> Result<PairingResult> {
    let tag = SimulatedTag::new(sensor, TagFaults::default()).context("failed to build simulated tag")?;
    let counter = UnlockCounter::new(store.clone());
    let handle = start_pairing(tag, request, PairingConfig::default(), store, counter);

    let mut progress = handle.state();
    tokio::spawn(async move {
        // ends when the session drops its sender
        while progress.changed().await.is_ok() {
            let state = *progress.borrow_and_update();
            debug!(?state, "pairing progress");
        }
    });

    handle.wait().await.context("pairing failed")
}

async fn run_pair(config: &Config, args: &PairArgs, store: Arc<dyn KeyValueStore>) -> Result<()> {
    let mut sensor = SensorSimulator::new(libre2_identity(), config.seed).with_age(args.age);
    if args.activate {
        sensor = sensor.with_age(0).with_state_code(1);
    }
    let request = PairingRequest {
        enable_streaming: args.enable_streaming,
        activate: args.activate,
    };

    let result = pair(&sensor, request, store).await?;
    print_pairing(&result);
    Ok(())
}

fn print_pairing(result: &PairingResult) {
    println!("=== Sensor ===");
    println!("Serial: {}", result.serial_number);
    println!("Type: {}", result.sensor_type);
    println!("Region: {:?}", result.identity.region());
    println!("Age: {} min ({:?})", result.parsed.age_minutes, result.parsed.lifecycle);
    println!("Started: {}", result.sensor_start().format("%Y-%m-%d %H:%M"));
    if result.activated {
        println!("Activated: yes");
    }
    if let Some(streaming) = &result.streaming {
        println!("Streaming enabled (enable time {})", streaming.enable_time);
    }
    println!();
    print_batch(&result.parsed.batch);
}

fn print_batch(batch: &ReadingBatch) {
    for reading in batch.history.iter().chain(&batch.trend) {
        println!(
            "{}  {:>5.0} mg/dL  {:?}",
            reading.timestamp.format("%H:%M"),
            reading.mg_dl,
            reading.kind
        );
    }
}

/// Report link events until `deadline`. Stops early on a credential error.
async fn follow_events(events: &mut mpsc::Receiver<LinkEvent>, deadline: Instant) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::time::sleep_until(deadline) => return,
        };
        let Some(event) = event else {
            return;
        };

        match event {
            LinkEvent::State(state) => info!(%state, "link state"),
            LinkEvent::Readings(batch) => match batch.latest() {
                Some(latest) => {
                    println!(
                        "{}  {:>5.0} mg/dL  ({} readings)",
                        latest.timestamp.format("%H:%M:%S"),
                        latest.mg_dl,
                        batch.len()
                    );
                }
                None => debug!("empty batch"),
            },
            LinkEvent::Lifecycle { age_minutes, lifecycle } => debug!(age_minutes, ?lifecycle, "sensor age"),
            LinkEvent::Error(error) => {
                warn!(kind = ?error.kind, critical = error.critical, "{}", error.message);
                if error.kind == LinkErrorKind::Credentials {
                    return;
                }
            }
        }
    }
}

async fn finish(handle: LinkHandle, config: &Config) -> Result<()> {
    let metrics = handle.shutdown().await.context("link did not shut down cleanly")?;
    if config.print_metrics {
        metrics.print_summary();
    }
    Ok(())
}

async fn run_stream(config: &Config, args: &StreamArgs, store: Arc<dyn KeyValueStore>) -> Result<()> {
    let sensor = SensorSimulator::new(libre2_identity(), config.seed).with_age(args.age);
    let request = PairingRequest {
        enable_streaming: true,
        activate: false,
    };
    let paired = pair(&sensor, request, store.clone()).await?;
    let enable_time = paired
        .streaming
        .map(|s| s.enable_time)
        .context("sensor did not enable streaming")?;
    info!(serial = %paired.serial_number, enable_time, "paired");

    let profile: Box<dyn LinkProfile> = match args.profile {
        ProfileKind::Direct => Box::new(DirectProfile),
        ProfileKind::Bridge => Box::new(BridgeProfile),
    };
    let services = profile.services().context("profile has no radio endpoints")?;
    let layout = profile.fragment_layout().context("profile has no fragment layout")?;

    let address = sensor_address(&paired.identity);
    let link_config = LinkConfig {
        stale_fragment_timeout: Duration::from_millis(args.fragment_timeout_ms),
        sampling_interval_minutes: args.sampling_interval,
        expected_address: Some(address.clone()),
        ..LinkConfig::default()
    };
    let tick_period = link_config.tick_period;
    let binding = SensorBinding::new(
        paired.identity,
        Calibration::factory(paired.factory_calibration),
        enable_time,
    );
    let counter = UnlockCounter::new(store.clone());
    let machine = ConnectionMachine::new(profile, link_config, Some(binding), store, counter);

    let frame_period = Duration::from_millis(args.frame_period_ms);
    let script = CentralScript {
        peripheral: PeripheralId(format!("sim-{}", paired.serial_number)),
        address: Some(address),
        service: services.service,
        layout,
        frame_period,
        frames: args.frames,
        disconnect_after: args.disconnect_after,
        failing_connects: 0,
        failing_writes: 0,
    };
    let sensor = Arc::new(Mutex::new(sensor));
    let link = Arc::new(Mutex::new(LinkSimulator::new(config.conditions)));

    let (events_tx, mut events) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let handle = spawn_link(
        machine,
        tick_period,
        |inputs| SimulatedCentral::new(inputs, sensor.clone(), link.clone(), script),
        None,
        events_tx,
    );
    handle.send(LinkInput::PoweredOn).await?;
    handle.connect().await?;

    let frames = args.frames + args.disconnect_after.unwrap_or(0);
    let deadline = Instant::now() + frame_period * (frames as u32 + 2);
    follow_events(&mut events, deadline).await;

    finish(handle, config).await?;
    if config.print_metrics {
        let stats = link.lock().stats();
        println!("=== Radio Simulation ===");
        println!("Payloads sent: {}", stats.payloads_sent);
        println!("Fragments dropped: {}", stats.fragments_dropped);
        println!("Fragments reordered: {}", stats.fragments_reordered);
        println!("Payloads corrupted: {}", stats.payloads_corrupted);
    }
    Ok(())
}

async fn run_relay(config: &Config, args: &RelayArgs, store: Arc<dyn KeyValueStore>) -> Result<()> {
    let relay_config = Config::relay_config(args);
    let credentials = Credentials {
        email: args.email.clone(),
        password: args.password.clone(),
    };

    if args.live {
        let transport =
            HttpRelayTransport::new(relay_config.request_timeout).context("failed to build HTTP client")?;
        follow_relay(config, args, transport, relay_config, credentials, store).await
    } else {
        let transport = SimulatedRelay::new(&args.email, &args.password, config.seed);
        follow_relay(config, args, transport, relay_config, credentials, store).await
    }
}

async fn follow_relay<T>(
    config: &Config,
    args: &RelayArgs,
    transport: T,
    relay_config: RelayConfig,
    credentials: Credentials,
    store: Arc<dyn KeyValueStore>,
) -> Result<()>
where
    T: RelayTransport + Clone + 'static,
{
    let interval = relay_config.poll_interval;
    let client = RelayClient::new(transport, relay_config, credentials, store.clone());
    let poller = RelayPoller::new(client, interval);

    let counter = UnlockCounter::new(store.clone());
    let link_config = LinkConfig::default();
    let tick_period = link_config.tick_period;
    let machine = ConnectionMachine::new(Box::new(RelayProfile { interval }), link_config, None, store, counter);

    let (events_tx, mut events) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let handle = spawn_link(machine, tick_period, |_| NullCentral, Some(relay_spawner(poller)), events_tx);
    handle.connect().await?;

    // polls happen at 0, 1, ..., polls - 1 intervals
    let deadline = Instant::now() + interval * args.polls.saturating_sub(1) + interval / 2;
    follow_events(&mut events, deadline).await;

    finish(handle, config).await
}
