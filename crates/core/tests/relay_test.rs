//! Relay client and relay-backed links against a scripted follower API.

use cgm_link_core::connection::{ConnectionMachine, LinkConfig, LinkInput};
use cgm_link_core::driver::{spawn_link, NullCentral};
use cgm_link_core::error::RelayError;
use cgm_link_core::events::{ConnectionState, LinkErrorKind, LinkEvent};
use cgm_link_core::profile::RelayProfile;
use cgm_link_core::reading::ReadingKind;
use cgm_link_core::relay::{
    account_id, relay_spawner, Credentials, RelayClient, RelayConfig, RelayPoller, DEFAULT_BASE_URL,
};
use cgm_link_core::sim::SimulatedRelay;
use cgm_link_core::store::{KeyValueStore, MemoryStore, UnlockCounter, RELAY_TOKEN_KEY};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const EMAIL: &str = "follower@example.com";
const PASSWORD: &str = "correct horse";

fn client_for(relay: &SimulatedRelay, password: &str, store: Arc<dyn KeyValueStore>) -> RelayClient<SimulatedRelay> {
    let credentials = Credentials {
        email: EMAIL.into(),
        password: password.into(),
    };
    RelayClient::new(relay.clone(), RelayConfig::default(), credentials, store)
}

fn memory() -> Arc<dyn KeyValueStore> {
    Arc::new(MemoryStore::new())
}

#[tokio::test]
async fn test_login_persists_session() {
    let relay = SimulatedRelay::new(EMAIL, PASSWORD, 1);
    let store = memory();
    let mut client = client_for(&relay, PASSWORD, store.clone());

    let session = client.login().await.unwrap().clone();
    assert_eq!(session.base_url, DEFAULT_BASE_URL);
    assert_eq!(session.token, "token-1");
    assert_eq!(session.account_id, account_id("user-1"));
    assert!(store.get(RELAY_TOKEN_KEY).unwrap().is_some());

    let state = relay.state();
    let state = state.lock();
    let login = &state.requests[0];
    assert!(login.headers.iter().any(|(name, value)| name == "product" && value == "llu.android"));
    assert!(!login.headers.iter().any(|(name, _)| name == "Authorization"));
}

#[tokio::test]
async fn test_fetch_readings_sorted_oldest_first() {
    let relay = SimulatedRelay::new(EMAIL, PASSWORD, 2);
    let mut client = client_for(&relay, PASSWORD, memory());

    let readings = client.fetch_readings().await.unwrap();
    assert_eq!(readings.len(), 4);
    assert!(readings.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert!(readings[..3].iter().all(|r| r.kind == ReadingKind::History));
    assert_eq!(readings[3].kind, ReadingKind::Trend);
    assert!(readings.iter().all(|r| r.age_minutes.is_none() && r.raw.is_none()));

    let state = relay.state();
    let state = state.lock();
    assert_eq!(readings[3].timestamp, state.now);
    let authorized = state.requests.last().unwrap();
    assert!(authorized
        .headers
        .iter()
        .any(|(name, value)| name == "Account-Id" && *value == account_id("user-1")));
}

#[tokio::test]
async fn test_region_redirect_followed_once() {
    let relay = SimulatedRelay::new(EMAIL, PASSWORD, 3);
    relay.state().lock().redirect_region = Some("eu".into());
    let mut client = client_for(&relay, PASSWORD, memory());

    let session = client.login().await.unwrap().clone();
    assert_eq!(session.base_url, "https://api-eu.libreview.io");

    client.fetch_readings().await.unwrap();
    let state = relay.state();
    let state = state.lock();
    assert_eq!(state.logins, 1);
    assert!(state.requests[1..]
        .iter()
        .all(|r| r.url.starts_with("https://api-eu.libreview.io")));
}

#[tokio::test]
async fn test_redirect_loop_is_a_credential_error() {
    let relay = SimulatedRelay::new(EMAIL, PASSWORD, 4);
    {
        let state = relay.state();
        let mut state = state.lock();
        state.redirect_region = Some("us".into());
        state.redirect_loop = true;
    }
    let mut client = client_for(&relay, PASSWORD, memory());

    let err = client.login().await.unwrap_err();
    assert!(matches!(&err, RelayError::RedirectLoop { region } if region == "us"));
    assert!(err.is_credential_error());
    assert_eq!(relay.state().lock().requests.len(), 2);
}

#[tokio::test]
async fn test_wrong_password() {
    let relay = SimulatedRelay::new(EMAIL, PASSWORD, 5);
    let mut client = client_for(&relay, "hunter2", memory());

    let err = client.fetch_readings().await.unwrap_err();
    assert!(matches!(&err, RelayError::InvalidCredentials(message) if message == "notAuthenticated"));
    assert!(client.session().is_none());
}

#[tokio::test]
async fn test_rejected_token_logs_in_again() {
    let relay = SimulatedRelay::new(EMAIL, PASSWORD, 6);
    let mut client = client_for(&relay, PASSWORD, memory());
    client.fetch_readings().await.unwrap();

    relay.revoke_token();
    let readings = client.fetch_readings().await.unwrap();
    assert!(!readings.is_empty());
    assert_eq!(relay.state().lock().logins, 2);
    assert_eq!(client.session().unwrap().token, "token-2");
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let relay = SimulatedRelay::new(EMAIL, PASSWORD, 7);
    let mut client = client_for(&relay, PASSWORD, memory());
    client.login().await.unwrap();

    relay.state().lock().failing_requests = 1;
    let err = client.fetch_readings().await.unwrap_err();
    assert!(matches!(err, RelayError::Server { status: 502, .. }));
    assert!(!err.is_credential_error());

    assert!(client.fetch_readings().await.is_ok());
}

#[tokio::test]
async fn test_pending_user_step_is_not_a_credential_error() {
    let relay = SimulatedRelay::new(EMAIL, PASSWORD, 12);
    relay.state().lock().status_replies = vec![4];
    let mut client = client_for(&relay, PASSWORD, memory());

    let err = client.login().await.unwrap_err();
    assert!(matches!(err, RelayError::Status { status: 4, .. }));
    assert!(!err.is_credential_error());

    assert_eq!(client.login().await.unwrap().token, "token-1");
}

#[tokio::test]
async fn test_persisted_session_is_reused() {
    let relay = SimulatedRelay::new(EMAIL, PASSWORD, 8);
    let store = memory();
    client_for(&relay, PASSWORD, store.clone()).login().await.unwrap();

    let mut restarted = client_for(&relay, PASSWORD, store);
    assert_eq!(restarted.session().map(|s| s.token.as_str()), Some("token-1"));
    restarted.fetch_readings().await.unwrap();
    assert_eq!(relay.state().lock().logins, 1);
}

fn relay_machine(store: Arc<dyn KeyValueStore>) -> ConnectionMachine {
    let counter = UnlockCounter::new(store.clone());
    ConnectionMachine::new(Box::new(RelayProfile::default()), LinkConfig::default(), None, store, counter)
}

async fn run_relay_link(relay: &SimulatedRelay, password: &str, minutes: u64) -> Vec<LinkEvent> {
    let store = memory();
    let client = client_for(relay, password, store.clone());
    let poller = RelayPoller::new(client, Duration::from_secs(60));

    let (events_tx, mut events_rx) = mpsc::channel(1024);
    let handle = spawn_link(
        relay_machine(store),
        Duration::from_secs(1),
        |_| NullCentral,
        Some(relay_spawner(poller)),
        events_tx,
    );
    handle.send(LinkInput::Connect).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60 * minutes) + Duration::from_secs(30)).await;
    handle.shutdown().await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_relay_link_streams_new_readings() {
    let relay = SimulatedRelay::new(EMAIL, PASSWORD, 9);
    let events = run_relay_link(&relay, PASSWORD, 3).await;

    assert_eq!(events[0], LinkEvent::State(ConnectionState::Pairing));
    assert_eq!(events[1], LinkEvent::State(ConnectionState::Connected));

    let batches: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            LinkEvent::Readings(batch) => Some(batch),
            _ => None,
        })
        .collect();
    // polls at 0, 1, 2 and 3 minutes
    assert_eq!(batches.len(), 4);
    assert_eq!(batches[0].trend.len(), 4);
    // later polls only add the newest measurement
    assert!(batches[1..].iter().all(|b| b.trend.len() == 1 && b.history.is_empty()));

    let timestamps: Vec<_> = batches.iter().flat_map(|b| b.trend.iter().map(|r| r.timestamp)).collect();
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(relay.state().lock().logins, 1);
}

#[tokio::test(start_paused = true)]
async fn test_relay_link_survives_non_credential_status() {
    let relay = SimulatedRelay::new(EMAIL, PASSWORD, 13);
    relay.state().lock().status_replies = vec![4];
    let events = run_relay_link(&relay, PASSWORD, 3).await;

    assert!(!events.iter().any(|event| matches!(event, LinkEvent::Error(_))));
    // only the final shutdown disconnects
    let disconnected = LinkEvent::State(ConnectionState::Disconnected);
    assert_eq!(events.last(), Some(&disconnected));
    assert!(!events[..events.len() - 1].contains(&disconnected));
    let batches = events
        .iter()
        .filter(|event| matches!(event, LinkEvent::Readings(_)))
        .count();
    assert_eq!(batches, 4);
    assert_eq!(relay.state().lock().logins, 1);
}

#[tokio::test(start_paused = true)]
async fn test_restarted_poller_reloads_session_from_store() {
    let relay = SimulatedRelay::new(EMAIL, PASSWORD, 14);
    let store = memory();
    let poller = RelayPoller::new(client_for(&relay, PASSWORD, store.clone()), Duration::from_secs(60));
    let mut spawn = relay_spawner(poller);

    // a session persisted after the poller was built
    client_for(&relay, PASSWORD, store.clone()).login().await.unwrap();

    for _ in 0..2 {
        let (inputs_tx, mut inputs) = mpsc::channel(16);
        let task = spawn(inputs_tx);
        assert_eq!(inputs.recv().await, Some(LinkInput::LoggedIn));
        assert!(matches!(inputs.recv().await, Some(LinkInput::RelayReadings(_))));
        task.abort();
    }
    assert_eq!(relay.state().lock().logins, 1);
}

#[tokio::test(start_paused = true)]
async fn test_relay_link_stops_on_bad_credentials() {
    let relay = SimulatedRelay::new(EMAIL, PASSWORD, 10);
    let events = run_relay_link(&relay, "hunter2", 2).await;

    assert_eq!(events[0], LinkEvent::State(ConnectionState::Pairing));
    assert!(matches!(
        &events[1],
        LinkEvent::Error(error) if error.kind == LinkErrorKind::Credentials && !error.critical
    ));
    assert_eq!(events[2], LinkEvent::State(ConnectionState::Disconnected));
    assert!(!events.iter().any(|event| matches!(event, LinkEvent::Readings(_))));

    // one login attempt, never retried
    assert_eq!(relay.state().lock().requests.len(), 1);
}
