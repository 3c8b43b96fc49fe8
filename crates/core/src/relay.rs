//! Cloud relay client (LibreLinkUp-style follower API).
//!
//! The relay variant of a link gets readings from the vendor's follower
//! service instead of a radio. A session token is obtained by logging in,
//! cached in the [`KeyValueStore`], and refreshed when it expires or the
//! server rejects it. A login answered with a region redirect is retried once
//! against the regional host; a second redirect is an error.
//!
//! HTTP goes through [`RelayTransport`] so tests can script the server.

use crate::connection::{LinkInput, RelayFailure};
use crate::error::{RelayError, Result as CrateResult};
use crate::reading::{GlucoseReading, ReadingKind};
use crate::store::{KeyValueStore, RELAY_TOKEN_KEY};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, RelayError>;

pub const DEFAULT_BASE_URL: &str = "https://api.libreview.io";
pub const LOGIN_PATH: &str = "/llu/auth/login";
pub const CONNECTIONS_PATH: &str = "/llu/connections";

/// Envelope status for rejected credentials. Other nonzero statuses (terms to
/// accept, maintenance) do not mean the password is wrong.
pub const STATUS_BAD_CREDENTIALS: i64 = 2;

/// Format of `FactoryTimestamp` values.
pub const TIMESTAMP_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

/// Relay client configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub base_url: String,
    pub product: String,
    pub version: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            product: "llu.android".to_string(),
            version: "4.7.0".to_string(),
            poll_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// One HTTP round trip.
pub trait RelayTransport: Send + Sync {
    fn send(&self, request: RelayRequest) -> impl Future<Output = Result<RelayResponse>> + Send;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpRelayTransport {
    http: reqwest::Client,
}

impl HttpRelayTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

impl RelayTransport for HttpRelayTransport {
    async fn send(&self, request: RelayRequest) -> Result<RelayResponse> {
        let mut builder = match request.method {
            Method::Get => self.http.get(&request.url),
            Method::Post => self.http.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(RelayResponse { status, body })
    }
}

/// Logged-in session, persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySession {
    pub base_url: String,
    pub token: String,
    pub expires: DateTime<Utc>,
    /// SHA-256 of the account's user id, sent as `Account-Id`
    pub account_id: String,
}

impl RelaySession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires
    }
}

/// Hex SHA-256 of a relay user id.
pub fn account_id(user_id: &str) -> String {
    Sha256::digest(user_id.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Parse a `FactoryTimestamp` (UTC).
pub fn parse_factory_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: i64,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(default)]
    redirect: bool,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    user: Option<User>,
    #[serde(rename = "authTicket", default)]
    auth_ticket: Option<AuthTicket>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AuthTicket {
    token: String,
    expires: i64,
}

#[derive(Debug, Deserialize)]
struct Connection {
    #[serde(rename = "patientId")]
    patient_id: String,
}

#[derive(Debug, Deserialize)]
struct GraphData {
    connection: GraphConnection,
    #[serde(rename = "graphData", default)]
    graph_data: Vec<Measurement>,
}

#[derive(Debug, Deserialize)]
struct GraphConnection {
    #[serde(rename = "glucoseMeasurement")]
    glucose_measurement: Option<Measurement>,
}

#[derive(Debug, Deserialize)]
struct Measurement {
    #[serde(rename = "FactoryTimestamp")]
    factory_timestamp: String,
    #[serde(rename = "ValueInMgPerDl")]
    value_in_mg_per_dl: f64,
}

impl Measurement {
    fn to_reading(&self, kind: ReadingKind) -> Option<GlucoseReading> {
        let timestamp = parse_factory_timestamp(&self.factory_timestamp)?;
        Some(GlucoseReading {
            timestamp,
            age_minutes: None,
            mg_dl: self.value_in_mg_per_dl,
            kind,
            raw: None,
        })
    }
}

/// Follower API client holding the session.
pub struct RelayClient<T: RelayTransport> {
    transport: T,
    config: RelayConfig,
    credentials: Credentials,
    store: Arc<dyn KeyValueStore>,
    session: Option<RelaySession>,
    patient_id: Option<String>,
}

impl<T: RelayTransport> RelayClient<T> {
    pub fn new(transport: T, config: RelayConfig, credentials: Credentials, store: Arc<dyn KeyValueStore>) -> Self {
        let session = match store.get(RELAY_TOKEN_KEY) {
            Ok(Some(json)) => serde_json::from_str(&json).ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "could not load relay session");
                None
            }
        };

        Self {
            transport,
            config,
            credentials,
            store,
            session,
            patient_id: None,
        }
    }

    pub fn session(&self) -> Option<&RelaySession> {
        self.session.as_ref()
    }

    /// A new client for the same account, with the session reloaded from the
    /// store.
    pub fn reopen(&self) -> Self
    where
        T: Clone,
    {
        Self::new(
            self.transport.clone(),
            self.config.clone(),
            self.credentials.clone(),
            self.store.clone(),
        )
    }

    fn headers(&self, session: Option<&RelaySession>) -> Vec<(String, String)> {
        let mut headers = vec![
            ("product".to_string(), self.config.product.clone()),
            ("version".to_string(), self.config.version.clone()),
            ("Accept".to_string(), "application/json".to_string()),
        ];
        if let Some(session) = session {
            headers.push(("Authorization".to_string(), format!("Bearer {}", session.token)));
            headers.push(("Account-Id".to_string(), session.account_id.clone()));
        }
        headers
    }

    async fn call(&self, method: Method, url: String, body: Option<Value>, session: Option<&RelaySession>) -> Result<Value> {
        let request = RelayRequest {
            method,
            url,
            headers: self.headers(session),
            body,
        };
        debug!(url = %request.url, "relay request");
        let response = self.transport.send(request).await?;

        match response.status {
            401 => return Err(RelayError::Unauthorized),
            200..=299 => {}
            status => {
                return Err(RelayError::Server {
                    status,
                    message: String::from_utf8_lossy(&response.body).into_owned(),
                })
            }
        }

        let envelope: Envelope = serde_json::from_slice(&response.body)?;
        match envelope.status {
            0 => {}
            status => {
                let message = envelope
                    .error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| format!("status {status}"));
                return Err(if status == STATUS_BAD_CREDENTIALS {
                    RelayError::InvalidCredentials(message)
                } else {
                    RelayError::Status { status, message }
                });
            }
        }
        envelope
            .data
            .ok_or_else(|| RelayError::InvalidResponse("missing data".into()))
    }

    /// Log in, following at most one region redirect.
    pub async fn login(&mut self) -> Result<&RelaySession> {
        let body = serde_json::json!({
            "email": self.credentials.email,
            "password": self.credentials.password,
        });

        let mut base_url = self.config.base_url.trim_end_matches('/').to_string();
        let mut redirected = false;
        let data: LoginData = loop {
            let data = self
                .call(Method::Post, format!("{base_url}{LOGIN_PATH}"), Some(body.clone()), None)
                .await?;
            let data: LoginData = serde_json::from_value(data)?;
            if !data.redirect {
                break data;
            }

            let region = data.region.unwrap_or_default();
            if redirected || region.is_empty() {
                return Err(RelayError::RedirectLoop { region });
            }
            info!(region = %region, "relay login redirected");
            base_url = format!("https://api-{region}.libreview.io");
            redirected = true;
        };

        let user = data
            .user
            .ok_or_else(|| RelayError::InvalidResponse("login without user".into()))?;
        let ticket = data
            .auth_ticket
            .ok_or_else(|| RelayError::InvalidResponse("login without auth ticket".into()))?;
        let expires = Utc
            .timestamp_opt(ticket.expires, 0)
            .single()
            .ok_or_else(|| RelayError::InvalidResponse(format!("bad expiry {}", ticket.expires)))?;

        let session = RelaySession {
            base_url,
            token: ticket.token,
            expires,
            account_id: account_id(&user.id),
        };
        if let Err(err) = self.persist(&session) {
            warn!(error = %err, "could not persist relay session");
        }
        info!(expires = %session.expires, "relay login succeeded");
        Ok(self.session.insert(session))
    }

    fn persist(&self, session: &RelaySession) -> CrateResult<()> {
        let json = serde_json::to_string(session).map_err(RelayError::from)?;
        self.store.set(RELAY_TOKEN_KEY, &json)
    }

    /// Make sure a fresh session exists.
    pub async fn ensure_session(&mut self) -> Result<()> {
        let fresh = self.session.as_ref().is_some_and(|s| !s.is_expired(Utc::now()));
        if !fresh {
            self.login().await?;
        }
        Ok(())
    }

    async fn authorized_get(&mut self, path: &str) -> Result<Value> {
        self.ensure_session().await?;
        for attempt in 0..2 {
            let session = self
                .session
                .clone()
                .ok_or_else(|| RelayError::InvalidResponse("no session".into()))?;
            let url = format!("{}{}", session.base_url, path);
            match self.call(Method::Get, url, None, Some(&session)).await {
                Err(RelayError::Unauthorized) if attempt == 0 => {
                    debug!("relay token rejected, logging in again");
                    self.session = None;
                    self.login().await?;
                }
                other => return other,
            }
        }
        Err(RelayError::Unauthorized)
    }

    /// Latest reading plus the graph history, oldest first.
    pub async fn fetch_readings(&mut self) -> Result<Vec<GlucoseReading>> {
        let patient_id = match self.patient_id.clone() {
            Some(id) => id,
            None => {
                let data = self.authorized_get(CONNECTIONS_PATH).await?;
                let connections: Vec<Connection> = serde_json::from_value(data)?;
                let id = connections
                    .into_iter()
                    .next()
                    .map(|c| c.patient_id)
                    .ok_or(RelayError::NoConnections)?;
                self.patient_id = Some(id.clone());
                id
            }
        };

        let data = self
            .authorized_get(&format!("{CONNECTIONS_PATH}/{patient_id}/graph"))
            .await?;
        let graph: GraphData = serde_json::from_value(data)?;

        let mut readings: Vec<GlucoseReading> = graph
            .graph_data
            .iter()
            .filter_map(|m| m.to_reading(ReadingKind::History))
            .collect();
        if let Some(latest) = graph
            .connection
            .glucose_measurement
            .as_ref()
            .and_then(|m| m.to_reading(ReadingKind::Trend))
        {
            readings.push(latest);
        }
        readings.sort_by_key(|r| r.timestamp);
        readings.dedup_by_key(|r| r.timestamp);
        Ok(readings)
    }
}

fn failure(err: &RelayError) -> RelayFailure {
    RelayFailure {
        message: err.to_string(),
        credential: err.is_credential_error(),
    }
}

/// Periodic fetcher feeding a link's input queue.
///
/// Fetches run one after another on a single interval; a tick that fires while
/// a fetch is still running is skipped, never run concurrently.
pub struct RelayPoller<T: RelayTransport> {
    client: RelayClient<T>,
    interval: Duration,
}

impl<T: RelayTransport> RelayPoller<T> {
    pub fn new(client: RelayClient<T>, interval: Duration) -> Self {
        Self { client, interval }
    }

    pub async fn run(mut self, inputs: mpsc::Sender<LinkInput>) {
        if let Err(err) = self.client.ensure_session().await {
            let credential = err.is_credential_error();
            let _ = inputs.send(LinkInput::RelayFailed(failure(&err))).await;
            if credential {
                return;
            }
        } else if inputs.send(LinkInput::LoggedIn).await.is_err() {
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut logged_in = self.client.session().is_some();

        loop {
            ticker.tick().await;
            let input = match self.client.fetch_readings().await {
                Ok(readings) => {
                    if !logged_in {
                        logged_in = true;
                        if inputs.send(LinkInput::LoggedIn).await.is_err() {
                            return;
                        }
                    }
                    LinkInput::RelayReadings(readings)
                }
                Err(err) => {
                    let credential = err.is_credential_error();
                    if inputs.send(LinkInput::RelayFailed(failure(&err))).await.is_err() || credential {
                        return;
                    }
                    continue;
                }
            };
            if inputs.send(input).await.is_err() {
                return;
            }
        }
    }
}

/// Starts a relay poller task feeding the given queue.
pub type RelaySpawner = Box<dyn FnMut(mpsc::Sender<LinkInput>) -> JoinHandle<()> + Send>;

/// Each spawned task gets a client reopened from the store, so a restarted
/// poller picks up whatever session the previous one persisted.
pub fn relay_spawner<T>(poller: RelayPoller<T>) -> RelaySpawner
where
    T: RelayTransport + Clone + 'static,
{
    Box::new(move |inputs| {
        let fresh = RelayPoller::new(poller.client.reopen(), poller.interval);
        tokio::spawn(fresh.run(inputs))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_is_sha256_hex() {
        assert_eq!(
            account_id("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_factory_timestamp() {
        let ts = parse_factory_timestamp("10/19/2026 1:05:09 PM").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 10, 19, 13, 5, 9).unwrap());
        let ts = parse_factory_timestamp("1/2/2026 12:00:00 AM").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap());
        assert!(parse_factory_timestamp("2026-10-19T13:05:09Z").is_none());
    }

    #[test]
    fn test_session_expiry() {
        let session = RelaySession {
            base_url: DEFAULT_BASE_URL.into(),
            token: "t".into(),
            expires: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            account_id: account_id("u"),
        };
        assert!(session.is_expired(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        assert!(!session.is_expired(Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap()));
    }
}
