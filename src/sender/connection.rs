use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client, ClientBuilder, Method, RequestBuilder};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Invalid endpoint URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),
    #[error("Probe of {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
    #[error("Probe of {endpoint} failed with HTTP {status}")]
    Status { endpoint: String, status: u16 },
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Reconnect cancelled")]
    Cancelled,
}

/// Observable lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            2 => ConnectionState::Connected,
            1 => ConnectionState::Connecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Store version as reported by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StoreVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl StoreVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses `"8.11.1"`, `"7.10.0-SNAPSHOT"` and the like.
    pub fn parse(raw: &str) -> Option<Self> {
        let core = raw.split(['-', '+']).next()?;
        let mut parts = core.split('.').map(str::parse::<u32>);
        let major = parts.next()?.ok()?;
        let minor = parts.next().and_then(Result::ok).unwrap_or(0);
        let patch = parts.next().and_then(Result::ok).unwrap_or(0);
        Some(Self::new(major, minor, patch))
    }

    pub fn at_least(self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl fmt::Display for StoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Deserialize)]
struct ProbeBody {
    version: Option<ProbeVersion>,
}

#[derive(Deserialize)]
struct ProbeVersion {
    number: String,
}

/// Static settings shared by every clone of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Base URL, credentials stripped.
    pub url: Url,
    pub username: Option<String>,
    pub password: Option<String>,
    /// `id:key` pair, sent base64-encoded as `Authorization: ApiKey ...`.
    pub api_key: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Path of the liveness probe, relative to the base URL.
    pub probe_path: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_idle_connections: usize,
    pub user_agent: String,
}

impl ConnectionSettings {
    /// Parses the endpoint and moves any `user:password@` into the settings.
    pub fn new(endpoint: &str) -> Result<Self, ConnectionError> {
        let mut url = Url::parse(endpoint).map_err(|e| ConnectionError::InvalidUrl {
            url: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConnectionError::InvalidUrl {
                url: endpoint.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        let username = (!url.username().is_empty()).then(|| url.username().to_string());
        let password = url.password().map(str::to_string);
        let strip_err = |_| ConnectionError::InvalidUrl {
            url: endpoint.to_string(),
            reason: "cannot strip credentials".to_string(),
        };
        url.set_username("").map_err(strip_err)?;
        url.set_password(None).map_err(strip_err)?;

        Ok(Self {
            url,
            username,
            password,
            api_key: None,
            headers: Vec::new(),
            probe_path: "/".to_string(),
            timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(1),
            max_idle_connections: 20,
            user_agent: format!("rask-shipper/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    /// Absolute URL for `path` under the base URL, keeping any base path prefix.
    pub fn endpoint_url(&self, path: &str) -> Url {
        let mut url = self.url.clone();
        let joined = format!(
            "{}/{}",
            self.url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url
    }

    /// Like [`endpoint_url`](Self::endpoint_url) but percent-encodes each segment.
    pub fn segments_url(&self, segments: &[&str]) -> Url {
        let mut url = self.url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

struct Inner {
    settings: Arc<ConnectionSettings>,
    client: Client,
    state: AtomicU8,
    version: parking_lot::Mutex<Option<StoreVersion>>,
    reconnecting: AtomicBool,
    connect_attempts: AtomicU64,
    cancel: CancellationToken,
}

/// One logical connection to the store.
///
/// Cloning shares the same connection and state. Use
/// [`Connection::independent_clone`] for a second connection with the same
/// settings.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.inner.settings.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(settings: ConnectionSettings, cancel: CancellationToken) -> Result<Self, ConnectionError> {
        Self::from_shared(Arc::new(settings), cancel)
    }

    fn from_shared(
        settings: Arc<ConnectionSettings>,
        cancel: CancellationToken,
    ) -> Result<Self, ConnectionError> {
        let client = ClientBuilder::new()
            .timeout(settings.timeout)
            .connect_timeout(settings.connect_timeout)
            .pool_max_idle_per_host(settings.max_idle_connections)
            .user_agent(&settings.user_agent)
            .build()
            .map_err(|e| ConnectionError::ClientBuild(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                client,
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                version: parking_lot::Mutex::new(None),
                reconnecting: AtomicBool::new(false),
                connect_attempts: AtomicU64::new(0),
                cancel,
            }),
        })
    }

    /// Same settings, its own HTTP client and state. Cancelled along with `self`.
    pub fn independent_clone(&self) -> Result<Self, ConnectionError> {
        Self::from_shared(
            Arc::clone(&self.inner.settings),
            self.inner.cancel.child_token(),
        )
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    pub fn endpoint(&self) -> &str {
        self.inner.settings.url.as_str()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn version(&self) -> Option<StoreVersion> {
        *self.inner.version.lock()
    }

    /// Total probe attempts made by this connection.
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Probe the store once and mark the connection live on success.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Connecting);

        match self.probe().await {
            Ok(version) => {
                if let Some(version) = version {
                    *self.inner.version.lock() = Some(version);
                }
                self.set_state(ConnectionState::Connected);
                debug!(endpoint = %self.endpoint(), ?version, "Connected to store");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn probe(&self) -> Result<Option<StoreVersion>, ConnectionError> {
        let settings = &self.inner.settings;
        let url = settings.endpoint_url(&settings.probe_path);
        let response = timeout(
            settings.timeout,
            self.request_url(Method::GET, url).send(),
        )
        .await
        .map_err(|_| ConnectionError::Timeout {
            endpoint: self.endpoint().to_string(),
            timeout: settings.timeout,
        })??;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectionError::Status {
                endpoint: self.endpoint().to_string(),
                status: status.as_u16(),
            });
        }

        // Stores that do not report a version are still usable.
        let body = response.bytes().await.unwrap_or_default();
        Ok(serde_json::from_slice::<ProbeBody>(&body)
            .ok()
            .and_then(|b| b.version)
            .and_then(|v| StoreVersion::parse(&v.number)))
    }

    /// Calls [`connect`](Self::connect) until it succeeds, sleeping
    /// `reconnect_interval` between attempts. Only cancellation stops it.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        let interval = self.inner.settings.reconnect_interval;
        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(ConnectionError::Cancelled);
            }
            match self.connect().await {
                Ok(()) => {
                    info!(endpoint = %self.endpoint(), "Reconnected to store");
                    return Ok(());
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint(), error = %e, retry_in = ?interval, "Store not reachable");
                }
            }
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = self.inner.cancel.cancelled() => return Err(ConnectionError::Cancelled),
            }
        }
    }

    /// Start the background reconnect loop unless one is already running.
    ///
    /// Returns `true` if this call started it.
    pub fn spawn_reconnect(&self) -> bool {
        if !self.try_claim_reconnect() {
            return false;
        }

        let conn = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = conn.reconnect().await {
                    debug!(endpoint = %conn.endpoint(), error = %e, "Reconnect loop stopped");
                }
                conn.inner.reconnecting.store(false, Ordering::Release);

                // A failure reported between connecting and releasing the claim
                // found the loop still running; pick it up here.
                if conn.is_connected() || conn.inner.cancel.is_cancelled() || !conn.try_claim_reconnect() {
                    break;
                }
            }
        });
        true
    }

    fn try_claim_reconnect(&self) -> bool {
        self.inner
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the connection down after a transport failure and recover in the background.
    pub fn report_failure(&self) {
        self.set_state(ConnectionState::Disconnected);
        self.spawn_reconnect();
    }

    /// Stop any reconnect loop and mark the connection down.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.inner.settings.endpoint_url(path);
        self.request_url(method, url)
    }

    pub fn request_segments(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let url = self.inner.settings.segments_url(segments);
        self.request_url(method, url)
    }

    fn request_url(&self, method: Method, url: Url) -> RequestBuilder {
        let settings = &self.inner.settings;
        let mut builder = self.inner.client.request(method, url);

        if let Some(api_key) = &settings.api_key {
            builder = builder.header(
                reqwest::header::AUTHORIZATION,
                format!("ApiKey {}", BASE64.encode(api_key)),
            );
        } else if let Some(username) = &settings.username {
            builder = builder.basic_auth(username, settings.password.as_deref());
        }
        for (name, value) in &settings.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }
}
