//! Centralized configuration for Courier.
//!
//! Constant defaults live in [`RpcConfig`]. Programmatic construction goes
//! through [`ClientOptions`] / [`ServerOptions`]; the serde-backed
//! [`ClientConfig`] / [`ServerConfig`] accept the camelCase keys used in
//! cluster configuration files and convert into options with validation.

use crate::client::{CustomRouter, MailboxFactory, MembershipSource};
use crate::protocol::{Namespace, WireFormat};
use crate::{Result, RpcError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Transport defaults.
pub struct RpcConfig;

impl RpcConfig {
    // Client timing
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);
    pub const KEEPALIVE: Duration = Duration::from_millis(10_000);
    pub const FLUSH_INTERVAL: Duration = Duration::from_millis(50);
    pub const CALLBACK_TIMEOUT: Duration = Duration::from_millis(30_000);
    pub const GRACE_TIMEOUT: Duration = Duration::from_millis(3000);

    // Station
    pub const PENDING_SIZE: usize = 10_000;
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;

    // Consistent hash
    pub const REPLICAS: usize = 100;

    // Gateway
    pub const DEFAULT_PORT: u16 = 3050;
    pub const DEFAULT_HOST: &'static str = "0.0.0.0";
    pub const MAX_CONNECTIONS: usize = 1024;

    // Framing
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
}

/// Built-in routing strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteStrategy {
    Random,
    RoundRobin,
    WeightedRoundRobin,
    LeastActive,
    ConsistentHash,
}

impl RouteStrategy {
    /// Short name used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteStrategy::Random => "rd",
            RouteStrategy::RoundRobin => "rr",
            RouteStrategy::WeightedRoundRobin => "wrr",
            RouteStrategy::LeastActive => "la",
            RouteStrategy::ConsistentHash => "ch",
        }
    }
}

impl FromStr for RouteStrategy {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rd" | "random" => Ok(RouteStrategy::Random),
            "rr" => Ok(RouteStrategy::RoundRobin),
            "wrr" => Ok(RouteStrategy::WeightedRoundRobin),
            "la" => Ok(RouteStrategy::LeastActive),
            "ch" => Ok(RouteStrategy::ConsistentHash),
            other => Err(RpcError::Config {
                message: format!("unknown router type: {}", other),
            }),
        }
    }
}

impl fmt::Display for RouteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digest used to place keys on the consistent-hash ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha256,
    Sha512,
    Blake3,
}

impl FromStr for HashAlgorithm {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => Err(RpcError::Config {
                message: format!("unsupported hash algorithm: {}", other),
            }),
        }
    }
}

/// Failure-handling hint for callers. The transport itself does not act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    #[default]
    Failover,
    Failfast,
    Failsafe,
    Failback,
}

impl FromStr for FailMode {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "failover" => Ok(FailMode::Failover),
            "failfast" => Ok(FailMode::Failfast),
            "failsafe" => Ok(FailMode::Failsafe),
            "failback" => Ok(FailMode::Failback),
            other => Err(RpcError::Config {
                message: format!("unknown fail mode: {}", other),
            }),
        }
    }
}

/// Per-call options threaded through the filter chains to the mailbox.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    /// Overrides the client's request timeout for this call.
    pub timeout: Option<Duration>,
    /// Free-form attributes for filters.
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

impl CallOptions {
    /// Options with no timeout override and no attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the request timeout for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach an attribute for filters to read.
    pub fn with_attr(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

/// Options for building a [`Client`](crate::Client).
#[derive(Clone)]
pub struct ClientOptions {
    /// Identifies this node in log lines.
    pub client_id: String,
    /// Coalesce outbound requests and write them on a timer.
    pub buffer_msg: bool,
    pub keepalive: Duration,
    /// Flush period when buffering.
    pub interval: Duration,
    /// Default per-request timeout.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Delay before mailboxes close on a non-forced stop.
    pub grace_timeout: Duration,
    /// Bound on calls queued for a peer that is still connecting.
    pub pending_size: usize,
    pub router_type: Option<RouteStrategy>,
    pub replicas: usize,
    pub algorithm: HashAlgorithm,
    /// Call argument used as the consistent-hash key.
    pub hash_field_index: Option<usize>,
    /// Used when no `router_type` is set.
    pub router: Option<CustomRouter>,
    /// Membership handed to the custom router and to broadcast calls.
    pub route_context: Option<Arc<dyn MembershipSource>>,
    pub fail_mode: FailMode,
    pub wire_format: WireFormat,
    pub mailbox_factory: Option<Arc<dyn MailboxFactory>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            buffer_msg: false,
            keepalive: RpcConfig::KEEPALIVE,
            interval: RpcConfig::FLUSH_INTERVAL,
            timeout: RpcConfig::CALLBACK_TIMEOUT,
            connect_timeout: RpcConfig::CONNECT_TIMEOUT,
            grace_timeout: RpcConfig::GRACE_TIMEOUT,
            pending_size: RpcConfig::PENDING_SIZE,
            router_type: None,
            replicas: RpcConfig::REPLICAS,
            algorithm: HashAlgorithm::default(),
            hash_field_index: None,
            router: None,
            route_context: None,
            fail_mode: FailMode::default(),
            wire_format: WireFormat::default(),
            mailbox_factory: None,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("client_id", &self.client_id)
            .field("buffer_msg", &self.buffer_msg)
            .field("keepalive", &self.keepalive)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("grace_timeout", &self.grace_timeout)
            .field("pending_size", &self.pending_size)
            .field("router_type", &self.router_type)
            .field("replicas", &self.replicas)
            .field("algorithm", &self.algorithm)
            .field("hash_field_index", &self.hash_field_index)
            .field("router", &self.router.as_ref().map(|_| "custom"))
            .field("fail_mode", &self.fail_mode)
            .field("wire_format", &self.wire_format.name())
            .finish()
    }
}

impl ClientOptions {
    /// Default options; see [`RpcConfig`] for the values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the id used in log lines.
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Enable or disable outbound buffering.
    pub fn with_buffer_msg(mut self, enabled: bool) -> Self {
        self.buffer_msg = enabled;
        self
    }

    /// Set the keepalive interval.
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Set the buffered flush interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the default request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the grace period for non-forced stops.
    pub fn with_grace_timeout(mut self, timeout: Duration) -> Self {
        self.grace_timeout = timeout;
        self
    }

    /// Set the bound on calls queued per connecting peer.
    pub fn with_pending_size(mut self, size: usize) -> Self {
        self.pending_size = size;
        self
    }

    /// Select a built-in routing strategy.
    pub fn with_router_type(mut self, strategy: RouteStrategy) -> Self {
        self.router_type = Some(strategy);
        self
    }

    /// Set the number of ring points per node.
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Set the ring hash algorithm.
    pub fn with_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Hash this call argument for consistent-hash routing.
    pub fn with_hash_field_index(mut self, index: usize) -> Self {
        self.hash_field_index = Some(index);
        self
    }

    /// Install a custom routing function.
    pub fn with_router(mut self, router: CustomRouter) -> Self {
        self.router = Some(router);
        self
    }

    /// Membership seen by the custom router instead of the station's.
    pub fn with_route_context(mut self, context: Arc<dyn MembershipSource>) -> Self {
        self.route_context = Some(context);
        self
    }

    /// Set the advisory failure mode.
    pub fn with_fail_mode(mut self, mode: FailMode) -> Self {
        self.fail_mode = mode;
        self
    }

    /// Set the envelope encoding.
    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    /// Replace the TCP mailbox factory.
    pub fn with_mailbox_factory(mut self, factory: Arc<dyn MailboxFactory>) -> Self {
        self.mailbox_factory = Some(factory);
        self
    }

    /// Reject zero durations and a zero pending size or replica count.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("keepalive", self.keepalive),
            ("interval", self.interval),
            ("timeout", self.timeout),
            ("connect_timeout", self.connect_timeout),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.pending_size == 0 {
            return Err(invalid("pending_size", "must be greater than zero"));
        }
        if self.replicas == 0 {
            return Err(invalid("replicas", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Client settings as found in configuration files.
///
/// Durations are milliseconds. Zero or missing values fall back to the
/// defaults in [`RpcConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub client_id: Option<String>,
    pub buffer_msg: bool,
    pub keepalive: Option<u64>,
    pub interval: Option<u64>,
    pub timeout: Option<u64>,
    pub pending_size: Option<usize>,
    pub router_type: Option<String>,
    pub replicas: Option<usize>,
    pub algorithm: Option<String>,
    pub hash_field_index: Option<usize>,
    pub fail_mode: Option<String>,
}

impl ClientConfig {
    /// Parse a JSON configuration document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Apply the file settings over the defaults and validate the result.
    pub fn into_options(self) -> Result<ClientOptions> {
        let mut opts = ClientOptions::default().with_buffer_msg(self.buffer_msg);
        if let Some(id) = self.client_id {
            opts.client_id = id;
        }
        if let Some(ms) = self.keepalive.filter(|ms| *ms > 0) {
            opts.keepalive = Duration::from_millis(ms);
        }
        if let Some(ms) = self.interval.filter(|ms| *ms > 0) {
            opts.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.timeout.filter(|ms| *ms > 0) {
            opts.timeout = Duration::from_millis(ms);
        }
        if let Some(size) = self.pending_size.filter(|n| *n > 0) {
            opts.pending_size = size;
        }
        if let Some(replicas) = self.replicas.filter(|n| *n > 0) {
            opts.replicas = replicas;
        }
        if let Some(name) = self.router_type {
            opts.router_type = Some(name.parse()?);
        }
        if let Some(name) = self.algorithm {
            opts.algorithm = name.parse()?;
        }
        if let Some(mode) = self.fail_mode {
            opts.fail_mode = mode.parse()?;
        }
        opts.hash_field_index = self.hash_field_index;
        opts.validate()?;
        Ok(opts)
    }
}

/// A directory of service modules and the namespace they are served under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePath {
    pub namespace: Namespace,
    pub path: PathBuf,
}

impl RemotePath {
    /// A path served under `namespace`.
    pub fn new(namespace: Namespace, path: impl Into<PathBuf>) -> Self {
        Self {
            namespace,
            path: path.into(),
        }
    }
}

/// Options for building a [`Gateway`](crate::Gateway).
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    /// Port 0 asks the OS for a free port.
    pub port: u16,
    pub paths: Vec<RemotePath>,
    /// Consumed by an external watcher that calls [`Gateway::reload`](crate::Gateway::reload).
    pub reload_remotes: bool,
    pub buffer_msg: bool,
    pub interval: Duration,
    pub wire_format: WireFormat,
    pub max_connections: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: RpcConfig::DEFAULT_HOST.to_string(),
            port: RpcConfig::DEFAULT_PORT,
            paths: Vec::new(),
            reload_remotes: false,
            buffer_msg: false,
            interval: RpcConfig::FLUSH_INTERVAL,
            wire_format: WireFormat::default(),
            max_connections: RpcConfig::MAX_CONNECTIONS,
        }
    }
}

impl ServerOptions {
    /// Default options listening on `port`.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Set the bind host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Add a service path.
    pub fn with_path(mut self, path: RemotePath) -> Self {
        self.paths.push(path);
        self
    }

    /// Enable or disable reply buffering.
    pub fn with_buffer_msg(mut self, enabled: bool) -> Self {
        self.buffer_msg = enabled;
        self
    }

    /// Set the buffered flush interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the envelope encoding.
    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    /// Cap concurrent inbound connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Reject an empty host or path, and zero limits.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(invalid("host", "must not be empty"));
        }
        if self.paths.iter().any(|p| p.path.as_os_str().is_empty()) {
            return Err(invalid("paths", "service path must not be empty"));
        }
        if self.buffer_msg && self.interval.is_zero() {
            return Err(invalid("interval", "must be greater than zero when buffering"));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Server settings as found in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: u16,
    pub paths: Vec<RemotePath>,
    pub reload_remotes: bool,
    pub buffer_msg: bool,
    pub interval: Option<u64>,
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: RpcConfig::DEFAULT_PORT,
            paths: Vec::new(),
            reload_remotes: false,
            buffer_msg: false,
            interval: None,
            max_connections: None,
        }
    }
}

impl ServerConfig {
    /// Parse a JSON configuration document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Apply the file settings over the defaults and validate the result.
    pub fn into_options(self) -> Result<ServerOptions> {
        let mut opts = ServerOptions::new(self.port).with_buffer_msg(self.buffer_msg);
        if let Some(host) = self.host {
            opts.host = host;
        }
        opts.paths = self.paths;
        opts.reload_remotes = self.reload_remotes;
        if let Some(ms) = self.interval.filter(|ms| *ms > 0) {
            opts.interval = Duration::from_millis(ms);
        }
        if let Some(max) = self.max_connections {
            opts.max_connections = max;
        }
        opts.validate()?;
        Ok(opts)
    }
}

fn invalid(field: &str, message: &str) -> RpcError {
    RpcError::Validation {
        field: field.to_string(),
        message: message.to_string(),
    }
}
