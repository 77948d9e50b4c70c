//! # Fluentd Exporter
//!
//! A Prometheus exporter for fluentd. Scrapes the `monitor_agent` HTTP status
//! endpoint of a fluentd daemon, translates per-plugin buffer and retry
//! statistics into Prometheus metrics, and exposes them over HTTP for a
//! Prometheus server to poll.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         FLUENTD EXPORTER                             │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  STATUS CLIENT → DECODER → EMITTER → COLLECTOR → /metrics ENDPOINT   │
//! │                                                                      │
//! │  NAMESPACE ENUMERATOR → DISCOVERY FAN-OUT → SERVICE FILTER → RESULT  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two independent pipelines:
//!
//! - **Scrape pipeline**: a mutex-guarded fetch-decode-emit cycle, one cycle
//!   per request to the metrics endpoint. Transport failures are reported as
//!   `fluentd_up 0`; decode failures end the cycle without killing the
//!   process.
//! - **Discovery pipeline**: enumerates every namespace visible to the
//!   in-cluster identity, fans out one service lookup per namespace with
//!   bounded concurrency, and aggregates services labeled `app=fluentd`.
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::sync::{Mutex as TokioMutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use reqwest::Client as HttpClient;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::providers::{Env, Format, Toml};
use figment::Figment;

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::Parser;

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Metric names, label names, and flag defaults. The metric schema is fixed:
// renaming a metric is a breaking change for every dashboard and alert rule
// built on top of this exporter.
// ============================================================================

/// Exporter version - follows semantic versioning
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORTER_NAME: &str = "fluentd-exporter";

/// Prometheus namespace prefixed to every exported metric.
pub const METRIC_NAMESPACE: &str = "fluentd";

// ----------------------------------------------------------------------------
// Metric Schema
// ----------------------------------------------------------------------------

/// Availability gauge. Carries no labels; exactly one sample per scrape cycle.
pub const METRIC_UP: &str = "fluentd_up";
pub const HELP_UP: &str = "Could fluentd be reached";

/// Current buffer queue length per plugin (gauge; may decrease).
pub const METRIC_BUFFER_QUEUE_LENGTH: &str = "fluentd_buffer_queue_length";
pub const HELP_BUFFER_QUEUE_LENGTH: &str = "Buffered queue length";

/// Total queued buffer size per plugin (counter semantics upstream).
pub const METRIC_BUFFER_QUEUED_SIZE: &str = "fluentd_buffer_queued_size";
pub const HELP_BUFFER_QUEUED_SIZE: &str = "size of the total queued";

/// Cumulative retry count per plugin.
pub const METRIC_RETRY_TOTAL: &str = "fluentd_retry_total";
pub const HELP_RETRY_TOTAL: &str = "fluentd retry count";

/// Label names attached to every per-plugin sample.
pub const LABEL_PLUGIN_ID: &str = "pluginId";
pub const LABEL_PLUGIN_CATEGORY: &str = "pluginCategory";

/// Plugin category that is excluded from emission. Input plugins have no
/// buffer, so emitting zeroed buffer metrics for them would only add noise.
pub const CATEGORY_INPUT: &str = "input";

// ----------------------------------------------------------------------------
// Flag & Configuration Defaults
// ----------------------------------------------------------------------------

pub const DEFAULT_LISTEN_ADDRESS: &str = ":9309";
pub const DEFAULT_METRICS_ENDPOINT: &str = "/metrics";
pub const DEFAULT_SCRAPE_URI: &str = "http://localhost:24220/api/plugins.json";

/// Fixed label selector for discovered fluentd services.
pub const DEFAULT_SELECTOR_KEY: &str = "app";
pub const DEFAULT_SELECTOR_VALUE: &str = "fluentd";

/// Upper bound on concurrent per-namespace service lookups.
pub const DEFAULT_DISCOVERY_MAX_IN_FLIGHT: usize = 16;

/// Per-namespace lookup deadline. One unresponsive namespace must not stall
/// the whole discovery pass.
pub const DEFAULT_NAMESPACE_TIMEOUT_SECS: u64 = 15;

// ----------------------------------------------------------------------------
// In-Cluster Environment
// ----------------------------------------------------------------------------

/// Mount point of the ambient service-account credentials inside a pod.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

pub const ENV_KUBERNETES_SERVICE_HOST: &str = "KUBERNETES_SERVICE_HOST";
pub const ENV_KUBERNETES_SERVICE_PORT: &str = "KUBERNETES_SERVICE_PORT";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The typed units flowing through the two pipelines:
// - PluginStatus: one decoded record from the fluentd plugin dump
// - MetricSample: one (name, labels, value, kind) tuple headed for exposition
// - ServiceEndpoint / DiscoveryResult: the discovery pipeline's output
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Plugin Status
// ----------------------------------------------------------------------------

/// One plugin record decoded from the fluentd `monitor_agent` response.
///
/// Constructed fresh on every decode, never mutated, discarded after
/// emission. Fields absent from the wire payload default to their zero value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PluginStatus {
    /// Opaque plugin identifier assigned by fluentd.
    #[serde(default)]
    pub plugin_id: String,

    /// Plugin category; `"input"` records are excluded from emission.
    #[serde(default)]
    pub plugin_category: String,

    /// Plugin type name as reported by fluentd.
    #[serde(rename = "type", default)]
    pub plugin_type: String,

    /// Cumulative retry count.
    #[serde(default)]
    pub retry_count: u64,

    /// Current buffer queue length.
    #[serde(default)]
    pub buffer_queue_length: u64,

    /// Total queued buffer size in bytes.
    #[serde(default)]
    pub buffer_total_queued_size: u64,
}

/// Wire envelope of the plugin dump: `{"plugins": [...]}`.
#[derive(Debug, Deserialize)]
struct PluginDump {
    plugins: Vec<PluginStatus>,
}

// ----------------------------------------------------------------------------
// 3.2 Metric Samples
// ----------------------------------------------------------------------------

/// Value kind of an exported metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Instantaneous value; may rise or fall.
    Gauge,
    /// Monotonic between process restarts; never decremented by this system.
    Counter,
}

/// A single metric label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: CompactString,
    pub value: CompactString,
}

impl Label {
    pub fn new(name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        Self {
            name: CompactString::from(name.as_ref()),
            value: CompactString::from(value.as_ref()),
        }
    }
}

/// Label set for a sample. Per-plugin samples carry exactly two labels.
pub type Labels = SmallVec<[Label; 2]>;

/// One metric sample on its way to the exposition layer.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub value: f64,
    pub labels: Labels,
}

impl MetricSample {
    /// Create an unlabeled gauge sample.
    pub fn gauge(name: &'static str, help: &'static str, value: f64) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Gauge,
            value,
            labels: Labels::new(),
        }
    }

    /// Create an unlabeled counter sample.
    pub fn counter(name: &'static str, help: &'static str, value: f64) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Counter,
            value,
            labels: Labels::new(),
        }
    }

    /// Attach a label.
    pub fn with_label(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.labels.push(Label::new(name, value));
        self
    }

    /// Attach the standard `(pluginId, pluginCategory)` label pair.
    pub fn with_plugin(self, plugin: &PluginStatus) -> Self {
        self.with_label(LABEL_PLUGIN_ID, &plugin.plugin_id)
            .with_label(LABEL_PLUGIN_CATEGORY, &plugin.plugin_category)
    }

    /// Look up a label value by name.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }
}

/// Output stream for metric samples.
///
/// The collector writes every sample of a cycle into one sink; the exposition
/// layer renders the finished sink. `Vec<MetricSample>` is the canonical
/// implementation.
pub trait SampleSink {
    fn write(&mut self, sample: MetricSample);
}

impl SampleSink for Vec<MetricSample> {
    fn write(&mut self, sample: MetricSample) {
        self.push(sample);
    }
}

/// Build the availability sample for one scrape cycle.
pub fn availability_sample(reachable: bool) -> MetricSample {
    MetricSample::gauge(METRIC_UP, HELP_UP, if reachable { 1.0 } else { 0.0 })
}

// ----------------------------------------------------------------------------
// 3.3 Service Endpoints & Discovery Results
// ----------------------------------------------------------------------------

/// A fluentd service discovered inside the cluster.
///
/// Only constructed for services whose label map carries an exact match on
/// the configured selector. The port is the first declared port of the
/// service; a matching service without ports is a loud, typed error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub cluster_address: String,
    pub port: u16,
}

/// Aggregate outcome of one discovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Every namespace lookup succeeded.
    Complete,
    /// Some namespace lookups failed; the aggregate still carries matches.
    PartialNamespaceErrors,
}

/// Result of one discovery pass. Built incrementally under a lock by the
/// fan-out tasks; immutable once the join barrier completes.
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    /// Matching endpoints, in unspecified order across namespaces.
    pub endpoints: Vec<ServiceEndpoint>,
    /// Namespaces whose lookup failed or timed out.
    pub failed_namespaces: Vec<String>,
}

impl DiscoveryResult {
    pub fn outcome(&self) -> DiscoveryOutcome {
        if self.failed_namespaces.is_empty() {
            DiscoveryOutcome::Complete
        } else {
            DiscoveryOutcome::PartialNamespaceErrors
        }
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// One enum per pipeline plus an umbrella type. The split between Transport
// and Decode matters operationally: a transport failure is reported as
// fluentd_up 0, a decode failure ends the cycle after fluentd_up 1. The two
// must never be conflated.
// ============================================================================

/// Failures of a single scrape cycle.
#[derive(Error, Debug)]
pub enum ScrapeError {
    /// Connection, DNS, or TLS failure reaching the scrape target.
    /// Recoverable; reported as availability 0.
    #[error("error scraping fluentd: {0}")]
    Transport(#[from] reqwest::Error),

    /// The target answered with a non-success status code. Observed after
    /// transport success, so availability has already been reported as 1.
    #[error("fluentd returned status {code}")]
    Status { code: u16 },

    /// Malformed response body. Recoverable: the cycle fails, the process
    /// does not.
    #[error("malformed plugin dump: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ScrapeError {
    /// Whether the failure happened before the target could be reached.
    pub fn is_transport(&self) -> bool {
        matches!(self, ScrapeError::Transport(_))
    }

    /// Error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            ScrapeError::Transport(_) => "transport",
            ScrapeError::Status { .. } => "status",
            ScrapeError::Decode(_) => "decode",
        }
    }
}

/// Failures of the discovery pipeline.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// A cluster API listing call failed.
    #[error("cluster API call failed: {message}")]
    Api { message: String },

    /// The ambient in-cluster credentials could not be loaded.
    #[error("in-cluster credentials unavailable: {message}")]
    Credentials { message: String },

    /// A matching service declares no ports. The first-port assumption is a
    /// precondition; violating it fails loudly instead of indexing past the
    /// end of an empty list.
    #[error("service '{service}' in namespace '{namespace}' declares no ports")]
    MissingPort { service: String, namespace: String },

    /// A per-namespace lookup exceeded its deadline.
    #[error("namespace lookup timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Zero matches survived across all namespaces.
    #[error("no services found matching {selector}")]
    NoServicesFound { selector: String },
}

impl DiscoveryError {
    pub fn api(message: impl Display) -> Self {
        DiscoveryError::Api {
            message: message.to_string(),
        }
    }

    pub fn credentials(message: impl Display) -> Self {
        DiscoveryError::Credentials {
            message: message.to_string(),
        }
    }

    /// Error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            DiscoveryError::Api { .. } => "api",
            DiscoveryError::Credentials { .. } => "credentials",
            DiscoveryError::MissingPort { .. } => "missing_port",
            DiscoveryError::Timeout { .. } => "timeout",
            DiscoveryError::NoServicesFound { .. } => "no_services_found",
        }
    }
}

/// Errors related to configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// The main error type for the exporter.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("scrape error: {0}")]
    Scrape(#[from] ScrapeError),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("metrics rendering error: {0}")]
    Render(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Check if this error is recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExporterError::Config(_) => false,
            ExporterError::Scrape(_) => true,
            ExporterError::Discovery(e) => !matches!(e, DiscoveryError::Credentials { .. }),
            ExporterError::Render(_) => true,
            ExporterError::Io(_) => true,
            ExporterError::Internal(_) => false,
        }
    }

    /// Get the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Scrape(e) => e.category(),
            ExporterError::Discovery(e) => e.category(),
            ExporterError::Render(_) => "render",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }
}

/// Convenience alias used throughout the exporter.
pub type ExporterResult<T> = Result<T, ExporterError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file parsing with environment variable overrides and validation.
// Every field has a sensible default, so the exporter runs with no
// configuration at all - the classic single-binary exporter experience.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the exporter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Metrics endpoint settings
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Scrape target settings
    #[serde(default)]
    pub scrape: ScrapeConfig,

    /// In-cluster discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExporterConfig {
    /// Load configuration from an optional TOML file with environment
    /// overrides (`FLUENTD_EXPORTER_` prefix, `__` as section separator).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }

        let figment = figment.merge(Env::prefixed("FLUENTD_EXPORTER_").split("__"));

        figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.telemetry.endpoint.starts_with('/') {
            return Err(ConfigError::invalid_value(
                "telemetry.endpoint",
                "metrics endpoint path must start with '/'",
            ));
        }

        self.telemetry.listen_addr()?;

        if self.scrape.uri.is_empty() {
            return Err(ConfigError::invalid_value(
                "scrape.uri",
                "scrape URI cannot be empty",
            ));
        }

        if self.discovery.max_in_flight == 0 {
            return Err(ConfigError::invalid_value(
                "discovery.max_in_flight",
                "concurrency limit must be at least 1",
            ));
        }

        if self.discovery.namespace_timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "discovery.namespace_timeout_secs",
                "per-namespace timeout must be at least 1s",
            ));
        }

        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.2 Telemetry Configuration
// ----------------------------------------------------------------------------

/// Where and under which path the exporter serves metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Address on which to expose metrics, e.g. `:9309` or `0.0.0.0:9309`.
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// Path under which to expose metrics.
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            endpoint: default_metrics_endpoint(),
        }
    }
}

impl TelemetryConfig {
    /// Resolve the listen address. A bare `:port` binds all interfaces.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let candidate = if self.address.starts_with(':') {
            format!("0.0.0.0{}", self.address)
        } else {
            self.address.clone()
        };

        candidate
            .parse()
            .map_err(|_| ConfigError::invalid_value("telemetry.address", &candidate))
    }
}

// ----------------------------------------------------------------------------
// 5.3 Scrape Configuration
// ----------------------------------------------------------------------------

/// The fluentd status endpoint to scrape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// URI of the fluentd `monitor_agent` plugin dump.
    #[serde(default = "default_scrape_uri")]
    pub uri: String,

    /// Skip TLS certificate verification when scraping over https.
    ///
    /// This trusts any certificate the target presents. It is an explicit
    /// trust trade-off behind `--insecure`, never a silent default.
    #[serde(default)]
    pub insecure_tls: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            uri: default_scrape_uri(),
            insecure_tls: false,
        }
    }
}

// ----------------------------------------------------------------------------
// 5.4 Discovery Configuration
// ----------------------------------------------------------------------------

/// In-cluster service discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Label key matched exactly against each service's label map.
    #[serde(default = "default_selector_key")]
    pub selector_key: String,

    /// Label value matched exactly.
    #[serde(default = "default_selector_value")]
    pub selector_value: String,

    /// Upper bound on concurrent per-namespace lookups.
    #[serde(default = "default_discovery_max_in_flight")]
    pub max_in_flight: usize,

    /// Deadline for a single namespace lookup in seconds.
    #[serde(default = "default_namespace_timeout_secs")]
    pub namespace_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            selector_key: default_selector_key(),
            selector_value: default_selector_value(),
            max_in_flight: default_discovery_max_in_flight(),
            namespace_timeout_secs: default_namespace_timeout_secs(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: compact or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.6 Default Value Functions
// ----------------------------------------------------------------------------

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

fn default_metrics_endpoint() -> String {
    DEFAULT_METRICS_ENDPOINT.to_string()
}

fn default_scrape_uri() -> String {
    DEFAULT_SCRAPE_URI.to_string()
}

fn default_selector_key() -> String {
    DEFAULT_SELECTOR_KEY.to_string()
}

fn default_selector_value() -> String {
    DEFAULT_SELECTOR_VALUE.to_string()
}

fn default_discovery_max_in_flight() -> usize {
    DEFAULT_DISCOVERY_MAX_IN_FLIGHT
}

fn default_namespace_timeout_secs() -> u64 {
    DEFAULT_NAMESPACE_TIMEOUT_SECS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration.
pub fn init_logging(config: &LoggingConfig) -> ExporterResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "fluentd_exporter::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: CLI & COMMAND LINE INTERFACE
// ============================================================================
// Flag spellings (`--telemetry.address`, `--scrape_uri`, ...) are kept
// compatible with existing deployments of the exporter.
// ============================================================================

/// Fluentd exporter CLI
#[derive(Parser, Debug)]
#[command(
    name = "fluentd-exporter",
    author = "AIOps Team",
    version,
    about = "Prometheus exporter for fluentd with in-cluster service discovery"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FLUENTD_EXPORTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address on which to expose metrics
    #[arg(long = "telemetry.address")]
    pub telemetry_address: Option<String>,

    /// Path under which to expose metrics
    #[arg(long = "telemetry.endpoint")]
    pub telemetry_endpoint: Option<String>,

    /// URI to the fluentd monitor_agent plugin dump
    #[arg(long = "scrape_uri")]
    pub scrape_uri: Option<String>,

    /// Ignore the server certificate when scraping over https
    #[arg(long)]
    pub insecure: bool,

    /// Log level override
    #[arg(short, long, env = "FLUENTD_EXPORTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Run one in-cluster discovery pass, print matching fluentd services,
    /// and exit
    #[arg(long)]
    pub discover: bool,
}

impl Cli {
    /// Apply flag overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut ExporterConfig) {
        if let Some(address) = &self.telemetry_address {
            config.telemetry.address = address.clone();
        }
        if let Some(endpoint) = &self.telemetry_endpoint {
            config.telemetry.endpoint = endpoint.clone();
        }
        if let Some(uri) = &self.scrape_uri {
            config.scrape.uri = uri.clone();
        }
        if self.insecure {
            config.scrape.insecure_tls = true;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

// ============================================================================
// SECTION 8: STATUS CLIENT & PLUGIN DUMP DECODER
// ============================================================================
// The two leaf stages of the scrape pipeline. The client issues exactly one
// GET per invocation - no retry, no timeout beyond the transport default.
// The decoder is a pure function of the body bytes.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Status Client
// ----------------------------------------------------------------------------

/// HTTP client for the fluentd status endpoint.
#[derive(Debug, Clone)]
pub struct StatusClient {
    http: HttpClient,
    uri: String,
}

impl StatusClient {
    /// Build a client for the configured scrape target.
    pub fn new(config: &ScrapeConfig) -> ExporterResult<Self> {
        let mut builder = HttpClient::builder();

        if config.insecure_tls {
            // Trusts any certificate the target presents; opt-in only.
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| ExporterError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            uri: config.uri.clone(),
        })
    }

    /// URI this client scrapes.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Issue one GET to the status endpoint.
    ///
    /// Any connection, DNS, or TLS failure surfaces as
    /// [`ScrapeError::Transport`].
    pub async fn fetch(&self) -> Result<reqwest::Response, ScrapeError> {
        trace!(target: "fluentd_exporter::client", uri = %self.uri, "fetching plugin dump");
        self.http
            .get(&self.uri)
            .send()
            .await
            .map_err(ScrapeError::Transport)
    }

    /// Read the response body. A non-success status is a distinct failure
    /// from a transport error; it is observed after the target was reached.
    pub async fn read_body(&self, response: reqwest::Response) -> Result<Bytes, ScrapeError> {
        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Status {
                code: status.as_u16(),
            });
        }
        response.bytes().await.map_err(ScrapeError::Transport)
    }
}

// ----------------------------------------------------------------------------
// 8.2 Plugin Dump Decoder
// ----------------------------------------------------------------------------

/// Decode a plugin dump body into plugin status records, in wire order.
///
/// Non-object input, or input missing the `plugins` key, is a
/// [`ScrapeError::Decode`]. Decoding is pure: the same bytes always yield the
/// same records.
pub fn decode_plugin_dump(body: &[u8]) -> Result<Vec<PluginStatus>, ScrapeError> {
    let dump: PluginDump = serde_json::from_slice(body)?;
    Ok(dump.plugins)
}


// ============================================================================
// SECTION 9: METRIC EMITTER
// ============================================================================

/// Map decoded plugin records to the fixed metric schema.
///
/// For each record whose category is not `"input"`, writes three samples to
/// the sink: queue-length gauge, total-queued-size counter, retry counter,
/// each labeled `(pluginId, pluginCategory)`. Input plugins are skipped by
/// policy. Emission order follows decode order.
///
/// Returns the number of samples written.
pub fn emit_plugin_metrics<S: SampleSink>(plugins: &[PluginStatus], sink: &mut S) -> usize {
    let mut written = 0;

    for plugin in plugins {
        if plugin.plugin_category == CATEGORY_INPUT {
            continue;
        }

        sink.write(
            MetricSample::gauge(
                METRIC_BUFFER_QUEUE_LENGTH,
                HELP_BUFFER_QUEUE_LENGTH,
                plugin.buffer_queue_length as f64,
            )
            .with_plugin(plugin),
        );
        sink.write(
            MetricSample::counter(
                METRIC_BUFFER_QUEUED_SIZE,
                HELP_BUFFER_QUEUED_SIZE,
                plugin.buffer_total_queued_size as f64,
            )
            .with_plugin(plugin),
        );
        sink.write(
            MetricSample::counter(
                METRIC_RETRY_TOTAL,
                HELP_RETRY_TOTAL,
                plugin.retry_count as f64,
            )
            .with_plugin(plugin),
        );
        written += 3;
    }

    written
}

#[cfg(test)]
mod emitter_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn output_plugin(id: &str) -> PluginStatus {
        PluginStatus {
            plugin_id: id.to_string(),
            plugin_category: "output".to_string(),
            plugin_type: "forward".to_string(),
            retry_count: 2,
            buffer_queue_length: 4,
            buffer_total_queued_size: 456,
        }
    }

    fn input_plugin(id: &str) -> PluginStatus {
        PluginStatus {
            plugin_id: id.to_string(),
            plugin_category: "input".to_string(),
            plugin_type: "tail".to_string(),
            retry_count: 0,
            buffer_queue_length: 0,
            buffer_total_queued_size: 0,
        }
    }

    #[test]
    fn emits_three_samples_per_non_input_plugin() {
        let mut sink = Vec::new();
        let written = emit_plugin_metrics(&[output_plugin("out1")], &mut sink);

        assert_eq!(written, 3);
        assert_eq!(sink.len(), 3);
        assert_eq!(sink[0].name, METRIC_BUFFER_QUEUE_LENGTH);
        assert_eq!(sink[0].kind, MetricKind::Gauge);
        assert_eq!(sink[0].value, 4.0);
        assert_eq!(sink[1].name, METRIC_BUFFER_QUEUED_SIZE);
        assert_eq!(sink[1].kind, MetricKind::Counter);
        assert_eq!(sink[1].value, 456.0);
        assert_eq!(sink[2].name, METRIC_RETRY_TOTAL);
        assert_eq!(sink[2].kind, MetricKind::Counter);
        assert_eq!(sink[2].value, 2.0);
    }

    #[test]
    fn every_sample_carries_the_plugin_label_pair() {
        let mut sink = Vec::new();
        emit_plugin_metrics(&[output_plugin("out1")], &mut sink);

        for sample in &sink {
            assert_eq!(sample.label(LABEL_PLUGIN_ID), Some("out1"));
            assert_eq!(sample.label(LABEL_PLUGIN_CATEGORY), Some("output"));
        }
    }

    #[test]
    fn input_plugins_are_skipped() {
        let mut sink = Vec::new();
        let written =
            emit_plugin_metrics(&[input_plugin("in1"), output_plugin("out1")], &mut sink);

        assert_eq!(written, 3);
        assert!(sink.iter().all(|s| s.label(LABEL_PLUGIN_ID) == Some("out1")));
    }

    #[test]
    fn emission_follows_decode_order() {
        let mut sink = Vec::new();
        emit_plugin_metrics(&[output_plugin("a"), output_plugin("b")], &mut sink);

        let ids: Vec<_> = sink.iter().filter_map(|s| s.label(LABEL_PLUGIN_ID)).collect();
        assert_eq!(ids, ["a", "a", "a", "b", "b", "b"]);
    }

    #[test]
    fn empty_input_emits_nothing() {
        let mut sink = Vec::new();
        assert_eq!(emit_plugin_metrics(&[], &mut sink), 0);
        assert!(sink.is_empty());
    }
}

// ============================================================================
// SECTION 10: COLLECTOR & SCRAPE CYCLE
// ============================================================================
// The scrape cycle state machine: Idle -> Fetching -> (Decoding -> Emitting)
// | Failed -> Idle. A tokio mutex serializes cycles, so the backing fluentd
// endpoint sees at most one in-flight request from this process and samples
// from different cycles never interleave in one sink.
// ============================================================================

/// Orchestrates the scrape pipeline: client -> decoder -> emitter.
///
/// The lock is owned by the exporter value, not process-global state, so
/// independent exporter instances (and tests) never couple through it.
pub struct Exporter {
    client: StatusClient,
    scrape_lock: TokioMutex<()>,
}

impl Debug for Exporter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exporter")
            .field("uri", &self.client.uri())
            .finish()
    }
}

impl Exporter {
    /// Create an exporter for the configured scrape target.
    pub fn new(config: &ScrapeConfig) -> ExporterResult<Self> {
        Ok(Self {
            client: StatusClient::new(config)?,
            scrape_lock: TokioMutex::new(()),
        })
    }

    /// Run one scrape cycle, writing every sample of the cycle into `sink`.
    ///
    /// Concurrent callers block FIFO on the cycle lock. Exactly one
    /// availability sample is written per cycle:
    ///
    /// - transport failure: availability 0, no per-plugin samples, the
    ///   transport error is returned;
    /// - non-success status or decode failure: availability 1, no per-plugin
    ///   samples, the error is returned - the cycle fails, the process
    ///   survives;
    /// - success: availability 1 plus three samples per non-input plugin.
    ///
    /// Returns the number of per-plugin samples on success.
    pub async fn collect<S: SampleSink>(&self, sink: &mut S) -> Result<usize, ScrapeError> {
        let _cycle = self.scrape_lock.lock().await;
        let started = Instant::now();

        let response = match self.client.fetch().await {
            Ok(response) => response,
            Err(err) => {
                sink.write(availability_sample(false));
                return Err(err);
            }
        };

        sink.write(availability_sample(true));

        let body = self.client.read_body(response).await?;
        let plugins = decode_plugin_dump(&body)?;
        let written = emit_plugin_metrics(&plugins, sink);

        debug!(
            target: "fluentd_exporter::collector",
            plugins = plugins.len(),
            samples = written,
            duration_us = started.elapsed().as_micros() as u64,
            "scrape cycle complete"
        );

        Ok(written)
    }
}

// ============================================================================
// SECTION 11: PROMETHEUS EXPOSITION & HTTP SERVER
// ============================================================================
// Samples are rendered into a fresh registry per request and encoded in the
// Prometheus text format. A fresh registry keeps counter semantics honest:
// upstream values are mirrored as-is instead of being accumulated twice.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Sample Rendering
// ----------------------------------------------------------------------------

/// Render a finished sample stream into the Prometheus text format.
pub fn render_samples(samples: &[MetricSample]) -> ExporterResult<String> {
    let registry = Registry::new();
    let mut gauges: HashMap<&'static str, GaugeVec> = HashMap::new();
    let mut counters: HashMap<&'static str, CounterVec> = HashMap::new();

    for sample in samples {
        let label_names: Vec<&str> = sample.labels.iter().map(|l| l.name.as_str()).collect();
        let label_values: Vec<&str> = sample.labels.iter().map(|l| l.value.as_str()).collect();

        match sample.kind {
            MetricKind::Gauge => {
                let vec = match gauges.entry(sample.name) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let vec =
                            GaugeVec::new(Opts::new(sample.name, sample.help), &label_names)?;
                        registry.register(Box::new(vec.clone()))?;
                        entry.insert(vec)
                    }
                };
                vec.with_label_values(&label_values).set(sample.value);
            }
            MetricKind::Counter => {
                let vec = match counters.entry(sample.name) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let vec =
                            CounterVec::new(Opts::new(sample.name, sample.help), &label_names)?;
                        registry.register(Box::new(vec.clone()))?;
                        entry.insert(vec)
                    }
                };
                vec.with_label_values(&label_values).inc_by(sample.value);
            }
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| ExporterError::Internal(e.to_string()))
}

// ----------------------------------------------------------------------------
// 11.2 HTTP Server
// ----------------------------------------------------------------------------

/// Shared state behind the metrics endpoint.
#[derive(Clone)]
struct AppState {
    exporter: Arc<Exporter>,
}

impl Debug for AppState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish()
    }
}

/// Build the exporter's HTTP router. One GET on the metrics endpoint
/// triggers exactly one collector cycle.
pub fn router(exporter: Arc<Exporter>, endpoint: &str) -> Router {
    Router::new()
        .route(endpoint, get(metrics_handler))
        .with_state(AppState { exporter })
}

/// Handler for the metrics endpoint.
///
/// A failed cycle is logged and whatever the cycle did emit (at minimum the
/// availability gauge) is still served; 5xx is reserved for encoding
/// failures.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let mut samples = Vec::new();

    if let Err(err) = state.exporter.collect(&mut samples).await {
        error!(
            target: "fluentd_exporter::collector",
            category = err.category(),
            error = %err,
            "scrape cycle failed"
        );
    }

    match render_samples(&samples) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(
                target: "fluentd_exporter::server",
                error = %err,
                "failed to encode metrics"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

/// Serve the metrics endpoint until ctrl-c.
pub async fn run_server(config: &ExporterConfig) -> ExporterResult<()> {
    let exporter = Arc::new(Exporter::new(&config.scrape)?);
    let app = router(exporter, &config.telemetry.endpoint);
    let addr = config.telemetry.listen_addr()?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        target: "fluentd_exporter::server",
        address = %addr,
        endpoint = %config.telemetry.endpoint,
        scrape_uri = %config.scrape.uri,
        "Starting server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!(target: "fluentd_exporter::server", "Shutdown signal received");
        })
        .await?;

    Ok(())
}

// ============================================================================
// SECTION 12: SCRAPE PIPELINE TESTS
// ============================================================================

#[cfg(test)]
mod scrape_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SAMPLE_DUMP: &str = r#"{"plugins":[
        {"plugin_id":"out1","plugin_category":"output","retry_count":0,
         "buffer_queue_length":4,"buffer_total_queued_size":456},
        {"plugin_id":"in1","plugin_category":"input","retry_count":0}
    ]}"#;

    /// Spawn a one-route status endpoint on an ephemeral port.
    async fn spawn_status_target(status: StatusCode, body: &'static str) -> SocketAddr {
        let app = Router::new().route(
            "/api/plugins.json",
            get(move || async move { (status, body) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn exporter_for(addr: SocketAddr) -> Exporter {
        Exporter::new(&ScrapeConfig {
            uri: format!("http://{}/api/plugins.json", addr),
            insecure_tls: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn transport_failure_emits_availability_zero_and_nothing_else() {
        // Nothing listens on this port.
        let exporter = Exporter::new(&ScrapeConfig {
            uri: "http://127.0.0.1:1/api/plugins.json".to_string(),
            insecure_tls: false,
        })
        .unwrap();

        let mut sink = Vec::new();
        let err = exporter.collect(&mut sink).await.unwrap_err();

        assert!(err.is_transport());
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].name, METRIC_UP);
        assert_eq!(sink[0].value, 0.0);
    }

    #[tokio::test]
    async fn well_formed_response_yields_availability_plus_plugin_samples() {
        let addr = spawn_status_target(StatusCode::OK, SAMPLE_DUMP).await;
        let exporter = exporter_for(addr);

        let mut sink = Vec::new();
        let written = exporter.collect(&mut sink).await.unwrap();

        // availability + 3 for out1; none for the input plugin.
        assert_eq!(written, 3);
        assert_eq!(sink.len(), 4);
        assert_eq!(sink[0].name, METRIC_UP);
        assert_eq!(sink[0].value, 1.0);
        assert!(sink[1..].iter().all(|s| s.label(LABEL_PLUGIN_ID) == Some("out1")));
    }

    #[tokio::test]
    async fn non_success_status_fails_after_availability_one() {
        let addr = spawn_status_target(StatusCode::INTERNAL_SERVER_ERROR, "boom").await;
        let exporter = exporter_for(addr);

        let mut sink = Vec::new();
        let err = exporter.collect(&mut sink).await.unwrap_err();

        assert!(matches!(err, ScrapeError::Status { code: 500 }));
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].value, 1.0);
    }

    #[tokio::test]
    async fn malformed_body_is_a_recoverable_decode_failure() {
        let addr = spawn_status_target(StatusCode::OK, "definitely not json").await;
        let exporter = exporter_for(addr);

        let mut sink = Vec::new();
        let err = exporter.collect(&mut sink).await.unwrap_err();

        assert!(matches!(err, ScrapeError::Decode(_)));
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].name, METRIC_UP);
        assert_eq!(sink[0].value, 1.0);

        // The exporter is still usable for the next cycle.
        let mut next = Vec::new();
        assert!(exporter.collect(&mut next).await.is_err());
        assert_eq!(next.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_collects_serialize_against_the_target() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let app = {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            Router::new().route(
                "/api/plugins.json",
                get(move || {
                    let current = Arc::clone(&current);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(25)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        SAMPLE_DUMP
                    }
                }),
            )
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let exporter = Arc::new(exporter_for(addr));
        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let exporter = Arc::clone(&exporter);
            tasks.spawn(async move {
                let mut sink = Vec::new();
                exporter.collect(&mut sink).await.unwrap();
                sink
            });
        }

        while let Some(result) = tasks.join_next().await {
            let sink = result.unwrap();
            // Every cycle is complete and self-contained: availability first,
            // then the plugin samples of that cycle only.
            assert_eq!(sink.len(), 4);
            assert_eq!(sink[0].name, METRIC_UP);
        }

        // The cycle lock admits at most one in-flight request.
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rendered_text_carries_types_and_labels() {
        let mut sink = Vec::new();
        sink.write(availability_sample(true));
        emit_plugin_metrics(
            &[PluginStatus {
                plugin_id: "out1".to_string(),
                plugin_category: "output".to_string(),
                plugin_type: "forward".to_string(),
                retry_count: 2,
                buffer_queue_length: 4,
                buffer_total_queued_size: 456,
            }],
            &mut sink,
        );

        let text = render_samples(&sink).unwrap();

        assert!(text.contains("# TYPE fluentd_up gauge"));
        assert!(text.contains("fluentd_up 1"));
        assert!(text.contains("# TYPE fluentd_buffer_queue_length gauge"));
        assert!(text.contains("# TYPE fluentd_retry_total counter"));
        assert!(text.contains("pluginId=\"out1\""));
        assert!(text.contains("pluginCategory=\"output\""));
    }

    #[test]
    fn help_lines_keep_the_established_wording() {
        // Help text is part of the exposition surface dashboards key on;
        // wording and casing are load-bearing.
        let mut sink = Vec::new();
        sink.write(availability_sample(true));
        emit_plugin_metrics(
            &[PluginStatus {
                plugin_id: "out1".to_string(),
                plugin_category: "output".to_string(),
                plugin_type: "forward".to_string(),
                retry_count: 2,
                buffer_queue_length: 4,
                buffer_total_queued_size: 456,
            }],
            &mut sink,
        );

        let text = render_samples(&sink).unwrap();

        assert!(text.contains("# HELP fluentd_up Could fluentd be reached"));
        assert!(text.contains("# HELP fluentd_buffer_queue_length Buffered queue length"));
        assert!(text.contains("# HELP fluentd_buffer_queued_size size of the total queued"));
        assert!(text.contains("# HELP fluentd_retry_total fluentd retry count"));
    }

    #[test]
    fn rendering_an_empty_cycle_yields_empty_exposition() {
        let text = render_samples(&[]).unwrap();
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_one_cycle_per_request() {
        let addr = spawn_status_target(StatusCode::OK, SAMPLE_DUMP).await;
        let exporter = Arc::new(exporter_for(addr));
        let app = router(exporter, "/metrics");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let serve_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let response = reqwest::get(format!("http://{}/metrics", serve_addr))
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 200);
        let body = response.text().await.unwrap();
        assert!(body.contains("fluentd_up 1"));
        assert!(body.contains("fluentd_buffer_queue_length"));
    }

    #[tokio::test]
    async fn metrics_endpoint_still_serves_availability_on_scrape_failure() {
        let exporter = Arc::new(
            Exporter::new(&ScrapeConfig {
                uri: "http://127.0.0.1:1/api/plugins.json".to_string(),
                insecure_tls: false,
            })
            .unwrap(),
        );
        let app = router(exporter, "/metrics");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let serve_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let response = reqwest::get(format!("http://{}/metrics", serve_addr))
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 200);
        assert!(response.text().await.unwrap().contains("fluentd_up 0"));
    }
}

// ============================================================================
// SECTION 13: KUBERNETES SERVICE DISCOVERY
// ============================================================================
// Finds fluentd services across every namespace visible to the ambient
// in-cluster identity. The cluster API is a trait boundary: read-only
// namespace and service listings, nothing else. The orchestrator fans out
// one lookup per namespace with bounded concurrency and a per-namespace
// deadline, aggregates matches under a lock held only for the append, and
// joins every task before the result is read.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Cluster API Boundary
// ----------------------------------------------------------------------------

/// A service as listed by the cluster API, reduced to the fields the filter
/// needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterService {
    pub name: String,
    pub cluster_ip: String,
    pub labels: HashMap<String, String>,
    pub ports: Vec<u16>,
}

/// Read-only view of the cluster API.
///
/// Implemented by [`InClusterClient`] in production and by in-memory mocks
/// in tests.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// List all namespaces visible to the calling identity.
    ///
    /// Enumeration failure is an explicit error, so callers can distinguish
    /// "no namespaces exist" from "the listing call failed".
    async fn list_namespaces(&self) -> Result<Vec<String>, DiscoveryError>;

    /// List all services in one namespace.
    async fn list_services(&self, namespace: &str) -> Result<Vec<ClusterService>, DiscoveryError>;
}

// ----------------------------------------------------------------------------
// 13.2 Label Selector & Service Filter
// ----------------------------------------------------------------------------

/// Exact-match label predicate selecting target services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    pub key: String,
    pub value: String,
}

impl LabelSelector {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether a label map carries an exact key/value match.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        labels.get(&self.key).map(String::as_str) == Some(self.value.as_str())
    }
}

impl Default for LabelSelector {
    fn default() -> Self {
        Self::new(DEFAULT_SELECTOR_KEY, DEFAULT_SELECTOR_VALUE)
    }
}

impl Display for LabelSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// List the services of one namespace and keep those matching the selector.
///
/// Each match becomes a [`ServiceEndpoint`] built from the service's cluster
/// address and its first declared port; a matching service without ports
/// fails the namespace with a typed error.
pub async fn matching_endpoints<C>(
    client: &C,
    namespace: &str,
    selector: &LabelSelector,
) -> Result<Vec<ServiceEndpoint>, DiscoveryError>
where
    C: ClusterClient + ?Sized,
{
    let services = client.list_services(namespace).await?;
    let mut endpoints = Vec::new();

    for service in services {
        if !selector.matches(&service.labels) {
            continue;
        }

        let port = service
            .ports
            .first()
            .copied()
            .ok_or_else(|| DiscoveryError::MissingPort {
                service: service.name.clone(),
                namespace: namespace.to_string(),
            })?;

        debug!(
            target: "fluentd_exporter::discovery",
            service = %service.name,
            namespace = %namespace,
            "service matched selector"
        );

        endpoints.push(ServiceEndpoint {
            name: service.name,
            cluster_address: service.cluster_ip,
            port,
        });
    }

    Ok(endpoints)
}

// ----------------------------------------------------------------------------
// 13.3 Discovery Orchestrator
// ----------------------------------------------------------------------------

/// Fans out one service lookup per namespace and aggregates the matches.
pub struct Discovery<C: ClusterClient> {
    client: Arc<C>,
    selector: LabelSelector,
    max_in_flight: usize,
    namespace_timeout: Duration,
}

impl<C: ClusterClient> Debug for Discovery<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovery")
            .field("selector", &self.selector)
            .field("max_in_flight", &self.max_in_flight)
            .field("namespace_timeout", &self.namespace_timeout)
            .finish()
    }
}

impl<C: ClusterClient> Discovery<C> {
    pub fn new(client: Arc<C>, config: &DiscoveryConfig) -> Self {
        Self {
            client,
            selector: LabelSelector::new(&config.selector_key, &config.selector_value),
            max_in_flight: config.max_in_flight.max(1),
            namespace_timeout: Duration::from_secs(config.namespace_timeout_secs),
        }
    }

    /// Run one full discovery pass.
    ///
    /// Enumerates namespaces once, then launches one filtered lookup per
    /// namespace. Successes append to a shared collection under a lock held
    /// only for the append; per-namespace failures and timeouts are logged
    /// and recorded without failing the pass. The join barrier completes
    /// before the aggregate is read. An empty aggregate is
    /// [`DiscoveryError::NoServicesFound`]; partial success is success.
    pub async fn discover_all(&self) -> Result<DiscoveryResult, DiscoveryError> {
        let started = Instant::now();
        let namespaces = self.client.list_namespaces().await?;
        info!(
            target: "fluentd_exporter::discovery",
            namespaces = namespaces.len(),
            selector = %self.selector,
            "starting discovery pass"
        );

        let endpoints: Arc<Mutex<Vec<ServiceEndpoint>>> = Arc::new(Mutex::new(Vec::new()));
        let failed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let permits = Arc::new(Semaphore::new(self.max_in_flight));

        let mut tasks = JoinSet::new();
        for namespace in namespaces {
            let client = Arc::clone(&self.client);
            let selector = self.selector.clone();
            let endpoints = Arc::clone(&endpoints);
            let failed = Arc::clone(&failed);
            let permits = Arc::clone(&permits);
            let deadline = self.namespace_timeout;

            tasks.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    // The semaphore is never closed while tasks run.
                    Err(_) => return,
                };

                match timeout(deadline, matching_endpoints(client.as_ref(), &namespace, &selector))
                    .await
                {
                    Ok(Ok(matches)) => {
                        if !matches.is_empty() {
                            endpoints.lock().extend(matches);
                        }
                    }
                    Ok(Err(err)) => {
                        warn!(
                            target: "fluentd_exporter::discovery",
                            namespace = %namespace,
                            category = err.category(),
                            error = %err,
                            "namespace lookup failed"
                        );
                        failed.lock().push(namespace);
                    }
                    Err(_) => {
                        let err = DiscoveryError::Timeout {
                            timeout_secs: deadline.as_secs(),
                        };
                        warn!(
                            target: "fluentd_exporter::discovery",
                            namespace = %namespace,
                            error = %err,
                            "namespace lookup timed out"
                        );
                        failed.lock().push(namespace);
                    }
                }
            });
        }

        // Join barrier: no partial results are visible before this completes.
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(
                    target: "fluentd_exporter::discovery",
                    error = %err,
                    "discovery task panicked"
                );
            }
        }

        let endpoints = std::mem::take(&mut *endpoints.lock());
        let failed_namespaces = std::mem::take(&mut *failed.lock());

        if endpoints.is_empty() {
            warn!(
                target: "fluentd_exporter::discovery",
                failed_namespaces = failed_namespaces.len(),
                "no services found"
            );
            return Err(DiscoveryError::NoServicesFound {
                selector: self.selector.to_string(),
            });
        }

        info!(
            target: "fluentd_exporter::discovery",
            endpoints = endpoints.len(),
            failed_namespaces = failed_namespaces.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "discovery pass complete"
        );

        Ok(DiscoveryResult {
            endpoints,
            failed_namespaces,
        })
    }
}

// ----------------------------------------------------------------------------
// 13.4 In-Cluster Client
// ----------------------------------------------------------------------------

/// Wire shapes of the two list calls, reduced to the fields we read.
#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct NamespaceObject {
    #[serde(default)]
    metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct ServiceObject {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: ServiceSpec,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceSpec {
    #[serde(rename = "clusterIP", default)]
    cluster_ip: String,
    #[serde(default)]
    ports: Vec<ServicePort>,
}

#[derive(Debug, Deserialize)]
struct ServicePort {
    port: u16,
}

/// Cluster API client authenticated via the ambient in-cluster identity.
///
/// Reads the service-account token and CA bundle mounted into the pod and
/// issues the two read-only list calls against the API server. No write
/// operations are ever issued.
#[derive(Debug, Clone)]
pub struct InClusterClient {
    http: HttpClient,
    base: String,
    token: String,
}

impl InClusterClient {
    /// Build a client from the standard in-cluster environment:
    /// `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` plus the mounted
    /// service-account credentials.
    pub fn from_environment() -> Result<Self, DiscoveryError> {
        let host = env::var(ENV_KUBERNETES_SERVICE_HOST).map_err(|_| {
            DiscoveryError::credentials(format!("{} is not set", ENV_KUBERNETES_SERVICE_HOST))
        })?;
        let port =
            env::var(ENV_KUBERNETES_SERVICE_PORT).unwrap_or_else(|_| "443".to_string());

        Self::new(format!("https://{}:{}", host, port), Path::new(SERVICE_ACCOUNT_DIR))
    }

    /// Build a client against an explicit API server base URL with
    /// credentials loaded from `credential_dir` (`token` and `ca.crt`).
    pub fn new(base: impl Into<String>, credential_dir: &Path) -> Result<Self, DiscoveryError> {
        let token = fs::read_to_string(credential_dir.join("token")).map_err(|e| {
            DiscoveryError::credentials(format!(
                "cannot read {}: {}",
                credential_dir.join("token").display(),
                e
            ))
        })?;

        let ca_pem = fs::read(credential_dir.join("ca.crt")).map_err(|e| {
            DiscoveryError::credentials(format!(
                "cannot read {}: {}",
                credential_dir.join("ca.crt").display(),
                e
            ))
        })?;

        let ca = reqwest::Certificate::from_pem(&ca_pem)
            .map_err(|e| DiscoveryError::credentials(format!("invalid CA bundle: {}", e)))?;

        let http = HttpClient::builder()
            .add_root_certificate(ca)
            .build()
            .map_err(|e| DiscoveryError::credentials(format!("cannot build client: {}", e)))?;

        Ok(Self {
            http,
            base: base.into(),
            token: token.trim().to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DiscoveryError> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(DiscoveryError::api)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::api(format!(
                "GET {} returned status {}",
                path, status
            )));
        }

        response.json().await.map_err(DiscoveryError::api)
    }
}

#[async_trait]
impl ClusterClient for InClusterClient {
    async fn list_namespaces(&self) -> Result<Vec<String>, DiscoveryError> {
        let list: ObjectList<NamespaceObject> = self.get_json("/api/v1/namespaces").await?;
        Ok(list.items.into_iter().map(|n| n.metadata.name).collect())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<ClusterService>, DiscoveryError> {
        let list: ObjectList<ServiceObject> = self
            .get_json(&format!("/api/v1/namespaces/{}/services", namespace))
            .await?;

        Ok(list
            .items
            .into_iter()
            .map(|s| ClusterService {
                name: s.metadata.name,
                labels: s.metadata.labels,
                cluster_ip: s.spec.cluster_ip,
                ports: s.spec.ports.into_iter().map(|p| p.port).collect(),
            })
            .collect())
    }
}

// ============================================================================
// SECTION 14: DISCOVERY TESTS
// ============================================================================


// ============================================================================
// SECTION 15: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the exporter.
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    let mut config = ExporterConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    init_logging(&config.logging)?;

    info!(
        target: "fluentd_exporter::init",
        version = EXPORTER_VERSION,
        "Starting {}",
        EXPORTER_NAME
    );

    if cli.discover {
        return run_discovery(&config).await;
    }

    run_server(&config).await?;
    Ok(())
}

/// Run one in-cluster discovery pass and print the matching services.
async fn run_discovery(config: &ExporterConfig) -> AnyhowResult<()> {
    let client = Arc::new(
        InClusterClient::from_environment()
            .context("discovery requires the in-cluster environment")?,
    );
    let discovery = Discovery::new(client, &config.discovery);
    let result = discovery.discover_all().await?;

    for endpoint in &result.endpoints {
        println!(
            "{}\t{}:{}",
            endpoint.name, endpoint.cluster_address, endpoint.port
        );
    }

    if result.outcome() == DiscoveryOutcome::PartialNamespaceErrors {
        warn!(
            target: "fluentd_exporter::discovery",
            failed_namespaces = ?result.failed_namespaces,
            "some namespaces could not be listed"
        );
    }

    Ok(())
}

// ============================================================================
// SECTION 16: CONFIGURATION & CLI TESTS
// ============================================================================
