//! BIM Graph Sync
//!
//! Keeps a shared Neo4j representation of a building model consistent across
//! concurrent editing sessions:
//! - Idempotent, natural-key upserts generated from typed entities
//! - A FIFO command queue drained by a single dispatcher
//! - Bounding-box derived relationships kept in step on both sides
//! - Per-session ChangeLog entries fanned out to every other live session
//! - A polling listener that raises pull requests, with feedback suppression

pub mod building;
pub mod cypher;
pub mod diagnostics;
pub mod events;
pub mod neo4j;
pub mod queue;
pub mod spatial;
pub mod sync;

use anyhow::{bail, Result};
use building::EntityKind;
use diagnostics::DiagnosticLog;
use events::EventBus;
use neo4j::GraphStore;
use queue::{CommandQueue, QueueReceiver};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub neo4j: Neo4jYamlConfig,
    pub sync: SyncYamlConfig,
    pub diagnostics: DiagnosticsYamlConfig,
}

/// Neo4j configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Neo4jYamlConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub max_connections: usize,
    pub fetch_size: usize,
    pub query_timeout_ms: u64,
}

impl Default for Neo4jYamlConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".into(),
            user: "neo4j".into(),
            password: "neo4j".into(),
            max_connections: 16,
            fetch_size: 200,
            query_timeout_ms: 15_000,
        }
    }
}

/// How the listener decides that new changes are waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Unacknowledged entries with a sequence number above the last one signalled
    Cursor,
    /// Unacknowledged entries created within the recency window
    RecencyWindow,
}

impl FromStr for DetectionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cursor" => Ok(DetectionMode::Cursor),
            "recency_window" | "recency" => Ok(DetectionMode::RecencyWindow),
            other => Err(format!("unknown detection mode '{}'", other)),
        }
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionMode::Cursor => write!(f, "cursor"),
            DetectionMode::RecencyWindow => write!(f, "recency_window"),
        }
    }
}

/// Sync configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncYamlConfig {
    pub session_id: Option<String>,
    pub poll_interval_ms: u64,
    pub recency_window_ms: u64,
    pub detection: DetectionMode,
    pub propagation_timeout_ms: u64,
    pub dispose_grace_ms: u64,
    pub drain_timeout_ms: u64,
    pub session_ttl_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Kinds whose local mutations are not written back while a pull runs
    pub suppressed_kinds: Vec<EntityKind>,
}

impl Default for SyncYamlConfig {
    fn default() -> Self {
        Self {
            session_id: None,
            poll_interval_ms: 1_000,
            recency_window_ms: 2_000,
            detection: DetectionMode::Cursor,
            propagation_timeout_ms: 10_000,
            dispose_grace_ms: 2_000,
            drain_timeout_ms: 10_000,
            session_ttl_secs: 300,
            heartbeat_interval_secs: 30,
            suppressed_kinds: vec![
                EntityKind::Door,
                EntityKind::ProvisionalSpace,
                EntityKind::Pipe,
            ],
        }
    }
}

/// Diagnostics configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiagnosticsYamlConfig {
    /// Directory receiving `crash.log`
    pub dir: String,
}

impl Default for DiagnosticsYamlConfig {
    fn default() -> Self {
        Self {
            dir: ".bim-sync".into(),
        }
    }
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

#[derive(Debug, Clone)]
pub struct Neo4jSettings {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub max_connections: usize,
    pub fetch_size: usize,
    pub query_timeout: Duration,
}

/// Timing and behavior of the sync core
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub recency_window: Duration,
    pub detection: DetectionMode,
    pub propagation_timeout: Duration,
    pub dispose_grace: Duration,
    pub drain_timeout: Duration,
    pub session_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub suppressed_kinds: Vec<EntityKind>,
}

impl From<&SyncYamlConfig> for SyncSettings {
    fn from(y: &SyncYamlConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(y.poll_interval_ms),
            recency_window: Duration::from_millis(y.recency_window_ms),
            detection: y.detection,
            propagation_timeout: Duration::from_millis(y.propagation_timeout_ms),
            dispose_grace: Duration::from_millis(y.dispose_grace_ms),
            drain_timeout: Duration::from_millis(y.drain_timeout_ms),
            session_ttl: Duration::from_secs(y.session_ttl_secs),
            heartbeat_interval: Duration::from_secs(y.heartbeat_interval_secs),
            suppressed_kinds: y.suppressed_kinds.clone(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&SyncYamlConfig::default())
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub neo4j: Neo4jSettings,
    /// Identity of this editing session; required to run the sync core
    pub session_id: Option<String>,
    pub sync: SyncSettings,
    pub diagnostics_dir: PathBuf,
}

fn env_parse<T: FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}", var, raw);
            None
        }
    }
}

impl Config {
    /// Load configuration from environment variables only.
    /// Equivalent to from_yaml_and_env(None).
    pub fn from_env() -> Result<Self> {
        Self::from_yaml_and_env(None)
    }

    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "config.yaml" in CWD. If the file doesn't
    /// exist, falls back to pure env var / defaults.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        // 1. Load YAML config (or defaults if file not found)
        let yaml = Self::load_yaml(yaml_path);

        // 2. Build Config with env var overrides
        let mut sync = SyncSettings::from(&yaml.sync);
        if let Some(ms) = env_parse::<u64>("SYNC_POLL_INTERVAL_MS") {
            sync.poll_interval = Duration::from_millis(ms);
        }
        if let Some(mode) = env_parse::<DetectionMode>("SYNC_DETECTION") {
            sync.detection = mode;
        }
        if sync.poll_interval.is_zero() {
            bail!("poll interval must be greater than zero");
        }

        Ok(Self {
            neo4j: Neo4jSettings {
                uri: std::env::var("NEO4J_URI").unwrap_or(yaml.neo4j.uri),
                user: std::env::var("NEO4J_USER").unwrap_or(yaml.neo4j.user),
                password: std::env::var("NEO4J_PASSWORD").unwrap_or(yaml.neo4j.password),
                max_connections: env_parse("NEO4J_MAX_CONNECTIONS")
                    .unwrap_or(yaml.neo4j.max_connections),
                fetch_size: yaml.neo4j.fetch_size,
                query_timeout: Duration::from_millis(yaml.neo4j.query_timeout_ms),
            },
            session_id: std::env::var("SYNC_SESSION_ID")
                .ok()
                .or(yaml.sync.session_id)
                .filter(|s| !s.trim().is_empty()),
            sync,
            diagnostics_dir: PathBuf::from(
                std::env::var("DIAGNOSTICS_DIR").unwrap_or(yaml.diagnostics.dir),
            ),
        })
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }
}

// ============================================================================
// Sync context
// ============================================================================

/// Everything a session's sync components share. Passed explicitly; there
/// is no process-wide state.
#[derive(Clone)]
pub struct SyncContext {
    pub session_id: String,
    pub store: Arc<dyn GraphStore>,
    pub queue: CommandQueue,
    pub events: EventBus,
    pub diagnostics: Arc<DiagnosticLog>,
    pub settings: SyncSettings,
}

impl SyncContext {
    /// Build a context around an existing store. The receiver goes to the dispatcher.
    pub fn new(
        session_id: impl Into<String>,
        store: Arc<dyn GraphStore>,
        settings: SyncSettings,
        diagnostics: Arc<DiagnosticLog>,
    ) -> (Self, QueueReceiver) {
        let (queue, receiver) = CommandQueue::new();
        (
            Self {
                session_id: session_id.into(),
                store,
                queue,
                events: EventBus::default(),
                diagnostics,
                settings,
            },
            receiver,
        )
    }

    /// Connect to Neo4j and build the context for the configured session
    pub async fn connect(config: &Config) -> Result<(Self, QueueReceiver)> {
        let Some(session_id) = config.session_id.clone() else {
            bail!("no session id configured (set SYNC_SESSION_ID or sync.session_id)");
        };
        let store = Arc::new(neo4j::Neo4jClient::new(&config.neo4j).await?);
        let diagnostics = Arc::new(DiagnosticLog::new(&config.diagnostics_dir));
        Ok(Self::new(session_id, store, config.sync.clone(), diagnostics))
    }
}

// ============================================================================
// Tests
// ============================================================================
