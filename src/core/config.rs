use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::room::directory::Principal;
use super::room::queue::Track;

const APP_CONFIG_DIR: &str = "Lockstep";
const APP_CONFIG_FILE: &str = "config.json";
const DEV_CONFIG_FILE: &str = "dev-config.json";
const DEV_CONFIG_ENV: &str = "LOCKSTEP_DEV_CONFIG";

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3030";
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3030/ws";
pub const DEFAULT_ROOM_ID: &str = "lobby";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialGrant {
    pub credential: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomSeed {
    pub room_id: String,
    pub administrator: String,
    #[serde(default)]
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub auto_advance: bool,
    #[serde(default)]
    pub credentials: Vec<CredentialGrant>,
    #[serde(default)]
    pub rooms: Vec<RoomSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncTuning {
    pub probes_per_round: usize,
    pub probe_best_fraction: f64,
    pub probe_timeout_ms: u64,
    pub probe_interval_secs: u64,
    pub probe_retry_base_ms: u64,
    pub probe_failure_limit: u32,
    pub fallback_latency_ms: f64,
    pub tolerance_base_ms: f64,
    pub tolerance_latency_weight: f64,
    pub tolerance_jitter_weight: f64,
    pub tolerance_min_ms: f64,
    pub tolerance_max_ms: f64,
    pub tolerance_tighten_factor: f64,
    pub hard_seek_multiple: f64,
    pub nudge_fraction: f64,
    pub output_latency_ms: f64,
    pub sync_interval_ms: u64,
    pub sync_interval_min_ms: u64,
    pub sync_interval_max_ms: u64,
    pub play_state_interval_ms: u64,
    pub history_len: usize,
    pub failures_per_tier: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_reset_after_secs: u64,
    pub connect_timeout_ms: u64,
    pub keepalive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub credential: String,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub sync: SyncTuning,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            auto_advance: true,
            credentials: vec![
                CredentialGrant {
                    credential: "host-token".to_string(),
                    user_id: "host".to_string(),
                },
                CredentialGrant {
                    credential: "guest-token".to_string(),
                    user_id: "guest".to_string(),
                },
            ],
            rooms: vec![RoomSeed {
                room_id: DEFAULT_ROOM_ID.to_string(),
                administrator: "host".to_string(),
                tracks: Vec::new(),
            }],
        }
    }
}

impl ServerConfig {
    pub fn credential_table(&self) -> HashMap<String, Principal> {
        self.credentials
            .iter()
            .map(|grant| (grant.credential.clone(), Principal::new(grant.user_id.clone())))
            .collect()
    }
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            probes_per_round: 8,
            probe_best_fraction: 0.5,
            probe_timeout_ms: 5_000,
            probe_interval_secs: 30,
            probe_retry_base_ms: 1_000,
            probe_failure_limit: 3,
            fallback_latency_ms: 250.0,
            tolerance_base_ms: 40.0,
            tolerance_latency_weight: 0.5,
            tolerance_jitter_weight: 1.0,
            tolerance_min_ms: 30.0,
            tolerance_max_ms: 400.0,
            tolerance_tighten_factor: 0.8,
            hard_seek_multiple: 8.0,
            nudge_fraction: 0.8,
            output_latency_ms: 0.0,
            sync_interval_ms: 1_000,
            sync_interval_min_ms: 250,
            sync_interval_max_ms: 3_000,
            play_state_interval_ms: 250,
            history_len: 20,
            failures_per_tier: 3,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 32_000,
            reconnect_reset_after_secs: 30,
            connect_timeout_ms: 10_000,
            keepalive_secs: 10,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            credential: "guest-token".to_string(),
            room_id: Some(DEFAULT_ROOM_ID.to_string()),
            sync: SyncTuning::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: AppConfig,
    pub path: PathBuf,
    pub is_dev_override: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to resolve config base directory")]
    NoConfigDirectory,
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: String,
        source: serde_json::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write config file {path}: {source}")]
    WriteFile {
        path: String,
        source: std::io::Error,
    },
}

pub fn load_config() -> Result<LoadedConfig, ConfigError> {
    if let Some(dev_path) = find_dev_config() {
        let mut config = read_config(&dev_path)?;
        if normalize_sync_tuning(&mut config.listener.sync) {
            log::warn!("dev config {} has out-of-range sync tuning; clamped", dev_path.display());
        }
        return Ok(LoadedConfig {
            config,
            path: dev_path,
            is_dev_override: true,
        });
    }

    let path = persistent_config_path()?;
    if path.exists() {
        let mut config = read_config(&path)?;
        if normalize_sync_tuning(&mut config.listener.sync) {
            save_config_to_path(&path, &config)?;
        }
        return Ok(LoadedConfig {
            config,
            path,
            is_dev_override: false,
        });
    }

    let config = AppConfig::default();
    save_config_to_path(&path, &config)?;

    Ok(LoadedConfig {
        config,
        path,
        is_dev_override: false,
    })
}

pub fn save_config_to_path(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }

    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).map_err(|source| ConfigError::WriteFile {
        path: path.display().to_string(),
        source,
    })
}

pub fn persistent_config_path() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDirectory)?;
    Ok(base_dir.join(APP_CONFIG_DIR).join(APP_CONFIG_FILE))
}

pub fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::ParseFile {
        path: path.display().to_string(),
        source,
    })
}

fn find_dev_config() -> Option<PathBuf> {
    if let Ok(path_from_env) = std::env::var(DEV_CONFIG_ENV) {
        let from_env = PathBuf::from(path_from_env);
        if from_env.exists() {
            return Some(from_env);
        }
    }

    let cwd = std::env::current_dir().ok()?;
    let direct = cwd.join(DEV_CONFIG_FILE);
    if direct.exists() {
        return Some(direct);
    }

    let parent = cwd.parent()?.join(DEV_CONFIG_FILE);
    if parent.exists() {
        return Some(parent);
    }

    None
}

fn normalize_sync_tuning(tuning: &mut SyncTuning) -> bool {
    let before = tuning.clone();
    let defaults = SyncTuning::default();

    tuning.probes_per_round = tuning.probes_per_round.max(1);
    if !(tuning.probe_best_fraction > 0.0 && tuning.probe_best_fraction <= 1.0) {
        tuning.probe_best_fraction = defaults.probe_best_fraction;
    }
    if !(tuning.nudge_fraction > 0.0 && tuning.nudge_fraction <= 1.0) {
        tuning.nudge_fraction = defaults.nudge_fraction;
    }
    if tuning.hard_seek_multiple <= 1.0 {
        tuning.hard_seek_multiple = defaults.hard_seek_multiple;
    }
    if tuning.tolerance_min_ms <= 0.0 || tuning.tolerance_min_ms > tuning.tolerance_max_ms {
        tuning.tolerance_min_ms = defaults.tolerance_min_ms;
        tuning.tolerance_max_ms = defaults.tolerance_max_ms;
    }
    if tuning.sync_interval_min_ms == 0 || tuning.sync_interval_min_ms > tuning.sync_interval_max_ms {
        tuning.sync_interval_min_ms = defaults.sync_interval_min_ms;
        tuning.sync_interval_max_ms = defaults.sync_interval_max_ms;
    }
    tuning.sync_interval_ms = tuning
        .sync_interval_ms
        .clamp(tuning.sync_interval_min_ms, tuning.sync_interval_max_ms);
    tuning.history_len = tuning.history_len.max(1);
    tuning.failures_per_tier = tuning.failures_per_tier.max(1);
    if tuning.reconnect_base_ms == 0 || tuning.reconnect_base_ms > tuning.reconnect_max_ms {
        tuning.reconnect_base_ms = defaults.reconnect_base_ms;
        tuning.reconnect_max_ms = defaults.reconnect_max_ms;
    }
    if tuning.connect_timeout_ms == 0 {
        tuning.connect_timeout_ms = defaults.connect_timeout_ms;
    }

    *tuning != before
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

const fn default_subscriber_queue_capacity() -> usize {
    64
}

const fn default_heartbeat_timeout_secs() -> u64 {
    30
}

const fn default_true() -> bool {
    true
}
