//! `config.toml` loading (spec §6). Parsed once at startup with `serde` +
//! `toml`, the same pairing the teacher reaches for over the heavier
//! `config` crate (see `ferrex-server/Cargo.toml`'s commented-out
//! `# config.workspace = true`). Values are validated against the bounds
//! from spec §6/§4.7/§4.1 here, so every other component can treat `Config`
//! as already-correct.

use std::path::Path;

use serde::Deserialize;

use crate::error::{FetcherError, Result};
use crate::story::Behavior;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub email: EmailConfig,
    pub library: LibraryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub email: String,
    pub password: String,
    pub server: String,
    pub mailbox: String,
    #[serde(default = "default_sleep_time")]
    pub sleep_time: u64,
    #[serde(default)]
    pub disabled_sites: Vec<String>,
}

fn default_sleep_time() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMethod {
    Update,
    UpdateAlways,
    Force,
    UpdateNoForce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataPreservationMode {
    RemoveAdd,
    PreserveMetadata,
    AddFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LibraryConfig {
    pub path: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub default_ini: Option<String>,
    pub personal_ini: Option<String>,
    pub update_method: UpdateMethod,
    pub metadata_preservation_mode: MetadataPreservationMode,
    /// Name or path of the library-management CLI binary (spec §6 treats
    /// this CLI as an external collaborator without specifying how its
    /// location is configured; defaulted to the conventional `calibredb`
    /// name so it resolves via `PATH` out of the box).
    #[serde(default = "default_library_binary")]
    pub binary: String,
}

fn default_library_binary() -> String {
    "calibredb".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_normal_retries: u32,
    pub final_attempt_enabled: bool,
    pub final_attempt_wait_hours: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_normal_retries: 11,
            final_attempt_enabled: true,
            final_attempt_wait_hours: 12.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub shutdown_timeout: f64,
    pub health_check_interval: f64,
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
    pub restart_delay: f64,
    pub enable_monitoring: bool,
    /// Per-fetch timeout, in seconds. Not mandated by spec §5 but explicitly
    /// permitted; grounded on `ferrex-server`'s `tokio::time::timeout` wrap
    /// around external-process execution (see SPEC_FULL.md).
    pub fetch_timeout_seconds: u64,
    /// Number of concurrent `SiteWorker` instances (spec §2 names this "N
    /// instances" but leaves N unconfigured; see SPEC_FULL.md).
    pub worker_count: usize,
    /// Bound on each per-site channel the coordinator drains backlogs into.
    pub site_channel_capacity: usize,
    /// Name or path of the story-fetcher CLI binary (spec §6, same
    /// unspecified-location treatment as `library.binary`; defaulted to the
    /// conventional `fanficfare` name).
    #[serde(default = "default_fetcher_binary")]
    pub fetcher_binary: String,
}

fn default_fetcher_binary() -> String {
    "fanficfare".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: 10.0,
            health_check_interval: 30.0,
            auto_restart: true,
            max_restart_attempts: 3,
            restart_delay: 5.0,
            enable_monitoring: true,
            fetch_timeout_seconds: 1800,
            worker_count: 4,
            site_channel_capacity: 64,
            fetcher_binary: default_fetcher_binary(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub primary: Option<PrimaryNotificationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrimaryNotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    pub api_key: String,
    #[serde(default)]
    pub device_iden: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FetcherError::Config(format!("reading {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| FetcherError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let email_sleep_floor = 5;
        if self.email.sleep_time < email_sleep_floor {
            return Err(FetcherError::Config(format!(
                "email.sleep_time must be >= {email_sleep_floor}s"
            )));
        }
        if !(1..=50).contains(&self.retry.max_normal_retries) {
            return Err(FetcherError::Config(
                "retry.max_normal_retries must be in 1..=50".into(),
            ));
        }
        let wait = self.retry.final_attempt_wait_hours;
        if !(wait > 0.1 && wait <= 168.0) {
            return Err(FetcherError::Config(
                "retry.final_attempt_wait_hours must be in (0.1, 168]".into(),
            ));
        }
        let rt = &self.runtime;
        if !(1.0..=300.0).contains(&rt.shutdown_timeout) {
            return Err(FetcherError::Config(
                "runtime.shutdown_timeout must be in 1..=300".into(),
            ));
        }
        if !(0.1..=3600.0).contains(&rt.health_check_interval) {
            return Err(FetcherError::Config(
                "runtime.health_check_interval must be in 0.1..=3600".into(),
            ));
        }
        if rt.max_restart_attempts > 10 {
            return Err(FetcherError::Config(
                "runtime.max_restart_attempts must be <= 10".into(),
            ));
        }
        if !(0.1..=60.0).contains(&rt.restart_delay) {
            return Err(FetcherError::Config(
                "runtime.restart_delay must be in 0.1..=60".into(),
            ));
        }
        if !(1..=64).contains(&rt.worker_count) {
            return Err(FetcherError::Config(
                "runtime.worker_count must be in 1..=64".into(),
            ));
        }
        Ok(())
    }
}

/// Whether `behavior` should be honored as `force` under the configured
/// `update_method` (spec §4.8). Returns the command modifier to pass to the
/// story-fetcher CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchModifier {
    Update,
    UpdateAlways,
    Force,
}

impl FetchModifier {
    pub fn as_cli_flag(&self) -> &'static str {
        match self {
            FetchModifier::Update => "update",
            FetchModifier::UpdateAlways => "update-always",
            FetchModifier::Force => "force",
        }
    }
}

/// Implements the top-to-bottom decision table in spec §4.8.
pub fn resolve_fetch_modifier(update_method: UpdateMethod, behavior: Behavior) -> FetchModifier {
    if update_method == UpdateMethod::UpdateNoForce {
        return FetchModifier::Update;
    }
    if behavior == Behavior::Force {
        return FetchModifier::Force;
    }
    match update_method {
        UpdateMethod::Force => FetchModifier::Force,
        UpdateMethod::UpdateAlways => FetchModifier::UpdateAlways,
        UpdateMethod::Update | UpdateMethod::UpdateNoForce => FetchModifier::Update,
    }
}

/// Whether a `ForceIndicated` fetcher outcome may promote a story to `force`
/// (spec §4.8: "only applies when `update_method != update_no_force`").
pub fn allows_force_promotion(update_method: UpdateMethod) -> bool {
    update_method != UpdateMethod::UpdateNoForce
}
