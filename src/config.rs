use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::logging::LogConfig;
use crate::models::{AthleteId, AthleteProfile, PlanPolicy};

/// Main engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Configuration metadata
    pub metadata: ConfigMetadata,

    /// Runtime settings of the athlete engine
    pub engine: EngineSettings,

    /// Policy given to athletes created from this configuration
    pub default_policy: PlanPolicy,

    pub logging: LogConfig,

    /// Locally managed athlete profiles
    pub athletes: BTreeMap<AthleteId, AthleteProfile>,

    /// Athlete used by the CLI when none is given
    pub default_athlete_id: Option<AthleteId>,
}

/// Configuration metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Athlete engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum wait for exclusive access to one athlete's state
    pub lock_timeout_ms: u64,

    /// Run replays on the blocking thread pool instead of inline
    pub replay_on_blocking_pool: bool,

    /// Evaluate adaptation after every applied ingest
    pub adapt_on_ingest: bool,

    /// Write diagnostic reports to the data directory on invariant violations
    pub save_diagnostics: bool,

    /// Adaptation events kept in memory per athlete; the sink holds the full trail
    pub recent_events: usize,
}

impl Default for ConfigMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
            replay_on_blocking_pool: true,
            adapt_on_ingest: true,
            save_diagnostics: false,
            recent_events: 16,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            metadata: ConfigMetadata::default(),
            engine: EngineSettings::default(),
            default_policy: PlanPolicy::default(),
            logging: LogConfig::default(),
            athletes: BTreeMap::new(),
            default_athlete_id: None,
        }
    }
}

impl EngineConfig {
    /// Read and validate a TOML configuration
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let config: EngineConfig =
            toml::from_str(&raw).with_context(|| format!("invalid configuration in {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("rejected configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Write as TOML, creating parent directories and stamping `updated_at`
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.metadata.updated_at = Utc::now();

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
        }
        let body = toml::to_string_pretty(self).context("cannot serialize configuration")?;
        fs::write(path, body).with_context(|| format!("cannot write {}", path.display()))
    }

    /// `~/.trainload/config.toml`
    pub fn default_config_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".trainload").join("config.toml")
    }

    /// Configuration at the default path, or defaults when it is missing or invalid
    pub fn load_or_default() -> Self {
        let path = Self::default_config_path();
        if !path.exists() {
            return Self::default();
        }
        Self::load_from_file(&path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %format!("{:#}", e), "Ignoring unusable config file");
            Self::default()
        })
    }

    /// Reject policies that would break the engine
    pub fn validate(&self) -> Result<()> {
        if self.engine.lock_timeout_ms == 0 {
            anyhow::bail!("engine.lock_timeout_ms must be positive");
        }
        self.default_policy
            .validate()
            .map_err(|e| anyhow::anyhow!("default_policy: {}", e))?;
        for (id, profile) in &self.athletes {
            if *id != profile.athlete_id {
                anyhow::bail!("athlete entry {} holds profile for {}", id, profile.athlete_id);
            }
            profile
                .plan_policy
                .validate()
                .map_err(|e| anyhow::anyhow!("athlete {}: {}", id, e))?;
        }
        Ok(())
    }

    /// New profile carrying this configuration's default policy
    pub fn new_profile(&self, athlete_id: impl Into<AthleteId>) -> AthleteProfile {
        let mut profile = AthleteProfile::new(athlete_id);
        profile.plan_policy = self.default_policy.clone();
        profile
    }

    /// Add or replace an athlete profile
    pub fn add_athlete(&mut self, profile: AthleteProfile) {
        if self.athletes.is_empty() {
            self.default_athlete_id = Some(profile.athlete_id.clone());
        }
        self.athletes.insert(profile.athlete_id.clone(), profile);
        self.metadata.updated_at = Utc::now();
    }

    pub fn remove_athlete(&mut self, athlete_id: &str) -> Result<AthleteProfile> {
        let removed = self
            .athletes
            .remove(athlete_id)
            .ok_or_else(|| anyhow::anyhow!("Athlete not found: {}", athlete_id))?;

        if self.default_athlete_id.as_deref() == Some(athlete_id) {
            self.default_athlete_id = self.athletes.keys().next().cloned();
        }

        self.metadata.updated_at = Utc::now();
        Ok(removed)
    }

    pub fn get_athlete(&self, athlete_id: &str) -> Option<&AthleteProfile> {
        self.athletes.get(athlete_id)
    }

    pub fn get_default_athlete(&self) -> Option<&AthleteProfile> {
        self.default_athlete_id
            .as_ref()
            .and_then(|id| self.athletes.get(id))
    }
}
