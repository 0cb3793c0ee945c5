use std::{
	path::{Path, PathBuf},
	time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("cannot read {path}: {message}")]
	Read { path: PathBuf, message: String },

	#[error("cannot parse {path}: {message}")]
	Parse { path: PathBuf, message: String },

	#[error("invalid value for {field}: {message}")]
	Invalid { field: &'static str, message: String },
}

/// Verifier configuration, read from TOML. Every field has a default so an
/// empty file is valid.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct VerifierConfig {
	pub scheduler: SchedulerConfig,
	pub store: StoreConfig,
	pub history: HistoryConfig,
	pub counters: CountersConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
	pub max_running: usize,
	pub max_retries: u32,
	/// Seconds between sweeps.
	pub sweep_interval: u64,
	/// Seconds allowed for one namespace lookup.
	pub namespace_timeout: u64,
	/// Seconds allowed for one corrective action.
	pub action_timeout: u64,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		SchedulerConfig {
			max_running: 200,
			max_retries: 1,
			sweep_interval: 60,
			namespace_timeout: 30,
			action_timeout: 3600,
		}
	}
}

impl SchedulerConfig {
	pub fn sweep_interval(&self) -> Duration {
		Duration::from_secs(self.sweep_interval)
	}

	pub fn namespace_timeout(&self) -> Duration {
		Duration::from_secs(self.namespace_timeout)
	}

	pub fn action_timeout(&self) -> Duration {
		Duration::from_secs(self.action_timeout)
	}
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
	/// Listings matching more rows than this require an explicit limit.
	pub ls_threshold: usize,
	/// SurrealKV directory; operations live in memory only when absent.
	pub database: Option<PathBuf>,
}

impl Default for StoreConfig {
	fn default() -> Self {
		StoreConfig { ls_threshold: 50_000, database: None }
	}
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
	pub capacity: usize,
}

impl Default for HistoryConfig {
	fn default() -> Self {
		HistoryConfig { capacity: 1000 }
	}
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CountersConfig {
	pub statistics_file: Option<PathBuf>,
	pub record_to_file: bool,
}

impl VerifierConfig {
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
			path: path.to_path_buf(),
			message: e.to_string(),
		})?;
		let config: VerifierConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse {
			path: path.to_path_buf(),
			message: e.to_string(),
		})?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.scheduler.max_running == 0 {
			return Err(ConfigError::Invalid {
				field: "scheduler.max_running",
				message: "must be at least 1".into(),
			});
		}
		if self.scheduler.sweep_interval == 0 {
			return Err(ConfigError::Invalid {
				field: "scheduler.sweep_interval",
				message: "must be at least 1 second".into(),
			});
		}
		if self.scheduler.namespace_timeout == 0 {
			return Err(ConfigError::Invalid {
				field: "scheduler.namespace_timeout",
				message: "must be at least 1 second".into(),
			});
		}
		if self.scheduler.action_timeout == 0 {
			return Err(ConfigError::Invalid {
				field: "scheduler.action_timeout",
				message: "must be at least 1 second".into(),
			});
		}
		if self.history.capacity == 0 {
			return Err(ConfigError::Invalid {
				field: "history.capacity",
				message: "must be at least 1".into(),
			});
		}
		if self.counters.record_to_file && self.counters.statistics_file.is_none() {
			return Err(ConfigError::Invalid {
				field: "counters.statistics_file",
				message: "required when record_to_file is set".into(),
			});
		}
		Ok(())
	}
}
