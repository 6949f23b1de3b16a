//! Configuration file support for kres
//!
//! Supports `.kres.yaml` files that can be placed anywhere in the directory
//! hierarchy. kres searches from the working directory upward to the
//! filesystem root. Command-line flags override file values, which override
//! the built-in defaults.

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{
	k8s::apply::{ApplyStrategy, DEFAULT_FIELD_MANAGER, DEFAULT_POLL_INTERVAL},
	lifecycle::{Timeouts, WaitOptions, DEFAULT_TIMEOUT},
};

/// The name of the config file kres looks for
pub const CONFIG_FILE_NAME: &str = ".kres.yaml";

/// Retries after the first conflicting write, unless configured otherwise.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 5;

/// Root configuration structure for .kres.yaml
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KresConfig {
	/// Field manager name recorded on writes.
	#[serde(default)]
	pub field_manager: Option<String>,

	#[serde(default)]
	pub apply_strategy: Option<ApplyStrategy>,

	/// Readiness and deletion poll interval, e.g. "500ms".
	#[serde(default)]
	pub poll_interval: Option<String>,

	/// How often a write rejected with 409 Conflict is retried.
	#[serde(default)]
	pub conflict_retries: Option<u32>,

	#[serde(default)]
	pub timeouts: TimeoutsConfig,

	/// Block on readiness after create and update.
	#[serde(default)]
	pub wait: Option<bool>,
}

/// Per-operation timeouts as humantime strings ("5m", "90s").
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
	#[serde(default)]
	pub create: Option<String>,
	#[serde(default)]
	pub update: Option<String>,
	#[serde(default)]
	pub delete: Option<String>,
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
	pub field_manager: String,
	pub apply_strategy: ApplyStrategy,
	pub poll_interval: Duration,
	pub conflict_retries: u32,
	pub wait: WaitOptions,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			field_manager: DEFAULT_FIELD_MANAGER.to_string(),
			apply_strategy: ApplyStrategy::default(),
			poll_interval: DEFAULT_POLL_INTERVAL,
			conflict_retries: DEFAULT_CONFLICT_RETRIES,
			wait: WaitOptions::default(),
		}
	}
}

fn parse_duration(field: &str, value: Option<&str>, default: Duration) -> Result<Duration> {
	match value {
		Some(value) => humantime::parse_duration(value)
			.with_context(|| format!("invalid duration for {field}: {value:?}")),
		None => Ok(default),
	}
}

impl KresConfig {
	/// Load config by searching from the given directory upward
	pub fn load_from_directory(start_dir: &Path) -> Result<Option<Self>> {
		if let Some(config_path) = find_config_file(start_dir) {
			let config = Self::load_from_file(&config_path)?;
			Ok(Some(config))
		} else {
			Ok(None)
		}
	}

	/// Load config from a specific file path
	pub fn load_from_file(path: &Path) -> Result<Self> {
		let content = fs::read_to_string(path)
			.with_context(|| format!("failed to read config file: {}", path.display()))?;
		let config: KresConfig = serde_yaml::from_str(&content)
			.with_context(|| format!("failed to parse config file: {}", path.display()))?;
		Ok(config)
	}

	/// Merge `other` over this config (values set in `other` win)
	pub fn merge_from(&mut self, other: &KresConfig) {
		if other.field_manager.is_some() {
			self.field_manager.clone_from(&other.field_manager);
		}
		if other.apply_strategy.is_some() {
			self.apply_strategy = other.apply_strategy;
		}
		if other.poll_interval.is_some() {
			self.poll_interval.clone_from(&other.poll_interval);
		}
		if other.conflict_retries.is_some() {
			self.conflict_retries = other.conflict_retries;
		}
		if other.timeouts.create.is_some() {
			self.timeouts.create.clone_from(&other.timeouts.create);
		}
		if other.timeouts.update.is_some() {
			self.timeouts.update.clone_from(&other.timeouts.update);
		}
		if other.timeouts.delete.is_some() {
			self.timeouts.delete.clone_from(&other.timeouts.delete);
		}
		if other.wait.is_some() {
			self.wait = other.wait;
		}
	}

	/// Fill unset values with defaults and parse durations.
	pub fn resolve(&self) -> Result<Settings> {
		let timeouts = Timeouts {
			create: parse_duration("timeouts.create", self.timeouts.create.as_deref(), DEFAULT_TIMEOUT)?,
			update: parse_duration("timeouts.update", self.timeouts.update.as_deref(), DEFAULT_TIMEOUT)?,
			delete: parse_duration("timeouts.delete", self.timeouts.delete.as_deref(), DEFAULT_TIMEOUT)?,
		};

		Ok(Settings {
			field_manager: self
				.field_manager
				.clone()
				.unwrap_or_else(|| DEFAULT_FIELD_MANAGER.to_string()),
			apply_strategy: self.apply_strategy.unwrap_or_default(),
			poll_interval: parse_duration("pollInterval", self.poll_interval.as_deref(), DEFAULT_POLL_INTERVAL)?,
			conflict_retries: self.conflict_retries.unwrap_or(DEFAULT_CONFLICT_RETRIES),
			wait: WaitOptions {
				wait: self.wait.unwrap_or(false),
				timeouts,
			},
		})
	}
}

/// Search for a config file starting from `start_dir` and walking up to the filesystem root
pub fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
	let mut current = start_dir.to_path_buf();

	// Canonicalize if possible to handle relative paths
	if let Ok(canonical) = current.canonicalize() {
		current = canonical;
	}

	loop {
		let config_path = current.join(CONFIG_FILE_NAME);
		if config_path.exists() {
			return Some(config_path);
		}

		match current.parent() {
			Some(parent) if parent != current => current = parent.to_path_buf(),
			_ => break,
		}
	}

	None
}
