//! Persisted last-applied state.
//!
//! The state file is a JSON object mapping resource IDs to the manifest that
//! was last applied successfully, together with its wait setting. Entries
//! keep insertion order, which is the order resources were applied in.

use std::{
	fs,
	path::{Path, PathBuf},
};

use kres_model::{IdError, Manifest, ManifestError, ResourceId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Default state file name, relative to the working directory.
pub const DEFAULT_STATE_FILE: &str = "kres.state.json";

#[derive(Debug, Error)]
pub enum StateError {
	#[error("failed to read state file: {}", path.display())]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse state file: {}", path.display())]
	Parse {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},

	#[error("failed to write state file: {}", path.display())]
	Write {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("state entry {key:?} is not a valid ID")]
	InvalidId {
		key: String,
		#[source]
		source: IdError,
	},

	#[error("state entry {id} does not hold a valid manifest")]
	Manifest {
		id: ResourceId,
		#[source]
		source: ManifestError,
	},
}

/// One tracked resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
	/// Last successfully applied manifest.
	pub manifest: Value,
	#[serde(default)]
	pub wait: bool,
}

/// Tracked resources, keyed by ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
	#[serde(default)]
	resources: serde_json::Map<String, Value>,
}

impl State {
	/// Load state from `path`; a missing file is an empty state.
	pub fn load(path: &Path) -> Result<Self, StateError> {
		let content = match fs::read_to_string(path) {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
			Err(source) => {
				return Err(StateError::Read {
					path: path.to_path_buf(),
					source,
				})
			}
		};
		serde_json::from_str(&content).map_err(|source| StateError::Parse {
			path: path.to_path_buf(),
			source,
		})
	}

	/// Write state to `path`, replacing the previous file atomically.
	pub fn save(&self, path: &Path) -> Result<(), StateError> {
		let write_error = |source: std::io::Error| StateError::Write {
			path: path.to_path_buf(),
			source,
		};
		let mut content = serde_json::to_string_pretty(self).map_err(|e| write_error(e.into()))?;
		content.push('\n');

		let tmp = path.with_extension("json.tmp");
		fs::write(&tmp, content).map_err(write_error)?;
		fs::rename(&tmp, path).map_err(write_error)
	}

	/// Tracked IDs in the order they were first recorded.
	pub fn ids(&self) -> Result<Vec<ResourceId>, StateError> {
		self.resources
			.keys()
			.map(|key| {
				ResourceId::decode(key).map_err(|source| StateError::InvalidId {
					key: key.clone(),
					source,
				})
			})
			.collect()
	}

	pub fn len(&self) -> usize {
		self.resources.len()
	}

	pub fn is_empty(&self) -> bool {
		self.resources.is_empty()
	}

	pub fn contains(&self, id: &ResourceId) -> bool {
		self.resources.contains_key(&id.encode())
	}

	pub fn entry(&self, id: &ResourceId) -> Option<StateEntry> {
		let value = self.resources.get(&id.encode())?;
		serde_json::from_value(value.clone()).ok()
	}

	/// Last-applied manifest for `id`.
	pub fn manifest(&self, id: &ResourceId) -> Result<Option<Manifest>, StateError> {
		let Some(entry) = self.entry(id) else {
			return Ok(None);
		};
		Manifest::from_value(entry.manifest)
			.map(Some)
			.map_err(|source| StateError::Manifest {
				id: id.clone(),
				source,
			})
	}

	/// Record the manifest applied for its ID. Existing entries keep their position.
	pub fn record(&mut self, manifest: &Manifest, wait: bool) {
		let key = manifest.id().encode();
		let value = json!({
			"manifest": manifest.stripped().into_value(),
			"wait": wait,
		});
		match self.resources.get_mut(&key) {
			Some(existing) => *existing = value,
			None => {
				self.resources.insert(key, value);
			}
		}
	}

	pub fn remove(&mut self, id: &ResourceId) -> Option<StateEntry> {
		let value = self.resources.shift_remove(&id.encode())?;
		serde_json::from_value(value).ok()
	}
}

#[cfg(test)]
mod tests {
	use tempfile::TempDir;

	use super::*;

	fn manifest(value: Value) -> Manifest {
		Manifest::from_value(value).unwrap()
	}

	fn namespace(name: &str) -> Manifest {
		manifest(json!({
			"apiVersion": "v1",
			"kind": "Namespace",
			"metadata": { "name": name }
		}))
	}

	#[test]
	fn test_missing_file_is_empty() {
		let dir = TempDir::new().unwrap();
		let state = State::load(&dir.path().join(DEFAULT_STATE_FILE)).unwrap();
		assert!(state.is_empty());
	}

	#[test]
	fn test_round_trip_keeps_order() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join(DEFAULT_STATE_FILE);

		let mut state = State::default();
		state.record(&namespace("zeta"), false);
		state.record(&namespace("alpha"), true);
		state.save(&path).unwrap();

		let loaded = State::load(&path).unwrap();
		assert_eq!(loaded, state);
		let ids: Vec<String> = loaded.ids().unwrap().iter().map(ResourceId::encode).collect();
		assert_eq!(ids, ["_/Namespace/_/zeta", "_/Namespace/_/alpha"]);
		assert!(loaded.entry(&namespace("alpha").id().clone()).unwrap().wait);
	}

	#[test]
	fn test_record_strips_server_fields() {
		let mut state = State::default();
		let live = manifest(json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
			"metadata": {
				"name": "example",
				"namespace": "default",
				"uid": "1234",
				"resourceVersion": "7"
			},
			"data": { "key": "value" }
		}));
		state.record(&live, false);

		let stored = state.manifest(live.id()).unwrap().unwrap();
		assert_eq!(stored.resource_version(), None);
		assert_eq!(stored.as_value()["data"]["key"], "value");
	}

	#[test]
	fn test_remove() {
		let mut state = State::default();
		let ns = namespace("gone");
		state.record(&ns, false);
		assert!(state.contains(ns.id()));
		assert!(state.remove(ns.id()).is_some());
		assert!(!state.contains(ns.id()));
	}

	#[test]
	fn test_parse_error_names_file() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join(DEFAULT_STATE_FILE);
		fs::write(&path, "{ not json").unwrap();

		let err = State::load(&path).unwrap_err();
		assert!(err.to_string().starts_with("failed to parse state file: "));
	}
}
