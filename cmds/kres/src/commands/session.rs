//! Cluster arguments and per-invocation setup shared by the commands.

use std::{
	collections::HashMap,
	fs,
	path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Args;
use kres_model::{Manifest, ResourceId};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
	config::{KresConfig, Settings, TimeoutsConfig},
	k8s::{
		apply::{Applier, ApplyStrategy},
		client::ClusterConnection,
		discovery::RestMapper,
		retry::RetryConfig,
	},
	lifecycle::{Lifecycle, WaitOptions},
	state::{State, DEFAULT_STATE_FILE},
};

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
	/// Path to the kubeconfig file. Defaults to $KUBECONFIG or ~/.kube/config
	#[arg(long)]
	pub kubeconfig: Option<PathBuf>,

	/// Kubeconfig context to use instead of the current one
	#[arg(long)]
	pub context: Option<String>,

	/// Path to the state file
	#[arg(long, default_value = DEFAULT_STATE_FILE)]
	pub state: PathBuf,

	/// Path to a config file. Searched upwards from the working directory if not set
	#[arg(long)]
	pub config: Option<PathBuf>,

	/// Field manager name recorded on writes
	#[arg(long)]
	pub field_manager: Option<String>,

	/// How updates are sent to the API server
	#[arg(long, value_enum)]
	pub apply_strategy: Option<ApplyStrategy>,

	/// Readiness and deletion poll interval (e.g. "500ms")
	#[arg(long)]
	pub poll_interval: Option<String>,

	/// Retries for writes rejected with a conflict
	#[arg(long)]
	pub conflict_retries: Option<u32>,

	/// Wait for resources to become ready after create and update
	#[arg(long)]
	pub wait: bool,

	/// Readiness deadline after create (e.g. "5m")
	#[arg(long)]
	pub create_timeout: Option<String>,

	/// Readiness deadline after update
	#[arg(long)]
	pub update_timeout: Option<String>,

	/// Deadline for a deleted object to disappear
	#[arg(long)]
	pub delete_timeout: Option<String>,
}

impl ClusterArgs {
	fn overrides(&self) -> KresConfig {
		KresConfig {
			field_manager: self.field_manager.clone(),
			apply_strategy: self.apply_strategy,
			poll_interval: self.poll_interval.clone(),
			conflict_retries: self.conflict_retries,
			timeouts: TimeoutsConfig {
				create: self.create_timeout.clone(),
				update: self.update_timeout.clone(),
				delete: self.delete_timeout.clone(),
			},
			wait: self.wait.then_some(true),
		}
	}

	/// Settings from the config file with flags applied on top.
	pub fn settings(&self) -> Result<Settings> {
		let mut config = match &self.config {
			Some(path) => KresConfig::load_from_file(path)?,
			None => {
				let cwd = std::env::current_dir().context("reading working directory")?;
				KresConfig::load_from_directory(&cwd)?.unwrap_or_default()
			}
		};
		config.merge_from(&self.overrides());
		config.resolve()
	}

	/// Connect to the cluster and build a session.
	pub async fn connect(&self, cancel: CancellationToken) -> Result<Session> {
		let settings = self.settings()?;
		let connection = ClusterConnection::connect(self.kubeconfig.as_deref(), self.context.as_deref())
			.await
			.context("connecting to cluster")?;
		Session::new(&connection, settings, self.state.clone(), cancel).await
	}
}

/// Everything a command needs to talk to the cluster and the state file.
pub struct Session {
	pub lifecycle: Lifecycle,
	pub settings: Settings,
	pub state_path: PathBuf,
}

impl Session {
	#[instrument(skip_all, fields(cluster = %connection.cluster_identifier()))]
	pub async fn new(
		connection: &ClusterConnection,
		settings: Settings,
		state_path: PathBuf,
		cancel: CancellationToken,
	) -> Result<Self> {
		let mapper = RestMapper::new(connection.client().clone())
			.await
			.context("discovering API resources")?;
		let applier = Applier::builder()
			.client(connection.client().clone())
			.field_manager(settings.field_manager.clone())
			.strategy(settings.apply_strategy)
			.retry(RetryConfig::with_max_attempts(
				settings.conflict_retries.saturating_add(1),
			))
			.poll_interval(settings.poll_interval)
			.cancel(cancel)
			.build();

		Ok(Self {
			lifecycle: Lifecycle::new(mapper, applier),
			settings,
			state_path,
		})
	}

	pub fn wait(&self) -> WaitOptions {
		self.settings.wait
	}

	/// Wait options for a tracked resource, keeping its recorded wait flag.
	pub fn wait_for_entry(&self, wait: bool) -> WaitOptions {
		WaitOptions {
			wait,
			timeouts: self.settings.wait.timeouts,
		}
	}

	pub fn load_state(&self) -> Result<State> {
		Ok(State::load(&self.state_path)?)
	}

	pub fn save_state(&self, state: &State) -> Result<()> {
		Ok(state.save(&self.state_path)?)
	}
}

/// Read a manifests file: a JSON object mapping IDs to manifests.
///
/// Each manifest may be given as an object or as a string holding JSON. The
/// key must match the ID derived from the manifest.
pub fn load_manifests(path: &Path) -> Result<Vec<Manifest>> {
	let content = fs::read_to_string(path)
		.with_context(|| format!("failed to read manifests file: {}", path.display()))?;
	let entries: serde_json::Map<String, Value> = serde_json::from_str(&content)
		.with_context(|| format!("failed to parse manifests file: {}", path.display()))?;

	entries
		.into_iter()
		.map(|(key, value)| -> Result<Manifest> {
			let id = ResourceId::decode(&key)?;
			let manifest = match value {
				Value::String(raw) => Manifest::load(raw.as_bytes()),
				value => Manifest::from_value(value),
			}
			.with_context(|| format!("decoding manifest for {id}"))?;
			if manifest.id() != &id {
				anyhow::bail!("manifest for {id} describes {}", manifest.id());
			}
			Ok(manifest)
		})
		.collect()
}

/// Foundational objects (namespaces, CRDs) first, file order otherwise.
pub fn apply_order(manifests: &mut [Manifest]) {
	manifests.sort_by_key(|manifest| !manifest.id().is_foundational());
}

/// Map each new ID to the stale ID it replaces.
///
/// Only unambiguous pairs count: one new and one stale ID with the same group
/// and kind.
pub fn pair_renames(manifests: &[Manifest], tracked: &[ResourceId]) -> HashMap<ResourceId, ResourceId> {
	let desired: Vec<&ResourceId> = manifests.iter().map(Manifest::id).collect();
	let mut candidates: HashMap<(&str, &str), (Vec<&ResourceId>, Vec<&ResourceId>)> = HashMap::new();
	for id in desired.iter().copied().filter(|id| !tracked.contains(*id)) {
		candidates.entry((id.group(), id.kind())).or_default().0.push(id);
	}
	for id in tracked.iter().filter(|id| !desired.contains(id)) {
		candidates.entry((id.group(), id.kind())).or_default().1.push(id);
	}

	candidates
		.into_values()
		.filter_map(|(new, stale)| match (new.as_slice(), stale.as_slice()) {
			([new], [stale]) => Some(((*new).clone(), (*stale).clone())),
			_ => None,
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use indoc::indoc;
	use tempfile::TempDir;

	use super::*;

	fn write(dir: &TempDir, content: &str) -> PathBuf {
		let path = dir.path().join("manifests.json");
		fs::write(&path, content).unwrap();
		path
	}

	#[test]
	fn test_load_manifests_object_and_string() {
		let dir = TempDir::new().unwrap();
		let path = write(
			&dir,
			indoc! {r#"
				{
					"apps/Deployment/test/example": {
						"apiVersion": "apps/v1",
						"kind": "Deployment",
						"metadata": { "name": "example", "namespace": "test" }
					},
					"_/Namespace/_/test": "{\"apiVersion\":\"v1\",\"kind\":\"Namespace\",\"metadata\":{\"name\":\"test\"}}"
				}
			"#},
		);

		let mut manifests = load_manifests(&path).unwrap();
		let ids: Vec<String> = manifests.iter().map(|m| m.id().encode()).collect();
		assert_eq!(ids, ["apps/Deployment/test/example", "_/Namespace/_/test"]);

		apply_order(&mut manifests);
		let ids: Vec<String> = manifests.iter().map(|m| m.id().encode()).collect();
		assert_eq!(ids, ["_/Namespace/_/test", "apps/Deployment/test/example"]);
	}

	#[test]
	fn test_load_manifests_key_mismatch() {
		let dir = TempDir::new().unwrap();
		let path = write(
			&dir,
			indoc! {r#"
				{
					"_/Namespace/_/other": {
						"apiVersion": "v1",
						"kind": "Namespace",
						"metadata": { "name": "test" }
					}
				}
			"#},
		);

		let err = load_manifests(&path).unwrap_err();
		assert_eq!(
			err.to_string(),
			"manifest for _/Namespace/_/other describes _/Namespace/_/test"
		);
	}

	#[test]
	fn test_load_manifests_invalid_key() {
		let dir = TempDir::new().unwrap();
		let path = write(&dir, r#"{ "invalidID": {} }"#);

		let err = load_manifests(&path).unwrap_err();
		assert_eq!(
			err.to_string(),
			r#"invalid ID: "invalidID", valid IDs look like: "_/Namespace/_/example""#
		);
	}

	#[test]
	fn test_flags_override_config_file() {
		let dir = TempDir::new().unwrap();
		let config = dir.path().join(".kres.yaml");
		fs::write(&config, "fieldManager: from-file\nwait: true\n").unwrap();

		let args = ClusterArgs {
			kubeconfig: None,
			context: None,
			state: PathBuf::from(DEFAULT_STATE_FILE),
			config: Some(config),
			field_manager: Some("from-flag".to_string()),
			apply_strategy: None,
			poll_interval: None,
			conflict_retries: None,
			wait: false,
			create_timeout: Some("10s".to_string()),
			update_timeout: None,
			delete_timeout: None,
		};

		let settings = args.settings().unwrap();
		assert_eq!(settings.field_manager, "from-flag");
		assert!(settings.wait.wait);
		assert_eq!(settings.wait.timeouts.create, std::time::Duration::from_secs(10));
	}

	fn config_map(namespace: &str, name: &str) -> Manifest {
		Manifest::load(
			format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: {namespace}\n")
				.as_bytes(),
		)
		.unwrap()
	}

	fn ids(encoded: &[&str]) -> Vec<ResourceId> {
		encoded.iter().map(|id| ResourceId::decode(id).unwrap()).collect()
	}

	#[test]
	fn test_pair_renames_single_candidate() {
		let manifests = [config_map("default", "kept"), config_map("moved", "settings")];
		let tracked = ids(&["_/ConfigMap/default/kept", "_/ConfigMap/default/settings"]);

		let renames = pair_renames(&manifests, &tracked);
		assert_eq!(renames.len(), 1);
		assert_eq!(
			renames.get(manifests[1].id()).map(ResourceId::encode).as_deref(),
			Some("_/ConfigMap/default/settings")
		);
	}

	#[test]
	fn test_pair_renames_skips_ambiguous_and_other_kinds() {
		let manifests = [config_map("default", "a"), config_map("default", "b")];
		let tracked = ids(&["_/ConfigMap/default/old"]);
		assert!(pair_renames(&manifests, &tracked).is_empty());

		let manifests = [config_map("default", "new")];
		let tracked = ids(&["_/Secret/default/old"]);
		assert!(pair_renames(&manifests, &tracked).is_empty());
	}
}
