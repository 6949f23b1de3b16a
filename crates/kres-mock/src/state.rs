//! In-memory object store behind the mock API server.
//!
//! Objects are keyed by group, plural, namespace and name, so the same object
//! is visible under every served version of its group.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::trace;

use crate::{
	admission::{self, ImmutableField},
	discovery::MockDiscovery,
	helpers::{merge_json, without_metadata_and_status, Reply},
};

const APPLY_PATCH_CONTENT_TYPE: &str = "application/apply-patch+yaml";
const CREATION_TIMESTAMP: &str = "2024-01-01T00:00:00Z";

/// How workload status evolves after a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RolloutMode {
	/// Status reports a finished rollout right away.
	#[default]
	Converged,
	/// Status never reports available replicas.
	Stalled,
	/// Status converges after the object has been read this many times.
	AfterReads(u32),
}

/// One request seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
	pub method: String,
	pub path: String,
	pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
	pub group: String,
	pub plural: String,
	pub namespace: Option<String>,
	pub name: String,
}

struct StoredObject {
	value: Value,
	/// Reads left before a terminating object disappears.
	terminating: Option<u32>,
	/// Reads left before workload status converges.
	rollout_reads: u32,
}

/// Parsed resource URL.
#[derive(Debug, PartialEq, Eq)]
struct Route<'a> {
	group: &'a str,
	version: &'a str,
	namespace: Option<&'a str>,
	plural: &'a str,
	name: Option<&'a str>,
}

fn parse_route(path: &str) -> Option<Route<'_>> {
	let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
	let (group, version, rest) = match segments.as_slice() {
		["api", version, rest @ ..] => ("", *version, rest),
		["apis", group, version, rest @ ..] => (*group, *version, rest),
		_ => return None,
	};
	let (namespace, rest) = match rest {
		["namespaces", namespace, rest @ ..] if !rest.is_empty() => (Some(*namespace), rest),
		_ => (None, rest),
	};
	let (plural, name) = match rest {
		[plural] => (*plural, None),
		[plural, name] => (*plural, Some(*name)),
		_ => return None,
	};
	Some(Route {
		group,
		version,
		namespace,
		plural,
		name,
	})
}

pub struct MockState {
	discovery: MockDiscovery,
	objects: BTreeMap<ObjectKey, StoredObject>,
	next_resource_version: u64,
	next_uid: u64,
	journal: Vec<JournalEntry>,
	patch_conflicts: u32,
	deletion_delay: u32,
	rollout: RolloutMode,
	immutable: Vec<ImmutableField>,
}

impl MockState {
	pub fn new(
		discovery: MockDiscovery,
		rollout: RolloutMode,
		deletion_delay: u32,
		immutable: Vec<ImmutableField>,
	) -> Self {
		Self {
			discovery,
			objects: BTreeMap::new(),
			next_resource_version: 1,
			next_uid: 1,
			journal: Vec::new(),
			patch_conflicts: 0,
			deletion_delay,
			rollout,
			immutable,
		}
	}

	pub fn discovery(&self) -> &MockDiscovery {
		&self.discovery
	}

	/// Key for an object given its group, kind, namespace and name.
	pub fn key_for(&self, group: &str, kind: &str, namespace: Option<&str>, name: &str) -> Option<ObjectKey> {
		let resource = self.discovery.find_kind(group, kind)?;
		Some(ObjectKey {
			group: group.to_string(),
			plural: resource.name.clone(),
			namespace: if resource.namespaced {
				Some(namespace.unwrap_or("default").to_string())
			} else {
				None
			},
			name: name.to_string(),
		})
	}

	/// Store an object as if it had been created, bypassing admission.
	pub fn seed(&mut self, mut value: Value) -> Option<ObjectKey> {
		let api_version = value.get("apiVersion")?.as_str()?;
		let group = api_version.split_once('/').map_or("", |(g, _)| g).to_string();
		let kind = value.get("kind")?.as_str()?.to_string();
		let name = value.pointer("/metadata/name")?.as_str()?.to_string();
		let namespace = value
			.pointer("/metadata/namespace")
			.and_then(Value::as_str)
			.map(String::from);
		let key = self.key_for(&group, &kind, namespace.as_deref(), &name)?;
		if let Some(ns) = &key.namespace {
			value["metadata"]["namespace"] = json!(ns);
		}
		self.stamp_new(&mut value);
		self.insert(key.clone(), value);
		Some(key)
	}

	pub fn get(&self, key: &ObjectKey) -> Option<&Value> {
		self.objects.get(key).map(|o| &o.value)
	}

	pub fn get_mut(&mut self, key: &ObjectKey) -> Option<&mut Value> {
		self.objects.get_mut(key).map(|o| &mut o.value)
	}

	pub fn objects(&self) -> impl Iterator<Item = &Value> {
		self.objects.values().map(|o| &o.value)
	}

	pub fn journal(&self) -> &[JournalEntry] {
		&self.journal
	}

	pub fn inject_patch_conflicts(&mut self, count: u32) {
		self.patch_conflicts = count;
	}

	pub fn set_rollout(&mut self, rollout: RolloutMode) {
		self.rollout = rollout;
	}

	/// Serve one resource request and record it in the journal.
	pub fn handle(
		&mut self,
		method: &str,
		path: &str,
		query: &str,
		content_type: &str,
		body: &[u8],
	) -> Reply {
		let reply = self.dispatch(method, path, query, content_type, body);
		trace!(method, path, status = reply.code, "mock request");
		self.journal.push(JournalEntry {
			method: method.to_string(),
			path: path.to_string(),
			status: reply.code,
		});
		reply
	}

	fn dispatch(
		&mut self,
		method: &str,
		path: &str,
		query: &str,
		content_type: &str,
		body: &[u8],
	) -> Reply {
		let Some(route) = parse_route(path) else {
			return Reply::status(404, "NotFound", "the server could not find the requested resource");
		};
		let Some(resource) = self.discovery.find_plural(route.group, route.plural) else {
			return Reply::status(404, "NotFound", "the server could not find the requested resource");
		};
		let kind = resource.kind.clone();
		let namespaced = resource.namespaced;
		let dry_run = query.contains("dryRun");

		let namespace = if namespaced {
			route.namespace.map(String::from)
		} else {
			None
		};

		match (method, route.name) {
			("GET", None) => self.list(&route, namespace.as_deref()),
			("GET", Some(name)) => {
				let key = self.key(&route, namespace, name);
				self.read(&route, &key)
			}
			("POST", None) => match serde_json::from_slice::<Value>(body) {
				Ok(object) => self.create(&route, &kind, namespace, object, dry_run),
				Err(e) => Reply::status(400, "BadRequest", &e.to_string()),
			},
			("PATCH", Some(name)) => match serde_json::from_slice::<Value>(body) {
				Ok(patch) => {
					let key = self.key(&route, namespace, name);
					let server_side = content_type.starts_with(APPLY_PATCH_CONTENT_TYPE);
					self.patch(&route, &kind, key, patch, server_side, dry_run)
				}
				Err(e) => Reply::status(400, "BadRequest", &e.to_string()),
			},
			("DELETE", Some(name)) => {
				let key = self.key(&route, namespace, name);
				self.delete(&route, &key)
			}
			_ => Reply::status(405, "MethodNotAllowed", "method not allowed"),
		}
	}

	fn key(&self, route: &Route<'_>, namespace: Option<String>, name: &str) -> ObjectKey {
		ObjectKey {
			group: route.group.to_string(),
			plural: route.plural.to_string(),
			namespace,
			name: name.to_string(),
		}
	}

	fn list(&self, route: &Route<'_>, namespace: Option<&str>) -> Reply {
		let items: Vec<Value> = self
			.objects
			.iter()
			.filter(|(key, _)| key.group == route.group && key.plural == route.plural)
			.filter(|(key, _)| namespace.is_none() || key.namespace.as_deref() == namespace)
			.map(|(_, object)| served(route, &object.value))
			.collect();

		Reply::new(
			200,
			json!({
				"kind": "List",
				"apiVersion": "v1",
				"metadata": { "resourceVersion": self.next_resource_version.to_string() },
				"items": items
			}),
		)
	}

	fn read(&mut self, route: &Route<'_>, key: &ObjectKey) -> Reply {
		let Some(object) = self.objects.get_mut(key) else {
			return Reply::not_found(&qualified(route), &key.name);
		};

		if let Some(reads_left) = object.terminating {
			if reads_left == 0 {
				self.objects.remove(key);
				return Reply::not_found(&qualified(route), &key.name);
			}
			object.terminating = Some(reads_left - 1);
		}

		if object.rollout_reads > 0 {
			object.rollout_reads -= 1;
			if object.rollout_reads == 0 {
				apply_workload_status(&mut object.value, true);
			}
		}

		Reply::new(200, served(route, &object.value))
	}

	fn create(
		&mut self,
		route: &Route<'_>,
		kind: &str,
		namespace: Option<String>,
		mut object: Value,
		dry_run: bool,
	) -> Reply {
		let Some(name) = object.pointer("/metadata/name").and_then(Value::as_str).map(String::from) else {
			return Reply::status(422, "Invalid", "metadata.name: Required value");
		};
		let key = self.key(route, namespace, &name);

		if self.objects.contains_key(&key) {
			return Reply::status(
				409,
				"AlreadyExists",
				&format!("{} \"{name}\" already exists", qualified(route)),
			);
		}
		if let Err(message) = admission::validate(route.group, &object) {
			return Reply::status(422, "Invalid", &message);
		}

		object["kind"] = json!(kind);
		if let Some(ns) = &key.namespace {
			object["metadata"]["namespace"] = json!(ns);
		}
		self.stamp_new(&mut object);
		let reply = Reply::new(201, served(route, &object));
		if !dry_run {
			self.insert(key, object);
		}
		reply
	}

	fn patch(
		&mut self,
		route: &Route<'_>,
		kind: &str,
		key: ObjectKey,
		patch: Value,
		server_side: bool,
		dry_run: bool,
	) -> Reply {
		if self.patch_conflicts > 0 {
			self.patch_conflicts -= 1;
			return conflict(route, &key.name);
		}

		let Some(existing) = self.objects.get(&key) else {
			if server_side {
				return self.create(route, kind, key.namespace.clone(), patch, dry_run);
			}
			return Reply::not_found(&qualified(route), &key.name);
		};

		let current_rv = existing.value.pointer("/metadata/resourceVersion").and_then(Value::as_str);
		let requested_rv = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str);
		if requested_rv.is_some_and(|rv| Some(rv) != current_rv) {
			return conflict(route, &key.name);
		}

		let old = existing.value.clone();
		let mut updated = merge_json(old.clone(), patch);
		// identity and server-owned metadata are not patchable
		for field in ["name", "namespace", "uid", "creationTimestamp", "generation"] {
			match old["metadata"].get(field) {
				Some(value) => updated["metadata"][field] = value.clone(),
				None => {
					if let Some(metadata) = updated["metadata"].as_object_mut() {
						metadata.remove(field);
					}
				}
			}
		}
		updated["kind"] = json!(kind);

		if let Err(message) = admission::validate(route.group, &updated)
			.and_then(|()| admission::check_immutable(route.group, &old, &updated, &self.immutable))
		{
			return Reply::status(422, "Invalid", &message);
		}

		let spec_changed = without_metadata_and_status(&old) != without_metadata_and_status(&updated);
		if spec_changed {
			let generation = old.pointer("/metadata/generation").and_then(Value::as_i64).unwrap_or(1);
			updated["metadata"]["generation"] = json!(generation + 1);
		}
		updated["metadata"]["resourceVersion"] = json!(self.bump_resource_version());

		let reply = Reply::new(200, served(route, &updated));
		if !dry_run {
			if spec_changed {
				self.insert(key, updated);
			} else if let Some(stored) = self.objects.get_mut(&key) {
				stored.value = updated;
			}
		}
		reply
	}

	fn delete(&mut self, route: &Route<'_>, key: &ObjectKey) -> Reply {
		let Some(object) = self.objects.get_mut(key) else {
			return Reply::not_found(&qualified(route), &key.name);
		};

		if object.terminating.is_some() {
			return Reply::new(200, served(route, &object.value));
		}
		if self.deletion_delay == 0 {
			self.objects.remove(key);
			return Reply::deleted(route.plural, &key.name);
		}

		object.terminating = Some(self.deletion_delay);
		object.value["metadata"]["deletionTimestamp"] = json!(CREATION_TIMESTAMP);
		Reply::new(200, served(route, &object.value))
	}

	fn stamp_new(&mut self, object: &mut Value) {
		let uid = format!("00000000-0000-0000-0000-{:012}", self.next_uid);
		self.next_uid += 1;
		let resource_version = self.bump_resource_version();

		let metadata = &mut object["metadata"];
		metadata["uid"] = json!(uid);
		metadata["resourceVersion"] = json!(resource_version);
		metadata["generation"] = json!(1);
		metadata["creationTimestamp"] = json!(CREATION_TIMESTAMP);
		if let Some(metadata) = metadata.as_object_mut() {
			metadata.remove("deletionTimestamp");
		}
	}

	/// Store a freshly written object and start its rollout.
	fn insert(&mut self, key: ObjectKey, mut value: Value) {
		let rollout_reads = match self.rollout {
			RolloutMode::Converged => {
				apply_workload_status(&mut value, true);
				0
			}
			RolloutMode::Stalled => {
				apply_workload_status(&mut value, false);
				0
			}
			RolloutMode::AfterReads(0) => {
				apply_workload_status(&mut value, true);
				0
			}
			RolloutMode::AfterReads(reads) => {
				apply_workload_status(&mut value, false);
				reads
			}
		};
		self.objects.insert(
			key,
			StoredObject {
				value,
				terminating: None,
				rollout_reads,
			},
		);
	}

	fn bump_resource_version(&mut self) -> String {
		let rv = self.next_resource_version;
		self.next_resource_version += 1;
		rv.to_string()
	}
}

fn qualified(route: &Route<'_>) -> String {
	if route.group.is_empty() {
		route.plural.to_string()
	} else {
		format!("{}.{}", route.plural, route.group)
	}
}

fn conflict(route: &Route<'_>, name: &str) -> Reply {
	Reply::status(
		409,
		"Conflict",
		&format!(
			"Operation cannot be fulfilled on {} \"{name}\": the object has been modified; please apply your changes to the latest version and try again",
			qualified(route)
		),
	)
}

/// Copy of `value` as served under the route's group version.
fn served(route: &Route<'_>, value: &Value) -> Value {
	let mut value = value.clone();
	value["apiVersion"] = if route.group.is_empty() {
		json!(route.version)
	} else {
		json!(format!("{}/{}", route.group, route.version))
	};
	value
}

/// Fill in the status a workload controller would report.
fn apply_workload_status(object: &mut Value, converged: bool) {
	let kind = object.get("kind").and_then(Value::as_str).unwrap_or_default();
	let name = object.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default();
	let generation = object.pointer("/metadata/generation").and_then(Value::as_i64).unwrap_or(1);
	let replicas = object.pointer("/spec/replicas").and_then(Value::as_i64).unwrap_or(1);
	let ready = if converged { replicas } else { 0 };
	let revision = format!("{name}-{generation}");

	let status = match kind {
		"Deployment" => json!({
			"observedGeneration": generation,
			"replicas": replicas,
			"updatedReplicas": replicas,
			"readyReplicas": ready,
			"availableReplicas": ready,
			"unavailableReplicas": replicas - ready
		}),
		"StatefulSet" => json!({
			"observedGeneration": generation,
			"replicas": replicas,
			"readyReplicas": ready,
			"currentRevision": if converged { revision.clone() } else { format!("{name}-0") },
			"updateRevision": revision
		}),
		"DaemonSet" => json!({
			"observedGeneration": generation,
			"desiredNumberScheduled": 1,
			"currentNumberScheduled": 1,
			"updatedNumberScheduled": 1,
			"numberReady": i64::from(converged),
			"numberAvailable": i64::from(converged)
		}),
		_ => return,
	};
	object["status"] = status;
}
