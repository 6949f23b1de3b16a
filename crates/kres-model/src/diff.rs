//! Change classification.
//!
//! Compares the desired manifest against a base snapshot (the live object, or
//! the last-applied state when the live object could not be fetched) and
//! decides which operation brings the cluster in line. Only managed fields
//! take part: leaves present in the desired manifest, and leaves that were
//! applied last time but have since been dropped from it. Lists of equal
//! length are walked item by item, so fields the API server defaults inside
//! list items are never managed; a length change replaces the whole list.

use std::fmt;

use serde_json::{Map, Value};

use crate::{id::ResourceId, immutable, manifest::Manifest};

/// Operation needed to move from the observed state to the desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
	NoOp,
	UpdateInPlace,
	Recreate,
	Create,
	Delete,
}

impl fmt::Display for ChangeKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::NoOp => "no-op",
			Self::UpdateInPlace => "update in-place",
			Self::Recreate => "recreate",
			Self::Create => "create",
			Self::Delete => "delete",
		})
	}
}

/// What is known about the object in the cluster.
#[derive(Debug, Clone, Copy)]
pub enum Observed<'a> {
	/// The object does not exist.
	Absent,
	/// The object was fetched.
	Live(&'a Manifest),
	/// The object was not fetched; fall back to last-applied state.
	Unfetched,
}

/// Dotted path to a field, e.g. `spec.selector.matchLabels`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
	segments: Vec<String>,
}

impl FieldPath {
	pub fn root() -> Self {
		Self { segments: Vec::new() }
	}

	pub fn from_dotted(path: &str) -> Self {
		Self {
			segments: path.split('.').map(str::to_string).collect(),
		}
	}

	#[must_use]
	pub fn child(&self, segment: &str) -> Self {
		let mut segments = self.segments.clone();
		segments.push(segment.to_string());
		Self { segments }
	}

	pub fn segments(&self) -> &[String] {
		&self.segments
	}

	pub fn len(&self) -> usize {
		self.segments.len()
	}

	pub fn is_empty(&self) -> bool {
		self.segments.is_empty()
	}

	/// RFC 6901 pointer form, e.g. `/spec/selector`.
	pub fn to_pointer(&self) -> String {
		self.segments
			.iter()
			.map(|s| format!("/{}", s.replace('~', "~0").replace('/', "~1")))
			.collect()
	}
}

impl fmt::Display for FieldPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.segments.join("."))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
	/// Desired value differs from the base.
	Set,
	/// Field was applied last time, is gone from the desired manifest, and
	/// still present in the base.
	Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
	pub path: FieldPath,
	pub op: FieldOp,
}

/// Why a resource has to be destroyed and created again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecreateReason {
	IdChanged { from: ResourceId, to: ResourceId },
	ImmutableField { field: &'static str, path: FieldPath },
}

impl fmt::Display for RecreateReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::IdChanged { from, to } => write!(f, "identity changed from {from} to {to}"),
			Self::ImmutableField { field, path } => {
				write!(f, "{path} changed and {field} is immutable")
			}
		}
	}
}

/// Result of [`classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
	pub kind: ChangeKind,
	pub changes: Vec<FieldChange>,
	pub reason: Option<RecreateReason>,
}

impl Classification {
	fn bare(kind: ChangeKind) -> Self {
		Self {
			kind,
			changes: Vec::new(),
			reason: None,
		}
	}
}

/// Top-level fields owned by the API server.
const SERVER_OWNED_ROOTS: &[&str] = &["status"];

/// Decide which operation turns `observed` into `desired`.
///
/// `desired == None` is a deletion intent. `last_applied` is the state saved
/// after the previous successful apply.
pub fn classify(
	observed: Observed<'_>,
	desired: Option<&Manifest>,
	last_applied: Option<&Manifest>,
) -> Classification {
	let Some(desired) = desired else {
		return match observed {
			Observed::Absent => Classification::bare(ChangeKind::NoOp),
			Observed::Live(_) | Observed::Unfetched => Classification::bare(ChangeKind::Delete),
		};
	};

	let base = match observed {
		Observed::Absent => return Classification::bare(ChangeKind::Create),
		Observed::Live(live) => live,
		Observed::Unfetched => match last_applied {
			Some(last_applied) => last_applied,
			None => return Classification::bare(ChangeKind::Create),
		},
	};

	let previous = last_applied.unwrap_or(base);
	if previous.id() != desired.id() {
		return Classification {
			kind: ChangeKind::Recreate,
			changes: Vec::new(),
			reason: Some(RecreateReason::IdChanged {
				from: previous.id().clone(),
				to: desired.id().clone(),
			}),
		};
	}

	let changes = managed_changes(base, desired, last_applied);

	let immutable_hit = changes.iter().find_map(|change| {
		immutable::touched_by(desired.kind(), &change.path).map(|field| {
			RecreateReason::ImmutableField {
				field,
				path: change.path.clone(),
			}
		})
	});

	let kind = if immutable_hit.is_some() {
		ChangeKind::Recreate
	} else if changes.is_empty() {
		ChangeKind::NoOp
	} else {
		ChangeKind::UpdateInPlace
	};

	Classification {
		kind,
		changes,
		reason: immutable_hit,
	}
}

/// Field-level differences between `base` and `desired`, restricted to
/// managed fields.
pub fn managed_changes(
	base: &Manifest,
	desired: &Manifest,
	last_applied: Option<&Manifest>,
) -> Vec<FieldChange> {
	let mut changes = Vec::new();
	let desired_root = strip_server_owned(desired.as_value());
	let base_root = base.as_value();

	collect_set(&FieldPath::root(), &desired_root, Some(base_root), &mut changes);
	if let Some(last_applied) = last_applied {
		let last_root = strip_server_owned(last_applied.as_value());
		collect_cleared(
			&FieldPath::root(),
			&last_root,
			&desired_root,
			Some(base_root),
			&mut changes,
		);
	}

	changes
}

fn strip_server_owned(value: &Value) -> Value {
	let mut value = value.clone();
	if let Value::Object(ref mut map) = value {
		for root in SERVER_OWNED_ROOTS {
			map.remove(*root);
		}
		if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
			for field in crate::manifest::SERVER_METADATA_FIELDS {
				metadata.remove(*field);
			}
			if let Some(Value::Object(annotations)) = metadata.get_mut("annotations") {
				annotations.remove(crate::manifest::LAST_APPLIED_ANNOTATION);
			}
		}
	}
	value
}

fn collect_set(path: &FieldPath, desired: &Value, base: Option<&Value>, out: &mut Vec<FieldChange>) {
	match desired {
		// an empty desired map only matters when the base has no map there
		Value::Object(map) if !map.is_empty() || base.is_some_and(Value::is_object) => {
			for (key, value) in map {
				collect_set(&path.child(key), value, base.and_then(|b| b.get(key)), out);
			}
		}
		// items are compared by index so server defaults inside them stay unmanaged
		Value::Array(items) if base.and_then(Value::as_array).is_some_and(|b| b.len() == items.len()) => {
			let base_items = base.and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();
			for (index, (item, base_item)) in items.iter().zip(base_items).enumerate() {
				collect_set(&path.child(&index.to_string()), item, Some(base_item), out);
			}
		}
		leaf => {
			if base != Some(leaf) {
				out.push(FieldChange {
					path: path.clone(),
					op: FieldOp::Set,
				});
			}
		}
	}
}

fn collect_cleared(
	path: &FieldPath,
	last: &Value,
	desired: &Value,
	base: Option<&Value>,
	out: &mut Vec<FieldChange>,
) {
	match (last, desired) {
		(Value::Object(last_map), Value::Object(desired_map)) => {
			for (key, last_value) in last_map {
				let base_value = base.and_then(|b| b.get(key));
				match desired_map.get(key) {
					None => {
						if base_value.is_some_and(|v| !v.is_null()) {
							out.push(FieldChange {
								path: path.child(key),
								op: FieldOp::Clear,
							});
						}
					}
					Some(desired_value) => {
						collect_cleared(&path.child(key), last_value, desired_value, base_value, out);
					}
				}
			}
		}
		(Value::Array(last_items), Value::Array(desired_items)) if last_items.len() == desired_items.len() => {
			let base_items = base.and_then(Value::as_array);
			for (index, (last_item, desired_item)) in last_items.iter().zip(desired_items).enumerate() {
				collect_cleared(
					&path.child(&index.to_string()),
					last_item,
					desired_item,
					base_items.and_then(|b| b.get(index)),
					out,
				);
			}
		}
		_ => {}
	}
}

/// Three-way JSON merge patch turning `live` into `desired`.
///
/// Fields that differ from `live` are set. Fields present in `last_applied`
/// but dropped from `desired` are nulled out, so only previously applied
/// fields are ever removed.
pub fn merge_patch(last_applied: Option<&Value>, desired: &Value, live: &Value) -> Value {
	let desired = strip_server_owned(desired);
	let last_applied = last_applied.map(strip_server_owned);
	Value::Object(merge_patch_map(
		last_applied.as_ref().and_then(Value::as_object),
		desired.as_object().unwrap_or(&Map::new()),
		live.as_object(),
	))
}

fn merge_patch_map(
	last_applied: Option<&Map<String, Value>>,
	desired: &Map<String, Value>,
	live: Option<&Map<String, Value>>,
) -> Map<String, Value> {
	let mut patch = Map::new();

	for (key, desired_value) in desired {
		let live_value = live.and_then(|l| l.get(key));
		match (desired_value, live_value) {
			(Value::Object(desired_map), Some(Value::Object(live_map))) => {
				let nested = merge_patch_map(
					last_applied.and_then(|l| l.get(key)).and_then(Value::as_object),
					desired_map,
					Some(live_map),
				);
				if !nested.is_empty() {
					patch.insert(key.clone(), Value::Object(nested));
				}
			}
			_ if live_value != Some(desired_value) => {
				patch.insert(key.clone(), desired_value.clone());
			}
			_ => {}
		}
	}

	if let Some(last_applied) = last_applied {
		for key in last_applied.keys() {
			if !desired.contains_key(key) && live.is_some_and(|l| l.contains_key(key)) {
				patch.insert(key.clone(), Value::Null);
			}
		}
	}

	patch
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use rstest::rstest;
	use serde_json::json;

	use super::*;

	fn manifest(value: Value) -> Manifest {
		Manifest::from_value(value).unwrap()
	}

	fn deployment(labels: Value, annotations: Value) -> Manifest {
		manifest(json!({
			"apiVersion": "apps/v1",
			"kind": "Deployment",
			"metadata": { "name": "test", "namespace": "test-basic", "annotations": annotations },
			"spec": {
				"replicas": 1,
				"selector": { "matchLabels": labels.clone() },
				"template": {
					"metadata": { "labels": labels },
					"spec": { "containers": [{ "name": "app", "image": "nginx" }] }
				}
			}
		}))
	}

	fn with_server_fields(m: &Manifest) -> Manifest {
		let mut value = m.as_value().clone();
		value["metadata"]["uid"] = json!("1234");
		value["metadata"]["resourceVersion"] = json!("7");
		value["metadata"]["generation"] = json!(1);
		value["metadata"]["labels"] = json!({ "injected-by": "webhook" });
		value["status"] = json!({ "replicas": 1 });
		manifest(value)
	}

	#[test]
	fn test_identical_is_noop() {
		let desired = deployment(json!({ "app": "test" }), json!({}));
		let live = with_server_fields(&desired);

		let result = classify(Observed::Live(&live), Some(&desired), Some(&desired));
		assert_eq!(result.kind, ChangeKind::NoOp);
		assert!(result.changes.is_empty());
	}

	#[test]
	fn test_absent_is_create() {
		let desired = deployment(json!({ "app": "test" }), json!({}));
		let result = classify(Observed::Absent, Some(&desired), None);
		assert_eq!(result.kind, ChangeKind::Create);
	}

	#[test]
	fn test_unfetched_without_state_is_create() {
		let desired = deployment(json!({ "app": "test" }), json!({}));
		let result = classify(Observed::Unfetched, Some(&desired), None);
		assert_eq!(result.kind, ChangeKind::Create);
	}

	#[test]
	fn test_deletion_intent() {
		let live = deployment(json!({ "app": "test" }), json!({}));
		assert_eq!(classify(Observed::Live(&live), None, None).kind, ChangeKind::Delete);
		assert_eq!(classify(Observed::Unfetched, None, Some(&live)).kind, ChangeKind::Delete);
		assert_eq!(classify(Observed::Absent, None, Some(&live)).kind, ChangeKind::NoOp);
	}

	#[test]
	fn test_annotation_added_is_update() {
		let before = deployment(json!({ "app": "test" }), json!({}));
		let after = deployment(json!({ "app": "test" }), json!({ "new": "annotation" }));
		let live = with_server_fields(&before);

		let result = classify(Observed::Live(&live), Some(&after), Some(&before));
		assert_eq!(result.kind, ChangeKind::UpdateInPlace);
		assert_eq!(
			result.changes,
			vec![FieldChange {
				path: FieldPath::from_dotted("metadata.annotations.new"),
				op: FieldOp::Set,
			}]
		);
	}

	#[test]
	fn test_annotation_removed_is_cleared() {
		let before = deployment(json!({ "app": "test" }), json!({ "old": "annotation" }));
		let after = deployment(json!({ "app": "test" }), json!({}));
		let live = with_server_fields(&before);

		let result = classify(Observed::Live(&live), Some(&after), Some(&before));
		assert_eq!(result.kind, ChangeKind::UpdateInPlace);
		assert_eq!(
			result.changes,
			vec![FieldChange {
				path: FieldPath::from_dotted("metadata.annotations.old"),
				op: FieldOp::Clear,
			}]
		);
	}

	#[test]
	fn test_unmanaged_live_fields_ignored() {
		// labels were added by someone else and never applied
		let desired = deployment(json!({ "app": "test" }), json!({}));
		let mut live = with_server_fields(&desired).into_value();
		live["metadata"]["labels"] = json!({ "foreign": "label" });
		let live = manifest(live);

		let result = classify(Observed::Live(&live), Some(&desired), Some(&desired));
		assert_eq!(result.kind, ChangeKind::NoOp);
	}

	#[rstest]
	#[case::deployment("Deployment")]
	#[case::statefulset("StatefulSet")]
	#[case::daemonset("DaemonSet")]
	fn test_selector_change_is_recreate(#[case] kind: &str) {
		let build = |app: &str| {
			manifest(json!({
				"apiVersion": "apps/v1",
				"kind": kind,
				"metadata": { "name": "test", "namespace": "test-basic" },
				"spec": { "selector": { "matchLabels": { "app": app } } }
			}))
		};
		let before = build("test");
		let after = build("changed");

		let result = classify(Observed::Live(&before), Some(&after), Some(&before));
		assert_eq!(result.kind, ChangeKind::Recreate);
		assert_matches!(
			result.reason,
			Some(RecreateReason::ImmutableField { field: "spec.selector", .. })
		);
	}

	#[test]
	fn test_role_ref_change_is_recreate() {
		let build = |role: &str| {
			manifest(json!({
				"apiVersion": "rbac.authorization.k8s.io/v1",
				"kind": "RoleBinding",
				"metadata": { "name": "test", "namespace": "test-basic" },
				"roleRef": { "apiGroup": "rbac.authorization.k8s.io", "kind": "Role", "name": role },
				"subjects": [{ "kind": "ServiceAccount", "name": "default", "namespace": "test-basic" }]
			}))
		};
		let before = build("reader");
		let after = build("writer");

		let result = classify(Observed::Unfetched, Some(&after), Some(&before));
		assert_eq!(result.kind, ChangeKind::Recreate);
		assert_matches!(
			result.reason,
			Some(RecreateReason::ImmutableField { field: "roleRef", .. })
		);
	}

	#[rstest]
	#[case::name(json!({ "name": "renamed", "namespace": "test-basic" }))]
	#[case::namespace(json!({ "name": "test", "namespace": "moved" }))]
	fn test_id_change_is_recreate(#[case] metadata: Value) {
		let before = manifest(json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
			"metadata": { "name": "test", "namespace": "test-basic" },
			"data": { "a": "1" }
		}));
		let after = manifest(json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
			"metadata": metadata,
			"data": { "a": "1" }
		}));

		let result = classify(Observed::Live(&before), Some(&after), Some(&before));
		assert_eq!(result.kind, ChangeKind::Recreate);
		assert_matches!(result.reason, Some(RecreateReason::IdChanged { .. }));
	}

	#[test]
	fn test_api_version_upgrade_is_update() {
		let build = |version: &str| {
			manifest(json!({
				"apiVersion": format!("test.example.com/{version}"),
				"kind": "Clustered",
				"metadata": { "name": "test" }
			}))
		};
		let before = build("v1alpha1");
		let after = build("v1beta1");

		let result = classify(Observed::Unfetched, Some(&after), Some(&before));
		assert_eq!(result.kind, ChangeKind::UpdateInPlace);
		assert_eq!(result.changes[0].path, FieldPath::from_dotted("apiVersion"));
	}

	#[test]
	fn test_replicas_change_is_update() {
		let before = deployment(json!({ "app": "test" }), json!({}));
		let mut after = before.as_value().clone();
		after["spec"]["replicas"] = json!(3);
		let after = manifest(after);

		let result = classify(Observed::Live(&before), Some(&after), Some(&before));
		assert_eq!(result.kind, ChangeKind::UpdateInPlace);
		assert_eq!(result.reason, None);
	}

	fn stateful_set(image: &str) -> Manifest {
		manifest(json!({
			"apiVersion": "apps/v1",
			"kind": "StatefulSet",
			"metadata": { "name": "db", "namespace": "test-basic" },
			"spec": {
				"serviceName": "db",
				"selector": { "matchLabels": { "app": "db" } },
				"template": {
					"metadata": { "labels": { "app": "db" } },
					"spec": { "containers": [{ "name": "db", "image": image }] }
				},
				"volumeClaimTemplates": [{
					"metadata": { "name": "data" },
					"spec": {
						"accessModes": ["ReadWriteOnce"],
						"resources": { "requests": { "storage": "1Gi" } }
					}
				}]
			}
		}))
	}

	/// `stateful_set` as the API server returns it, with defaults filled in.
	fn defaulted_stateful_set(image: &str) -> Manifest {
		let mut value = with_server_fields(&stateful_set(image)).into_value();
		value["spec"]["template"]["spec"]["containers"][0]["imagePullPolicy"] = json!("IfNotPresent");
		value["spec"]["template"]["spec"]["containers"][0]["terminationMessagePath"] =
			json!("/dev/termination-log");
		let claim = &mut value["spec"]["volumeClaimTemplates"][0];
		claim["apiVersion"] = json!("v1");
		claim["kind"] = json!("PersistentVolumeClaim");
		claim["spec"]["volumeMode"] = json!("Filesystem");
		claim["status"] = json!({ "phase": "Pending" });
		manifest(value)
	}

	fn service(ports: Value) -> Manifest {
		manifest(json!({
			"apiVersion": "v1",
			"kind": "Service",
			"metadata": { "name": "web", "namespace": "test-basic" },
			"spec": { "selector": { "app": "web" }, "ports": ports }
		}))
	}

	#[test]
	fn test_defaulted_list_items_are_noop() {
		let desired = stateful_set("postgres:16");
		let live = defaulted_stateful_set("postgres:16");
		let result = classify(Observed::Live(&live), Some(&desired), Some(&desired));
		assert_eq!(result.kind, ChangeKind::NoOp, "{:?}", result.changes);

		let desired = service(json!([{ "name": "http", "port": 80 }]));
		let mut live = with_server_fields(&desired).into_value();
		live["spec"]["clusterIP"] = json!("10.0.0.12");
		live["spec"]["ports"] = json!([{ "name": "http", "port": 80, "protocol": "TCP", "targetPort": 80 }]);
		let live = manifest(live);
		let result = classify(Observed::Live(&live), Some(&desired), Some(&desired));
		assert_eq!(result.kind, ChangeKind::NoOp, "{:?}", result.changes);
	}

	#[test]
	fn test_list_item_change_is_reported_by_index() {
		let before = stateful_set("postgres:16");
		let after = stateful_set("postgres:17");
		let live = defaulted_stateful_set("postgres:16");

		let result = classify(Observed::Live(&live), Some(&after), Some(&before));
		assert_eq!(result.kind, ChangeKind::UpdateInPlace);
		assert_eq!(
			result.changes,
			vec![FieldChange {
				path: FieldPath::from_dotted("spec.template.spec.containers.0.image"),
				op: FieldOp::Set,
			}]
		);
	}

	#[test]
	fn test_list_length_change_replaces_list() {
		let before = service(json!([{ "name": "http", "port": 80 }]));
		let after = service(json!([{ "name": "http", "port": 80 }, { "name": "https", "port": 443 }]));
		let live = with_server_fields(&before);

		let result = classify(Observed::Live(&live), Some(&after), Some(&before));
		assert_eq!(result.kind, ChangeKind::UpdateInPlace);
		assert_eq!(result.changes[0].path, FieldPath::from_dotted("spec.ports"));
	}

	#[test]
	fn test_claim_template_change_is_recreate() {
		let before = stateful_set("postgres:16");
		let mut after = before.as_value().clone();
		after["spec"]["volumeClaimTemplates"][0]["spec"]["resources"]["requests"]["storage"] = json!("5Gi");
		let after = manifest(after);
		let live = defaulted_stateful_set("postgres:16");

		let result = classify(Observed::Live(&live), Some(&after), Some(&before));
		assert_eq!(result.kind, ChangeKind::Recreate);
		assert_matches!(
			result.reason,
			Some(RecreateReason::ImmutableField { field: "spec.volumeClaimTemplates", .. })
		);
	}

	#[test]
	fn test_field_dropped_from_list_item_is_cleared() {
		let before = service(json!([{ "name": "http", "port": 80, "targetPort": 8080 }]));
		let after = service(json!([{ "name": "http", "port": 80 }]));
		let live = with_server_fields(&before);

		let result = classify(Observed::Live(&live), Some(&after), Some(&before));
		assert_eq!(result.kind, ChangeKind::UpdateInPlace);
		assert_eq!(
			result.changes,
			vec![FieldChange {
				path: FieldPath::from_dotted("spec.ports.0.targetPort"),
				op: FieldOp::Clear,
			}]
		);
	}

	#[test]
	fn test_merge_patch_sets_and_clears() {
		let last = json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
			"metadata": { "name": "x", "annotations": { "old": "1" } },
			"data": { "a": "1", "b": "2" }
		});
		let desired = json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
			"metadata": { "name": "x" },
			"data": { "a": "changed", "c": "3" }
		});
		let live = json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
			"metadata": {
				"name": "x",
				"resourceVersion": "4",
				"annotations": { "old": "1" },
				"labels": { "foreign": "yes" }
			},
			"data": { "a": "1", "b": "2" }
		});

		let patch = merge_patch(Some(&last), &desired, &live);
		assert_eq!(
			patch,
			json!({
				"metadata": { "annotations": null },
				"data": { "a": "changed", "c": "3", "b": null }
			})
		);
	}

	#[test]
	fn test_merge_patch_without_last_applied_never_clears() {
		let desired = json!({ "data": { "a": "1" } });
		let live = json!({ "data": { "a": "1", "foreign": "x" } });
		assert_eq!(merge_patch(None, &desired, &live), json!({}));
	}
}
