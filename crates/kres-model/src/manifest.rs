//! Decoded Kubernetes objects.
//!
//! A [`Manifest`] wraps one unstructured object and exposes its identity
//! through typed accessors. Construction fails unless the object is a mapping
//! carrying `apiVersion`, `kind` and `metadata.name`, so every `Manifest` has
//! a valid [`ResourceId`].

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::{id::ResourceId, ResourceScope};

/// Annotation holding the canonical JSON of the last applied configuration.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Metadata fields populated by the API server.
pub const SERVER_METADATA_FIELDS: &[&str] = &[
	"uid",
	"resourceVersion",
	"generation",
	"creationTimestamp",
	"deletionTimestamp",
	"deletionGracePeriodSeconds",
	"managedFields",
	"selfLink",
];

#[derive(Debug, Error)]
pub enum ManifestError {
	#[error("decoding manifest")]
	Decode(#[source] serde_yaml::Error),

	#[error("manifest is not a mapping")]
	NotAMapping,

	#[error("manifest missing apiVersion or kind")]
	MissingApiVersionOrKind,

	#[error("manifest missing metadata.name")]
	MissingName,

	#[error("{id}: is not namespace scoped but has metadata.namespace set")]
	NamespaceNotAllowed { id: ResourceId },

	#[error("{id}: is namespace scoped and must set metadata.namespace")]
	NamespaceRequired { id: ResourceId },

	#[error("{path}: accessor error: {found} is not a map")]
	NotAMap { path: String, found: &'static str },
}

/// One decoded Kubernetes object.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
	object: Value,
	id: ResourceId,
}

impl Manifest {
	/// Decode a JSON or YAML document.
	pub fn load(bytes: &[u8]) -> Result<Self, ManifestError> {
		let value = match serde_json::from_slice::<Value>(bytes) {
			Ok(value) => value,
			Err(_) => serde_yaml::from_slice::<Value>(bytes).map_err(ManifestError::Decode)?,
		};
		Self::from_value(value)
	}

	/// Wrap an already-decoded object.
	pub fn from_value(object: Value) -> Result<Self, ManifestError> {
		let Value::Object(ref map) = object else {
			return Err(ManifestError::NotAMapping);
		};

		let api_version = map.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
		let kind = map.get("kind").and_then(Value::as_str).unwrap_or_default();
		if api_version.is_empty() || kind.is_empty() {
			return Err(ManifestError::MissingApiVersionOrKind);
		}

		let metadata = map.get("metadata");
		let name = metadata
			.and_then(|m| m.get("name"))
			.and_then(Value::as_str)
			.unwrap_or_default();
		let namespace = metadata
			.and_then(|m| m.get("namespace"))
			.and_then(Value::as_str)
			.unwrap_or_default();

		let (group, _) = split_api_version(api_version);
		let id = ResourceId::new(group, kind, namespace, name)
			.map_err(|_| ManifestError::MissingName)?;

		Ok(Self { object, id })
	}

	pub fn id(&self) -> &ResourceId {
		&self.id
	}

	pub fn api_version(&self) -> &str {
		self.object
			.get("apiVersion")
			.and_then(Value::as_str)
			.unwrap_or_default()
	}

	/// API group, empty for the core group.
	pub fn group(&self) -> &str {
		split_api_version(self.api_version()).0
	}

	pub fn version(&self) -> &str {
		split_api_version(self.api_version()).1
	}

	pub fn kind(&self) -> &str {
		self.id.kind()
	}

	pub fn name(&self) -> &str {
		self.id.name()
	}

	pub fn namespace(&self) -> Option<&str> {
		self.id.namespace()
	}

	pub fn resource_version(&self) -> Option<&str> {
		self.object
			.pointer("/metadata/resourceVersion")
			.and_then(Value::as_str)
	}

	pub fn generation(&self) -> Option<i64> {
		self.object.pointer("/metadata/generation").and_then(Value::as_i64)
	}

	pub fn annotation(&self, key: &str) -> Option<&str> {
		self.object
			.get("metadata")
			.and_then(|m| m.get("annotations"))
			.and_then(|a| a.get(key))
			.and_then(Value::as_str)
	}

	/// Check the namespace against the scope reported by API discovery.
	pub fn validate(&self, scope: ResourceScope) -> Result<(), ManifestError> {
		match (scope, self.namespace()) {
			(ResourceScope::ClusterWide, Some(_)) => Err(ManifestError::NamespaceNotAllowed {
				id: self.id.clone(),
			}),
			(ResourceScope::Namespaced, None) => Err(ManifestError::NamespaceRequired {
				id: self.id.clone(),
			}),
			_ => Ok(()),
		}
	}

	/// Look up a nested field.
	///
	/// A missing key yields `Ok(None)`; an intermediate value that is not a
	/// mapping is an error.
	pub fn field(&self, path: &[&str]) -> Result<Option<&Value>, ManifestError> {
		extract_field(&self.object, path)
	}

	pub fn as_value(&self) -> &Value {
		&self.object
	}

	pub fn into_value(self) -> Value {
		self.object
	}

	/// Object with every mapping's keys in sorted order.
	pub fn canonical(&self) -> Value {
		canonicalize(&self.object)
	}

	/// Compact JSON of [`Self::canonical`].
	pub fn to_canonical_json(&self) -> String {
		self.canonical().to_string()
	}

	/// Copy without `status` and server-populated metadata.
	pub fn stripped(&self) -> Self {
		let mut object = self.object.clone();
		if let Value::Object(ref mut map) = object {
			map.remove("status");
			if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
				for field in SERVER_METADATA_FIELDS {
					metadata.remove(*field);
				}
				if let Some(Value::Object(annotations)) = metadata.get_mut("annotations") {
					annotations.remove(LAST_APPLIED_ANNOTATION);
					if annotations.is_empty() {
						metadata.remove("annotations");
					}
				}
			}
		}
		Self {
			object,
			id: self.id.clone(),
		}
	}

	/// Copy with the last-applied annotation set to this manifest's canonical JSON.
	pub fn with_last_applied(&self) -> Self {
		let last_applied = self.stripped().to_canonical_json();
		let mut object = self.object.clone();
		if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
			let annotations = metadata
				.entry("annotations")
				.or_insert_with(|| Value::Object(Map::new()));
			if !annotations.is_object() {
				*annotations = Value::Object(Map::new());
			}
			if let Value::Object(annotations) = annotations {
				annotations.insert(LAST_APPLIED_ANNOTATION.to_string(), Value::String(last_applied));
			}
		}
		Self {
			object,
			id: self.id.clone(),
		}
	}

	/// Decode the last-applied annotation, if present and well formed.
	pub fn last_applied(&self) -> Option<Self> {
		let raw = self.annotation(LAST_APPLIED_ANNOTATION)?;
		let value = serde_json::from_str(raw).ok()?;
		Self::from_value(value).ok()
	}

	/// Copy with `metadata.resourceVersion` replaced.
	pub fn with_resource_version(&self, resource_version: Option<&str>) -> Self {
		let mut object = self.object.clone();
		if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
			match resource_version {
				Some(rv) => {
					metadata.insert("resourceVersion".to_string(), Value::String(rv.to_string()));
				}
				None => {
					metadata.remove("resourceVersion");
				}
			}
		}
		Self {
			object,
			id: self.id.clone(),
		}
	}
}

/// Split `group/version`; the core group has no slash.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
	api_version.split_once('/').unwrap_or(("", api_version))
}

/// Nested lookup shared by manifests and raw snapshots.
pub fn extract_field<'a>(object: &'a Value, path: &[&str]) -> Result<Option<&'a Value>, ManifestError> {
	let mut current = object;
	for (depth, segment) in path.iter().enumerate() {
		let Value::Object(map) = current else {
			return Err(ManifestError::NotAMap {
				path: path[..depth].join("."),
				found: type_name(current),
			});
		};
		match map.get(*segment) {
			Some(next) => current = next,
			None => return Ok(None),
		}
	}
	Ok(Some(current))
}

fn canonicalize(value: &Value) -> Value {
	match value {
		Value::Object(map) => {
			let sorted: BTreeMap<&String, Value> = map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
			Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
		}
		Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
		other => other.clone(),
	}
}

pub(crate) fn type_name(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "bool",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "map",
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use indoc::indoc;
	use rstest::rstest;
	use serde_json::json;

	use super::*;

	fn deployment() -> Manifest {
		Manifest::from_value(json!({
			"apiVersion": "apps/v1",
			"kind": "Deployment",
			"metadata": { "name": "test", "namespace": "test-basic" },
			"spec": { "replicas": 2, "selector": { "matchLabels": { "app": "test" } } }
		}))
		.unwrap()
	}

	#[test]
	fn test_load_yaml() {
		let manifest = Manifest::load(
			indoc! {"
				apiVersion: rbac.authorization.k8s.io/v1
				kind: ClusterRoleBinding
				metadata:
				  name: invalid
				roleRef:
				  apiGroup: rbac.authorization.k8s.io
				  kind: Role
				  name: invalid
			"}
			.as_bytes(),
		)
		.unwrap();

		assert_eq!(manifest.group(), "rbac.authorization.k8s.io");
		assert_eq!(manifest.version(), "v1");
		assert_eq!(manifest.kind(), "ClusterRoleBinding");
		assert_eq!(manifest.namespace(), None);
		assert_eq!(
			manifest.id().to_string(),
			"rbac.authorization.k8s.io/ClusterRoleBinding/_/invalid"
		);
	}

	#[test]
	fn test_load_json_core_group() {
		let manifest = Manifest::load(
			br#"{"apiVersion":"v1","kind":"Service","metadata":{"name":"test","namespace":"test-basic"}}"#,
		)
		.unwrap();
		assert_eq!(manifest.group(), "");
		assert_eq!(manifest.id().to_string(), "_/Service/test-basic/test");
	}

	#[rstest]
	#[case::garbage(b"{not: [valid".as_slice())]
	#[case::unclosed_flow(b"key: [unclosed".as_slice())]
	fn test_load_malformed(#[case] input: &[u8]) {
		assert_matches!(Manifest::load(input), Err(ManifestError::Decode(_)));
	}

	#[rstest]
	#[case::scalar(json!("string"))]
	#[case::array(json!([1, 2]))]
	fn test_not_a_mapping(#[case] value: Value) {
		assert_matches!(Manifest::from_value(value), Err(ManifestError::NotAMapping));
	}

	#[rstest]
	#[case::missing_kind(json!({ "apiVersion": "v1", "metadata": { "name": "x" } }))]
	#[case::missing_api_version(json!({ "kind": "ConfigMap", "metadata": { "name": "x" } }))]
	fn test_missing_type(#[case] value: Value) {
		assert_matches!(
			Manifest::from_value(value),
			Err(ManifestError::MissingApiVersionOrKind)
		);
	}

	#[test]
	fn test_missing_name() {
		let value = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": {} });
		assert_matches!(Manifest::from_value(value), Err(ManifestError::MissingName));
	}

	#[test]
	fn test_validate_namespace_not_allowed() {
		let manifest = Manifest::from_value(json!({
			"apiVersion": "rbac.authorization.k8s.io/v1",
			"kind": "ClusterRoleBinding",
			"metadata": { "name": "invalid", "namespace": "default" }
		}))
		.unwrap();

		let err = manifest.validate(ResourceScope::ClusterWide).unwrap_err();
		assert_eq!(
			err.to_string(),
			"rbac.authorization.k8s.io/ClusterRoleBinding/default/invalid: is not namespace scoped but has metadata.namespace set"
		);
	}

	#[test]
	fn test_validate_namespace_required() {
		let manifest = Manifest::from_value(json!({
			"apiVersion": "apps/v1",
			"kind": "Deployment",
			"metadata": { "name": "example" }
		}))
		.unwrap();

		let err = manifest.validate(ResourceScope::Namespaced).unwrap_err();
		assert_eq!(
			err.to_string(),
			"apps/Deployment/_/example: is namespace scoped and must set metadata.namespace"
		);
		assert!(deployment().validate(ResourceScope::Namespaced).is_ok());
	}

	#[test]
	fn test_field_lookup() {
		let manifest = deployment();
		assert_eq!(manifest.field(&["spec", "replicas"]).unwrap(), Some(&json!(2)));
		assert_eq!(manifest.field(&["spec", "template"]).unwrap(), None);
		assert_matches!(
			manifest.field(&["spec", "replicas", "value"]),
			Err(ManifestError::NotAMap { path, found: "number" }) if path == "spec.replicas"
		);
	}

	#[test]
	fn test_canonical_sorts_keys() {
		let manifest = Manifest::from_value(json!({
			"kind": "ConfigMap",
			"apiVersion": "v1",
			"metadata": { "namespace": "ns", "name": "x" },
			"data": { "b": "2", "a": "1" }
		}))
		.unwrap();

		assert_eq!(
			manifest.to_canonical_json(),
			r#"{"apiVersion":"v1","data":{"a":"1","b":"2"},"kind":"ConfigMap","metadata":{"name":"x","namespace":"ns"}}"#
		);
	}

	#[test]
	fn test_last_applied_annotation() {
		let stamped = deployment().with_last_applied();
		let restored = stamped.last_applied().unwrap();
		assert_eq!(restored.canonical(), deployment().canonical());
		assert_eq!(stamped.stripped().canonical(), deployment().canonical());
	}

	#[test]
	fn test_stripped_removes_server_fields() {
		let live = Manifest::from_value(json!({
			"apiVersion": "v1",
			"kind": "Namespace",
			"metadata": {
				"name": "test",
				"uid": "abc",
				"resourceVersion": "12",
				"creationTimestamp": "2024-01-01T00:00:00Z",
				"labels": { "a": "b" }
			},
			"status": { "phase": "Active" }
		}))
		.unwrap();

		assert_eq!(
			live.stripped().into_value(),
			json!({
				"apiVersion": "v1",
				"kind": "Namespace",
				"metadata": { "name": "test", "labels": { "a": "b" } }
			})
		);
	}
}
