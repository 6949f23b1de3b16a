//! Helper functions for mock Kubernetes testing.

use serde_json::{json, Map, Value};

/// Apply a JSON merge patch (RFC 7386) to `base`.
///
/// Objects merge recursively, `null` removes a key, everything else replaces.
pub fn merge_json(base: Value, patch: Value) -> Value {
	match (base, patch) {
		(Value::Object(mut base_map), Value::Object(patch_map)) => {
			for (key, patch_value) in patch_map {
				if patch_value.is_null() {
					base_map.remove(&key);
					continue;
				}
				let base_value = base_map.remove(&key).unwrap_or(Value::Null);
				base_map.insert(key, merge_json(base_value, patch_value));
			}
			Value::Object(base_map)
		}
		(_, Value::Object(patch_map)) => merge_json(Value::Object(Map::new()), Value::Object(patch_map)),
		(_, patch) => patch,
	}
}

/// Response code and JSON body.
pub struct Reply {
	pub code: u16,
	pub body: Value,
}

impl Reply {
	pub fn new(code: u16, body: Value) -> Self {
		Self { code, body }
	}

	/// A `Status` failure, as returned by the API server.
	pub fn status(code: u16, reason: &str, message: &str) -> Self {
		Self::new(
			code,
			json!({
				"kind": "Status",
				"apiVersion": "v1",
				"metadata": {},
				"status": "Failure",
				"message": message,
				"reason": reason,
				"code": code
			}),
		)
	}

	pub fn not_found(resource: &str, name: &str) -> Self {
		Self::status(404, "NotFound", &format!("{resource} \"{name}\" not found"))
	}

	pub fn deleted(resource: &str, name: &str) -> Self {
		Self::new(
			200,
			json!({
				"kind": "Status",
				"apiVersion": "v1",
				"metadata": {},
				"status": "Success",
				"details": { "name": name, "kind": resource }
			}),
		)
	}
}

/// Object with `metadata` and `status` removed, used to detect spec changes.
pub fn without_metadata_and_status(value: &Value) -> Value {
	let mut value = value.clone();
	if let Value::Object(ref mut map) = value {
		map.remove("metadata");
		map.remove("status");
	}
	value
}
