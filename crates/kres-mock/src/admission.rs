//! Validation the mock applies to writes, mimicking API server admission.

use serde_json::Value;

/// A field the server refuses to change once the object exists.
#[derive(Debug, Clone)]
pub struct ImmutableField {
	pub kind: String,
	/// Dotted path, e.g. `spec.selector`.
	pub path: String,
}

impl ImmutableField {
	pub fn new(kind: &str, path: &str) -> Self {
		Self {
			kind: kind.to_string(),
			path: path.to_string(),
		}
	}
}

const BUILTIN_IMMUTABLE: &[(&str, &str)] = &[
	("Deployment", "spec.selector"),
	("DaemonSet", "spec.selector"),
	("StatefulSet", "spec.selector"),
	("StatefulSet", "spec.volumeClaimTemplates"),
	("RoleBinding", "roleRef"),
	("ClusterRoleBinding", "roleRef"),
	("StorageClass", "provisioner"),
	("StorageClass", "parameters"),
];

/// Message of a rejected write, served as 422 Invalid.
pub type Rejection = String;

/// `Kind.group`, or just `Kind` for the core group.
pub fn qualified_kind(kind: &str, group: &str) -> String {
	if group.is_empty() {
		kind.to_string()
	} else {
		format!("{kind}.{group}")
	}
}

/// Validate an object on create and update.
pub fn validate(group: &str, object: &Value) -> Result<(), Rejection> {
	let kind = object.get("kind").and_then(Value::as_str).unwrap_or_default();
	let name = object.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default();

	let supported: &[&str] = match kind {
		"ClusterRoleBinding" => &["ClusterRole"],
		"RoleBinding" => &["Role", "ClusterRole"],
		_ => return Ok(()),
	};
	let role_kind = object.pointer("/roleRef/kind").and_then(Value::as_str).unwrap_or_default();
	if supported.contains(&role_kind) {
		return Ok(());
	}

	let supported = supported
		.iter()
		.map(|s| format!("\"{s}\""))
		.collect::<Vec<_>>()
		.join(", ");
	Err(format!(
		"{} \"{name}\" is invalid: roleRef.kind: Unsupported value: \"{role_kind}\": supported values: {supported}",
		qualified_kind(kind, group)
	))
}

/// Reject updates that change an immutable field.
pub fn check_immutable(
	group: &str,
	old: &Value,
	new: &Value,
	extra: &[ImmutableField],
) -> Result<(), Rejection> {
	let kind = new.get("kind").and_then(Value::as_str).unwrap_or_default();
	let name = new.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default();

	let builtin = BUILTIN_IMMUTABLE
		.iter()
		.filter(|(k, _)| *k == kind)
		.map(|(_, path)| *path);
	let configured = extra.iter().filter(|f| f.kind == kind).map(|f| f.path.as_str());

	for path in builtin.chain(configured) {
		let pointer = format!("/{}", path.replace('.', "/"));
		let before = old.pointer(&pointer);
		let after = new.pointer(&pointer);
		if before != after {
			let shown = after.map_or_else(|| "null".to_string(), Value::to_string);
			return Err(format!(
				"{} \"{name}\" is invalid: {path}: Invalid value: {shown}: field is immutable",
				qualified_kind(kind, group)
			));
		}
	}
	Ok(())
}
