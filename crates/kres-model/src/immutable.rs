//! Fields the API server refuses to change after creation.
//!
//! Keyed by kind. Paths are dotted field paths relative to the object root.

use phf::phf_map;

use crate::diff::FieldPath;

static IMMUTABLE_FIELDS: phf::Map<&'static str, &'static [&'static str]> = phf_map! {
	"Deployment" => &["spec.selector"],
	"DaemonSet" => &["spec.selector"],
	"ReplicaSet" => &["spec.selector"],
	"StatefulSet" => &[
		"spec.selector",
		"spec.volumeClaimTemplates",
		"spec.serviceName",
		"spec.podManagementPolicy",
	],
	"Job" => &["spec.selector", "spec.template"],
	"Service" => &["spec.clusterIP"],
	"PersistentVolumeClaim" => &["spec.storageClassName", "spec.volumeName"],
	"StorageClass" => &["provisioner", "parameters", "reclaimPolicy", "volumeBindingMode"],
	"Secret" => &["type"],
	"RoleBinding" => &["roleRef"],
	"ClusterRoleBinding" => &["roleRef"],
};

/// Immutable field paths for a kind, empty when the kind has none.
pub fn fields_for(kind: &str) -> &'static [&'static str] {
	IMMUTABLE_FIELDS.get(kind).copied().unwrap_or_default()
}

/// First immutable field of `kind` that overlaps `changed`.
///
/// A change overlaps when either path is a prefix of the other, so both a
/// change to `spec.selector.matchLabels.app` and a replacement of all of
/// `spec` hit `spec.selector`.
pub fn touched_by(kind: &str, changed: &FieldPath) -> Option<&'static str> {
	fields_for(kind).iter().copied().find(|field| {
		let field: Vec<&str> = field.split('.').collect();
		let common = field.len().min(changed.len());
		field[..common]
			.iter()
			.zip(&changed.segments()[..common])
			.all(|(a, b)| *a == b.as_str())
	})
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	#[rstest]
	#[case::selector_leaf("Deployment", "spec.selector.matchLabels.app", Some("spec.selector"))]
	#[case::whole_spec("StatefulSet", "spec", Some("spec.selector"))]
	#[case::replicas("Deployment", "spec.replicas", None)]
	#[case::role_ref("RoleBinding", "roleRef.name", Some("roleRef"))]
	#[case::provisioner("StorageClass", "provisioner", Some("provisioner"))]
	#[case::annotation("Deployment", "metadata.annotations.note", None)]
	#[case::unknown_kind("ConfigMap", "data.key", None)]
	#[case::similar_prefix("Secret", "typeMeta", None)]
	fn test_touched_by(#[case] kind: &str, #[case] path: &str, #[case] expected: Option<&str>) {
		let path = FieldPath::from_dotted(path);
		assert_eq!(touched_by(kind, &path), expected);
	}
}
