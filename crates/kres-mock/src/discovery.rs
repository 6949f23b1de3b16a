//! Mock Kubernetes API discovery types.

/// Discovery mode for the mock server.
#[derive(Clone, Copy, Default)]
pub enum DiscoveryMode {
	/// Support aggregated discovery (APIGroupDiscoveryList).
	#[default]
	Aggregated,
	/// Return 406 for aggregated discovery, forcing fallback to legacy endpoints.
	Legacy,
}

/// Pre-configured discovery responses.
///
/// The core group is the group with an empty name. Within a group the first
/// version is the preferred one.
pub struct MockDiscovery {
	pub groups: Vec<MockApiGroup>,
}

/// An API group and its served versions.
pub struct MockApiGroup {
	pub name: String,
	pub versions: Vec<MockGroupVersion>,
}

pub struct MockGroupVersion {
	pub version: String,
	pub resources: Vec<MockApiResource>,
}

impl MockApiGroup {
	pub fn new(name: &str, versions: Vec<MockGroupVersion>) -> Self {
		Self {
			name: name.to_string(),
			versions,
		}
	}

	pub fn preferred_version(&self) -> Option<&str> {
		self.versions.first().map(|v| v.version.as_str())
	}
}

impl MockGroupVersion {
	pub fn new(version: &str, resources: Vec<MockApiResource>) -> Self {
		Self {
			version: version.to_string(),
			resources,
		}
	}
}

impl Default for MockDiscovery {
	fn default() -> Self {
		use MockApiResource as R;

		Self {
			groups: vec![
				MockApiGroup::new(
					"",
					vec![MockGroupVersion::new(
						"v1",
						vec![
							R::namespaced("configmaps", "ConfigMap"),
							R::namespaced("secrets", "Secret"),
							R::namespaced("services", "Service"),
							R::namespaced("serviceaccounts", "ServiceAccount"),
							R::namespaced("persistentvolumeclaims", "PersistentVolumeClaim"),
							R::namespaced("pods", "Pod"),
							R::cluster_scoped("namespaces", "Namespace"),
						],
					)],
				),
				MockApiGroup::new(
					"apps",
					vec![MockGroupVersion::new(
						"v1",
						vec![
							R::namespaced("deployments", "Deployment"),
							R::namespaced("statefulsets", "StatefulSet"),
							R::namespaced("daemonsets", "DaemonSet"),
							R::namespaced("replicasets", "ReplicaSet"),
						],
					)],
				),
				MockApiGroup::new(
					"batch",
					vec![MockGroupVersion::new("v1", vec![R::namespaced("jobs", "Job")])],
				),
				MockApiGroup::new(
					"rbac.authorization.k8s.io",
					vec![MockGroupVersion::new(
						"v1",
						vec![
							R::namespaced("roles", "Role"),
							R::namespaced("rolebindings", "RoleBinding"),
							R::cluster_scoped("clusterroles", "ClusterRole"),
							R::cluster_scoped("clusterrolebindings", "ClusterRoleBinding"),
						],
					)],
				),
				MockApiGroup::new(
					"storage.k8s.io",
					vec![MockGroupVersion::new(
						"v1",
						vec![R::cluster_scoped("storageclasses", "StorageClass")],
					)],
				),
				MockApiGroup::new(
					"apiextensions.k8s.io",
					vec![MockGroupVersion::new(
						"v1",
						vec![R::cluster_scoped("customresourcedefinitions", "CustomResourceDefinition")],
					)],
				),
				MockApiGroup::new(
					"test.example.com",
					vec![
						MockGroupVersion::new(
							"v1beta1",
							vec![
								R::cluster_scoped("clustereds", "Clustered"),
								R::namespaced("namespaceds", "Namespaced"),
							],
						),
						MockGroupVersion::new(
							"v1alpha1",
							vec![
								R::cluster_scoped("clustereds", "Clustered"),
								R::namespaced("namespaceds", "Namespaced"),
							],
						),
					],
				),
			],
		}
	}
}

impl MockDiscovery {
	/// Find a resource by group and kind in any served version.
	pub fn find_kind(&self, group: &str, kind: &str) -> Option<&MockApiResource> {
		self.group(group)?
			.versions
			.iter()
			.flat_map(|v| &v.resources)
			.find(|r| r.kind == kind)
	}

	/// Find a resource by group and plural name in any served version.
	pub fn find_plural(&self, group: &str, plural: &str) -> Option<&MockApiResource> {
		self.group(group)?
			.versions
			.iter()
			.flat_map(|v| &v.resources)
			.find(|r| r.name == plural)
	}

	pub fn group(&self, name: &str) -> Option<&MockApiGroup> {
		self.groups.iter().find(|g| g.name == name)
	}

	/// All non-core groups.
	pub fn named_groups(&self) -> impl Iterator<Item = &MockApiGroup> {
		self.groups.iter().filter(|g| !g.name.is_empty())
	}
}

/// A mock API resource definition.
pub struct MockApiResource {
	pub name: String,
	pub kind: String,
	pub namespaced: bool,
	pub verbs: Vec<String>,
}

impl MockApiResource {
	pub fn namespaced(name: &str, kind: &str) -> Self {
		Self::new(name, kind, true)
	}

	pub fn cluster_scoped(name: &str, kind: &str) -> Self {
		Self::new(name, kind, false)
	}

	fn new(name: &str, kind: &str, namespaced: bool) -> Self {
		Self {
			name: name.to_string(),
			kind: kind.to_string(),
			namespaced,
			verbs: ["create", "delete", "get", "list", "patch", "update", "watch"]
				.into_iter()
				.map(String::from)
				.collect(),
		}
	}
}
