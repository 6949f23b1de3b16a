//! HTTP-based mock Kubernetes server using wiremock.
//!
//! This provides a real HTTP server that can be used with actual kubeconfig-based
//! connections.

use std::sync::{Arc, Mutex, MutexGuard};

use bon::Builder;
use kres_model::ResourceId;
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use serde_json::{json, Value};
use tracing::debug;
use wiremock::{
	matchers::{header_regex, method, path, path_regex},
	Mock, MockServer, Request, ResponseTemplate,
};

use super::{
	admission::ImmutableField,
	discovery::{DiscoveryMode, MockApiResource, MockDiscovery},
	state::{JournalEntry, MockState, ObjectKey, RolloutMode},
};

/// Shared mutable server state.
pub type SharedState = Arc<Mutex<MockState>>;

/// A mock Kubernetes server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockK8sServer {
	#[builder(default)]
	discovery_mode: DiscoveryMode,
	/// Objects present before the first request. The server derives API
	/// paths from apiVersion/kind using the discovery data.
	#[builder(default)]
	resources: Vec<Value>,
	/// How workload status evolves after writes.
	#[builder(default)]
	rollout: RolloutMode,
	/// Number of reads a deleted object stays visible (with a deletionTimestamp).
	#[builder(default)]
	deletion_delay: u32,
	/// Fields rejected as immutable on update, in addition to the built-in ones.
	#[builder(default)]
	immutable_fields: Vec<ImmutableField>,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockK8sServer {
	server: MockServer,
	state: SharedState,
}

impl HttpMockK8sServer {
	/// Start the mock server with all configured resources.
	pub async fn start(self) -> RunningHttpMockK8sServer {
		let server = MockServer::start().await;
		debug!(uri = %server.uri(), "Started mock K8s server");

		let mut state = MockState::new(
			MockDiscovery::default(),
			self.rollout,
			self.deletion_delay,
			self.immutable_fields,
		);

		state.seed(json!({
			"apiVersion": "v1",
			"kind": "Namespace",
			"metadata": { "name": "default" }
		}));
		for manifest in self.resources {
			if state.seed(manifest).is_none() {
				debug!("skipping seed resource with unknown type");
			}
		}

		mount_version(&server).await;
		mount_discovery(&server, state.discovery(), self.discovery_mode).await;

		let state = Arc::new(Mutex::new(state));
		mount_resources(&server, &state).await;

		RunningHttpMockK8sServer { server, state }
	}
}

impl RunningHttpMockK8sServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		self.kubeconfig_with_context("mock-context")
	}

	/// Create a Kubeconfig pointing to this mock server with a custom context name.
	pub fn kubeconfig_with_context(&self, context_name: &str) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: cluster_name.to_string(),
					user: Some(user_name.to_string()),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}

	fn lock(&self) -> MutexGuard<'_, MockState> {
		self.state.lock().unwrap()
	}

	fn key(state: &MockState, id: &ResourceId) -> Option<ObjectKey> {
		state.key_for(id.group(), id.kind(), id.namespace(), id.name())
	}

	/// Current stored object for `id`, including terminating ones.
	pub fn get(&self, id: &ResourceId) -> Option<Value> {
		let state = self.lock();
		let key = Self::key(&state, id)?;
		state.get(&key).cloned()
	}

	pub fn contains(&self, id: &ResourceId) -> bool {
		self.get(id).is_some()
	}

	/// Store an object directly, bypassing admission.
	pub fn insert(&self, manifest: Value) {
		self.lock().seed(manifest);
	}

	/// Overwrite the status of a stored object.
	pub fn set_status(&self, id: &ResourceId, status: Value) {
		let mut state = self.lock();
		if let Some(key) = Self::key(&state, id) {
			if let Some(object) = state.get_mut(&key) {
				object["status"] = status;
			}
		}
	}

	/// Answer the next `count` PATCH requests with 409 Conflict.
	pub fn inject_patch_conflicts(&self, count: u32) {
		self.lock().inject_patch_conflicts(count);
	}

	pub fn set_rollout(&self, rollout: RolloutMode) {
		self.lock().set_rollout(rollout);
	}

	/// Resource requests served so far, in order.
	pub fn journal(&self) -> Vec<JournalEntry> {
		self.lock().journal().to_vec()
	}

	/// Journal entries whose method is not GET.
	pub fn writes(&self) -> Vec<JournalEntry> {
		self.journal()
			.into_iter()
			.filter(|entry| entry.method != "GET")
			.collect()
	}

	/// All stored objects.
	pub fn objects(&self) -> Vec<Value> {
		self.lock().objects().cloned().collect()
	}
}

async fn mount_version(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"major": "1",
			"minor": "31",
			"gitVersion": "v1.31.0",
			"gitCommit": "fake",
			"gitTreeState": "clean",
			"buildDate": "2024-01-01T00:00:00Z",
			"goVersion": "go1.22.0",
			"compiler": "gc",
			"platform": "linux/amd64"
		})))
		.mount(server)
		.await;
}

fn aggregated_resource(group: &str, version: &str, r: &MockApiResource) -> Value {
	json!({
		"resource": r.name,
		"responseKind": {
			"group": group,
			"version": version,
			"kind": r.kind
		},
		"scope": if r.namespaced { "Namespaced" } else { "Cluster" },
		"verbs": r.verbs,
	})
}

fn legacy_resource(r: &MockApiResource) -> Value {
	json!({
		"name": r.name,
		"singularName": "",
		"namespaced": r.namespaced,
		"kind": r.kind,
		"verbs": r.verbs,
	})
}

async fn mount_discovery(server: &MockServer, discovery: &MockDiscovery, mode: DiscoveryMode) {
	let aggregated_group = |name: &str| {
		discovery.group(name).map(|group| {
			let versions: Vec<_> = group
				.versions
				.iter()
				.map(|v| {
					let resources: Vec<_> = v
						.resources
						.iter()
						.map(|r| aggregated_resource(name, &v.version, r))
						.collect();
					json!({
						"version": v.version,
						"resources": resources,
						"freshness": "Current"
					})
				})
				.collect();
			json!({
				"metadata": { "name": name },
				"versions": versions
			})
		})
	};

	let aggregated_core_body = json!({
		"kind": "APIGroupDiscoveryList",
		"apiVersion": "apidiscovery.k8s.io/v2",
		"items": aggregated_group("").into_iter().collect::<Vec<_>>()
	});

	let aggregated_apis_body = json!({
		"kind": "APIGroupDiscoveryList",
		"apiVersion": "apidiscovery.k8s.io/v2",
		"items": discovery
			.named_groups()
			.filter_map(|g| aggregated_group(&g.name))
			.collect::<Vec<_>>()
	});

	// The Content-Type must indicate aggregated discovery format for clients to parse it
	const AGGREGATED_DISCOVERY_CONTENT_TYPE: &str =
		"application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList";

	match mode {
		DiscoveryMode::Aggregated => {
			// set_body_json would overwrite Content-Type
			let core_body = aggregated_core_body.to_string().into_bytes();
			let apis_body = aggregated_apis_body.to_string().into_bytes();

			Mock::given(method("GET"))
				.and(path("/api"))
				.and(header_regex("accept", "apidiscovery"))
				.respond_with(
					ResponseTemplate::new(200)
						.set_body_raw(core_body, AGGREGATED_DISCOVERY_CONTENT_TYPE),
				)
				.mount(server)
				.await;

			Mock::given(method("GET"))
				.and(path("/apis"))
				.and(header_regex("accept", "apidiscovery"))
				.respond_with(
					ResponseTemplate::new(200)
						.set_body_raw(apis_body, AGGREGATED_DISCOVERY_CONTENT_TYPE),
				)
				.mount(server)
				.await;
		}
		DiscoveryMode::Legacy => {
			for endpoint in ["/api", "/apis"] {
				Mock::given(method("GET"))
					.and(path(endpoint))
					.and(header_regex("accept", "apidiscovery"))
					.respond_with(ResponseTemplate::new(406))
					.mount(server)
					.await;
			}
		}
	}

	// Legacy discovery endpoints (fallback)
	Mock::given(method("GET"))
		.and(path("/api"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIVersions",
			"versions": ["v1"],
			"serverAddressByClientCIDRs": []
		})))
		.mount(server)
		.await;

	let groups: Vec<_> = discovery
		.named_groups()
		.map(|group| {
			let versions: Vec<_> = group
				.versions
				.iter()
				.map(|v| json!({ "groupVersion": format!("{}/{}", group.name, v.version), "version": v.version }))
				.collect();
			let preferred = group.preferred_version().unwrap_or("v1");
			json!({
				"name": group.name,
				"versions": versions,
				"preferredVersion": {
					"groupVersion": format!("{}/{preferred}", group.name),
					"version": preferred
				}
			})
		})
		.collect();

	Mock::given(method("GET"))
		.and(path("/apis"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIGroupList",
			"apiVersion": "v1",
			"groups": groups
		})))
		.mount(server)
		.await;

	for group in &discovery.groups {
		for version in &group.versions {
			let (group_version, endpoint) = if group.name.is_empty() {
				(version.version.clone(), format!("/api/{}", version.version))
			} else {
				let gv = format!("{}/{}", group.name, version.version);
				let endpoint = format!("/apis/{gv}");
				(gv, endpoint)
			};
			let resources: Vec<_> = version.resources.iter().map(legacy_resource).collect();

			Mock::given(method("GET"))
				.and(path(endpoint))
				.respond_with(ResponseTemplate::new(200).set_body_json(json!({
					"kind": "APIResourceList",
					"apiVersion": "v1",
					"groupVersion": group_version,
					"resources": resources
				})))
				.mount(server)
				.await;
		}
	}
}

async fn mount_resources(server: &MockServer, state: &SharedState) {
	let state = Arc::clone(state);

	// Discovery mocks are mounted first and win for their exact paths
	Mock::given(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let content_type = req
				.headers
				.get("content-type")
				.and_then(|v| v.to_str().ok())
				.unwrap_or_default();

			let reply = state.lock().unwrap().handle(
				req.method.as_str(),
				req.url.path(),
				req.url.query().unwrap_or_default(),
				content_type,
				&req.body,
			);

			ResponseTemplate::new(reply.code).set_body_json(reply.body)
		})
		.mount(server)
		.await;
}
