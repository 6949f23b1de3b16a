//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::{path::PathBuf, time::Duration};

use kres::{
	commands::session::Session,
	config::Settings,
	k8s::client::ClusterConnection,
	lifecycle::{Lifecycle, Timeouts, WaitOptions},
	state::{State, DEFAULT_STATE_FILE},
};
use kres_mock::RunningHttpMockK8sServer;
use kres_model::{Manifest, ResourceId};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Settings that keep polling and deadlines short.
pub fn fast_settings() -> Settings {
	Settings {
		poll_interval: Duration::from_millis(10),
		wait: WaitOptions {
			wait: false,
			timeouts: Timeouts {
				create: Duration::from_secs(5),
				update: Duration::from_secs(5),
				delete: Duration::from_secs(5),
			},
		},
		..Settings::default()
	}
}

/// A mock cluster plus a session with its own state directory.
pub struct Harness {
	pub server: RunningHttpMockK8sServer,
	pub session: Session,
	dir: TempDir,
}

impl Harness {
	pub async fn start(server: RunningHttpMockK8sServer) -> Self {
		Self::with_settings(server, fast_settings()).await
	}

	pub async fn with_settings(server: RunningHttpMockK8sServer, settings: Settings) -> Self {
		let dir = TempDir::new().expect("failed to create temp dir");
		let connection = ClusterConnection::from_kubeconfig(server.kubeconfig(), None)
			.await
			.expect("failed to connect");
		let session = Session::new(
			&connection,
			settings,
			dir.path().join(DEFAULT_STATE_FILE),
			CancellationToken::new(),
		)
		.await
		.expect("failed to create session");

		Self {
			server,
			session,
			dir,
		}
	}

	pub fn lifecycle(&self) -> &Lifecycle {
		&self.session.lifecycle
	}

	pub fn state_path(&self) -> PathBuf {
		self.session.state_path.clone()
	}

	pub fn state(&self) -> State {
		State::load(&self.session.state_path).expect("failed to load state")
	}

	/// Methods and status codes of journal entries from `start` on whose
	/// path contains `fragment`.
	pub fn requests_since(&self, start: usize, fragment: &str) -> Vec<(String, u16)> {
		self.server.journal()[start..]
			.iter()
			.filter(|entry| entry.path.contains(fragment))
			.map(|entry| (entry.method.clone(), entry.status))
			.collect()
	}
}

pub fn manifest(yaml: &str) -> Manifest {
	Manifest::load(yaml.as_bytes()).expect("invalid test manifest")
}

pub fn id(encoded: &str) -> ResourceId {
	ResourceId::decode(encoded).expect("invalid test ID")
}

pub fn namespace(name: &str) -> Manifest {
	manifest(&format!(
		"apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {name}\n"
	))
}

pub fn config_map(namespace: &str, name: &str, value: &str) -> Manifest {
	manifest(&format!(
		"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: {namespace}\ndata:\n  key: {value}\n"
	))
}

pub fn service(namespace: &str, name: &str) -> Manifest {
	manifest(&format!(
		"apiVersion: v1\nkind: Service\nmetadata:\n  name: {name}\n  namespace: {namespace}\nspec:\n  selector:\n    app: {name}\n  ports:\n  - port: 80\n"
	))
}

/// Deployment selecting pods labelled `app: <app>`.
pub fn deployment(namespace: &str, name: &str, app: &str) -> Manifest {
	manifest(&format!(
		"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}
  namespace: {namespace}
spec:
  replicas: 1
  selector:
    matchLabels:
      app: {app}
  template:
    metadata:
      labels:
        app: {app}
    spec:
      containers:
      - name: main
        image: nginx:1.27
"
	))
}

pub fn daemon_set(namespace: &str, name: &str) -> Manifest {
	manifest(&format!(
		"apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: {name}
  namespace: {namespace}
spec:
  selector:
    matchLabels:
      app: {name}
  template:
    metadata:
      labels:
        app: {name}
    spec:
      containers:
      - name: main
        image: nginx:1.27
"
	))
}

pub fn stateful_set(namespace: &str, name: &str) -> Manifest {
	manifest(&format!(
		"apiVersion: apps/v1
kind: StatefulSet
metadata:
  name: {name}
  namespace: {namespace}
spec:
  serviceName: {name}
  replicas: 1
  selector:
    matchLabels:
      app: {name}
  template:
    metadata:
      labels:
        app: {name}
    spec:
      containers:
      - name: main
        image: nginx:1.27
"
	))
}

/// One of the workload kinds that have a readiness predicate.
pub fn workload(kind: &str, namespace: &str, name: &str) -> Manifest {
	match kind {
		"Deployment" => deployment(namespace, name, name),
		"DaemonSet" => daemon_set(namespace, name),
		"StatefulSet" => stateful_set(namespace, name),
		other => panic!("no fixture for {other}"),
	}
}
