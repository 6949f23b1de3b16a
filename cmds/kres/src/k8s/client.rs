//! Kubernetes cluster connection management.

use std::{path::Path, time::Duration};

use k8s_openapi::apimachinery::pkg::version::Info;
use kube::{
	config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
	Client, Config,
};
use thiserror::Error;
use tracing::instrument;

/// Default timeout for Kubernetes API requests.
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur when connecting to a Kubernetes cluster.
#[derive(Debug, Error)]
pub enum ConnectionError {
	#[error("no context named `{0}` was found. Please check your $KUBECONFIG")]
	ContextNotFound(String),

	#[error(transparent)]
	Kubeconfig(#[from] KubeconfigError),

	#[error(transparent)]
	Kube(#[from] kube::Error),
}

/// Represents a connection to a Kubernetes cluster.
///
/// Holds the kube client shared by discovery, the applier and the
/// readiness engine, along with the server version probed on connect.
#[derive(Clone)]
pub struct ClusterConnection {
	client: Client,
	server_version: Info,
	/// Human-readable identifier for the cluster (context name).
	cluster_identifier: String,
}

impl std::fmt::Debug for ClusterConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClusterConnection")
			.field("cluster_identifier", &self.cluster_identifier)
			.field("server_version", &self.server_version)
			.finish_non_exhaustive()
	}
}

impl ClusterConnection {
	/// Connect using a kubeconfig file, or the default `$KUBECONFIG` lookup
	/// when no path is given.
	#[instrument(skip_all)]
	pub async fn connect(
		kubeconfig_path: Option<&Path>,
		context: Option<&str>,
	) -> Result<Self, ConnectionError> {
		let kubeconfig = match kubeconfig_path {
			Some(path) => Kubeconfig::read_from(path)?,
			None => Kubeconfig::read()?,
		};
		Self::from_kubeconfig(kubeconfig, context).await
	}

	/// Connect to a cluster using a provided kubeconfig.
	///
	/// Uses `context` when given, otherwise the kubeconfig's current context.
	#[instrument(skip(kubeconfig))]
	pub async fn from_kubeconfig(
		kubeconfig: Kubeconfig,
		context: Option<&str>,
	) -> Result<Self, ConnectionError> {
		if let Some(name) = context {
			if !kubeconfig.contexts.iter().any(|c| c.name == name) {
				return Err(ConnectionError::ContextNotFound(name.to_string()));
			}
		}

		let cluster_identifier = context
			.map(str::to_string)
			.or_else(|| kubeconfig.current_context.clone())
			.map_or_else(|| "in-cluster".to_string(), |name| format!("context:{name}"));

		tracing::debug!(cluster = %cluster_identifier, "connecting to cluster");

		let mut config = Config::from_custom_kubeconfig(
			kubeconfig,
			&KubeConfigOptions {
				context: context.map(str::to_string),
				..Default::default()
			},
		)
		.await?;

		config.read_timeout = Some(DEFAULT_API_TIMEOUT);
		let client = Client::try_from(config)?;

		let server_version = client.apiserver_version().await?;
		tracing::debug!(version = %server_version.git_version, "connected");

		Ok(Self {
			client,
			server_version,
			cluster_identifier,
		})
	}

	/// Get a reference to the underlying kube client.
	pub fn client(&self) -> &Client {
		&self.client
	}

	/// Get the server version.
	pub fn server_version(&self) -> &Info {
		&self.server_version
	}

	/// Get the cluster identifier (context name).
	pub fn cluster_identifier(&self) -> &str {
		&self.cluster_identifier
	}
}
