//! Version-independent resource identifiers.
//!
//! An ID has the textual form `group/kind/namespace/name`. The core API group
//! and cluster-scoped objects use `_` in place of the empty group and
//! namespace, so every ID has exactly four non-empty segments.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Placeholder for the empty group and the missing namespace.
pub const SENTINEL: &str = "_";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
	#[error("invalid ID: \"{0}\", valid IDs look like: \"_/Namespace/_/example\"")]
	InvalidId(String),

	#[error("resource kind must not be empty")]
	EmptyKind,

	#[error("resource name must not be empty")]
	EmptyName,
}

/// Identity of a cluster object, independent of its API version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
	group: String,
	kind: String,
	namespace: String,
	name: String,
}

impl ResourceId {
	/// Build an ID from its parts. Empty group and namespace are allowed.
	pub fn new(
		group: impl Into<String>,
		kind: impl Into<String>,
		namespace: impl Into<String>,
		name: impl Into<String>,
	) -> Result<Self, IdError> {
		let kind = kind.into();
		let name = name.into();
		if kind.is_empty() {
			return Err(IdError::EmptyKind);
		}
		if name.is_empty() {
			return Err(IdError::EmptyName);
		}
		Ok(Self {
			group: from_segment(group.into()),
			kind,
			namespace: from_segment(namespace.into()),
			name,
		})
	}

	/// Parse the textual `group/kind/namespace/name` form.
	pub fn decode(input: &str) -> Result<Self, IdError> {
		let invalid = || IdError::InvalidId(input.to_string());

		let segments: Vec<&str> = input.split('/').collect();
		let [group, kind, namespace, name] = segments.as_slice() else {
			return Err(invalid());
		};
		if [group, kind, namespace, name].iter().any(|s| s.is_empty()) {
			return Err(invalid());
		}

		Self::new(*group, *kind, *namespace, *name).map_err(|_| invalid())
	}

	/// Render the textual form. Equivalent to `to_string()`.
	pub fn encode(&self) -> String {
		self.to_string()
	}

	/// API group, empty for the core group.
	pub fn group(&self) -> &str {
		&self.group
	}

	pub fn kind(&self) -> &str {
		&self.kind
	}

	/// Namespace, `None` for cluster-scoped objects.
	pub fn namespace(&self) -> Option<&str> {
		(!self.namespace.is_empty()).then_some(self.namespace.as_str())
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// `namespace/name`, or just `name` for cluster-scoped objects.
	pub fn namespaced_name(&self) -> String {
		match self.namespace() {
			Some(ns) => format!("{ns}/{}", self.name),
			None => self.name.clone(),
		}
	}

	/// Whether this ID names a Namespace or a CustomResourceDefinition.
	///
	/// Those objects must exist before anything that lives in or is typed by them.
	pub fn is_foundational(&self) -> bool {
		(self.group.is_empty() && self.kind == "Namespace")
			|| (self.group == "apiextensions.k8s.io" && self.kind == "CustomResourceDefinition")
	}
}

/// Encode four parts into an ID string.
pub fn encode(group: &str, kind: &str, namespace: &str, name: &str) -> Result<String, IdError> {
	ResourceId::new(group, kind, namespace, name).map(|id| id.encode())
}

fn from_segment(segment: String) -> String {
	if segment == SENTINEL {
		String::new()
	} else {
		segment
	}
}

fn to_segment(value: &str) -> &str {
	if value.is_empty() {
		SENTINEL
	} else {
		value
	}
}

impl fmt::Display for ResourceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}/{}/{}/{}",
			to_segment(&self.group),
			self.kind,
			to_segment(&self.namespace),
			self.name
		)
	}
}

impl FromStr for ResourceId {
	type Err = IdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::decode(s)
	}
}

impl TryFrom<String> for ResourceId {
	type Error = IdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::decode(&value)
	}
}

impl From<ResourceId> for String {
	fn from(id: ResourceId) -> Self {
		id.encode()
	}
}
