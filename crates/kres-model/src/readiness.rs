//! Readiness predicates and the wait state machine.
//!
//! Predicates are pure functions over an object snapshot. [`WaitMachine`]
//! tracks one wait from the first poll to a terminal state; the caller owns
//! the clock and feeds it snapshots.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
	Ready,
	/// Not ready yet, with a human readable progress message.
	NotReady(String),
}

impl Readiness {
	pub fn is_ready(&self) -> bool {
		matches!(self, Self::Ready)
	}
}

/// Whether `kind` has a readiness predicate. Other kinds are ready as soon
/// as they exist.
pub fn has_predicate(kind: &str) -> bool {
	matches!(kind, "Deployment" | "DaemonSet" | "StatefulSet")
}

/// Evaluate the readiness predicate for `kind` against `object`.
pub fn evaluate(kind: &str, object: &Value) -> Readiness {
	match kind {
		"Deployment" => deployment(object),
		"DaemonSet" => daemon_set(object),
		"StatefulSet" => stateful_set(object),
		_ => Readiness::Ready,
	}
}

fn int(object: &Value, pointer: &str) -> Option<i64> {
	object.pointer(pointer).and_then(Value::as_i64)
}

fn replicas(object: &Value) -> i64 {
	int(object, "/spec/replicas").unwrap_or(1)
}

/// Whether the controller has caught up with the latest spec.
fn generation_observed(object: &Value) -> bool {
	let generation = int(object, "/metadata/generation").unwrap_or(0);
	let observed = int(object, "/status/observedGeneration").unwrap_or(0);
	observed >= generation
}

fn deployment(object: &Value) -> Readiness {
	if !generation_observed(object) {
		return Readiness::NotReady("waiting for deployment spec update to be observed".into());
	}

	let desired = replicas(object);
	let updated = int(object, "/status/updatedReplicas").unwrap_or(0);
	if updated != desired {
		return Readiness::NotReady(format!(
			"waiting for rollout to finish: {updated} out of {desired} new replicas have been updated"
		));
	}

	let available = int(object, "/status/availableReplicas").unwrap_or(0);
	if available != desired {
		return Readiness::NotReady(format!(
			"waiting for rollout to finish: {available} of {desired} updated replicas are available"
		));
	}

	Readiness::Ready
}

fn daemon_set(object: &Value) -> Readiness {
	if !generation_observed(object) {
		return Readiness::NotReady("waiting for daemon set spec update to be observed".into());
	}

	let Some(desired) = int(object, "/status/desiredNumberScheduled") else {
		return Readiness::NotReady("waiting for daemon set pods to be scheduled".into());
	};
	let updated = int(object, "/status/updatedNumberScheduled").unwrap_or(0);
	if updated != desired {
		return Readiness::NotReady(format!(
			"waiting for daemon set rollout to finish: {updated} out of {desired} new pods have been updated"
		));
	}

	let ready = int(object, "/status/numberReady").unwrap_or(0);
	if ready != desired {
		return Readiness::NotReady(format!(
			"waiting for daemon set rollout to finish: {ready} of {desired} updated pods are available"
		));
	}

	Readiness::Ready
}

fn stateful_set(object: &Value) -> Readiness {
	if !generation_observed(object) {
		return Readiness::NotReady("waiting for statefulset spec update to be observed".into());
	}

	let desired = replicas(object);
	let ready = int(object, "/status/readyReplicas").unwrap_or(0);
	if ready != desired {
		return Readiness::NotReady(format!(
			"waiting for {ready} of {desired} pods to be ready"
		));
	}

	let update_revision = object.pointer("/status/updateRevision").and_then(Value::as_str);
	let current_revision = object.pointer("/status/currentRevision").and_then(Value::as_str);
	if update_revision != current_revision {
		return Readiness::NotReady(format!(
			"waiting for statefulset rolling update to complete: current revision {}, update revision {}",
			current_revision.unwrap_or("<none>"),
			update_revision.unwrap_or("<none>"),
		));
	}

	Readiness::Ready
}

/// Progress of one readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
	/// No snapshot observed yet.
	Pending,
	/// At least one snapshot observed, predicate not yet satisfied.
	Polling,
	Ready,
	TimedOut,
	/// The object disappeared or could not be read.
	Failed,
}

impl WaitState {
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Ready | Self::TimedOut | Self::Failed)
	}
}

/// State machine for waiting on one object.
#[derive(Debug, Clone)]
pub struct WaitMachine {
	kind: String,
	state: WaitState,
	polls: u32,
	last_status: String,
}

impl WaitMachine {
	pub fn new(kind: impl Into<String>) -> Self {
		Self {
			kind: kind.into(),
			state: WaitState::Pending,
			polls: 0,
			last_status: "no status observed".to_string(),
		}
	}

	pub fn state(&self) -> WaitState {
		self.state
	}

	/// Number of snapshots observed.
	pub fn polls(&self) -> u32 {
		self.polls
	}

	/// Progress message from the most recent snapshot.
	pub fn last_status(&self) -> &str {
		&self.last_status
	}

	/// Feed a snapshot; `None` means the object no longer exists.
	pub fn observe(&mut self, snapshot: Option<&Value>) -> WaitState {
		if self.state.is_terminal() {
			return self.state;
		}
		self.polls += 1;

		let Some(object) = snapshot else {
			self.last_status = "object no longer exists".to_string();
			self.state = WaitState::Failed;
			return self.state;
		};

		match evaluate(&self.kind, object) {
			Readiness::Ready => {
				self.last_status = "ready".to_string();
				self.state = WaitState::Ready;
			}
			Readiness::NotReady(status) => {
				self.last_status = status;
				self.state = WaitState::Polling;
			}
		}
		self.state
	}

	/// The deadline passed.
	pub fn expire(&mut self) -> WaitState {
		if !self.state.is_terminal() {
			self.state = WaitState::TimedOut;
		}
		self.state
	}

	/// Reading the object failed for a reason other than absence.
	pub fn fail(&mut self, reason: impl Into<String>) -> WaitState {
		if !self.state.is_terminal() {
			self.last_status = reason.into();
			self.state = WaitState::Failed;
		}
		self.state
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;
	use serde_json::json;

	use super::*;

	fn deployment_snapshot(replicas: Option<i64>, updated: i64, available: i64) -> Value {
		let mut spec = json!({});
		if let Some(replicas) = replicas {
			spec["replicas"] = json!(replicas);
		}
		json!({
			"metadata": { "generation": 2 },
			"spec": spec,
			"status": {
				"observedGeneration": 2,
				"updatedReplicas": updated,
				"availableReplicas": available
			}
		})
	}

	#[rstest]
	#[case::all_available(Some(3), 3, 3, true)]
	#[case::not_available(Some(3), 3, 2, false)]
	#[case::not_updated(Some(3), 2, 3, false)]
	#[case::default_replicas(None, 1, 1, true)]
	#[case::default_replicas_unavailable(None, 1, 0, false)]
	#[case::scaled_to_zero(Some(0), 0, 0, true)]
	fn test_deployment(
		#[case] replicas: Option<i64>,
		#[case] updated: i64,
		#[case] available: i64,
		#[case] ready: bool,
	) {
		let snapshot = deployment_snapshot(replicas, updated, available);
		assert_eq!(evaluate("Deployment", &snapshot).is_ready(), ready);
	}

	#[test]
	fn test_deployment_stale_generation() {
		let mut snapshot = deployment_snapshot(Some(1), 1, 1);
		snapshot["metadata"]["generation"] = json!(3);
		assert_eq!(
			evaluate("Deployment", &snapshot),
			Readiness::NotReady("waiting for deployment spec update to be observed".into())
		);
	}

	#[rstest]
	#[case::ready(3, 3, 3, true)]
	#[case::not_ready(3, 2, 3, false)]
	#[case::not_updated(3, 3, 1, false)]
	fn test_daemon_set(#[case] desired: i64, #[case] ready: i64, #[case] updated: i64, #[case] expected: bool) {
		let snapshot = json!({
			"status": {
				"desiredNumberScheduled": desired,
				"numberReady": ready,
				"updatedNumberScheduled": updated
			}
		});
		assert_eq!(evaluate("DaemonSet", &snapshot).is_ready(), expected);
	}

	#[rstest]
	#[case::empty_status(json!({ "generation": 1 }), json!({}), "waiting for daemon set spec update to be observed")]
	#[case::stale_generation(
		json!({ "generation": 2 }),
		json!({ "observedGeneration": 1, "desiredNumberScheduled": 1, "numberReady": 1, "updatedNumberScheduled": 1 }),
		"waiting for daemon set spec update to be observed"
	)]
	#[case::not_scheduled(
		json!({ "generation": 1 }),
		json!({ "observedGeneration": 1 }),
		"waiting for daemon set pods to be scheduled"
	)]
	fn test_daemon_set_not_observed(#[case] metadata: Value, #[case] status: Value, #[case] message: &str) {
		let snapshot = json!({ "metadata": metadata, "status": status });
		assert_eq!(evaluate("DaemonSet", &snapshot), Readiness::NotReady(message.into()));
	}

	#[rstest]
	#[case::empty_status(json!({}))]
	#[case::stale_generation(json!({ "observedGeneration": 1, "readyReplicas": 2, "currentRevision": "a", "updateRevision": "a" }))]
	fn test_stateful_set_not_observed(#[case] status: Value) {
		let snapshot = json!({ "metadata": { "generation": 2 }, "spec": { "replicas": 2 }, "status": status });
		assert_eq!(
			evaluate("StatefulSet", &snapshot),
			Readiness::NotReady("waiting for statefulset spec update to be observed".into())
		);
	}

	#[rstest]
	#[case::ready(json!({ "readyReplicas": 2, "currentRevision": "a", "updateRevision": "a" }), true)]
	#[case::rolling(json!({ "readyReplicas": 2, "currentRevision": "a", "updateRevision": "b" }), false)]
	#[case::not_ready(json!({ "readyReplicas": 1, "currentRevision": "a", "updateRevision": "a" }), false)]
	fn test_stateful_set(#[case] status: Value, #[case] expected: bool) {
		let snapshot = json!({ "spec": { "replicas": 2 }, "status": status });
		assert_eq!(evaluate("StatefulSet", &snapshot).is_ready(), expected);
	}

	#[test]
	fn test_other_kinds_ready_immediately() {
		assert!(!has_predicate("ConfigMap"));
		assert!(evaluate("ConfigMap", &json!({})).is_ready());
	}

	#[test]
	fn test_machine_flips_when_available() {
		let mut machine = WaitMachine::new("Deployment");
		assert_eq!(machine.state(), WaitState::Pending);

		let pending = deployment_snapshot(Some(2), 2, 1);
		assert_eq!(machine.observe(Some(&pending)), WaitState::Polling);
		assert_eq!(
			machine.last_status(),
			"waiting for rollout to finish: 1 of 2 updated replicas are available"
		);

		let done = deployment_snapshot(Some(2), 2, 2);
		assert_eq!(machine.observe(Some(&done)), WaitState::Ready);
		assert_eq!(machine.polls(), 2);

		// terminal states are sticky
		assert_eq!(machine.expire(), WaitState::Ready);
	}

	#[test]
	fn test_machine_times_out() {
		let mut machine = WaitMachine::new("Deployment");
		machine.observe(Some(&deployment_snapshot(Some(1), 1, 0)));
		assert_eq!(machine.expire(), WaitState::TimedOut);
		assert_eq!(machine.observe(Some(&deployment_snapshot(Some(1), 1, 1))), WaitState::TimedOut);
	}

	#[test]
	fn test_machine_fails_when_object_vanishes() {
		let mut machine = WaitMachine::new("StatefulSet");
		assert_eq!(machine.observe(None), WaitState::Failed);
		assert_eq!(machine.last_status(), "object no longer exists");
	}
}
