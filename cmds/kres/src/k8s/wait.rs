//! Readiness polling.
//!
//! A [`Ticker`] combines the poll interval, the operation deadline and the
//! cancellation token into one stream of ticks. [`ReadinessEngine`] feeds a
//! fresh snapshot into the pure [`WaitMachine`] on every tick until it
//! reaches a terminal state.

use std::time::Duration;

use kres_model::{readiness, ResourceId, WaitMachine, WaitState};
use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{
	apply::{Applier, ApplyError},
	discovery::DiscoveredResource,
};

/// Errors that end a readiness wait.
#[derive(Debug, Error)]
pub enum WaitError {
	#[error("timed out creating/updating {kind} {name}: {status}")]
	Timeout {
		kind: String,
		/// `namespace/name`, or just the name for cluster-scoped objects.
		name: String,
		status: String,
	},

	#[error("{id}: {status}")]
	Failed { id: ResourceId, status: String },

	#[error("{id}: cancelled while waiting for readiness")]
	Cancelled { id: ResourceId },

	#[error("reading {id} while waiting for readiness")]
	Read {
		id: ResourceId,
		#[source]
		source: Box<ApplyError>,
	},
}

/// One step of a [`Ticker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
	/// Time to take another snapshot.
	Poll,
	/// The deadline passed.
	Expired,
	/// The cancellation token fired.
	Cancelled,
}

/// Interval timer bounded by a deadline and a cancellation token.
///
/// The first tick fires immediately.
pub struct Ticker {
	interval: Interval,
	deadline: Instant,
	cancel: CancellationToken,
}

impl Ticker {
	pub fn new(period: Duration, timeout: Duration, cancel: CancellationToken) -> Self {
		let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
		interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
		Self {
			interval,
			deadline: Instant::now() + timeout,
			cancel,
		}
	}

	pub async fn tick(&mut self) -> Tick {
		tokio::select! {
			biased;
			() = self.cancel.cancelled() => Tick::Cancelled,
			() = tokio::time::sleep_until(self.deadline) => Tick::Expired,
			_ = self.interval.tick() => Tick::Poll,
		}
	}
}

/// Polls objects until their kind-specific readiness predicate holds.
#[derive(Clone)]
pub struct ReadinessEngine {
	applier: Applier,
}

impl ReadinessEngine {
	pub fn new(applier: Applier) -> Self {
		Self { applier }
	}

	/// Block until the object is ready, the timeout elapses or the operation
	/// is cancelled.
	#[instrument(skip_all, fields(id = %id, timeout = ?timeout))]
	pub async fn wait_ready(
		&self,
		resource: &DiscoveredResource,
		id: &ResourceId,
		timeout: Duration,
	) -> Result<(), WaitError> {
		if !readiness::has_predicate(id.kind()) {
			tracing::debug!("no readiness predicate, ready immediately");
			return Ok(());
		}

		let mut machine = WaitMachine::new(id.kind());
		let mut ticker = Ticker::new(
			self.applier.poll_interval(),
			timeout,
			self.applier.cancellation().clone(),
		);

		loop {
			match ticker.tick().await {
				Tick::Poll => {}
				Tick::Cancelled => return Err(WaitError::Cancelled { id: id.clone() }),
				Tick::Expired => {
					machine.expire();
					tracing::warn!(polls = machine.polls(), status = machine.last_status(), "readiness wait timed out");
					return Err(WaitError::Timeout {
						kind: id.kind().to_string(),
						name: id.namespaced_name(),
						status: machine.last_status().to_string(),
					});
				}
			}

			let snapshot = match self.applier.get(resource, id).await {
				Ok(snapshot) => snapshot,
				Err(ApplyError::Cancelled { .. }) => return Err(WaitError::Cancelled { id: id.clone() }),
				Err(e) if e.is_transient() => {
					tracing::warn!(error = %e, "read failed, polling again");
					continue;
				}
				Err(e) => {
					machine.fail(e.to_string());
					return Err(WaitError::Read {
						id: id.clone(),
						source: Box::new(e),
					});
				}
			};

			match machine.observe(snapshot.as_ref().map(|m| m.as_value())) {
				WaitState::Ready => {
					tracing::debug!(polls = machine.polls(), "ready");
					return Ok(());
				}
				WaitState::Failed => {
					return Err(WaitError::Failed {
						id: id.clone(),
						status: machine.last_status().to_string(),
					});
				}
				state => {
					tracing::debug!(?state, status = machine.last_status(), "not ready yet");
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn test_ticker_polls_then_expires() {
		let mut ticker = Ticker::new(
			Duration::from_secs(1),
			Duration::from_millis(2500),
			CancellationToken::new(),
		);

		let mut polls = 0;
		loop {
			match ticker.tick().await {
				Tick::Poll => polls += 1,
				Tick::Expired => break,
				Tick::Cancelled => unreachable!(),
			}
		}
		// immediate first tick, then at 1s and 2s
		assert_eq!(polls, 3);
	}

	#[tokio::test(start_paused = true)]
	async fn test_ticker_cancellation_wins() {
		let cancel = CancellationToken::new();
		let mut ticker = Ticker::new(Duration::from_secs(1), Duration::from_secs(60), cancel.clone());

		assert_eq!(ticker.tick().await, Tick::Poll);
		cancel.cancel();
		assert_eq!(ticker.tick().await, Tick::Cancelled);
	}

	#[test]
	fn test_timeout_message() {
		let error = WaitError::Timeout {
			kind: "Deployment".to_string(),
			name: "test-wait-fail/test".to_string(),
			status: "waiting for rollout to finish: 0 of 1 updated replicas are available".to_string(),
		};
		assert_eq!(
			error.to_string(),
			"timed out creating/updating Deployment test-wait-fail/test: waiting for rollout to finish: 0 of 1 updated replicas are available"
		);
	}
}
