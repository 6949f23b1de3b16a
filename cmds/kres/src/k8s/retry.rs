//! Retry with exponential backoff for writes that race other clients.

use std::{fmt::Display, future::Future, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
	/// Maximum number of attempts, including the first one.
	pub max_attempts: u32,
	/// Initial delay between attempts
	pub initial_delay: Duration,
	/// Maximum delay between attempts
	pub max_delay: Duration,
	/// Multiplier for exponential backoff
	pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			initial_delay: Duration::from_millis(100),
			max_delay: Duration::from_secs(5),
			backoff_multiplier: 2.0,
		}
	}
}

impl RetryConfig {
	/// Create a config with a maximum number of attempts.
	pub fn with_max_attempts(attempts: u32) -> Self {
		Self {
			max_attempts: attempts.max(1),
			..Default::default()
		}
	}

	fn next_delay(&self, delay: Duration) -> Duration {
		Duration::from_secs_f64(
			(delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
		)
	}
}

/// Why [`retry_with_backoff`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
	/// Every attempt failed with a retryable error; holds the last one.
	Exhausted { attempts: u32, source: E },
	/// The operation failed with an error that is not worth retrying.
	Aborted(E),
	/// The cancellation token fired while waiting between attempts.
	Cancelled,
}

/// Execute an async operation, retrying errors accepted by `retryable`.
///
/// Gives up after `config.max_attempts` attempts, and stops early when
/// `cancel` fires.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
	config: &RetryConfig,
	operation_name: &str,
	cancel: &CancellationToken,
	retryable: R,
	mut operation: F,
) -> Result<T, RetryError<E>>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: Display,
	R: Fn(&E) -> bool,
{
	let mut attempt = 0u32;
	let mut delay = config.initial_delay;

	loop {
		if cancel.is_cancelled() {
			return Err(RetryError::Cancelled);
		}
		attempt += 1;

		let error = match operation().await {
			Ok(result) => return Ok(result),
			Err(e) if !retryable(&e) => return Err(RetryError::Aborted(e)),
			Err(e) => e,
		};

		if attempt >= config.max_attempts {
			warn!(
				operation = %operation_name,
				attempt,
				error = %error,
				"giving up after max retries"
			);
			return Err(RetryError::Exhausted {
				attempts: attempt,
				source: error,
			});
		}

		warn!(
			operation = %operation_name,
			attempt,
			error = %error,
			delay_ms = delay.as_millis(),
			"operation failed, retrying"
		);

		tokio::select! {
			() = cancel.cancelled() => return Err(RetryError::Cancelled),
			() = tokio::time::sleep(delay) => {}
		}
		delay = config.next_delay(delay);
	}
}
