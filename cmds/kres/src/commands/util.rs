//! Utilities for command handlers.

use std::io::{self, ErrorKind, Write};

use anyhow::{Context, Result};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A writer wrapper that silently handles broken pipe errors.
///
/// When the underlying writer returns a broken pipe error (EPIPE), this wrapper
/// converts it to a successful write. This allows commands to exit cleanly when
/// output is piped to a process that closes early (e.g., `kres plan | head -1`).
pub struct BrokenPipeGuard<W> {
	inner: W,
}

impl<W> BrokenPipeGuard<W> {
	pub fn new(inner: W) -> Self {
		Self { inner }
	}
}

impl<W: Write> Write for BrokenPipeGuard<W> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self.inner.write(buf) {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(buf.len()),
			other => other,
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self.inner.flush() {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
			other => other,
		}
	}
}

/// Create a tokio runtime for async operations.
pub fn runtime() -> Result<Runtime> {
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("creating tokio runtime")
}

/// Cancel `token` on the first Ctrl-C.
///
/// Must be called from within a runtime.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
	tokio::spawn(async move {
		tokio::select! {
			result = tokio::signal::ctrl_c() => {
				if result.is_ok() {
					warn!("interrupted, cancelling in-flight operations");
					token.cancel();
				}
			}
			() = token.cancelled() => {}
		}
	});
}
