//! Logging and trace export.
//!
//! Logs always go to stderr so stdout stays clean for plan output and
//! imported manifests.

use std::io::IsTerminal;

use anyhow::Result;
use clap::ValueEnum;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable for service name (not exported by opentelemetry_sdk).
const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";

const SERVICE_NAME: &str = "kres";

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
	/// Pretty when stderr is a terminal, JSON otherwise
	#[default]
	Auto,
	Pretty,
	Json,
}

impl LogFormat {
	fn is_pretty(self, is_terminal: bool) -> bool {
		match self {
			Self::Auto => is_terminal,
			Self::Pretty => true,
			Self::Json => false,
		}
	}
}

/// Keeps the trace exporter alive; flushes pending spans on drop.
pub struct TelemetryGuard {
	_inner: Option<OtelGuard>,
}

struct OtelGuard {
	tracer_provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
	fn drop(&mut self) {
		if let Err(e) = self.tracer_provider.shutdown() {
			eprintln!("Failed to shutdown tracer provider: {e}");
		}
	}
}

fn otel_export_enabled() -> bool {
	std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_ENDPOINT).is_ok()
		|| std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_TRACES_ENDPOINT).is_ok()
}

/// Filter from the `--log-level` flag, else `RUST_LOG`, else info.
fn filter(log_level: Option<Level>) -> EnvFilter {
	match log_level {
		Some(level) => EnvFilter::new(level.as_str()),
		None => EnvFilter::builder()
			.with_default_directive(Level::INFO.into())
			.from_env_lossy(),
	}
}

/// Install the global subscriber.
///
/// OpenTelemetry export is enabled when `OTEL_EXPORTER_OTLP_ENDPOINT` or
/// `OTEL_EXPORTER_OTLP_TRACES_ENDPOINT` is set and is otherwise configured
/// through the standard OTEL environment variables. The service name
/// defaults to "kres".
pub fn init(log_level: Option<Level>, format: LogFormat) -> Result<TelemetryGuard> {
	let fmt_layer = if format.is_pretty(std::io::stderr().is_terminal()) {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.pretty()
			.boxed()
	} else {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.json()
			.boxed()
	};

	let registry = tracing_subscriber::registry()
		.with(filter(log_level))
		.with(fmt_layer);

	if otel_export_enabled() {
		let (otel_layer, guard) = init_otel()?;
		registry.with(otel_layer).init();
		return Ok(TelemetryGuard {
			_inner: Some(guard),
		});
	}

	registry.init();
	Ok(TelemetryGuard { _inner: None })
}

fn init_otel<S>() -> Result<(impl Layer<S>, OtelGuard)>
where
	S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
	use opentelemetry_sdk::Resource;

	// Resource::builder() reads OTEL_SERVICE_NAME and OTEL_RESOURCE_ATTRIBUTES itself
	let mut resource_builder = Resource::builder();
	if std::env::var(OTEL_SERVICE_NAME).is_err() {
		resource_builder = resource_builder.with_service_name(SERVICE_NAME);
	}

	let exporter = match std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL)
		.as_deref()
		.unwrap_or(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL_DEFAULT)
	{
		"grpc" => opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.build()?,
		_ => opentelemetry_otlp::SpanExporter::builder()
			.with_http()
			.build()?,
	};

	let tracer_provider = SdkTracerProvider::builder()
		.with_resource(resource_builder.build())
		.with_batch_exporter(exporter)
		.build();

	let layer = tracing_opentelemetry::layer()
		.with_error_records_to_exceptions(true)
		.with_tracer(tracer_provider.tracer(SERVICE_NAME));

	opentelemetry::global::set_tracer_provider(tracer_provider.clone());

	Ok((layer, OtelGuard { tracer_provider }))
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	#[rstest]
	#[case(LogFormat::Auto, true, true)]
	#[case(LogFormat::Auto, false, false)]
	#[case(LogFormat::Pretty, false, true)]
	#[case(LogFormat::Json, true, false)]
	fn test_format_selection(#[case] format: LogFormat, #[case] terminal: bool, #[case] pretty: bool) {
		assert_eq!(format.is_pretty(terminal), pretty);
	}
}
