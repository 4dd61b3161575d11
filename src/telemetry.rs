//! Opt-in tracing output.
//!
//! Set `JVMCD_TRACE` to print spans and events (pool borrows, unit compiles,
//! stage timings) to stderr. `RUST_LOG` filters them, defaulting to `debug`.
//! Without the variable no subscriber is installed and tracing calls are no-ops.

use std::time::Instant;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const TRACE_ENV: &str = "JVMCD_TRACE";

/// Keep alive for the duration of the program. Dropping it records how long
/// the traced session ran.
pub struct TelemetryGuard {
    started: Option<Instant>,
    /// Whether a subscriber was installed
    pub tracing_enabled: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(started) = self.started.take() {
            tracing::info!(
                duration_seconds = started.elapsed().as_secs_f64(),
                "session.finished"
            );
        }
    }
}

pub fn init_telemetry() -> TelemetryGuard {
    match std::env::var_os(TRACE_ENV) {
        Some(value) if !value.is_empty() && value != "0" => init_fmt(),
        _ => init_noop(),
    }
}

fn init_fmt() -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_span_events(FmtSpan::CLOSE);

    if let Err(e) = tracing_subscriber::registry().with(filter).with(layer).try_init() {
        log::warn!("Could not install the tracing subscriber: {}", e);
        return init_noop();
    }

    TelemetryGuard {
        started: Some(Instant::now()),
        tracing_enabled: true,
    }
}

fn init_noop() -> TelemetryGuard {
    TelemetryGuard {
        started: None,
        tracing_enabled: false,
    }
}
