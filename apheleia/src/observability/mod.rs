//! Logging bootstrap and reconcile span helpers.

use std::sync::Once;
use std::time::{Duration, Instant};
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::ObjectKey;
use crate::errors::{ApheleiaError, Result};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON lines, for production.
    Json,
    /// Human-readable, for development.
    #[default]
    Pretty,
}

/// Installs the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Only the first
/// call has an effect; it fails if another subscriber was already installed.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let mut outcome = Ok(());
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);
        let installed = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer()).try_init(),
        };
        outcome = installed.map_err(|e| ApheleiaError::Config(format!("tracing: {e}")));
    });
    outcome
}

/// The span every reconcile call runs in.
#[must_use]
pub fn reconcile_span(key: &ObjectKey) -> Span {
    tracing::info_span!(
        "reconcile",
        kind = %key.kind,
        namespace = %key.namespace,
        name = %key.name,
    )
}

/// Measures one reconcile call.
#[derive(Debug)]
pub struct ReconcileTimer {
    start: Instant,
    key: ObjectKey,
}

impl ReconcileTimer {
    /// Starts timing a reconcile of `key`.
    #[must_use]
    pub fn start(key: &ObjectKey) -> Self {
        Self {
            start: Instant::now(),
            key: key.clone(),
        }
    }

    /// Time since the timer started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Logs the duration with the outcome and returns it.
    pub fn finish(self, outcome: &str) -> Duration {
        let elapsed = self.elapsed();
        tracing::debug!(
            key = %self.key,
            outcome,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "reconcile finished"
        );
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Kind;

    #[test]
    fn test_init_tracing_is_idempotent() {
        let first = init_tracing(LogFormat::Pretty);
        let second = init_tracing(LogFormat::Json);
        // The first call may lose to a subscriber another test installed.
        let _ = first;
        assert!(second.is_ok());
    }

    #[test]
    fn test_reconcile_span_and_timer() {
        let key = ObjectKey::new(Kind::ArtifactBuild, "ns", "a");
        let span = reconcile_span(&key);
        let _guard = span.enter();

        let timer = ReconcileTimer::start(&key);
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.finish("done") >= Duration::from_millis(5));
    }
}
