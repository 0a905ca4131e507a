use std::sync::Once;

use config::environment::{Environment, UnknownEnvironment};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Directive used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

/// Environment variable enabling log output in tests.
const ENABLE_TRACING_ENV_NAME: &str = "ENABLE_TRACING";

static INIT_TEST_TRACING: Once = Once::new();

/// Errors returned by [`init_tracing`].
#[derive(Debug, Error)]
pub enum InitTracingError {
    #[error("failed to initialize tracing: {0}")]
    Environment(#[from] UnknownEnvironment),
    #[error("failed to initialize tracing: {0}")]
    Subscriber(#[from] TryInitError),
}

/// Installs the global tracing subscriber for a service named `app_name`.
///
/// Logs are filtered by `RUST_LOG` (default `info`), formatted as JSON lines in production and
/// human readable otherwise.
pub fn init_tracing(app_name: &str) -> Result<(), InitTracingError> {
    let environment = Environment::load()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if environment.is_prod() {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    result?;

    tracing::info!(app = app_name, %environment, "tracing initialized");

    Ok(())
}

/// Installs a test subscriber once per process when `ENABLE_TRACING` is set.
///
/// Output goes through the test writer so it is captured per test.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var(ENABLE_TRACING_ENV_NAME).is_err() {
            return;
        }

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}
