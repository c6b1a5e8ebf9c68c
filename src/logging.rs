//! Process-wide logging setup.
//!
//! Library code logs through the `log` facade; this installs a
//! `tracing-subscriber` formatter that also picks those records up.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding an `EnvFilter` directive, e.g. `vct_vsphere=debug`.
pub const LOG_ENV: &str = "VCTOOLS_LOG";

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Install the global subscriber. `default_level` applies when
/// `VCTOOLS_LOG` is unset or invalid. Returns `false` if logging was
/// already set up, by this function or by someone else.
pub fn init_logging(default_level: &str, format: LogFormat) -> bool {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return false;
    }

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .is_ok(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::debug!(format = ?format, "logging initialised");
    }
    installed
}
