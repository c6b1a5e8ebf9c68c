//! JSON settings file.
//!
//! ```json
//! {
//!   "vsphere": { "host": "vc.lab.local", "username": "administrator@vsphere.local" },
//!   "logLevel": "info"
//! }
//! ```
//!
//! The password may be left out of the file and supplied through
//! `VCTOOLS_PASSWORD` instead; the variable wins when both are set.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::logging::LogFormat;
use crate::vsphere::error::{VctError, VctErrorKind, VctResult};
use crate::vsphere::types::VimConfig;

pub const PASSWORD_ENV: &str = "VCTOOLS_PASSWORD";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub vsphere: VimConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_log_level() -> String {
    "info".into()
}

/// Read settings from `path`, applying `VCTOOLS_PASSWORD`.
pub fn load(path: impl AsRef<Path>) -> VctResult<Settings> {
    load_with_password(path, std::env::var(PASSWORD_ENV).ok())
}

/// Like [`load`], with the password override passed in explicitly.
pub fn load_with_password(path: impl AsRef<Path>, password: Option<String>) -> VctResult<Settings> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        VctError::new(
            VctErrorKind::Other,
            format!("Cannot read settings file {}: {e}", path.display()),
        )
    })?;
    let mut settings: Settings = serde_json::from_str(&text)?;

    if let Some(password) = password.filter(|p| !p.is_empty()) {
        settings.vsphere.password = password;
    }
    if settings.vsphere.host.trim().is_empty() {
        return Err(VctError::new(VctErrorKind::Other, "Settings: vsphere.host is empty"));
    }
    log::debug!("Loaded settings for {} from {}", settings.vsphere.host, path.display());
    Ok(settings)
}
