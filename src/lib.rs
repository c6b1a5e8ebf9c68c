//! # vctools
//!
//! Virtual machine lifecycle automation for vCenter / ESXi.
//!
//! The core lives in the `vct-vsphere` crate, re-exported here as
//! [`vsphere`]. This crate adds what an embedding application needs
//! around it: logging setup and settings loading.

pub mod logging;
pub mod settings;

pub use logging::{init_logging, LogFormat};
pub use settings::Settings;
pub use vct_vsphere as vsphere;
