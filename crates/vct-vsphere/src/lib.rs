//! # vctools – vSphere VM lifecycle core
//!
//! Inventory lookups, device configuration descriptors, remote task
//! monitoring and VM create / reconfigure / power orchestration over the
//! vSphere VI/JSON API.
//!
//! ## Modules
//!
//! - **types**: Shared data structures (inventory nodes, tasks, questions, config)
//! - **error**: Crate-specific error types
//! - **units**: Byte-size and percentage formatting
//! - **remote**: `RemoteSession` / `InventoryBrowser` traits
//! - **vim**: VI/JSON HTTP client with session-based auth
//! - **inventory**: Container views, name resolution, folders, datastore capacity
//! - **devices**: SCSI / disk / NIC / optical drive descriptors with key linkage checks
//! - **task**: Task polling, progress reporting and question answering
//! - **config**: VM create / reconfigure / power orchestration
//! - **service**: Aggregate facade + shared state alias
//! - **testing**: Scripted in-memory session (tests and `test-util` feature)

pub mod types;
pub mod error;
pub mod units;
pub mod remote;
pub mod vim;
pub mod inventory;
pub mod devices;
pub mod task;
pub mod config;
pub mod service;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
