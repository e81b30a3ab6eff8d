//! Core library for `plugman`, the workspace plugin service.
//!
//! The crate downloads plugin descriptors from one or more registries into a
//! cache, resolves transitive dependencies for install requests, stages
//! installs and removals in a [`ledger::Ledger`] without committing them,
//! rejects removals that would leave dependents dangling, and finally commits
//! a batch by downloading artifacts, patching the persisted workspace
//! components and writing the installed-plugin manifest.
//!
//! Most callers only need [`service::PluginService`], which ties all of the
//! pieces together behind a single serialized session.

/// The current version of the plugman library, set at build time
pub const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Filesystem layout for downloaded extension artifacts
pub mod artifacts;
/// Registry cache building
pub mod cache;
/// Notifications pushed to the client driving a session
pub mod client;
/// Configuration management for plugman
pub mod config;
/// Removal conflict checking
pub mod conflict;
/// Plugin descriptor model and parsing
pub mod descriptor;
/// Error types shared by the whole crate
pub mod error;
/// Fetching descriptors and artifacts from URLs
pub mod fetch;
/// Plugin identity
pub mod key;
/// Staged install/removal state
pub mod ledger;
/// The installed-plugin manifest
pub mod manifest;
/// Committing staged changes
pub mod persist;
/// Registry definitions and URL layout
pub mod registry;
/// Dependency resolution
pub mod resolver;
/// The plugin service session
pub mod service;
/// Install and remove transactions against a ledger
pub mod transaction;
/// Persisted workspace components
pub mod workspace;

pub use error::{FetchError, PluginError, Result};
pub use key::PluginKey;
