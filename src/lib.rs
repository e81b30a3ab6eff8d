//! Command line front end for the plugman plugin service.
//!
//! Every invocation drives a single [`plugman_lib::service::PluginService`]
//! session: it loads the installed-plugin manifest, refreshes the registry
//! cache when a command needs it, stages the requested changes and commits
//! them in one batch.

/// The current version of the plugman CLI, set at build time
pub const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cli;
