//! updraft-installer - Update Installer Daemon Library
//!
//! The daemon receives a downloaded update archive from the updater
//! process, verifies it, stages a replacement of the installed bundle (or
//! package), finalizes the swap once the host application terminates,
//! optionally relaunches the new version through the UI agent, and exits.
//!
//! # Modules
//!
//! - [`links`]: Updater and agent socket servers
//! - [`watcher`]: Host process termination observation
//! - [`installer`]: Three-stage installer backends and the serial worker
//! - [`controller`]: The installation state machine
//! - [`cleanup`]: Idempotent teardown of daemon-owned resources

pub mod cleanup;
pub mod controller;
pub mod event;
pub mod installer;
pub mod links;
pub mod watcher;

pub use controller::{run_daemon, Collaborators, DaemonConfig, DaemonExit, Timeouts};
