// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Corral: instance placement and lifecycle orchestration.
//!
//! The [`coordinator::Coordinator`] is the entry point. It owns the instance
//! store, the resource inventory, and the host directory, and drives the
//! external services described in [`services`] to carry out lifecycle
//! requests.

#![allow(clippy::style)]

pub mod action_log;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod instance;
pub mod inventory;
pub mod network;
pub mod retry;
pub mod scheduler;
pub mod services;
pub mod sim;
pub mod volume_drivers;

pub use coordinator::{Coordinator, RequestContext};
pub use error::OrchestrationError;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
