// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! LLDP neighbor discovery for a freshly booted bare-metal node.
//!
//! A [`session::Session`] captures LLDP advertisements on every physical
//! interface and collects them in a [`registry::Registry`] until enough of
//! the network has been seen.  A [`daemon::Daemon`] announces this host to
//! the switches, either on a timer or in answer to their own
//! advertisements.

pub mod capture;
pub mod daemon;
pub mod errors;
pub mod link;
pub mod registry;
pub mod session;
pub mod types;

#[cfg(target_os = "linux")]
pub mod plat_linux;
#[cfg(target_os = "linux")]
pub mod watcher;

pub use errors::DiscoveryError;
pub use types::DiscoveryResult;
pub use types::Neighbor;
pub use types::NeighborEvent;
