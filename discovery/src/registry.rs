// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The registry of neighbors discovered during one discovery session, and
//! the policy that decides when discovery is complete.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use slog::debug;
use slog::info;
use slog::trace;
use slog::Logger;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::errors::DiscoveryError;
use crate::types::DiscoveryResult;
use crate::types::Neighbor;
use crate::types::NeighborEvent;
use crate::types::NeighborId;

/// Standard LLDP transmit interval.
pub const LLDP_TX_INTERVAL: Duration = Duration::from_secs(30);

/// Two full transmit intervals plus a margin, so that every neighbor has had
/// at least two chances to be heard.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration =
    Duration::from_secs(2 * LLDP_TX_INTERVAL.as_secs() + 5);

pub const CONVERGENCE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct RegistryState {
    neighbors: BTreeMap<String, Vec<Neighbor>>,
    seen: BTreeSet<NeighborId>,
    converged: bool,
}

#[derive(Debug)]
pub struct Registry {
    log: Logger,
    start_time: Instant,
    timeout: Duration,
    min_interfaces: usize,
    min_neighbors: usize,
    state: Mutex<RegistryState>,
}

/// Has discovery seen enough of the network?
///
/// At least `min_interfaces` local interfaces must have heard a neighbor,
/// and the neighbors identified by MAC address on both chassis and port
/// must span at least `min_neighbors` distinct chassis.  With both minimums
/// at zero there is nothing to wait for.
pub fn is_converged(
    neighbors: &BTreeMap<String, Vec<Neighbor>>,
    min_interfaces: usize,
    min_neighbors: usize,
) -> bool {
    if min_interfaces == 0 && min_neighbors == 0 {
        return true;
    }

    let active = neighbors.values().filter(|n| !n.is_empty()).count();
    if active < min_interfaces {
        return false;
    }

    let chassis: BTreeSet<&str> = neighbors
        .values()
        .flatten()
        .filter(|n| n.is_mac_identified())
        .map(|n| n.chassis.value.as_str())
        .collect();
    chassis.len() >= min_neighbors
}

impl Registry {
    /// Create the registry for a new discovery session.  A zero `timeout`
    /// selects `DEFAULT_DISCOVERY_TIMEOUT`.
    pub fn new(
        log: &Logger,
        interfaces: &[String],
        min_interfaces: usize,
        min_neighbors: usize,
        timeout: Duration,
    ) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_DISCOVERY_TIMEOUT
        } else {
            timeout
        };
        let neighbors: BTreeMap<String, Vec<Neighbor>> = interfaces
            .iter()
            .map(|iface| (iface.clone(), Vec::new()))
            .collect();
        let converged = is_converged(&neighbors, min_interfaces, min_neighbors);

        Registry {
            log: log.new(slog::o!("unit" => "registry")),
            start_time: Instant::now(),
            timeout,
            min_interfaces,
            min_neighbors,
            state: Mutex::new(RegistryState {
                neighbors,
                seen: BTreeSet::new(),
                converged,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a neighbor heard on `interface`.  A neighbor already known,
    /// from this or any other interface, is dropped.  Returns whether the
    /// neighbor was new.
    pub fn ingest(&self, interface: &str, neighbor: Neighbor) -> bool {
        let mut state = self.state.lock().unwrap();

        let id = neighbor.id();
        if !state.seen.insert(id.clone()) {
            trace!(self.log, "duplicate neighbor";
                "iface" => interface, "chassis" => &id.chassis,
                "port" => &id.port);
            return false;
        }

        info!(self.log, "new neighbor";
            "iface" => interface,
            "chassis" => %neighbor.chassis,
            "port" => %neighbor.port,
            "system_name" => &neighbor.system_name);
        state
            .neighbors
            .entry(interface.to_string())
            .or_default()
            .push(neighbor);

        if !state.converged
            && is_converged(
                &state.neighbors,
                self.min_interfaces,
                self.min_neighbors,
            )
        {
            state.converged = true;
            info!(self.log, "neighbor discovery converged";
                "elapsed" => ?self.start_time.elapsed());
        }
        true
    }

    pub fn converged(&self) -> bool {
        self.state.lock().unwrap().converged
    }

    /// Wait until the convergence predicate holds, or fail once the
    /// registry's timeout has elapsed since it was created.
    pub async fn wait_for_convergence(&self) -> DiscoveryResult<()> {
        loop {
            if self.converged() {
                return Ok(());
            }
            if self.start_time.elapsed() > self.timeout {
                return Err(DiscoveryError::DiscoveryTimeout {
                    timeout: self.timeout,
                });
            }
            tokio::time::sleep(CONVERGENCE_POLL_INTERVAL).await;
        }
    }

    /// Neighbors heard on a single interface, in arrival order.
    pub fn neighbors(&self, interface: &str) -> Vec<Neighbor> {
        self.state
            .lock()
            .unwrap()
            .neighbors
            .get(interface)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<Neighbor>> {
        self.state.lock().unwrap().neighbors.clone()
    }

    pub fn interfaces_with_neighbors(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .neighbors
            .values()
            .filter(|n| !n.is_empty())
            .count()
    }

    /// Distinct chassis among the MAC-identified neighbors.
    pub fn mac_neighbor_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .neighbors
            .values()
            .flatten()
            .filter(|n| n.is_mac_identified())
            .map(|n| n.chassis.value.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Feed every event from the capture tasks into the registry.  This is the
/// only writer of a session's registry; it exits when every sender is gone.
pub async fn aggregate(
    log: Logger,
    registry: Arc<Registry>,
    mut rx: mpsc::Receiver<NeighborEvent>,
) {
    debug!(log, "aggregator started");
    while let Some(event) = rx.recv().await {
        registry.ingest(&event.interface, event.neighbor);
    }
    debug!(log, "aggregator exiting";
        "interfaces_with_neighbors" => registry.interfaces_with_neighbors(),
        "mac_neighbors" => registry.mac_neighbor_count());
}
