// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! One discovery attempt: a capture task per interface feeding a fresh
//! registry through a single aggregator.

use std::sync::Arc;
use std::time::Duration;

use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::capture;
use crate::capture::CaptureHandle;
use crate::link::LinkOpener;
#[cfg(target_os = "linux")]
use crate::link::SystemLinks;
use crate::registry;
use crate::registry::Registry;
use crate::types::DiscoveryResult;

/// Depth of the channel between the capture tasks and the aggregator.
const NEIGHBOR_CHANNEL_DEPTH: usize = 256;

#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    pub interfaces: Vec<String>,
    pub min_interfaces: usize,
    pub min_neighbors: usize,
    /// Zero selects the registry's default.
    pub timeout: Duration,
}

pub struct Session {
    log: Logger,
    registry: Arc<Registry>,
    captures: Vec<CaptureHandle>,
    aggregator: JoinHandle<()>,
}

impl Session {
    /// Start capturing on every configured interface.
    #[cfg(target_os = "linux")]
    pub fn start(log: &Logger, config: &SessionConfig) -> Session {
        Session::start_with(log, config, &SystemLinks)
    }

    /// Start capturing, opening links through `opener`.  Interfaces that
    /// can't be opened are skipped; the registry still lists them.
    pub fn start_with<O: LinkOpener>(
        log: &Logger,
        config: &SessionConfig,
        opener: &O,
    ) -> Session {
        let root = log;
        let log = root.new(slog::o!("unit" => "session"));
        let registry = Arc::new(Registry::new(
            root,
            &config.interfaces,
            config.min_interfaces,
            config.min_neighbors,
            config.timeout,
        ));

        let (tx, rx) = mpsc::channel(NEIGHBOR_CHANNEL_DEPTH);
        let mut captures = Vec::new();
        for iface in &config.interfaces {
            match capture::spawn(root, opener, iface, tx.clone()) {
                Ok(handle) => captures.push(handle),
                Err(e) => warn!(log, "skipping interface";
                    "iface" => iface, "error" => %e),
            }
        }
        info!(log, "discovery started";
            "interfaces" => captures.len(),
            "skipped" => config.interfaces.len() - captures.len(),
            "timeout" => ?registry.timeout());

        let aggregator = tokio::task::spawn(registry::aggregate(
            root.new(slog::o!("unit" => "aggregator")),
            registry.clone(),
            rx,
        ));

        Session {
            log,
            registry,
            captures,
            aggregator,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Interfaces with a running capture task.
    pub fn active_interfaces(&self) -> Vec<String> {
        self.captures.iter().map(|c| c.iface().to_string()).collect()
    }

    pub async fn wait_for_convergence(&self) -> DiscoveryResult<()> {
        self.registry.wait_for_convergence().await
    }

    /// Stop every capture task and let the aggregator drain.  The registry
    /// remains readable afterward.
    pub async fn shutdown(self) {
        debug!(self.log, "shutting down capture tasks");
        for capture in self.captures {
            capture.shutdown().await;
        }
        let _ = self.aggregator.await;
    }
}
