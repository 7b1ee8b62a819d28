// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The seam between the per-interface loops and the operating system's raw
//! sockets.

use std::future::Future;

use protocol::MacAddr;

use crate::types::DiscoveryResult;

#[cfg(target_os = "linux")]
use crate::plat_linux as plat;

/// A layer-2 link carrying whole ethernet frames.
pub trait RawLink: Send + Sync + 'static {
    /// Wait for the next frame, copy it into `buf` and return its length
    /// along with the sender's MAC address.
    fn recv(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = DiscoveryResult<(usize, MacAddr)>> + Send;

    /// Transmit one complete frame.
    fn send(
        &self,
        frame: &[u8],
    ) -> impl Future<Output = DiscoveryResult<()>> + Send;
}

/// Opens the two flavors of raw link on a named interface.  Each returns the
/// link along with the interface's own hardware address.
pub trait LinkOpener: Send + Sync + 'static {
    type Link: RawLink;

    fn open_capture(&self, iface: &str)
        -> DiscoveryResult<(Self::Link, MacAddr)>;

    /// `known_mac`, when the caller already has it, saves looking the
    /// address up again.
    fn open_listener(
        &self,
        iface: &str,
        known_mac: Option<MacAddr>,
    ) -> DiscoveryResult<(Self::Link, MacAddr)>;
}

/// Real AF_PACKET sockets.
#[cfg(target_os = "linux")]
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemLinks;

#[cfg(target_os = "linux")]
impl LinkOpener for SystemLinks {
    type Link = plat::Transport;

    fn open_capture(
        &self,
        iface: &str,
    ) -> DiscoveryResult<(plat::Transport, MacAddr)> {
        let mac = plat::get_iface_mac(iface)?;
        plat::Transport::open_capture(iface, mac).map(|t| (t, mac))
    }

    fn open_listener(
        &self,
        iface: &str,
        known_mac: Option<MacAddr>,
    ) -> DiscoveryResult<(plat::Transport, MacAddr)> {
        let mac = match known_mac {
            Some(mac) => mac,
            None => plat::get_iface_mac(iface)?,
        };
        plat::Transport::open_listener(iface).map(|t| (t, mac))
    }
}

#[cfg(target_os = "linux")]
impl RawLink for plat::Transport {
    async fn recv(&self, buf: &mut [u8]) -> DiscoveryResult<(usize, MacAddr)> {
        self.packet_recv(buf).await
    }

    async fn send(&self, frame: &[u8]) -> DiscoveryResult<()> {
        self.packet_send(frame).await
    }
}
