// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Per-interface capture of neighbor advertisements.
//!
//! Each capture task owns one raw link, decodes every LLDP frame it sees and
//! forwards the resulting neighbors to the aggregator.  Nothing here touches
//! the registry directly.

use std::time::Duration;

use slog::debug;
use slog::error;
use slog::info;
use slog::trace;
use slog::Logger;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::link::LinkOpener;
use crate::link::RawLink;
use crate::types::DiscoveryResult;
use crate::types::InterfaceMsg;
use crate::types::Neighbor;
use crate::types::NeighborEvent;

/// How long to back off after a failed read before trying again.
pub const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Handle on a running capture task.  Dropping it leaves the task running.
pub struct CaptureHandle {
    iface: String,
    msg_tx: mpsc::Sender<InterfaceMsg>,
    task: JoinHandle<()>,
}

impl CaptureHandle {
    pub fn iface(&self) -> &str {
        &self.iface
    }

    /// Ask the capture loop to exit and wait for it to do so.
    pub async fn shutdown(self) {
        let _ = self.msg_tx.send(InterfaceMsg::TimeToGo).await;
        let _ = self.task.await;
    }
}

// Turn a single frame into a neighbor, if it describes one.
fn handle_frame(log: &Logger, iface: &str, data: &[u8]) -> Option<Neighbor> {
    let lldpdu = match protocol::decode_frame(data) {
        Ok((_, lldpdu)) => lldpdu,
        Err(e) => {
            debug!(log, "dropping frame"; "error" => %e);
            return None;
        }
    };

    if !lldpdu.has_descriptive_tlv() {
        debug!(log, "dropping lldpdu without descriptive tlvs";
            "chassis" => %lldpdu.chassis_id, "port" => %lldpdu.port_id);
        return None;
    }
    Some(Neighbor::from_lldpdu(iface, &lldpdu))
}

/// Read frames from `link` until told to stop or until the aggregator goes
/// away.  Decode failures and read errors never end the loop.
pub async fn run<L: RawLink>(
    log: Logger,
    link: L,
    iface: String,
    tx: mpsc::Sender<NeighborEvent>,
    mut msg_rx: mpsc::Receiver<InterfaceMsg>,
) {
    debug!(log, "capture loop started");
    let mut buf = [0u8; 4096];
    // If the handle is dropped we just keep going.
    let mut listening = true;

    loop {
        let rval = tokio::select! {
            msg = msg_rx.recv(), if listening => match msg {
                Some(InterfaceMsg::TimeToGo) => break,
                None => {
                    listening = false;
                    continue;
                }
            },
            r = link.recv(&mut buf) => r,
        };

        match rval {
            Ok((n, src)) => {
                trace!(log, "received frame"; "len" => n, "src" => %src);
                let Some(neighbor) = handle_frame(&log, &iface, &buf[..n])
                else {
                    continue;
                };
                let event = NeighborEvent {
                    interface: iface.clone(),
                    neighbor,
                };
                if tx.send(event).await.is_err() {
                    info!(log, "neighbor channel closed");
                    break;
                }
            }
            Err(e) => {
                error!(log, "failed to read frame"; "error" => %e);
                tokio::time::sleep(READ_RETRY_DELAY).await;
            }
        }
    }
    debug!(log, "capture loop shutting down");
}

/// Start a capture task on an already-open link.
pub fn spawn_on<L: RawLink>(
    log: &Logger,
    iface: &str,
    link: L,
    tx: mpsc::Sender<NeighborEvent>,
) -> CaptureHandle {
    let log = log.new(slog::o!(
        "unit" => "capture",
        "iface" => iface.to_string()));
    let (msg_tx, msg_rx) = mpsc::channel(1);
    let task =
        tokio::task::spawn(run(log, link, iface.to_string(), tx, msg_rx));
    CaptureHandle {
        iface: iface.to_string(),
        msg_tx,
        task,
    }
}

/// Open a capture link on `iface` and start reading from it.  An interface
/// that cannot be opened is reported to the caller, which is expected to
/// carry on without it.
pub fn spawn<O: LinkOpener>(
    log: &Logger,
    opener: &O,
    iface: &str,
    tx: mpsc::Sender<NeighborEvent>,
) -> DiscoveryResult<CaptureHandle> {
    let (link, _mac) = opener.open_capture(iface)?;
    Ok(spawn_on(log, iface, link, tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DiscoveryError;
    use crate::link::mem::MemLink;
    use crate::link::mem::MemOpener;
    use hex_literal::hex;
    use protocol::LinkIdentifier;
    use protocol::Lldpdu;
    use protocol::MacAddr;
    use protocol::LLDP_MULTICAST;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn switch_mac() -> MacAddr {
        MacAddr::new(0x0c, 0xc4, 0x7a, 0x01, 0x02, 0x03)
    }

    fn advert(port: &str, system_name: &str) -> Vec<u8> {
        let lldpdu = Lldpdu {
            chassis_id: LinkIdentifier::mac(switch_mac()),
            port_id: LinkIdentifier::interface_name(port),
            ttl: 120,
            port_description: String::new(),
            system_name: system_name.to_string(),
            system_description: String::new(),
        };
        protocol::encode_frame(LLDP_MULTICAST, switch_mac(), &lldpdu).unwrap()
    }

    async fn next(rx: &mut mpsc::Receiver<NeighborEvent>) -> NeighborEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a neighbor")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_capture_emits_neighbor() {
        let (link, peer) = MemLink::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_on(&log(), "eth0", link, tx);

        peer.inject.send(Ok(advert("Ethernet1", "leaf-01"))).unwrap();
        let event = next(&mut rx).await;
        assert_eq!(event.interface, "eth0");
        assert_eq!(event.neighbor.local_interface, "eth0");
        assert_eq!(event.neighbor.system_name, "leaf-01");
        assert_eq!(event.neighbor.chassis, LinkIdentifier::mac(switch_mac()));
        assert_eq!(
            event.neighbor.port,
            LinkIdentifier::interface_name("Ethernet1")
        );
        assert_eq!(event.neighbor.ttl, 120);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_capture_switch_frame() {
        let (link, peer) = MemLink::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_on(&log(), "eno1", link, tx);

        let frame = hex!(
            "0180 c200 000e 0cc4 7a01 0203 88cc"
            "0207 040c c47a 0102 03"
            "0405 0545 7468 31"
            "0602 0078"
            "0a06 6c65 6166 3031"
            "0000"
        );
        peer.inject.send(Ok(frame.to_vec())).unwrap();

        let neighbor = next(&mut rx).await.neighbor;
        assert_eq!(neighbor.chassis, LinkIdentifier::mac(switch_mac()));
        assert_eq!(neighbor.port, LinkIdentifier::interface_name("Eth1"));
        assert_eq!(neighbor.system_name, "leaf01");
        assert_eq!(neighbor.system_description, "");
        assert_eq!(neighbor.ttl, 120);
        assert!(!neighbor.is_mac_identified());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_capture_survives_bad_input() {
        let (link, peer) = MemLink::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_on(&log(), "eth1", link, tx);

        // garbage, a read error, an advertisement with only the mandatory
        // TLVs, then a good one
        peer.inject.send(Ok(vec![0xff; 9])).unwrap();
        peer.inject
            .send(Err(DiscoveryError::Read("eth1: link flap".into())))
            .unwrap();
        peer.inject.send(Ok(advert("Ethernet2", ""))).unwrap();
        peer.inject.send(Ok(advert("Ethernet3", "leaf-02"))).unwrap();

        let event = next(&mut rx).await;
        assert_eq!(
            event.neighbor.port,
            LinkIdentifier::interface_name("Ethernet3")
        );
        assert!(rx.try_recv().is_err());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_capture_stops_when_channel_closes() {
        let (link, peer) = MemLink::new();
        let (tx, rx) = mpsc::channel(1);
        let (_msg_tx, msg_rx) = mpsc::channel(1);
        drop(rx);

        let task = tokio::spawn(run(log(), link, "eth0".into(), tx, msg_rx));
        peer.inject.send(Ok(advert("Ethernet1", "leaf-01"))).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("capture loop did not exit")
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawn_reports_open_failure() {
        let opener = MemOpener::default();
        let (tx, _rx) = mpsc::channel(1);
        match spawn(&log(), &opener, "eth9", tx) {
            Err(DiscoveryError::Open { iface, .. }) => {
                assert_eq!(iface, "eth9")
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("opened a missing interface"),
        }
    }
}
