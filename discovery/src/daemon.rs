// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Announce this host to its neighbors.
//!
//! The daemon runs one task per interface.  In broadcast mode the task sends
//! our LLDPDU to the nearest-bridge group on a fixed interval.  In passive
//! mode it stays quiet until it hears an LLDPDU, and then answers it.  Either
//! way the frame for an interface is built once and reused until the
//! interface goes away.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use slog::debug;
use slog::error;
use slog::info;
use slog::trace;
use slog::warn;
use slog::Logger;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::capture::READ_RETRY_DELAY;
use crate::errors::DiscoveryError;
use crate::link::LinkOpener;
use crate::link::RawLink;
#[cfg(target_os = "linux")]
use crate::link::SystemLinks;
use crate::types::DiscoveryResult;
use crate::types::InterfaceMsg;
use crate::types::LinkEvent;
use protocol::LinkIdentifier;
use protocol::Lldpdu;
use protocol::MacAddr;
use protocol::LLDP_MULTICAST;

pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);

/// Standard 30 second transmit interval times a hold multiplier of 4.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// Advertised until the node has been allocated and installed.
pub const DEFAULT_SYSTEM_DESCRIPTION: &str = "waiting for allocation";

// Interfaces that never face a switch port.
const VIRTUAL_PREFIXES: &[&str] =
    &["lo", "docker", "veth", "virbr", "br-", "tap", "tun", "vnet"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceMode {
    /// Send unsolicited announcements every `interval`.
    Broadcast { interval: Duration },
    /// Only answer announcements we receive.
    PassiveReply,
}

pub type InterfaceFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type PortDescriptionLookup = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Clone)]
pub struct AnnounceConfig {
    pub mode: AnnounceMode,
    /// Interfaces for which this returns false are never announced on.
    pub interface_filter: InterfaceFilter,
    /// Produces the Port Description TLV for an interface.  An empty string
    /// leaves the TLV out.
    pub port_description: PortDescriptionLookup,
    /// In passive mode, answer the sender directly rather than the group.
    pub reply_unicast: bool,
    /// Announce this address instead of the interface's own.
    pub source_address: Option<MacAddr>,
    pub system_name: String,
    pub system_description: String,
    pub ttl: Duration,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        AnnounceConfig {
            mode: AnnounceMode::Broadcast {
                interval: DEFAULT_ANNOUNCE_INTERVAL,
            },
            interface_filter: Arc::new(default_interface_filter),
            port_description: Arc::new(|_| String::new()),
            reply_unicast: false,
            source_address: None,
            system_name: local_hostname(),
            system_description: DEFAULT_SYSTEM_DESCRIPTION.to_string(),
            ttl: DEFAULT_TTL,
        }
    }
}

impl fmt::Debug for AnnounceConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AnnounceConfig")
            .field("mode", &self.mode)
            .field("reply_unicast", &self.reply_unicast)
            .field("source_address", &self.source_address)
            .field("system_name", &self.system_name)
            .field("system_description", &self.system_description)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl AnnounceConfig {
    /// Refuse settings that would have us transmit back to back.
    pub fn validate(&self) -> DiscoveryResult<()> {
        match self.mode {
            AnnounceMode::Broadcast { interval } if interval.is_zero() => {
                Err(DiscoveryError::Invalid(
                    "announce interval must be non-zero".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Skip loopback and the usual software-only devices.
pub fn default_interface_filter(name: &str) -> bool {
    !name.is_empty() && !VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn local_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|h| h.trim().to_string())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Build the frame announcing this host on `iface`, addressed to the
/// nearest-bridge group.
pub fn build_frame(
    config: &AnnounceConfig,
    iface: &str,
    iface_mac: MacAddr,
) -> DiscoveryResult<Vec<u8>> {
    let mac = config.source_address.unwrap_or(iface_mac);
    let lldpdu = Lldpdu {
        chassis_id: LinkIdentifier::mac(mac),
        port_id: LinkIdentifier::interface_name(iface),
        ttl: u16::try_from(config.ttl.as_secs()).unwrap_or(u16::MAX),
        port_description: (config.port_description)(iface),
        system_name: config.system_name.clone(),
        system_description: config.system_description.clone(),
    };
    Ok(protocol::encode_frame(LLDP_MULTICAST, mac, &lldpdu)?)
}

/// Frames already built for each interface.
#[derive(Debug, Default)]
pub struct FrameCache {
    frames: Mutex<BTreeMap<String, Arc<Vec<u8>>>>,
}

impl FrameCache {
    /// Return the cached frame for `iface`, building it first if needed.  A
    /// failed build leaves nothing behind, so the next call tries again.
    pub fn get_or_build(
        &self,
        iface: &str,
        build: impl FnOnce() -> DiscoveryResult<Vec<u8>>,
    ) -> DiscoveryResult<Arc<Vec<u8>>> {
        let mut frames = self.frames.lock().unwrap();
        if let Some(frame) = frames.get(iface) {
            return Ok(frame.clone());
        }
        let frame = Arc::new(build()?);
        frames.insert(iface.to_string(), frame.clone());
        Ok(frame)
    }

    pub fn remove(&self, iface: &str) {
        self.frames.lock().unwrap().remove(iface);
    }

    pub fn contains(&self, iface: &str) -> bool {
        self.frames.lock().unwrap().contains_key(iface)
    }
}

// Copy of `frame` with the destination rewritten.
fn readdress(frame: &[u8], dst: MacAddr) -> Vec<u8> {
    let mut out = frame.to_vec();
    out[0..6].copy_from_slice(&dst.to_vec());
    out
}

// Everything one interface's task needs.
struct Announcer<L> {
    log: Logger,
    iface: String,
    iface_mac: MacAddr,
    link: L,
    config: Arc<AnnounceConfig>,
    cache: Arc<FrameCache>,
}

impl<L: RawLink> Announcer<L> {
    fn frame(&self) -> DiscoveryResult<Arc<Vec<u8>>> {
        self.cache.get_or_build(&self.iface, || {
            build_frame(&self.config, &self.iface, self.iface_mac)
        })
    }

    // Frames from either of our addresses are our own, looped back.
    fn is_own(&self, src: MacAddr) -> bool {
        src == self.iface_mac || Some(src) == self.config.source_address
    }

    async fn xmit(&self, frame: &[u8]) {
        match self.link.send(frame).await {
            Ok(()) => trace!(self.log, "transmit LLDPDU";
                "dst" => %MacAddr::from_slice(&frame[0..6])),
            Err(e) => error!(self.log, "failed to xmit lldpdu"; "error" => %e),
        }
    }

    async fn broadcast_loop(
        self,
        interval: Duration,
        mut msg_rx: mpsc::Receiver<InterfaceMsg>,
    ) {
        let mut listening = true;
        loop {
            match self.frame() {
                Ok(frame) => self.xmit(&frame).await,
                Err(e) => error!(self.log, "failed to build lldpdu";
                    "error" => %e),
            }

            tokio::select! {
                msg = msg_rx.recv(), if listening => match msg {
                    Some(InterfaceMsg::TimeToGo) => break,
                    None => listening = false,
                },
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn reply_loop(self, mut msg_rx: mpsc::Receiver<InterfaceMsg>) {
        let mut buf = [0u8; 4096];
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
                r = self.link.recv(&mut buf) => r,
            };

            let (n, src) = match rval {
                Ok(r) => r,
                Err(e) => {
                    error!(self.log, "failed to read frame"; "error" => %e);
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                    continue;
                }
            };
            if self.is_own(src) {
                continue;
            }
            if let Err(e) = protocol::decode_frame(&buf[..n]) {
                debug!(self.log, "ignoring frame"; "src" => %src,
                    "error" => %e);
                continue;
            }

            let frame = match self.frame() {
                Ok(frame) => frame,
                Err(e) => {
                    error!(self.log, "failed to build lldpdu"; "error" => %e);
                    continue;
                }
            };
            if self.config.reply_unicast {
                self.xmit(&readdress(&frame, src)).await;
            } else {
                self.xmit(&frame).await;
            }
        }
    }

    async fn run(self, msg_rx: mpsc::Receiver<InterfaceMsg>) {
        debug!(self.log, "interface loop started");
        let log = self.log.clone();
        let mode = self.config.mode;
        match mode {
            AnnounceMode::Broadcast { interval } => {
                self.broadcast_loop(interval, msg_rx).await
            }
            AnnounceMode::PassiveReply => self.reply_loop(msg_rx).await,
        }
        debug!(log, "interface loop shutting down");
    }
}

struct InterfaceTask {
    msg_tx: mpsc::Sender<InterfaceMsg>,
    task: JoinHandle<()>,
}

pub struct Daemon<O: LinkOpener> {
    log: Logger,
    config: Arc<AnnounceConfig>,
    opener: O,
    cache: Arc<FrameCache>,
    interfaces: Mutex<BTreeMap<String, InterfaceTask>>,
}

#[cfg(target_os = "linux")]
impl Daemon<SystemLinks> {
    pub fn new(log: &Logger, config: AnnounceConfig) -> Self {
        Daemon::with_opener(log, config, SystemLinks)
    }
}

impl<O: LinkOpener> Daemon<O> {
    pub fn with_opener(
        log: &Logger,
        config: AnnounceConfig,
        opener: O,
    ) -> Self {
        Daemon {
            log: log.new(slog::o!("unit" => "daemon")),
            config: Arc::new(config),
            opener,
            cache: Arc::new(FrameCache::default()),
            interfaces: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &AnnounceConfig {
        &self.config
    }

    /// Names of the interfaces we are announcing on.
    pub fn interfaces(&self) -> Vec<String> {
        self.interfaces.lock().unwrap().keys().cloned().collect()
    }

    /// Has the frame for `iface` been built?
    pub fn is_cached(&self, iface: &str) -> bool {
        self.cache.contains(iface)
    }

    /// Start announcing on an interface.
    pub fn add_interface(&self, name: &str) -> DiscoveryResult<()> {
        self.start(name, None)
    }

    fn start(
        &self,
        name: &str,
        known_mac: Option<MacAddr>,
    ) -> DiscoveryResult<()> {
        self.config.validate()?;
        if !(self.config.interface_filter)(name) {
            return Err(DiscoveryError::Invalid(format!(
                "interface {name} excluded by filter"
            )));
        }

        let mut interfaces = self.interfaces.lock().unwrap();
        if interfaces.contains_key(name) {
            return Err(DiscoveryError::Exists(format!(
                "interface {name} already added"
            )));
        }

        let (link, iface_mac) = self.opener.open_listener(name, known_mac)?;
        info!(self.log, "Adding interface"; "iface" => name,
            "mac" => %iface_mac);

        let announcer = Announcer {
            log: self.log.new(slog::o!("iface" => name.to_string())),
            iface: name.to_string(),
            iface_mac,
            link,
            config: self.config.clone(),
            cache: self.cache.clone(),
        };
        let (msg_tx, msg_rx) = mpsc::channel(1);
        let task = tokio::task::spawn(announcer.run(msg_rx));
        interfaces.insert(name.to_string(), InterfaceTask { msg_tx, task });
        Ok(())
    }

    /// Stop announcing on an interface and forget its frame.
    pub async fn remove_interface(&self, name: &str) -> DiscoveryResult<()> {
        let entry = self.interfaces.lock().unwrap().remove(name);
        let Some(InterfaceTask { msg_tx, task }) = entry else {
            return Err(DiscoveryError::Missing(format!(
                "no such interface: {name}"
            )));
        };

        info!(self.log, "Shutting down interface"; "iface" => name);
        let _ = msg_tx.send(InterfaceMsg::TimeToGo).await;
        let _ = task.await;
        self.cache.remove(name);
        Ok(())
    }

    /// Announce on each of `names`.  Interfaces that cannot be set up are
    /// logged and skipped.  Returns how many were started.
    pub fn run_static(&self, names: &[String]) -> usize {
        names
            .iter()
            .filter(|name| match self.add_interface(name) {
                Ok(()) => true,
                Err(e) => {
                    warn!(self.log, "skipping interface"; "iface" => *name,
                        "error" => %e);
                    false
                }
            })
            .count()
    }

    /// Follow link events, adding and removing interfaces as they come and
    /// go, until the event channel closes.
    pub async fn run_dynamic(&self, mut events: mpsc::Receiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Added(link) => {
                    if !(self.config.interface_filter)(&link.name) {
                        debug!(self.log, "ignoring filtered interface";
                            "iface" => &link.name);
                        continue;
                    }
                    if let Err(e) = self.start(&link.name, link.mac) {
                        warn!(self.log, "failed to add interface";
                            "iface" => &link.name, "error" => %e);
                    }
                }
                LinkEvent::Removed(link) => {
                    match self.remove_interface(&link.name).await {
                        Ok(()) | Err(DiscoveryError::Missing(_)) => {}
                        Err(e) => warn!(self.log, "failed to remove interface";
                            "iface" => &link.name, "error" => %e),
                    }
                }
            }
        }
        debug!(self.log, "link event channel closed");
    }

    /// Apply the events produced by `watcher` until `shutdown` completes,
    /// then stop the watcher through `stop_tx`.  A watcher that ends first
    /// has lost track of the links, which is an error even if it returned
    /// cleanly.
    pub async fn run_watched<W, S>(
        self: &Arc<Self>,
        events: mpsc::Receiver<LinkEvent>,
        watcher: W,
        stop_tx: mpsc::Sender<InterfaceMsg>,
        shutdown: S,
    ) -> DiscoveryResult<()>
    where
        W: Future<Output = DiscoveryResult<()>> + Send + 'static,
        S: Future<Output = DiscoveryResult<()>>,
    {
        let mut watcher = tokio::task::spawn(watcher);
        let d = self.clone();
        let applier =
            tokio::task::spawn(async move { d.run_dynamic(events).await });

        let (stopped, early) = tokio::select! {
            r = shutdown => (r, None),
            r = &mut watcher => (Ok(()), Some(r)),
        };
        let lost = early.is_some();
        let finished = match early {
            Some(r) => r,
            None => {
                debug!(self.log, "stopping link watcher");
                let _ = stop_tx.send(InterfaceMsg::TimeToGo).await;
                watcher.await
            }
        };
        let _ = applier.await;
        stopped?;

        match finished {
            Ok(Ok(())) if !lost => Ok(()),
            Ok(Ok(())) => Err(DiscoveryError::Watcher(
                "link watcher exited".to_string(),
            )),
            Ok(Err(e)) => {
                error!(self.log, "link watcher failed"; "error" => %e);
                Err(e)
            }
            Err(e) => {
                Err(DiscoveryError::Watcher(format!("link watcher task: {e}")))
            }
        }
    }

    pub async fn shutdown_all(&self) {
        debug!(self.log, "shutting down interface tasks");
        let tasks: Vec<(String, InterfaceTask)> =
            std::mem::take(&mut *self.interfaces.lock().unwrap())
                .into_iter()
                .collect();

        for (_, t) in &tasks {
            let _ = t.msg_tx.send(InterfaceMsg::TimeToGo).await;
        }
        debug!(self.log, "waiting for tasks to exit");
        for (name, t) in tasks {
            let _ = t.task.await;
            self.cache.remove(&name);
        }
    }
}
