// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Follow the kernel's view of network links over rtnetlink.
//!
//! Interfaces on a freshly PXE-booted machine show up whenever their drivers
//! get around to it, so the daemon can't rely on a list taken at startup.
//! The watcher reports each physical ethernet link once when it appears and
//! once when it goes away.

use std::collections::BTreeMap;
use std::io::Read;

use nix::libc;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use slog::Logger;
use socket2::Domain;
use socket2::Protocol;
use socket2::SockAddr;
use socket2::Socket;
use socket2::Type;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use crate::capture::READ_RETRY_DELAY;
use crate::errors::DiscoveryError;
use crate::types::DiscoveryResult;
use crate::types::InterfaceMsg;
use crate::types::Link;
use crate::types::LinkEvent;
use protocol::MacAddr;

// From linux/netlink.h and linux/rtnetlink.h
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_GETLINK: u16 = 18;
const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_DUMP: u16 = 0x300;
const RTMGRP_LINK: u32 = 0x1;

// From linux/if_link.h
const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_LINKINFO: u16 = 18;
const IFLA_INFO_KIND: u16 = 1;
const NLA_TYPE_MASK: u16 = 0x3fff;

const ARPHRD_ETHER: u16 = 1;

const NLMSG_HDRLEN: usize = 16;
const IFINFOMSG_LEN: usize = 16;
const RTA_HDRLEN: usize = 4;

const RECV_BUF_SIZE: usize = 32768;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn ne_u16(data: &[u8]) -> u16 {
    u16::from_ne_bytes([data[0], data[1]])
}

fn ne_u32(data: &[u8]) -> u32 {
    u32::from_ne_bytes([data[0], data[1], data[2], data[3]])
}

/// What we care about in an RTM_NEWLINK or RTM_DELLINK message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LinkInfo {
    pub index: u32,
    pub link_type: u16,
    pub name: Option<String>,
    pub mac: Option<MacAddr>,
    /// Set for virtual devices: "bridge", "vlan", "bond", "veth", ...
    pub kind: Option<String>,
}

impl LinkInfo {
    fn is_physical_ethernet(&self) -> bool {
        self.link_type == ARPHRD_ETHER && self.kind.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LinkMessage {
    New(LinkInfo),
    Del(LinkInfo),
    Done,
    Error(i32),
    Other(u16),
}

fn nl_string(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .to_string()
}

// Split a run of rtattrs into (type, payload) pairs.
fn parse_attrs(data: &[u8]) -> Result<Vec<(u16, &[u8])>, String> {
    let mut attrs = Vec::new();
    let mut offset = 0;
    while offset + RTA_HDRLEN <= data.len() {
        let len = ne_u16(&data[offset..]) as usize;
        let rta_type = ne_u16(&data[offset + 2..]) & NLA_TYPE_MASK;
        if len < RTA_HDRLEN || offset + len > data.len() {
            return Err(format!(
                "bad attribute length {len} at offset {offset}"
            ));
        }
        attrs.push((rta_type, &data[offset + RTA_HDRLEN..offset + len]));
        offset += align4(len);
    }
    Ok(attrs)
}

fn parse_link(payload: &[u8]) -> Result<LinkInfo, String> {
    if payload.len() < IFINFOMSG_LEN {
        return Err(format!("ifinfomsg too short: {} bytes", payload.len()));
    }

    let mut info = LinkInfo {
        index: ne_u32(&payload[4..]),
        link_type: ne_u16(&payload[2..]),
        name: None,
        mac: None,
        kind: None,
    };
    for (attr, data) in parse_attrs(&payload[IFINFOMSG_LEN..])? {
        match attr {
            IFLA_IFNAME => info.name = Some(nl_string(data)),
            IFLA_ADDRESS if data.len() == 6 => {
                info.mac = Some(MacAddr::from_slice(data))
            }
            IFLA_LINKINFO => {
                info.kind = parse_attrs(data)?
                    .into_iter()
                    .find(|(a, _)| *a == IFLA_INFO_KIND)
                    .map(|(_, kind)| nl_string(kind));
            }
            _ => {}
        }
    }
    Ok(info)
}

/// Parse every netlink message in a datagram.  A message whose header is
/// damaged ends the walk, since the ones after it can't be located.
pub(crate) fn parse_messages(buf: &[u8]) -> Vec<Result<LinkMessage, String>> {
    let mut msgs = Vec::new();
    let mut offset = 0;
    while offset + NLMSG_HDRLEN <= buf.len() {
        let len = ne_u32(&buf[offset..]) as usize;
        let msg_type = ne_u16(&buf[offset + 4..]);
        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            msgs.push(Err(format!(
                "bad message length {len} at offset {offset}"
            )));
            break;
        }

        let payload = &buf[offset + NLMSG_HDRLEN..offset + len];
        msgs.push(match msg_type {
            RTM_NEWLINK => parse_link(payload).map(LinkMessage::New),
            RTM_DELLINK => parse_link(payload).map(LinkMessage::Del),
            NLMSG_DONE => Ok(LinkMessage::Done),
            NLMSG_ERROR if payload.len() >= 4 => {
                Ok(LinkMessage::Error(ne_u32(payload) as i32))
            }
            NLMSG_ERROR => Err("truncated error message".to_string()),
            t => Ok(LinkMessage::Other(t)),
        });
        offset += align4(len);
    }
    msgs
}

/// An RTM_GETLINK request asking for every link the kernel knows about.
pub(crate) fn dump_request(seq: u32) -> Vec<u8> {
    let len = (NLMSG_HDRLEN + IFINFOMSG_LEN) as u32;
    let mut req = Vec::with_capacity(len as usize);
    req.extend_from_slice(&len.to_ne_bytes());
    req.extend_from_slice(&RTM_GETLINK.to_ne_bytes());
    req.extend_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
    req.extend_from_slice(&seq.to_ne_bytes());
    req.extend_from_slice(&0u32.to_ne_bytes());
    // ifi_family = AF_UNSPEC, everything else zero
    req.extend_from_slice(&[0u8; IFINFOMSG_LEN]);
    req
}

/// The set of links already reported, keyed by interface index.
#[derive(Debug, Default)]
pub(crate) struct LinkTracker {
    known: BTreeMap<u32, Link>,
}

impl LinkTracker {
    /// Fold one message into the known set, returning the event to report,
    /// if any.
    pub(crate) fn apply(&mut self, msg: LinkMessage) -> Option<LinkEvent> {
        match msg {
            LinkMessage::New(info) => {
                if !info.is_physical_ethernet()
                    || self.known.contains_key(&info.index)
                {
                    return None;
                }
                let link = Link {
                    index: info.index,
                    name: info.name?,
                    mac: info.mac,
                };
                self.known.insert(link.index, link.clone());
                Some(LinkEvent::Added(link))
            }
            LinkMessage::Del(info) => {
                self.known.remove(&info.index).map(LinkEvent::Removed)
            }
            _ => None,
        }
    }
}

// Build a sockaddr_nl for the given multicast groups.  With no groups this
// addresses the kernel.
fn netlink_addr(groups: u32) -> std::io::Result<SockAddr> {
    // SAFETY: the storage handed to us is large enough for a sockaddr_nl, and
    // the length we report matches the structure we wrote.
    let ((), addr) = unsafe {
        SockAddr::try_init(|storage, len| {
            let mut snl: libc::sockaddr_nl = std::mem::zeroed();
            snl.nl_family = libc::AF_NETLINK as libc::sa_family_t;
            snl.nl_groups = groups;
            storage.cast::<libc::sockaddr_nl>().write(snl);
            len.write(
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t
            );
            Ok(())
        })?
    };
    Ok(addr)
}

pub struct InterfaceWatcher {
    log: Logger,
    fd: AsyncFd<Socket>,
}

fn watcher_error(what: &str, e: std::io::Error) -> DiscoveryError {
    DiscoveryError::Watcher(format!("{what}: {e}"))
}

impl InterfaceWatcher {
    /// Subscribe to link notifications.  Failure here is the one error the
    /// dynamic daemon can't work around.
    pub fn new(log: &Logger) -> DiscoveryResult<Self> {
        let socket = Socket::new(
            Domain::from(libc::AF_NETLINK),
            Type::RAW,
            Some(Protocol::from(libc::NETLINK_ROUTE)),
        )
        .map_err(|e| watcher_error("netlink socket", e))?;
        netlink_addr(RTMGRP_LINK)
            .and_then(|addr| socket.bind(&addr))
            .map_err(|e| watcher_error("netlink bind", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| watcher_error("set_nonblocking", e))?;
        let fd = AsyncFd::new(socket)
            .map_err(|e| watcher_error("wrapping fd for tokio", e))?;

        Ok(InterfaceWatcher {
            log: log.new(slog::o!("unit" => "watcher")),
            fd,
        })
    }

    async fn send_request(&self, req: &[u8]) -> std::io::Result<()> {
        let kernel = netlink_addr(0)?;
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(req, &kernel)) {
                Ok(r) => return r.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let rval = guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(buf)
            });
            match rval {
                Ok(r) => return r,
                Err(_would_block) => continue,
            }
        }
    }

    /// Report the links that exist now, then every change after that, until
    /// told to stop or until nobody is listening.
    pub async fn run(
        self,
        tx: mpsc::Sender<LinkEvent>,
        mut msg_rx: mpsc::Receiver<InterfaceMsg>,
    ) -> DiscoveryResult<()> {
        self.send_request(&dump_request(1))
            .await
            .map_err(|e| watcher_error("link dump request", e))?;
        debug!(self.log, "watching for link changes");

        let mut tracker = LinkTracker::default();
        let mut buf = vec![0u8; RECV_BUF_SIZE];
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
                r = self.recv(&mut buf) => r,
            };

            let n = match rval {
                Ok(n) => n,
                Err(e) => {
                    error!(self.log, "netlink read failed"; "error" => %e);
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                    continue;
                }
            };

            for msg in parse_messages(&buf[..n]) {
                let msg = match msg {
                    Ok(LinkMessage::Error(errno)) if errno != 0 => {
                        warn!(self.log, "netlink error"; "errno" => -errno);
                        continue;
                    }
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(self.log, "skipping malformed message";
                            "error" => e);
                        continue;
                    }
                };
                let Some(event) = tracker.apply(msg) else {
                    continue;
                };
                info!(self.log, "link event"; "event" => ?event);
                if tx.send(event).await.is_err() {
                    debug!(self.log, "link event channel closed");
                    return Ok(());
                }
            }
        }
        debug!(self.log, "watcher shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(rta_type: u16, data: &[u8]) -> Vec<u8> {
        let len = (RTA_HDRLEN + data.len()) as u16;
        let mut a = Vec::new();
        a.extend_from_slice(&len.to_ne_bytes());
        a.extend_from_slice(&rta_type.to_ne_bytes());
        a.extend_from_slice(data);
        a.resize(align4(a.len()), 0);
        a
    }

    fn ifinfo(link_type: u16, index: u32, attrs: &[Vec<u8>]) -> Vec<u8> {
        let mut p = vec![0u8, 0];
        p.extend_from_slice(&link_type.to_ne_bytes());
        p.extend_from_slice(&index.to_ne_bytes());
        p.extend_from_slice(&[0u8; 8]);
        for a in attrs {
            p.extend_from_slice(a);
        }
        p
    }

    fn nlmsg(msg_type: u16, payload: &[u8]) -> Vec<u8> {
        let len = (NLMSG_HDRLEN + payload.len()) as u32;
        let mut m = Vec::new();
        m.extend_from_slice(&len.to_ne_bytes());
        m.extend_from_slice(&msg_type.to_ne_bytes());
        m.extend_from_slice(&0u16.to_ne_bytes());
        m.extend_from_slice(&7u32.to_ne_bytes());
        m.extend_from_slice(&0u32.to_ne_bytes());
        m.extend_from_slice(payload);
        m.resize(align4(m.len()), 0);
        m
    }

    fn ether_link(msg_type: u16, index: u32, name: &str) -> Vec<u8> {
        nlmsg(
            msg_type,
            &ifinfo(
                ARPHRD_ETHER,
                index,
                &[
                    attr(IFLA_IFNAME, format!("{name}\0").as_bytes()),
                    attr(IFLA_ADDRESS, &[0xa8, 0x40, 0x25, 0, 0, index as u8]),
                ],
            ),
        )
    }

    fn virtual_link(index: u32, name: &str, kind: &str) -> Vec<u8> {
        let linkinfo = attr(IFLA_INFO_KIND, kind.as_bytes());
        nlmsg(
            RTM_NEWLINK,
            &ifinfo(
                ARPHRD_ETHER,
                index,
                &[
                    attr(IFLA_IFNAME, format!("{name}\0").as_bytes()),
                    // the kernel marks this attribute as nested
                    attr(IFLA_LINKINFO | 0x8000, &linkinfo),
                ],
            ),
        )
    }

    #[test]
    fn test_parse_newlink() {
        let buf = ether_link(RTM_NEWLINK, 2, "eno1");
        let msgs = parse_messages(&buf);
        assert_eq!(
            msgs,
            vec![Ok(LinkMessage::New(LinkInfo {
                index: 2,
                link_type: ARPHRD_ETHER,
                name: Some("eno1".to_string()),
                mac: Some(MacAddr::new(0xa8, 0x40, 0x25, 0, 0, 2)),
                kind: None,
            }))]
        );
    }

    #[test]
    fn test_parse_batch() {
        let mut buf = ether_link(RTM_NEWLINK, 2, "eno1");
        buf.extend(virtual_link(5, "br0", "bridge"));
        buf.extend(nlmsg(NLMSG_DONE, &0u32.to_ne_bytes()));

        let msgs = parse_messages(&buf);
        assert_eq!(msgs.len(), 3);
        match &msgs[1] {
            Ok(LinkMessage::New(info)) => {
                assert_eq!(info.kind.as_deref(), Some("bridge"));
                assert!(!info.is_physical_ethernet());
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(msgs[2], Ok(LinkMessage::Done));
    }

    #[test]
    fn test_parse_malformed() {
        // header claims more than we have
        let mut buf = ether_link(RTM_NEWLINK, 2, "eno1");
        buf.truncate(buf.len() - 4);
        let msgs = parse_messages(&buf);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].is_err());

        // payload too short to be an ifinfomsg
        let buf = nlmsg(RTM_NEWLINK, &[0u8; 8]);
        assert!(parse_messages(&buf)[0].is_err());

        // attribute running off the end of the message
        let mut payload = ifinfo(ARPHRD_ETHER, 3, &[]);
        payload.extend_from_slice(&64u16.to_ne_bytes());
        payload.extend_from_slice(&IFLA_IFNAME.to_ne_bytes());
        let mut buf = nlmsg(RTM_NEWLINK, &payload);
        // a good message after the bad one is still seen
        buf.extend(ether_link(RTM_NEWLINK, 4, "eno2"));
        let msgs = parse_messages(&buf);
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].is_err());
        assert!(msgs[1].is_ok());

        // never panics on short garbage
        for len in 0..NLMSG_HDRLEN + 4 {
            let _ = parse_messages(&vec![0xffu8; len]);
        }
    }

    #[test]
    fn test_parse_error_message() {
        let buf = nlmsg(NLMSG_ERROR, &(-105i32).to_ne_bytes());
        assert_eq!(parse_messages(&buf), vec![Ok(LinkMessage::Error(-105))]);
    }

    #[test]
    fn test_tracker() {
        let mut tracker = LinkTracker::default();
        let mut events = Vec::new();
        let mut feed = |buf: Vec<u8>| {
            for msg in parse_messages(&buf).into_iter().flatten() {
                events.extend(tracker.apply(msg));
            }
        };

        feed(ether_link(RTM_NEWLINK, 2, "eno1"));
        // link flags changing produce another NEWLINK for the same index
        feed(ether_link(RTM_NEWLINK, 2, "eno1"));
        feed(virtual_link(5, "br0", "bridge"));
        feed(nlmsg(
            RTM_NEWLINK,
            &ifinfo(772, 1, &[attr(IFLA_IFNAME, b"lo\0")]),
        ));
        feed(ether_link(RTM_NEWLINK, 3, "eno2"));
        feed(ether_link(RTM_DELLINK, 2, "eno1"));
        feed(ether_link(RTM_DELLINK, 5, "br0"));
        feed(ether_link(RTM_NEWLINK, 2, "eno1"));

        let names: Vec<String> = events
            .iter()
            .map(|e| match e {
                LinkEvent::Added(l) => format!("+{}", l.name),
                LinkEvent::Removed(l) => format!("-{}", l.name),
            })
            .collect();
        assert_eq!(names, vec!["+eno1", "+eno2", "-eno1", "+eno1"]);
    }

    #[test]
    fn test_dump_request() {
        let req = dump_request(9);
        assert_eq!(req.len(), 32);
        assert_eq!(ne_u32(&req[0..]), 32);
        assert_eq!(ne_u16(&req[4..]), RTM_GETLINK);
        assert_eq!(ne_u16(&req[6..]), NLM_F_REQUEST | NLM_F_DUMP);
        assert_eq!(ne_u32(&req[8..]), 9);
    }
}
