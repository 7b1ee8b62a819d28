// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::io::Read;
use std::io::Write;
use std::path::Path;

use nix::libc;
use socket2::Domain;
use socket2::Protocol;
use socket2::SockAddr;
use socket2::Socket;
use socket2::Type;
use tokio::io::unix::AsyncFd;

use crate::errors::open_error;
use crate::errors::DiscoveryError;
use crate::types::DiscoveryResult;
use protocol::packet::ETHER_LLDP;
use protocol::types::LLDP_MULTICAST;
use protocol::MacAddr;

const ETH_P_ALL: u16 = 0x0003;
const SYSFS_NET: &str = "/sys/class/net";

// Classic BPF opcodes, from linux/bpf_common.h
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_H: u16 = 0x08;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

/// Bytes of each accepted frame handed to userspace.
const SNAP_LEN: u32 = 0x40000;

/// A non-blocking AF_PACKET socket bound to a single interface.
pub struct Transport {
    iface: String,
    fd: AsyncFd<Socket>,
}

fn bpf_stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn bpf_jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// Build a filter program accepting only LLDP frames that were not sent from
/// `own`.
///
/// ```text
/// 0: ldh [12]               ; ethertype
/// 1: jeq #0x88cc, 2, 7
/// 2: ld  [8]                ; low four octets of the source mac
/// 3: jeq #own_lo, 4, 6
/// 4: ldh [6]                ; high two octets of the source mac
/// 5: jeq #own_hi, 7, 6
/// 6: ret #SNAP_LEN
/// 7: ret #0
/// ```
pub fn capture_filter(own: MacAddr) -> Vec<libc::sock_filter> {
    let a: [u8; 6] = own.into();
    let own_hi = u32::from(u16::from_be_bytes([a[0], a[1]]));
    let own_lo = u32::from_be_bytes([a[2], a[3], a[4], a[5]]);

    vec![
        bpf_stmt(BPF_LD | BPF_H | BPF_ABS, 12),
        bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, u32::from(ETHER_LLDP), 0, 5),
        bpf_stmt(BPF_LD | BPF_W | BPF_ABS, 8),
        bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, own_lo, 0, 2),
        bpf_stmt(BPF_LD | BPF_H | BPF_ABS, 6),
        bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, own_hi, 1, 0),
        bpf_stmt(BPF_RET | BPF_K, SNAP_LEN),
        bpf_stmt(BPF_RET | BPF_K, 0),
    ]
}

// Build the sockaddr_ll naming an interface and ethertype.
fn link_addr(ifindex: u32, proto: u16) -> std::io::Result<SockAddr> {
    // SAFETY: the storage handed to us is large enough for a sockaddr_ll, and
    // the length we report matches the structure we wrote.
    let ((), addr) = unsafe {
        SockAddr::try_init(|storage, len| {
            let mut sll: libc::sockaddr_ll = std::mem::zeroed();
            sll.sll_family = libc::AF_PACKET as libc::c_ushort;
            sll.sll_protocol = proto.to_be();
            sll.sll_ifindex = ifindex as libc::c_int;
            storage.cast::<libc::sockaddr_ll>().write(sll);
            len.write(
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t
            );
            Ok(())
        })?
    };
    Ok(addr)
}

fn add_membership(
    socket: &Socket,
    ifindex: u32,
    mr_type: libc::c_int,
    addr: Option<MacAddr>,
) -> std::io::Result<()> {
    let mut mreq = libc::packet_mreq {
        mr_ifindex: ifindex as libc::c_int,
        mr_type: mr_type as libc::c_ushort,
        mr_alen: 0,
        mr_address: [0; 8],
    };
    if let Some(mac) = addr {
        mreq.mr_alen = 6;
        mreq.mr_address[..6].copy_from_slice(&mac.to_vec());
    }

    // SAFETY: mreq is a fully initialized packet_mreq, and we pass its exact
    // size.
    let rval = unsafe {
        libc::setsockopt(
            std::os::fd::AsRawFd::as_raw_fd(socket),
            libc::SOL_PACKET,
            libc::PACKET_ADD_MEMBERSHIP,
            (&mreq as *const libc::packet_mreq).cast(),
            std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
        )
    };
    if rval < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

// Create a raw packet socket for `proto` and bind it to the interface.
fn packet_socket(iface: &str, proto: u16) -> DiscoveryResult<(Socket, u32)> {
    let ifindex = nix::net::if_::if_nametoindex(iface)
        .map_err(|e| open_error(iface, format!("interface lookup: {e}")))?;

    let socket = Socket::new(
        Domain::PACKET,
        Type::RAW,
        Some(Protocol::from(i32::from(proto.to_be()))),
    )
    .map_err(|e| open_error(iface, format!("socket: {e}")))?;

    link_addr(ifindex, proto)
        .and_then(|addr| socket.bind(&addr))
        .map_err(|e| open_error(iface, format!("bind: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| open_error(iface, format!("set_nonblocking: {e}")))?;

    Ok((socket, ifindex))
}

impl Transport {
    fn new(iface: &str, socket: Socket) -> DiscoveryResult<Transport> {
        let fd = AsyncFd::new(socket).map_err(|e| {
            open_error(iface, format!("failed to wrap fd for tokio: {e:?}"))
        })?;
        Ok(Transport {
            iface: iface.to_string(),
            fd,
        })
    }

    /// Open a promiscuous socket that sees every LLDP frame on the wire
    /// except those we sent ourselves.
    pub fn open_capture(iface: &str, own: MacAddr) -> DiscoveryResult<Self> {
        let (socket, ifindex) = packet_socket(iface, ETH_P_ALL)?;
        add_membership(&socket, ifindex, libc::PACKET_MR_PROMISC, None)
            .map_err(|e| open_error(iface, format!("promiscuous mode: {e}")))?;
        socket
            .attach_filter(&capture_filter(own))
            .map_err(|e| open_error(iface, format!("capture filter: {e}")))?;
        Transport::new(iface, socket)
    }

    /// Open a socket receiving LLDP frames addressed to the nearest-bridge
    /// group, suitable for both announcing and answering.
    pub fn open_listener(iface: &str) -> DiscoveryResult<Self> {
        let (socket, ifindex) = packet_socket(iface, ETHER_LLDP)?;
        add_membership(
            &socket,
            ifindex,
            libc::PACKET_MR_MULTICAST,
            Some(LLDP_MULTICAST),
        )
        .map_err(|e| open_error(iface, format!("multicast membership: {e}")))?;
        Transport::new(iface, socket)
    }

    fn read_error(&self, e: std::io::Error) -> DiscoveryError {
        DiscoveryError::Read(format!("{}: {e}", self.iface))
    }

    pub async fn packet_recv(
        &self,
        buf: &mut [u8],
    ) -> DiscoveryResult<(usize, MacAddr)> {
        loop {
            let mut guard = self
                .fd
                .readable()
                .await
                .map_err(|e| self.read_error(e))?;
            let rval = guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(buf)
            });
            match rval {
                Ok(Ok(n)) => {
                    let src = if n >= 12 {
                        MacAddr::from_slice(&buf[6..12])
                    } else {
                        MacAddr::ZERO
                    };
                    return Ok((n, src));
                }
                Ok(Err(e)) => return Err(self.read_error(e)),
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn packet_send(&self, frame: &[u8]) -> DiscoveryResult<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            let rval = guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.write(frame)
            });
            match rval {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Look up an interface's hardware address.
pub fn get_iface_mac(name: &str) -> DiscoveryResult<MacAddr> {
    let addr_file = format!("{SYSFS_NET}/{name}/address");
    let mac = std::fs::read_to_string(addr_file)
        .map_err(|e| open_error(name, format!("reading mac address: {e}")))?;
    mac.trim().parse().map_err(|e| {
        open_error(name, format!("failed to parse mac address {mac}: {e:?}"))
    })
}

/// Every ethernet interface backed by a physical device, sorted by name.
pub fn physical_interfaces() -> DiscoveryResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(SYSFS_NET)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if is_physical_ethernet(&entry.path()) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn is_physical_ethernet(dir: &Path) -> bool {
    let arp_type = std::fs::read_to_string(dir.join("type"))
        .map(|t| t.trim() == "1")
        .unwrap_or(false);
    arp_type && dir.join("device").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Just enough of a classic BPF interpreter to run the capture filter.
    fn run_filter(prog: &[libc::sock_filter], pkt: &[u8]) -> u32 {
        let mut acc = 0u32;
        let mut pc = 0usize;
        loop {
            let insn = prog[pc];
            let k = insn.k as usize;
            match insn.code {
                c if c == BPF_LD | BPF_H | BPF_ABS => {
                    if k + 2 > pkt.len() {
                        return 0;
                    }
                    acc = u32::from(u16::from_be_bytes([pkt[k], pkt[k + 1]]));
                }
                c if c == BPF_LD | BPF_W | BPF_ABS => {
                    if k + 4 > pkt.len() {
                        return 0;
                    }
                    acc = u32::from_be_bytes([
                        pkt[k],
                        pkt[k + 1],
                        pkt[k + 2],
                        pkt[k + 3],
                    ]);
                }
                c if c == BPF_JMP | BPF_JEQ | BPF_K => {
                    let skip = if acc == insn.k { insn.jt } else { insn.jf };
                    pc += skip as usize;
                }
                c if c == BPF_RET | BPF_K => return insn.k,
                c => panic!("unexpected opcode {c:#x}"),
            }
            pc += 1;
        }
    }

    fn frame(src: MacAddr, ethertype: u16) -> Vec<u8> {
        let mut f = LLDP_MULTICAST.to_vec();
        f.extend_from_slice(&src.to_vec());
        f.extend_from_slice(&ethertype.to_be_bytes());
        f.extend_from_slice(&[0u8; 32]);
        f
    }

    #[test]
    fn test_capture_filter() {
        let own = MacAddr::new(0xa8, 0x40, 0x25, 0x10, 0x20, 0x30);
        let peer = MacAddr::new(0x0c, 0xc4, 0x7a, 0x10, 0x20, 0x30);
        let close = MacAddr::new(0xa8, 0x40, 0x25, 0x10, 0x20, 0x31);
        let prog = capture_filter(own);

        assert_eq!(run_filter(&prog, &frame(peer, ETHER_LLDP)), SNAP_LEN);
        assert_eq!(run_filter(&prog, &frame(close, ETHER_LLDP)), SNAP_LEN);
        assert_eq!(run_filter(&prog, &frame(own, ETHER_LLDP)), 0);
        assert_eq!(run_filter(&prog, &frame(peer, 0x0800)), 0);
        assert_eq!(run_filter(&prog, &frame(peer, 0x86dd)), 0);
    }

    #[test]
    fn test_filter_checks_both_halves() {
        // Same low four octets as ours, different vendor prefix.
        let own = MacAddr::new(0xa8, 0x40, 0x25, 0x10, 0x20, 0x30);
        let other = MacAddr::new(0x02, 0x00, 0x25, 0x10, 0x20, 0x30);
        let prog = capture_filter(own);
        assert_eq!(run_filter(&prog, &frame(other, ETHER_LLDP)), SNAP_LEN);
    }
}
