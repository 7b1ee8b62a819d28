// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::errors;
use protocol::LinkIdentifier;
use protocol::LinkIdentifierKind;
use protocol::Lldpdu;
use protocol::MacAddr;

pub type DiscoveryResult<T> = Result<T, errors::DiscoveryError>;

/// A remote system whose advertisement we received on one of our interfaces.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Neighbor {
    pub system_name: String,
    pub system_description: String,
    pub port_description: String,
    /// The local interface the advertisement arrived on.
    pub local_interface: String,
    pub chassis: LinkIdentifier,
    pub port: LinkIdentifier,
    /// Seconds, as advertised.
    pub ttl: u16,
    pub first_seen: DateTime<Utc>,
}

impl Neighbor {
    pub fn from_lldpdu(local_interface: &str, lldpdu: &Lldpdu) -> Self {
        Neighbor {
            system_name: lldpdu.system_name.clone(),
            system_description: lldpdu.system_description.clone(),
            port_description: lldpdu.port_description.clone(),
            local_interface: local_interface.to_string(),
            chassis: lldpdu.chassis_id.clone(),
            port: lldpdu.port_id.clone(),
            ttl: lldpdu.ttl,
            first_seen: Utc::now(),
        }
    }

    pub fn id(&self) -> NeighborId {
        NeighborId {
            chassis: self.chassis.value.clone(),
            port: self.port.value.clone(),
        }
    }

    /// Does this neighbor identify itself by MAC address on both the chassis
    /// and the port?  Only these count toward the convergence quorum.
    pub fn is_mac_identified(&self) -> bool {
        self.chassis.kind == LinkIdentifierKind::MacAddress
            && self.port.kind == LinkIdentifierKind::MacAddress
    }
}

/// Identity of a neighbor across every local interface.  Two advertisements
/// with the same chassis and port values describe the same remote port, no
/// matter which of our interfaces heard them.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NeighborId {
    pub chassis: String,
    pub port: String,
}

/// The item carried from the capture tasks to the aggregator.
#[derive(Clone, Debug)]
pub struct NeighborEvent {
    pub interface: String,
    pub neighbor: Neighbor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceMsg {
    TimeToGo,
}

/// A network interface reported by the link watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mac: Option<MacAddr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Added(Link),
    Removed(Link),
}
