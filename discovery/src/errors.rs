// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::convert;
use std::time::Duration;

use protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// A raw link could not be set up on an interface.  The interface is
    /// skipped; discovery carries on with the others.
    #[error("failed to open {iface}: {reason}")]
    Open { iface: String, reason: String },
    #[error("read error: {0}")]
    Read(String),
    #[error("LLDP decode error: {0}")]
    Decode(String),
    #[error("LLDP encoding error: {0}")]
    Encoding(String),
    /// The convergence predicate was not satisfied in time.
    #[error("neighbor discovery did not converge within {timeout:?}")]
    DiscoveryTimeout { timeout: Duration },
    #[error("link watcher error: {0}")]
    Watcher(String),
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    #[error("Resource already exists: {0}")]
    Exists(String),
    #[error("No such resource: {0}")]
    Missing(String),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("error: {0}")]
    Other(String),
}

/// Utility function to generate an Open error for an interface
pub fn open_error(iface: &str, reason: impl ToString) -> DiscoveryError {
    DiscoveryError::Open {
        iface: iface.to_string(),
        reason: reason.to_string(),
    }
}

impl convert::From<std::io::Error> for DiscoveryError {
    fn from(err: std::io::Error) -> Self {
        DiscoveryError::Io(err)
    }
}

impl convert::From<ProtocolError> for DiscoveryError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Decode(e) => DiscoveryError::Decode(e),
            ProtocolError::Encoding(e) => DiscoveryError::Encoding(e),
        }
    }
}

impl convert::From<String> for DiscoveryError {
    fn from(err: String) -> Self {
        DiscoveryError::Other(err)
    }
}

impl convert::From<&str> for DiscoveryError {
    fn from(err: &str) -> Self {
        DiscoveryError::Other(err.to_string())
    }
}

impl convert::From<anyhow::Error> for DiscoveryError {
    fn from(err: anyhow::Error) -> Self {
        DiscoveryError::Other(err.to_string())
    }
}

#[test]
fn test_protocol_error_mapping() {
    let e: DiscoveryError = protocol::decode_error("short").into();
    assert!(matches!(e, DiscoveryError::Decode(m) if m == "short"));
    let e: DiscoveryError = protocol::encoding_error("long").into();
    assert!(matches!(e, DiscoveryError::Encoding(m) if m == "long"));
    let e = open_error("eth0", "no such device");
    assert_eq!(e.to_string(), "failed to open eth0: no such device");
}
