// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Wire-level support for LLDP: MAC addresses, Ethernet framing, and the
//! subset of IEEE 802.1AB TLVs used for neighbor discovery.

pub mod macaddr;
pub mod packet;
pub mod types;

pub use macaddr::MacAddr;
pub use types::decode;
pub use types::decode_frame;
pub use types::encode;
pub use types::encode_frame;
pub use types::LinkIdentifier;
pub use types::LinkIdentifierKind;
pub use types::Lldpdu;
pub use types::LLDP_MULTICAST;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The data handed to the decoder is not a usable LLDPDU.
    #[error("decode error: {0}")]
    Decode(String),
    /// An outgoing LLDPDU could not be represented on the wire.
    #[error("encoding error: {0}")]
    Encoding(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Utility function to generate a Decode error
pub fn decode_error(message: impl ToString) -> ProtocolError {
    ProtocolError::Decode(message.to_string())
}

/// Utility function to generate an Encoding error
pub fn encoding_error(message: impl ToString) -> ProtocolError {
    ProtocolError::Encoding(message.to_string())
}
