//! Beacon ("server is up") datagram codec.
//!
//! ```text
//! header:    command=13  data_type=minor revision  element_count=TCP port
//!            cid=beacon counter  available=server IPv4 address (0 = any)
//! extension: [magic "IPv6":4][block_size:4][address:16][scope_id:4]
//! ```
//! The extension is carried as the message payload, padded to 8 bytes, so
//! receivers that do not know it skip it like any other payload.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::codec::{decode_message, encode_message, read_u32, ProtocolError};
use crate::protocol::messages::{Command, Header, MINOR_PROTOCOL_REVISION};

/// Magic tag of the IPv6 extension block.
pub const IPV6_EXTENSION_MAGIC: [u8; 4] = *b"IPv6";

/// Unpadded length of the IPv6 extension block.
pub const IPV6_EXTENSION_SIZE: usize = 28;

/// One beacon as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    /// Port of the server's TCP listener.
    pub server_port: u16,
    /// Minor protocol revision of the server.
    pub minor_version: u16,
    /// Wrapping beacon counter.
    pub beacon_id: u32,
    /// IPv4 address the server listens on; unspecified means "use the
    /// datagram's source address".
    pub address: Ipv4Addr,
    /// IPv6 address and scope the server listens on, if any.
    pub ipv6: Option<(Ipv6Addr, u32)>,
}

impl Beacon {
    /// A beacon for a server on `server_port` with the current revision.
    pub fn new(server_port: u16, beacon_id: u32) -> Self {
        Self {
            server_port,
            minor_version: MINOR_PROTOCOL_REVISION,
            beacon_id,
            address: Ipv4Addr::UNSPECIFIED,
            ipv6: Some((Ipv6Addr::UNSPECIFIED, 0)),
        }
    }

    /// Encodes the datagram.
    pub fn encode(&self) -> Vec<u8> {
        let header = Header::new(Command::RsrvIsUp)
            .with_data_type(self.minor_version)
            .with_element_count(u32::from(self.server_port))
            .with_cid(self.beacon_id)
            .with_available(u32::from(self.address));

        match self.ipv6 {
            Some((addr, scope_id)) => {
                let mut ext = Vec::with_capacity(IPV6_EXTENSION_SIZE);
                ext.extend_from_slice(&IPV6_EXTENSION_MAGIC);
                ext.extend_from_slice(&(IPV6_EXTENSION_SIZE as u32).to_be_bytes());
                ext.extend_from_slice(&addr.octets());
                ext.extend_from_slice(&scope_id.to_be_bytes());
                encode_message(&header, &ext)
            }
            None => encode_message(&header, &[]),
        }
    }

    /// Decodes a beacon datagram.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownCommand`] for any other command and
    /// [`ProtocolError::MalformedPayload`] for a damaged extension block.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (header, payload, _) = decode_message(bytes, false)?;
        if header.kind() != Some(Command::RsrvIsUp) {
            return Err(ProtocolError::UnknownCommand(header.command));
        }

        let ipv6 = if payload.len() >= IPV6_EXTENSION_SIZE && payload[0..4] == IPV6_EXTENSION_MAGIC {
            let size = read_u32(payload, 4)? as usize;
            if size != IPV6_EXTENSION_SIZE {
                return Err(ProtocolError::MalformedPayload(format!(
                    "IPv6 extension block of {size} bytes"
                )));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&payload[8..24]);
            Some((Ipv6Addr::from(octets), read_u32(payload, 24)?))
        } else {
            None
        };

        Ok(Self {
            server_port: header.element_count as u16,
            minor_version: header.data_type,
            beacon_id: header.cid,
            address: Ipv4Addr::from(header.available),
            ipv6,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_header_fields() {
        // Arrange
        let beacon = Beacon::new(5064, 41);

        // Act
        let bytes = beacon.encode();

        // Assert
        assert_eq!(&bytes[0..2], &[0, 13]);
        assert_eq!(&bytes[4..6], &MINOR_PROTOCOL_REVISION.to_be_bytes());
        assert_eq!(&bytes[6..8], &5064u16.to_be_bytes());
        assert_eq!(&bytes[8..12], &41u32.to_be_bytes());
        assert_eq!(&bytes[16..20], b"IPv6");
        assert_eq!(bytes.len(), 16 + 32);
    }

    #[test]
    fn test_beacon_decodes_extension() {
        let mut beacon = Beacon::new(6000, u32::MAX);
        beacon.ipv6 = Some(("fe80::1".parse().unwrap(), 3));
        assert_eq!(Beacon::decode(&beacon.encode()).unwrap(), beacon);
    }

    #[test]
    fn test_beacon_without_extension_decodes() {
        let mut beacon = Beacon::new(5064, 1);
        beacon.ipv6 = None;
        beacon.address = Ipv4Addr::new(10, 0, 0, 5);
        let bytes = beacon.encode();
        assert_eq!(bytes.len(), 16);
        assert_eq!(Beacon::decode(&bytes).unwrap(), beacon);
    }

    #[test]
    fn test_decode_rejects_other_commands() {
        let bytes = encode_message(&Header::new(Command::Echo), &[]);
        assert_eq!(Beacon::decode(&bytes), Err(ProtocolError::UnknownCommand(23)));
    }

    #[test]
    fn test_decode_rejects_bad_extension_size() {
        let mut bytes = Beacon::new(5064, 1).encode();
        bytes[23] = 99;
        assert!(matches!(
            Beacon::decode(&bytes),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }
}
