// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Mac address type and logic.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A [MAC Address] type: a transparent wrapper around `[u8; 6]`.
///
/// [MAC Address]: https://en.wikipedia.org/wiki/MAC_address
#[must_use]
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mac(pub [u8; 6]);

impl Mac {
    /// The zero `Mac`, illegal as a source or destination in most contexts.
    pub const ZERO: Mac = Mac([0; 6]);

    /// The raw octets of the address.
    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Returns true iff the least significant bit of the first octet is one.
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 == 0x01
    }

    /// Returns true iff the binary representation is exclusively zeros.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self == &Mac::ZERO
    }

    /// Multicast and zero are not legal source addresses.
    #[must_use]
    pub fn is_valid_src(&self) -> bool {
        !self.is_zero() && !self.is_multicast()
    }
}

impl From<[u8; 6]> for Mac {
    fn from(value: [u8; 6]) -> Self {
        Mac(value)
    }
}

impl From<Mac> for [u8; 6] {
    fn from(value: Mac) -> Self {
        value.0
    }
}

impl Display for Mac {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// An error which may occur when parsing a [`Mac`] from text.
#[derive(Debug, thiserror::Error)]
#[error("invalid mac address: {0}")]
pub struct InvalidMac(String);

impl FromStr for Mac {
    type Err = InvalidMac;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = input.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(|| InvalidMac(input.to_string()))?;
            *octet =
                u8::from_str_radix(part, 16).map_err(|_| InvalidMac(input.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(InvalidMac(input.to_string()));
        }
        Ok(Mac(octets))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let mac: Mac = "52:54:00:12:34:56".parse().unwrap();
        assert_eq!(mac.octets(), [0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        assert_eq!(mac.to_string(), "52:54:00:12:34:56");
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("52:54:00:12:34".parse::<Mac>().is_err());
        assert!("52:54:00:12:34:56:78".parse::<Mac>().is_err());
        assert!("52:54:00:12:34:zz".parse::<Mac>().is_err());
    }

    #[test]
    fn source_validity() {
        assert!(!Mac::ZERO.is_valid_src());
        assert!(!Mac([0x01, 0, 0, 0, 0, 1]).is_valid_src());
        assert!(Mac([0x52, 0x54, 0, 0, 0, 1]).is_valid_src());
    }
}
