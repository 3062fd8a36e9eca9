// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! IP prefix type used by the firewall rule compiler.

use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use std::str::FromStr;

/// An IP network in CIDR notation.
///
/// A prefix length of zero means "the whole address family"; the rule
/// compiler renders it as a bare family match instead of a network match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Cidr {
    address: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Create a new [`Cidr`], validating the prefix length against the
    /// address family.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, InvalidCidr> {
        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(InvalidCidr::PrefixTooLong {
                prefix_len,
                max,
            });
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    #[must_use]
    pub fn address(&self) -> IpAddr {
        self.address
    }

    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    #[must_use]
    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }
}

impl Display for Cidr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Errors that can occur when building a [`Cidr`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidCidr {
    #[error("prefix length {prefix_len} exceeds the family maximum {max}")]
    PrefixTooLong { prefix_len: u8, max: u8 },
    #[error("malformed cidr '{0}'")]
    Malformed(String),
}

impl FromStr for Cidr {
    type Err = InvalidCidr;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (addr, len) = input
            .split_once('/')
            .ok_or_else(|| InvalidCidr::Malformed(input.to_string()))?;
        let address: IpAddr = addr
            .parse()
            .map_err(|_| InvalidCidr::Malformed(input.to_string()))?;
        let prefix_len: u8 = len
            .parse()
            .map_err(|_| InvalidCidr::Malformed(input.to_string()))?;
        Cidr::new(address, prefix_len)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn parse_and_display() {
        let cidr: Cidr = "10.0.0.0/24".parse().unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.0/24");
        assert!(cidr.is_ipv4());
        assert_eq!(cidr.prefix_len(), 24);
    }

    #[test]
    fn prefix_length_is_validated_per_family() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("fd00::/64".parse::<Cidr>().is_ok());
        assert!("fd00::/129".parse::<Cidr>().is_err());
    }

    #[test]
    fn zero_prefix_means_whole_family() {
        let cidr: Cidr = "0.0.0.0/0".parse().unwrap();
        assert_eq!(cidr.prefix_len(), 0);
    }
}
