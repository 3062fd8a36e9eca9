// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! VXLAN Network Identifier type and the multicast-group derivation used to
//! express cross-host VNI membership.

use std::fmt::{Display, Formatter};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::num::NonZero;

/// A [VXLAN][RFC7348] Network Identifier.
///
/// A 24-bit value designating one overlay network. The all-zero identifier
/// is reserved on the wire and rejected here, which lets `Vni` wrap
/// [`NonZero<u32>`] and keep `Option<Vni>` the size of a `u32`.
///
/// [RFC7348]: https://datatracker.ietf.org/doc/html/rfc7348#section-5
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u32", into = "u32"))]
#[repr(transparent)]
pub struct Vni(NonZero<u32>);

impl Vni {
    /// Smallest identifier usable on the wire (1).
    pub const MIN: u32 = 1;
    /// Largest identifier that fits the 24-bit field (2<sup>24</sup> - 1).
    pub const MAX: u32 = 0x00_FF_FF_FF;

    /// Validate a raw value into a [`Vni`].
    ///
    /// # Errors
    ///
    /// Rejects zero and anything wider than 24 bits.
    pub fn new(value: u32) -> Result<Vni, InvalidVni> {
        if value > Vni::MAX {
            return Err(InvalidVni::OutOfRange(value));
        }
        NonZero::<u32>::new(value).map(Vni).ok_or(InvalidVni::Reserved)
    }

    /// The raw 24-bit value.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.0.get()
    }

    /// The IPv4 multicast group carrying broadcast/unknown/multicast traffic
    /// for this overlay network.
    ///
    /// The VNI's big-endian bytes with the high octet overwritten by 230.
    /// Every result lies in 230.0.0.0/8, clear of the reserved 224.0.0.0/24
    /// and the administratively scoped 239.0.0.0/8 edges.
    #[must_use]
    pub fn multicast_group_v4(self) -> Ipv4Addr {
        let b = self.as_u32().to_be_bytes();
        Ipv4Addr::new(230, b[1], b[2], b[3])
    }

    /// The IPv6 multicast group for this overlay network: `ff` in the first
    /// octet, the VNI's little-endian bytes in octets 12..=15, zero elsewhere.
    #[must_use]
    pub fn multicast_group_v6(self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets[0] = 0xff;
        octets[12..16].copy_from_slice(&self.as_u32().to_le_bytes());
        Ipv6Addr::from(octets)
    }
}

impl Display for Vni {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

impl From<Vni> for u32 {
    fn from(vni: Vni) -> u32 {
        vni.as_u32()
    }
}

impl TryFrom<u32> for Vni {
    type Error = InvalidVni;

    fn try_from(value: u32) -> Result<Vni, Self::Error> {
        Vni::new(value)
    }
}

/// Why a raw value failed [`Vni::new`].
#[must_use]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum InvalidVni {
    /// Zero never names an overlay network.
    #[error("vni 0 is reserved and cannot name an overlay network")]
    Reserved,
    /// Carries the offending value; a vni must fit in 24 bits.
    #[error("vni {0} does not fit in 24 bits (max {max})", max = Vni::MAX)]
    OutOfRange(u32),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_is_rejected_as_reserved() {
        assert_eq!(Vni::new(0).unwrap_err(), InvalidVni::Reserved);
    }

    #[test]
    fn both_ends_of_the_range_are_accepted() {
        assert_eq!(Vni::new(Vni::MIN).unwrap().as_u32(), Vni::MIN);
        assert_eq!(Vni::new(Vni::MAX).unwrap().as_u32(), Vni::MAX);
    }

    #[test]
    fn values_wider_than_24_bits_are_rejected() {
        assert_eq!(
            Vni::new(Vni::MAX + 1).unwrap_err(),
            InvalidVni::OutOfRange(Vni::MAX + 1)
        );
        assert_eq!(
            Vni::new(u32::MAX).unwrap_err(),
            InvalidVni::OutOfRange(u32::MAX)
        );
    }

    #[test]
    fn try_from_goes_through_validation() {
        Vni::try_from(2).expect("2 names a valid overlay network");
        assert!(Vni::try_from(0).is_err());
    }

    #[test]
    fn multicast_group_v4_of_small_vni() {
        let vni = Vni::new(0x10).unwrap();
        assert_eq!(vni.multicast_group_v4(), Ipv4Addr::new(230, 0, 0, 16));
    }

    #[test]
    fn multicast_group_v6_holds_vni_little_endian() {
        let vni = Vni::new(0x0001_0203).unwrap();
        let octets = vni.multicast_group_v6().octets();
        assert_eq!(octets[0], 0xff);
        assert_eq!(&octets[1..12], &[0u8; 11]);
        assert_eq!(&octets[12..16], &[0x03, 0x02, 0x01, 0x00]);
    }

    proptest! {
        #[test]
        fn new_accepts_exactly_the_nonzero_24_bit_range(val in any::<u32>()) {
            match Vni::new(val) {
                Ok(vni) => {
                    assert!((Vni::MIN..=Vni::MAX).contains(&val));
                    assert_eq!(vni.as_u32(), val);
                }
                Err(InvalidVni::Reserved) => assert_eq!(val, 0),
                Err(InvalidVni::OutOfRange(reported)) => {
                    assert_eq!(reported, val);
                    assert!(val > Vni::MAX);
                }
            }
        }

        #[test]
        fn multicast_groups_are_pure_and_in_range(val in Vni::MIN..=Vni::MAX) {
            let vni = Vni::new(val).unwrap();
            let v4 = vni.multicast_group_v4();
            assert_eq!(v4, vni.multicast_group_v4());
            assert_eq!(v4.octets()[0], 230);

            let v6 = vni.multicast_group_v6();
            assert_eq!(v6, vni.multicast_group_v6());
            assert_eq!(v6.octets()[0], 0xff);
            let mut back = [0u8; 4];
            back.copy_from_slice(&v6.octets()[12..16]);
            assert_eq!(u32::from_le_bytes(back), val);
        }
    }
}
