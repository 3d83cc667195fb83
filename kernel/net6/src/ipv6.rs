//! IPv6 addressing and flow-label header word for Zero-OS
//!
//! Only the parts of IPv6 the flow-label manager touches live here:
//!
//! - [`Ipv6Addr`] with the classification needed to validate a label's
//!   destination (unspecified, v4-mapped, multicast, loopback)
//! - The 20-bit flow-label constants
//! - Encoding/decoding of the first 32-bit word of the IPv6 header
//!   (version, traffic class, flow label)
//!
//! # Wire Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version| Traffic Class |           Flow Label                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Labels are kept in host order inside the kernel and always masked with
//! [`IPV6_FLOWLABEL_MASK`] before they are stored, compared or emitted.
//!
//! # References
//! - RFC 8200: Internet Protocol, Version 6
//! - RFC 6437: IPv6 Flow Label Specification

use core::fmt;

// ============================================================================
// Constants
// ============================================================================

/// IPv6 version nibble.
pub const IPV6_VERSION: u8 = 6;

/// Traffic class + flow label bits of the first header word.
pub const IPV6_FLOWINFO_MASK: u32 = 0x0FFF_FFFF;

/// Flow label bits of the first header word.
pub const IPV6_FLOWLABEL_MASK: u32 = 0x000F_FFFF;

/// Top bit of the flow label, reserved for stateless labels when the
/// `flowlabel_state_ranges` sysctl is enabled.
pub const IPV6_FLOWLABEL_STATELESS_FLAG: u32 = 0x0008_0000;

/// Shift of the traffic class inside the first header word.
pub const IPV6_TCLASS_SHIFT: u32 = 20;

/// Fixed IPv6 header length.
pub const IPV6_HEADER_LEN: usize = 40;

// ============================================================================
// Errors
// ============================================================================

/// IPv6 header word decoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6Error {
    /// Fewer than 4 bytes available
    Truncated,
    /// Version nibble is not 6
    BadVersion,
}

// ============================================================================
// IPv6 Address
// ============================================================================

/// IPv6 address (16 bytes, network order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv6Addr(pub [u8; 16]);

impl Ipv6Addr {
    /// All zeros (::)
    pub const UNSPECIFIED: Ipv6Addr = Ipv6Addr([0; 16]);

    /// Loopback (::1)
    pub const LOCALHOST: Ipv6Addr = Ipv6Addr([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

    /// Build from eight 16-bit groups.
    pub const fn new(segs: [u16; 8]) -> Self {
        let mut out = [0u8; 16];
        let mut i = 0;
        while i < 8 {
            out[i * 2] = (segs[i] >> 8) as u8;
            out[i * 2 + 1] = segs[i] as u8;
            i += 1;
        }
        Ipv6Addr(out)
    }

    /// Eight 16-bit groups.
    pub fn segments(&self) -> [u16; 8] {
        let mut segs = [0u16; 8];
        for (i, seg) in segs.iter_mut().enumerate() {
            *seg = u16::from_be_bytes([self.0[i * 2], self.0[i * 2 + 1]]);
        }
        segs
    }

    /// Check if this is the unspecified address (::)
    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Check if this is the loopback address (::1)
    #[inline]
    pub fn is_loopback(&self) -> bool {
        *self == Self::LOCALHOST
    }

    /// Check if this is a multicast address (ff00::/8)
    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] == 0xff
    }

    /// Check if this is an IPv4-mapped address (::ffff:0:0/96)
    #[inline]
    pub fn is_v4_mapped(&self) -> bool {
        self.0[..10] == [0; 10] && self.0[10] == 0xff && self.0[11] == 0xff
    }

    /// Check if this address may be recorded as a flow label destination.
    ///
    /// Mapped IPv4 addresses never carry an IPv6 header of their own and
    /// the unspecified address names no peer; everything else is accepted.
    #[inline]
    pub fn is_valid_flowlabel_dst(&self) -> bool {
        !self.is_unspecified() && !self.is_v4_mapped()
    }
}

impl From<[u16; 8]> for Ipv6Addr {
    fn from(segs: [u16; 8]) -> Self {
        Ipv6Addr::new(segs)
    }
}

/// Uncompressed colon form, e.g. `2001:0db8:0000:...:0001`.
impl fmt::Display for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let segs = self.segments();
        for (i, seg) in segs.iter().enumerate() {
            if i != 0 {
                f.write_str(":")?;
            }
            write!(f, "{:04x}", seg)?;
        }
        Ok(())
    }
}

/// 32 hex digits without separators, as used by the flow-label listing.
impl fmt::LowerHex for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

// ============================================================================
// Header Word
// ============================================================================

/// Mask a label into its 20-bit range.
#[inline]
pub const fn mask_flowlabel(label: u32) -> u32 {
    label & IPV6_FLOWLABEL_MASK
}

/// Build the first IPv6 header word from a traffic class and a label.
///
/// Bits of `label` outside the 20-bit range are dropped.
#[inline]
pub fn build_flow_word(tclass: u8, label: u32) -> [u8; 4] {
    let word = ((IPV6_VERSION as u32) << 28)
        | ((tclass as u32) << IPV6_TCLASS_SHIFT)
        | mask_flowlabel(label);
    word.to_be_bytes()
}

/// Read the raw first header word, checking the version nibble.
fn read_flow_word(hdr: &[u8]) -> Result<u32, Ipv6Error> {
    if hdr.len() < 4 {
        return Err(Ipv6Error::Truncated);
    }
    let word = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
    if (word >> 28) as u8 != IPV6_VERSION {
        return Err(Ipv6Error::BadVersion);
    }
    Ok(word)
}

/// Extract the flow label from an IPv6 header.
#[inline]
pub fn parse_flowlabel(hdr: &[u8]) -> Result<u32, Ipv6Error> {
    read_flow_word(hdr).map(mask_flowlabel)
}

/// Extract traffic class + flow label from an IPv6 header.
#[inline]
pub fn parse_flowinfo(hdr: &[u8]) -> Result<u32, Ipv6Error> {
    read_flow_word(hdr).map(|w| w & IPV6_FLOWINFO_MASK)
}

/// Extract the traffic class from an IPv6 header.
#[inline]
pub fn parse_tclass(hdr: &[u8]) -> Result<u8, Ipv6Error> {
    read_flow_word(hdr).map(|w| ((w & IPV6_FLOWINFO_MASK) >> IPV6_TCLASS_SHIFT) as u8)
}

// ============================================================================
// Tests
// ============================================================================
