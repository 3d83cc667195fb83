//! IPv6 extension headers captured from ancillary data
//!
//! A flow label may carry extension headers that are merged into every
//! packet sent with it. They arrive as a buffer of control messages (cmsg)
//! appended to the flow-label request and are parsed here into an
//! [`Ip6TxOptions`] set.
//!
//! # Control Message Layout (64-bit)
//!
//! ```text
//! +----------------+-----------+----------+-------------------+---------+
//! | cmsg_len (u64) | level i32 | type i32 | data (len - 16)   | padding |
//! +----------------+-----------+----------+-------------------+---------+
//!                                                  ^ next record 8-aligned
//! ```
//!
//! Only `SOL_IPV6` records are interpreted, records of other levels are
//! skipped. Hop-by-hop and destination options require `CAP_NET_RAW`.
//!
//! # Fragmentable vs Non-Fragmentable
//!
//! Hop-by-hop options, destination options placed before the routing header
//! and the routing header itself form the non-fragmentable part
//! (`opt_nflen`). Destination options after the routing header are
//! fragmentable (`opt_flen`).

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::flowlabel::CallerCtx;
use crate::netns::NetNamespace;

// ============================================================================
// Constants
// ============================================================================

/// Socket option level for IPv6.
pub const SOL_IPV6: i32 = 41;

pub const IPV6_FLOWINFO: i32 = 11;
pub const IPV6_PKTINFO: i32 = 50;
pub const IPV6_HOPLIMIT: i32 = 52;
pub const IPV6_HOPOPTS: i32 = 54;
pub const IPV6_RTHDRDSTOPTS: i32 = 55;
pub const IPV6_RTHDR: i32 = 57;
pub const IPV6_DSTOPTS: i32 = 59;
pub const IPV6_DONTFRAG: i32 = 62;
pub const IPV6_TCLASS: i32 = 67;

/// Mobile IPv6 type 2 routing header.
pub const IPV6_SRCRT_TYPE_2: u8 = 2;

/// Size of the fixed cmsg header.
pub const CMSG_HDR_LEN: usize = 16;

/// Alignment of cmsg records.
pub const CMSG_ALIGN_TO: usize = 8;

/// Size of `struct in6_pktinfo`.
const IN6_PKTINFO_LEN: usize = 20;

/// Round `len` up to the cmsg alignment.
#[inline]
pub const fn cmsg_align(len: usize) -> usize {
    (len + CMSG_ALIGN_TO - 1) & !(CMSG_ALIGN_TO - 1)
}

// ============================================================================
// Errors
// ============================================================================

/// Ancillary data parsing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtHdrError {
    /// Record header or payload runs past the buffer
    Truncated,
    /// Extension header length does not fit the record
    BadLength,
    /// Same extension header supplied twice
    Duplicate,
    /// Unsupported routing header type or inconsistent segments
    BadRoutingHeader,
    /// Integer option outside its range
    BadValue,
    /// Unknown SOL_IPV6 record type
    UnknownType(i32),
    /// Caller lacks CAP_NET_RAW for raw option headers
    PermissionDenied,
}

// ============================================================================
// Captured Options
// ============================================================================

/// One raw extension header, including its two-byte prefix.
pub type ExtHdr = Arc<[u8]>;

/// Extension headers attached to outgoing packets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ip6TxOptions {
    /// Hop-by-hop options
    pub hopopt: Option<ExtHdr>,
    /// Destination options before the routing header
    pub dst0opt: Option<ExtHdr>,
    /// Routing header
    pub srcrt: Option<ExtHdr>,
    /// Destination options after the routing header
    pub dst1opt: Option<ExtHdr>,
    /// Length of the non-fragmentable part
    pub opt_nflen: u32,
    /// Length of the fragmentable part
    pub opt_flen: u32,
}

impl Ip6TxOptions {
    /// Total option bytes.
    pub fn total_len(&self) -> u32 {
        self.opt_nflen + self.opt_flen
    }

    /// No header captured at all.
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }
}

/// Combine a label's options with the socket's own options.
///
/// The label supplies the non-fragmentable headers; the socket options
/// supply the fragmentable destination options. When the socket has no
/// fragmentable part the label's options are used unchanged.
pub fn merge_tx_options(
    fl_opt: Option<&Arc<Ip6TxOptions>>,
    sock_opt: Option<&Arc<Ip6TxOptions>>,
) -> Option<Arc<Ip6TxOptions>> {
    let fopt = match sock_opt {
        Some(fopt) if fopt.opt_flen != 0 => fopt,
        _ => return fl_opt.cloned(),
    };

    let mut merged = match fl_opt {
        Some(fl) => Ip6TxOptions {
            hopopt: fl.hopopt.clone(),
            dst0opt: fl.dst0opt.clone(),
            srcrt: fl.srcrt.clone(),
            opt_nflen: fl.opt_nflen,
            ..Ip6TxOptions::default()
        },
        None => {
            if fopt.opt_nflen == 0 {
                return Some(fopt.clone());
            }
            Ip6TxOptions::default()
        }
    };
    merged.dst1opt = fopt.dst1opt.clone();
    merged.opt_flen = fopt.opt_flen;
    Some(Arc::new(merged))
}

// ============================================================================
// Control Message Iteration
// ============================================================================

/// One decoded control message.
#[derive(Debug, Clone, Copy)]
pub struct Cmsg<'a> {
    pub level: i32,
    pub ty: i32,
    pub data: &'a [u8],
}

/// Iterator over the records of a control buffer.
pub struct CmsgIter<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> CmsgIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }
}

impl<'a> Iterator for CmsgIter<'a> {
    type Item = Result<Cmsg<'a>, ExtHdrError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }
        if self.buf.len() < CMSG_HDR_LEN {
            self.failed = true;
            return Some(Err(ExtHdrError::Truncated));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&self.buf[0..8]);
        let cmsg_len = u64::from_ne_bytes(len_bytes);
        let level = i32::from_ne_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]);
        let ty = i32::from_ne_bytes([self.buf[12], self.buf[13], self.buf[14], self.buf[15]]);

        let cmsg_len = match usize::try_from(cmsg_len) {
            Ok(len) if len >= CMSG_HDR_LEN && len <= self.buf.len() => len,
            _ => {
                self.failed = true;
                return Some(Err(ExtHdrError::Truncated));
            }
        };

        let data = &self.buf[CMSG_HDR_LEN..cmsg_len];
        let advance = cmsg_align(cmsg_len).min(self.buf.len());
        self.buf = &self.buf[advance..];

        Some(Ok(Cmsg { level, ty, data }))
    }
}

/// Append one control message to `out`, padded to the record alignment.
pub fn push_cmsg(out: &mut Vec<u8>, level: i32, ty: i32, data: &[u8]) {
    let cmsg_len = CMSG_HDR_LEN + data.len();
    out.extend_from_slice(&(cmsg_len as u64).to_ne_bytes());
    out.extend_from_slice(&level.to_ne_bytes());
    out.extend_from_slice(&ty.to_ne_bytes());
    out.extend_from_slice(data);
    out.resize(out.len() + (cmsg_align(cmsg_len) - cmsg_len), 0);
}

// ============================================================================
// Parser
// ============================================================================

/// Parser turning ancillary data into captured extension headers.
///
/// The socket layer calls this while building a flow-label candidate.
pub trait AncillaryParser: Send + Sync {
    fn capture(
        &self,
        netns: &NetNamespace,
        ctx: &CallerCtx,
        control: &[u8],
    ) -> Result<Ip6TxOptions, ExtHdrError>;
}

/// Default parser for the SOL_IPV6 records relevant to flow labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ip6CmsgParser;

/// Validate a generic option header and return its on-wire copy.
fn option_header(data: &[u8]) -> Result<ExtHdr, ExtHdrError> {
    if data.len() < 2 {
        return Err(ExtHdrError::Truncated);
    }
    let len = (data[1] as usize + 1) << 3;
    if data.len() < len {
        return Err(ExtHdrError::BadLength);
    }
    Ok(Arc::from(&data[..len]))
}

/// Validate a routing header (type 2 only).
fn routing_header(data: &[u8]) -> Result<ExtHdr, ExtHdrError> {
    if data.len() < 4 {
        return Err(ExtHdrError::Truncated);
    }
    let (hdrlen, rt_type, segments_left) = (data[1], data[2], data[3]);
    if rt_type != IPV6_SRCRT_TYPE_2 || hdrlen != 2 || segments_left != 1 {
        return Err(ExtHdrError::BadRoutingHeader);
    }
    if (hdrlen >> 1) != segments_left {
        return Err(ExtHdrError::BadRoutingHeader);
    }
    let len = (hdrlen as usize + 1) << 3;
    if data.len() < len {
        return Err(ExtHdrError::BadLength);
    }
    Ok(Arc::from(&data[..len]))
}

/// Validate a 4-byte integer option within `min..=max`.
fn int_option(data: &[u8], min: i32, max: i32) -> Result<(), ExtHdrError> {
    if data.len() != 4 {
        return Err(ExtHdrError::BadLength);
    }
    let v = i32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
    if v < min || v > max {
        return Err(ExtHdrError::BadValue);
    }
    Ok(())
}

impl AncillaryParser for Ip6CmsgParser {
    fn capture(
        &self,
        _netns: &NetNamespace,
        ctx: &CallerCtx,
        control: &[u8],
    ) -> Result<Ip6TxOptions, ExtHdrError> {
        let mut opt = Ip6TxOptions::default();

        for cmsg in CmsgIter::new(control) {
            let cmsg = cmsg?;
            if cmsg.level != SOL_IPV6 {
                continue;
            }

            match cmsg.ty {
                IPV6_HOPOPTS => {
                    if opt.hopopt.is_some() {
                        return Err(ExtHdrError::Duplicate);
                    }
                    if !ctx.cap_net_raw {
                        return Err(ExtHdrError::PermissionDenied);
                    }
                    let hdr = option_header(cmsg.data)?;
                    opt.opt_nflen += hdr.len() as u32;
                    opt.hopopt = Some(hdr);
                }
                IPV6_DSTOPTS | IPV6_RTHDRDSTOPTS => {
                    if !ctx.cap_net_raw {
                        return Err(ExtHdrError::PermissionDenied);
                    }
                    let hdr = option_header(cmsg.data)?;
                    if cmsg.ty == IPV6_DSTOPTS {
                        if opt.dst1opt.is_some() {
                            return Err(ExtHdrError::Duplicate);
                        }
                        opt.opt_flen += hdr.len() as u32;
                        opt.dst1opt = Some(hdr);
                    } else {
                        if opt.dst0opt.is_some() {
                            return Err(ExtHdrError::Duplicate);
                        }
                        opt.opt_nflen += hdr.len() as u32;
                        opt.dst0opt = Some(hdr);
                    }
                }
                IPV6_RTHDR => {
                    if opt.srcrt.is_some() {
                        return Err(ExtHdrError::Duplicate);
                    }
                    let hdr = routing_header(cmsg.data)?;
                    opt.opt_nflen += hdr.len() as u32;
                    opt.srcrt = Some(hdr);
                }
                IPV6_PKTINFO => {
                    if cmsg.data.len() < IN6_PKTINFO_LEN {
                        return Err(ExtHdrError::BadLength);
                    }
                }
                IPV6_HOPLIMIT | IPV6_TCLASS => int_option(cmsg.data, -1, 0xff)?,
                IPV6_DONTFRAG => int_option(cmsg.data, i32::MIN, i32::MAX)?,
                IPV6_FLOWINFO => {
                    if cmsg.data.len() < 4 {
                        return Err(ExtHdrError::BadLength);
                    }
                }
                other => return Err(ExtHdrError::UnknownType(other)),
            }
        }

        Ok(opt)
    }
}

// ============================================================================
// Tests
// ============================================================================
