//! IPv6 flow-label entries
//!
//! This module defines the data side of the flow-label manager:
//!
//! - [`FlowLabel`]: one interned label with its sharing policy, owner,
//!   destination, captured extension headers and lifetime bookkeeping
//! - [`FlowLabelCandidate`]: a label being built by a GET request, not yet
//!   visible in the registry
//! - [`FlowLabelRef`]: a counted reference; dropping it releases the entry
//! - [`FlowLabelReq`]: the fixed 32-byte request record exchanged with the
//!   socket option boundary
//! - [`FlowLabelError`]: the error taxonomy and its errno mapping
//!
//! # Reference Counting
//!
//! `Arc` keeps the memory of an entry alive for as long as anyone can reach
//! it. The logical number of holders lives in a separate `users` counter:
//! lookups may only bump it from a non-zero value, so an entry that dropped
//! to zero can only be revived by the registry while it holds its write lock.

use alloc::sync::Arc;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::exthdr::{ExtHdrError, Ip6TxOptions};
use crate::fltable::FlowLabelTable;
use crate::ipv6::{Ipv6Addr, Ipv6Error, IPV6_FLOWLABEL_MASK};
use crate::netns::NetNsId;

// ============================================================================
// Constants
// ============================================================================

/// Size of the request record (`struct in6_flowlabel_req`).
pub const FLOWLABEL_REQ_LEN: usize = 32;

/// Offset of the label inside the request record.
pub const FLOWLABEL_REQ_LABEL_OFFSET: usize = 16;

pub type Pid = u32;
pub type Uid = u32;

// ============================================================================
// Error Types
// ============================================================================

/// Flow-label operation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowLabelError {
    /// Malformed request, options, destination or flag combination
    InvalidArgument,
    /// Stateless label bit used while state ranges are enforced
    OutOfRange,
    /// Exclusive GET hit an existing label
    AlreadyExists,
    /// No matching label
    NotFound,
    /// Reflect state missing on PUT
    NoSuchState,
    /// Sharing policy or privilege check failed
    PermissionDenied,
    /// Reflect requested on a socket that cannot reflect
    ProtocolMismatch,
    /// Admission cap reached
    ResourceExhausted,
    /// Allocation failure
    OutOfMemory,
    /// The namespace has been torn down
    NamespaceExited,
}

impl FlowLabelError {
    /// Convert to a negative errno value.
    pub fn to_errno(&self) -> i32 {
        match self {
            FlowLabelError::InvalidArgument => -22,   // EINVAL
            FlowLabelError::OutOfRange => -34,        // ERANGE
            FlowLabelError::AlreadyExists => -17,     // EEXIST
            FlowLabelError::NotFound => -2,           // ENOENT
            FlowLabelError::NoSuchState => -3,        // ESRCH
            FlowLabelError::PermissionDenied => -1,   // EPERM
            FlowLabelError::ProtocolMismatch => -92,  // ENOPROTOOPT
            FlowLabelError::ResourceExhausted => -105, // ENOBUFS
            FlowLabelError::OutOfMemory => -12,       // ENOMEM
            FlowLabelError::NamespaceExited => -6,    // ENXIO
        }
    }
}

impl From<ExtHdrError> for FlowLabelError {
    fn from(e: ExtHdrError) -> Self {
        match e {
            ExtHdrError::PermissionDenied => FlowLabelError::PermissionDenied,
            _ => FlowLabelError::InvalidArgument,
        }
    }
}

impl From<Ipv6Error> for FlowLabelError {
    fn from(_: Ipv6Error) -> Self {
        FlowLabelError::InvalidArgument
    }
}

// ============================================================================
// Sharing Policy
// ============================================================================

/// Who besides the creator may attach to a label.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowLabelShare {
    /// No policy; only meaningful for administrative RENEW
    None = 0,
    /// Nobody else
    Exclusive = 1,
    /// Sockets of the creating process
    Process = 2,
    /// Sockets of the creating user
    User = 3,
    /// Anybody
    Any = 255,
}

impl FlowLabelShare {
    /// Try to convert from the raw request code.
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(FlowLabelShare::None),
            1 => Some(FlowLabelShare::Exclusive),
            2 => Some(FlowLabelShare::Process),
            3 => Some(FlowLabelShare::User),
            255 => Some(FlowLabelShare::Any),
            _ => None,
        }
    }

    /// Get the raw request code.
    pub fn to_raw(self) -> u8 {
        self as u8
    }
}

/// Identity captured for process/user scoped labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowLabelOwner {
    None,
    Process(Pid),
    User(Uid),
}

impl FlowLabelOwner {
    /// Raw owner id (0 when unowned).
    pub fn id(&self) -> u32 {
        match self {
            FlowLabelOwner::None => 0,
            FlowLabelOwner::Process(pid) => *pid,
            FlowLabelOwner::User(uid) => *uid,
        }
    }
}

// ============================================================================
// Caller Context
// ============================================================================

/// Credentials of the task issuing a flow-label request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerCtx {
    /// Process ID, recorded for process-scoped labels.
    pub pid: Pid,
    /// Effective user ID, recorded for user-scoped labels.
    pub euid: Uid,
    /// CAP_NET_ADMIN: linger above the maximum, admission bypass, admin renew.
    pub cap_net_admin: bool,
    /// CAP_NET_RAW: raw hop-by-hop / destination options.
    pub cap_net_raw: bool,
}

impl CallerCtx {
    /// Unprivileged caller.
    pub const fn user(pid: Pid, euid: Uid) -> Self {
        Self {
            pid,
            euid,
            cap_net_admin: false,
            cap_net_raw: false,
        }
    }

    /// Caller holding CAP_NET_ADMIN and CAP_NET_RAW.
    pub const fn admin(pid: Pid, euid: Uid) -> Self {
        Self {
            pid,
            euid,
            cap_net_admin: true,
            cap_net_raw: true,
        }
    }
}

// ============================================================================
// Request Record
// ============================================================================

/// Request action codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowLabelAction {
    Get = 0,
    Put = 1,
    Renew = 2,
}

impl FlowLabelAction {
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(FlowLabelAction::Get),
            1 => Some(FlowLabelAction::Put),
            2 => Some(FlowLabelAction::Renew),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Request flags.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FlowLabelFlags: u16 {
        /// Create the label if it does not exist.
        const CREATE = 0x01;
        /// Fail if the label already exists.
        const EXCL = 0x02;
        /// Toggle reflect mode instead of managing a label.
        const REFLECT = 0x04;
        /// Query the label last received from the peer.
        const REMOTE = 0x08;
    }
}

/// Flow-label request record.
///
/// # Layout
///
/// ```text
/// 0        16       20     21     22      24       26      28    32
/// +--------+--------+------+------+-------+--------+-------+-----+
/// |  dst   | label  |action|share | flags |expires |linger | pad |
/// +--------+--------+------+------+-------+--------+-------+-----+
/// ```
///
/// `label` is big-endian, the 16-bit fields are host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowLabelReq {
    pub dst: Ipv6Addr,
    pub label: u32,
    pub action: u8,
    pub share: u8,
    pub flags: u16,
    pub expires: u16,
    pub linger: u16,
}

impl FlowLabelReq {
    /// Request for `action` on `label`.
    pub fn new(action: FlowLabelAction, label: u32) -> Self {
        Self {
            label,
            action: action as u8,
            ..Self::default()
        }
    }

    pub fn with_dst(mut self, dst: Ipv6Addr) -> Self {
        self.dst = dst;
        self
    }

    pub fn with_share(mut self, share: FlowLabelShare) -> Self {
        self.share = share.to_raw();
        self
    }

    pub fn with_flags(mut self, flags: FlowLabelFlags) -> Self {
        self.flags = flags.bits();
        self
    }

    pub fn with_linger(mut self, secs: u16) -> Self {
        self.linger = secs;
        self
    }

    pub fn with_expires(mut self, secs: u16) -> Self {
        self.expires = secs;
        self
    }

    /// Decoded flags; unknown bits are ignored.
    pub fn flags(&self) -> FlowLabelFlags {
        FlowLabelFlags::from_bits_truncate(self.flags)
    }

    /// Decoded action.
    pub fn action(&self) -> Result<FlowLabelAction, FlowLabelError> {
        FlowLabelAction::from_raw(self.action).ok_or(FlowLabelError::InvalidArgument)
    }

    /// Parse a request record, returning it and the trailing ancillary data.
    pub fn parse(buf: &[u8]) -> Result<(Self, &[u8]), FlowLabelError> {
        if buf.len() < FLOWLABEL_REQ_LEN {
            return Err(FlowLabelError::InvalidArgument);
        }

        let mut dst = [0u8; 16];
        dst.copy_from_slice(&buf[0..16]);
        let req = Self {
            dst: Ipv6Addr(dst),
            label: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
            action: buf[20],
            share: buf[21],
            flags: u16::from_ne_bytes([buf[22], buf[23]]),
            expires: u16::from_ne_bytes([buf[24], buf[25]]),
            linger: u16::from_ne_bytes([buf[26], buf[27]]),
        };
        Ok((req, &buf[FLOWLABEL_REQ_LEN..]))
    }

    /// Serialize the request record.
    pub fn to_bytes(&self) -> [u8; FLOWLABEL_REQ_LEN] {
        let mut out = [0u8; FLOWLABEL_REQ_LEN];
        out[0..16].copy_from_slice(&self.dst.0);
        out[16..20].copy_from_slice(&self.label.to_be_bytes());
        out[20] = self.action;
        out[21] = self.share;
        out[22..24].copy_from_slice(&self.flags.to_ne_bytes());
        out[24..26].copy_from_slice(&self.expires.to_ne_bytes());
        out[26..28].copy_from_slice(&self.linger.to_ne_bytes());
        out
    }

    /// Write a chosen label back into a caller's request buffer.
    pub fn write_label(buf: &mut [u8], label: u32) {
        if let Some(slot) =
            buf.get_mut(FLOWLABEL_REQ_LABEL_OFFSET..FLOWLABEL_REQ_LABEL_OFFSET + 4)
        {
            slot.copy_from_slice(&label.to_be_bytes());
        }
    }
}

// ============================================================================
// Lifetime Bookkeeping
// ============================================================================

/// Mutable part of an entry, guarded by the entry lock.
#[derive(Debug, Clone)]
pub(crate) struct FlowLabelTimes {
    /// Minimum time to keep the entry after its last release (ms)
    pub(crate) linger_ms: u64,
    /// Absolute deadline after which an unreferenced entry may go (ms)
    pub(crate) expires_ms: u64,
    /// Last time the entry was touched (ms)
    pub(crate) lastuse_ms: u64,
    /// Captured extension headers
    pub(crate) opt: Option<Arc<Ip6TxOptions>>,
}

impl FlowLabelTimes {
    /// Extend linger and expiry. Never shortens either value.
    ///
    /// `linger_ms` and `expires_ms` are relative durations already
    /// validated against the configured bounds.
    pub(crate) fn renew(&mut self, linger_ms: u64, expires_ms: u64, now_ms: u64) {
        self.lastuse_ms = now_ms;
        if self.linger_ms < linger_ms {
            self.linger_ms = linger_ms;
        }
        let expires_ms = expires_ms.max(self.linger_ms);
        let deadline = self.lastuse_ms.saturating_add(expires_ms);
        if self.expires_ms < deadline {
            self.expires_ms = deadline;
        }
    }

    /// Fold `lastuse + linger` into the expiry and return the deadline.
    pub(crate) fn settle_deadline(&mut self) -> u64 {
        let ttd = self.lastuse_ms.saturating_add(self.linger_ms);
        if ttd > self.expires_ms {
            self.expires_ms = ttd;
        }
        self.expires_ms
    }
}

// ============================================================================
// Candidate
// ============================================================================

/// A label built from a GET request, not yet interned.
///
/// Dropping a candidate frees its captured options; the registry never
/// owns a candidate that lost an interning race.
#[derive(Debug)]
pub struct FlowLabelCandidate {
    pub(crate) netns: NetNsId,
    pub(crate) share: FlowLabelShare,
    pub(crate) owner: FlowLabelOwner,
    pub(crate) dst: Ipv6Addr,
    pub(crate) times: FlowLabelTimes,
}

impl FlowLabelCandidate {
    /// Start a candidate whose expiry is `now_ms`.
    pub fn new(
        netns: NetNsId,
        share: FlowLabelShare,
        owner: FlowLabelOwner,
        dst: Ipv6Addr,
        opt: Option<Arc<Ip6TxOptions>>,
        now_ms: u64,
    ) -> Self {
        Self {
            netns,
            share,
            owner,
            dst,
            times: FlowLabelTimes {
                linger_ms: 0,
                expires_ms: now_ms,
                lastuse_ms: 0,
                opt,
            },
        }
    }

    /// Apply the requested linger/expiry (validated, in ms).
    pub fn renew(&mut self, linger_ms: u64, expires_ms: u64, now_ms: u64) {
        self.times.renew(linger_ms, expires_ms, now_ms);
    }

    pub fn share(&self) -> FlowLabelShare {
        self.share
    }

    pub fn owner(&self) -> FlowLabelOwner {
        self.owner
    }

    pub fn linger_ms(&self) -> u64 {
        self.times.linger_ms
    }

    pub fn expires_ms(&self) -> u64 {
        self.times.expires_ms
    }

    /// Exclusive or option-carrying labels force transmit-time ownership
    /// checks in their namespace.
    pub fn forces_ownership(&self) -> bool {
        self.share == FlowLabelShare::Exclusive || self.times.opt.is_some()
    }

    pub(crate) fn into_entry(mut self, label: u32, now_ms: u64) -> FlowLabel {
        self.times.lastuse_ms = now_ms;
        FlowLabel {
            label,
            netns: self.netns,
            share: self.share,
            owner: self.owner,
            dst: self.dst,
            forces_ownership: self.forces_ownership(),
            users: AtomicU32::new(1),
            times: Mutex::new(self.times),
        }
    }
}

// ============================================================================
// Flow Label Entry
// ============================================================================

/// An interned flow label.
pub struct FlowLabel {
    /// 20-bit label, never 0 once interned
    label: u32,
    netns: NetNsId,
    share: FlowLabelShare,
    owner: FlowLabelOwner,
    dst: Ipv6Addr,
    /// Counted in the registry's exclusive tally
    forces_ownership: bool,
    /// Live holders (bindings + transient lookups)
    users: AtomicU32,
    times: Mutex<FlowLabelTimes>,
}

impl fmt::Debug for FlowLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowLabel")
            .field("label", &format_args!("{:05x}", self.label))
            .field("netns", &self.netns)
            .field("share", &self.share)
            .field("owner", &self.owner)
            .field("users", &self.users.load(Ordering::Relaxed))
            .finish()
    }
}

impl FlowLabel {
    #[inline]
    pub fn label(&self) -> u32 {
        self.label
    }

    #[inline]
    pub fn netns(&self) -> NetNsId {
        self.netns
    }

    #[inline]
    pub fn share(&self) -> FlowLabelShare {
        self.share
    }

    #[inline]
    pub fn owner(&self) -> FlowLabelOwner {
        self.owner
    }

    #[inline]
    pub fn dst(&self) -> Ipv6Addr {
        self.dst
    }

    /// Current number of holders.
    #[inline]
    pub fn users(&self) -> u32 {
        self.users.load(Ordering::Acquire)
    }

    pub fn linger_ms(&self) -> u64 {
        self.times.lock().linger_ms
    }

    pub fn expires_ms(&self) -> u64 {
        self.times.lock().expires_ms
    }

    pub fn lastuse_ms(&self) -> u64 {
        self.times.lock().lastuse_ms
    }

    /// Captured extension headers, if any remain.
    pub fn options(&self) -> Option<Arc<Ip6TxOptions>> {
        self.times.lock().opt.clone()
    }

    /// Exclusive or created with options.
    pub fn forces_ownership(&self) -> bool {
        self.forces_ownership
    }

    pub(crate) fn times(&self) -> spin::MutexGuard<'_, FlowLabelTimes> {
        self.times.lock()
    }

    /// Take a reference only if somebody else still holds one.
    pub(crate) fn hold_not_zero(&self) -> bool {
        self.users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                (u != 0).then(|| u + 1)
            })
            .is_ok()
    }

    /// Take a reference unconditionally.
    ///
    /// Only valid under the registry write lock or while already holding
    /// a reference.
    pub(crate) fn hold(&self) {
        self.users.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference if it is not the last one.
    pub(crate) fn put_not_last(&self) -> bool {
        self.users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                (u > 1).then(|| u - 1)
            })
            .is_ok()
    }

    /// Drop one reference, returning the previous count.
    ///
    /// `None` means the count was already zero and nothing was dropped.
    pub(crate) fn put(&self) -> Option<u32> {
        self.users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| u.checked_sub(1))
            .ok()
    }

    pub(crate) fn touch(&self, now_ms: u64) {
        self.times.lock().lastuse_ms = now_ms;
    }

    /// Whether a candidate's requester may attach to this entry.
    pub fn shareable_with(&self, cand: &FlowLabelCandidate) -> bool {
        if self.share == FlowLabelShare::Exclusive || self.share != cand.share {
            return false;
        }
        match (self.share, self.owner, cand.owner) {
            (FlowLabelShare::Process, a, b) | (FlowLabelShare::User, a, b) => a == b,
            _ => true,
        }
    }

    /// Merge a candidate's lifetime into this entry (max of both).
    pub(crate) fn merge_times(&self, cand: &FlowLabelCandidate) {
        let mut times = self.times.lock();
        if cand.times.linger_ms > times.linger_ms {
            times.linger_ms = cand.times.linger_ms;
        }
        if cand.times.expires_ms > times.expires_ms {
            times.expires_ms = cand.times.expires_ms;
        }
    }

    /// Entry matches `(netns, label)`.
    #[inline]
    pub(crate) fn matches(&self, netns: NetNsId, label: u32) -> bool {
        self.label == label && self.netns == netns
    }
}

// ============================================================================
// Counted Reference
// ============================================================================

/// A counted hold on a [`FlowLabel`].
///
/// Obtained from registry lookups, interning and socket binding lookups.
/// Dropping the reference releases it; the last release starts the linger
/// period and arms garbage collection.
pub struct FlowLabelRef {
    table: Arc<FlowLabelTable>,
    fl: Arc<FlowLabel>,
}

impl FlowLabelRef {
    /// Wrap a reference the caller has already counted.
    pub(crate) fn adopt(table: Arc<FlowLabelTable>, fl: Arc<FlowLabel>) -> Self {
        Self { table, fl }
    }

    /// Underlying shared entry.
    pub fn entry(&self) -> &Arc<FlowLabel> {
        &self.fl
    }

    /// Registry the entry lives in.
    pub fn table(&self) -> &Arc<FlowLabelTable> {
        &self.table
    }

    /// Same underlying entry.
    pub fn same_entry(&self, other: &FlowLabelRef) -> bool {
        Arc::ptr_eq(&self.fl, &other.fl)
    }
}

impl Deref for FlowLabelRef {
    type Target = FlowLabel;

    fn deref(&self) -> &FlowLabel {
        &self.fl
    }
}

impl Clone for FlowLabelRef {
    fn clone(&self) -> Self {
        self.fl.hold();
        Self {
            table: self.table.clone(),
            fl: self.fl.clone(),
        }
    }
}

impl Drop for FlowLabelRef {
    fn drop(&mut self) {
        self.table.release(&self.fl);
    }
}

impl fmt::Debug for FlowLabelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.fl, f)
    }
}

/// Reject labels with bits outside the 20-bit range.
#[inline]
pub fn validate_label(label: u32) -> Result<u32, FlowLabelError> {
    if label & !IPV6_FLOWLABEL_MASK != 0 {
        return Err(FlowLabelError::InvalidArgument);
    }
    Ok(label)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(share: FlowLabelShare, owner: FlowLabelOwner) -> FlowLabelCandidate {
        FlowLabelCandidate::new(
            NetNsId::new(1),
            share,
            owner,
            Ipv6Addr::LOCALHOST,
            None,
            1_000,
        )
    }

    #[test]
    fn test_request_layout() {
        let req = FlowLabelReq::new(FlowLabelAction::Renew, 0xabcde)
            .with_dst(Ipv6Addr::LOCALHOST)
            .with_share(FlowLabelShare::Any)
            .with_flags(FlowLabelFlags::CREATE | FlowLabelFlags::EXCL)
            .with_linger(30)
            .with_expires(40);
        let bytes = req.to_bytes();
        assert_eq!(bytes[15], 1);
        assert_eq!(&bytes[16..20], &[0x00, 0x0a, 0xbc, 0xde]);
        assert_eq!(bytes[20], 2);
        assert_eq!(bytes[21], 255);

        let (parsed, rest) = FlowLabelReq::parse(&bytes).unwrap();
        assert_eq!(parsed, req);
        assert!(rest.is_empty());
        assert_eq!(parsed.action(), Ok(FlowLabelAction::Renew));
        assert_eq!(parsed.flags(), FlowLabelFlags::CREATE | FlowLabelFlags::EXCL);
    }

    #[test]
    fn test_short_request_rejected() {
        assert_eq!(
            FlowLabelReq::parse(&[0u8; 31]),
            Err(FlowLabelError::InvalidArgument)
        );
        let mut req = FlowLabelReq::default();
        req.action = 7;
        assert_eq!(req.action(), Err(FlowLabelError::InvalidArgument));
    }

    #[test]
    fn test_write_label_back() {
        let mut buf = [0u8; FLOWLABEL_REQ_LEN + 8];
        FlowLabelReq::write_label(&mut buf, 0x54321);
        let (req, rest) = FlowLabelReq::parse(&buf).unwrap();
        assert_eq!(req.label, 0x54321);
        assert_eq!(rest.len(), 8);
    }

    #[test]
    fn test_renew_is_monotonic() {
        let mut times = FlowLabelTimes {
            linger_ms: 0,
            expires_ms: 1_000,
            lastuse_ms: 0,
            opt: None,
        };
        times.renew(6_000, 6_000, 1_000);
        assert_eq!(times.linger_ms, 6_000);
        assert_eq!(times.expires_ms, 7_000);

        // Shorter values at a later time keep linger, expiry only grows.
        times.renew(1_000, 1_000, 2_000);
        assert_eq!(times.linger_ms, 6_000);
        assert_eq!(times.expires_ms, 8_000);

        times.renew(20_000, 3_000, 2_000);
        assert_eq!(times.linger_ms, 20_000);
        assert_eq!(times.expires_ms, 22_000);
    }

    #[test]
    fn test_settle_deadline() {
        let mut times = FlowLabelTimes {
            linger_ms: 5_000,
            expires_ms: 2_000,
            lastuse_ms: 10_000,
            opt: None,
        };
        assert_eq!(times.settle_deadline(), 15_000);
        times.lastuse_ms = 0;
        assert_eq!(times.settle_deadline(), 15_000);
    }

    #[test]
    fn test_sharing_rules() {
        let entry = cand(FlowLabelShare::Process, FlowLabelOwner::Process(7)).into_entry(5, 0);
        assert!(entry.shareable_with(&cand(FlowLabelShare::Process, FlowLabelOwner::Process(7))));
        assert!(!entry.shareable_with(&cand(FlowLabelShare::Process, FlowLabelOwner::Process(8))));
        assert!(!entry.shareable_with(&cand(FlowLabelShare::Any, FlowLabelOwner::None)));

        let excl = cand(FlowLabelShare::Exclusive, FlowLabelOwner::None).into_entry(6, 0);
        assert!(!excl.shareable_with(&cand(FlowLabelShare::Exclusive, FlowLabelOwner::None)));
        assert!(excl.forces_ownership());

        let user = cand(FlowLabelShare::User, FlowLabelOwner::User(1000)).into_entry(9, 0);
        assert!(user.shareable_with(&cand(FlowLabelShare::User, FlowLabelOwner::User(1000))));
        assert!(!user.shareable_with(&cand(FlowLabelShare::User, FlowLabelOwner::User(0))));
    }

    #[test]
    fn test_refcount_from_zero_refused() {
        let entry = cand(FlowLabelShare::Any, FlowLabelOwner::None).into_entry(3, 0);
        assert_eq!(entry.users(), 1);
        assert!(!entry.put_not_last());
        assert_eq!(entry.put(), Some(1));
        assert_eq!(entry.put(), None);
        assert!(!entry.hold_not_zero());
        entry.hold();
        assert!(entry.hold_not_zero());
        assert_eq!(entry.users(), 2);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FlowLabelError::InvalidArgument.to_errno(), -22);
        assert_eq!(FlowLabelError::ResourceExhausted.to_errno(), -105);
        assert_eq!(
            FlowLabelError::from(ExtHdrError::PermissionDenied),
            FlowLabelError::PermissionDenied
        );
        assert_eq!(
            FlowLabelError::from(ExtHdrError::BadLength),
            FlowLabelError::InvalidArgument
        );
        assert_eq!(validate_label(0x10_0000), Err(FlowLabelError::InvalidArgument));
        assert_eq!(validate_label(0xf_ffff), Ok(0xf_ffff));
    }
}
