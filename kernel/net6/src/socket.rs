//! IPv6 socket flow-label state
//!
//! Each IPv6 socket keeps the flow labels it has attached in a short
//! binding list, plus the flowinfo word it currently stamps on outgoing
//! packets. The label lifecycle verbs live here:
//!
//! - **GET**: create a label or attach to an existing one
//! - **PUT**: detach a label, or leave reflect mode
//! - **RENEW**: extend linger/expiry of a bound (or, for admins, any) label
//! - **query**: report the label currently in use
//!
//! # Architecture
//!
//! ```text
//! +------------------+     +------------------+     +------------------+
//! |  setsockopt      | --> |  Ip6Sock         | --> |  FlowLabelTable  |
//! |  FLOWLABEL_MGR   |     |  (binding list)  |     |  (registry)      |
//! +------------------+     +------------------+     +------------------+
//!                                  |
//!                                  v
//!                          +------------------+
//!                          |  tx flow word    |
//!                          |  + ext headers   |
//!                          +------------------+
//! ```
//!
//! # Lock Order
//!
//! The binding-list lock may be held while the registry lock is taken
//! (dropping the last reference of an entry), never the other way round.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::mem;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::exthdr::{merge_tx_options, Ip6TxOptions};
use crate::fltable::Interned;
use crate::flowlabel::{
    validate_label, CallerCtx, FlowLabelAction, FlowLabelCandidate, FlowLabelError,
    FlowLabelFlags, FlowLabelOwner, FlowLabelRef, FlowLabelReq, FlowLabelShare,
};
use crate::ipv6::{
    build_flow_word, mask_flowlabel, parse_flowinfo, Ipv6Error, IPV6_FLOWINFO_MASK,
    IPV6_FLOWLABEL_MASK, IPV6_FLOWLABEL_STATELESS_FLAG,
};
use crate::netns::NetNamespace;

/// Next socket identifier, used only for diagnostics
static NEXT_SOCK_ID: AtomicU64 = AtomicU64::new(1);

const MSEC_PER_SEC: u64 = 1000;

// ============================================================================
// Socket Protocol
// ============================================================================

/// Transport protocol of an IPv6 socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ip6Protocol {
    Tcp,
    Udp,
    Raw,
}

impl Ip6Protocol {
    /// Only stream sockets can reflect the peer's label.
    #[inline]
    pub fn is_stream(&self) -> bool {
        matches!(self, Ip6Protocol::Tcp)
    }
}

// ============================================================================
// IPv6 Socket
// ============================================================================

/// Flow-label state of one IPv6 socket.
pub struct Ip6Sock {
    /// Diagnostic identifier
    id: u64,

    netns: Arc<NetNamespace>,

    protocol: Ip6Protocol,

    /// Attached labels, most recent first
    fl_list: Mutex<Vec<FlowLabelRef>>,

    /// Flowinfo stamped on outgoing packets; its label bits are the active
    /// label marker
    flow_label: AtomicU32,

    /// Last flowinfo received from the peer
    rcv_flowinfo: AtomicU32,

    /// Reflect mode: mirror the peer's label
    repflow: AtomicBool,

    /// IPV6_FLOWINFO_SEND: honour flowinfo supplied on connect/send
    sndflow: AtomicBool,

    /// Socket-level extension headers (IPV6_*OPTS sticky options)
    tx_options: Mutex<Option<Arc<Ip6TxOptions>>>,

    /// Teardown has run
    released: AtomicBool,
}

impl fmt::Debug for Ip6Sock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ip6Sock")
            .field("id", &self.id)
            .field("netns", &self.netns.id().raw())
            .field("protocol", &self.protocol)
            .field("labels", &self.binding_count())
            .field("flow_label", &self.flow_label.load(Ordering::Relaxed))
            .field("repflow", &self.repflow.load(Ordering::Relaxed))
            .finish()
    }
}

impl Ip6Sock {
    /// Create a socket in `netns`.
    pub fn new(netns: Arc<NetNamespace>, protocol: Ip6Protocol) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SOCK_ID.fetch_add(1, Ordering::Relaxed),
            netns,
            protocol,
            fl_list: Mutex::new(Vec::new()),
            flow_label: AtomicU32::new(0),
            rcv_flowinfo: AtomicU32::new(0),
            repflow: AtomicBool::new(false),
            sndflow: AtomicBool::new(false),
            tx_options: Mutex::new(None),
            released: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn netns(&self) -> &Arc<NetNamespace> {
        &self.netns
    }

    #[inline]
    pub fn protocol(&self) -> Ip6Protocol {
        self.protocol
    }

    /// Label bits of the flowinfo currently used for transmission.
    #[inline]
    pub fn active_label(&self) -> u32 {
        self.flow_label.load(Ordering::Acquire) & IPV6_FLOWLABEL_MASK
    }

    #[inline]
    pub fn is_reflecting(&self) -> bool {
        self.repflow.load(Ordering::Acquire)
    }

    /// IPV6_FLOWINFO_SEND.
    pub fn set_flowinfo_send(&self, on: bool) {
        self.sndflow.store(on, Ordering::Release);
    }

    /// Install socket-level extension headers.
    pub fn set_tx_options(&self, opt: Option<Arc<Ip6TxOptions>>) {
        *self.tx_options.lock() = opt;
    }

    // ========================================================================
    // Binding List
    // ========================================================================

    /// Number of labels attached to this socket.
    pub fn binding_count(&self) -> usize {
        self.fl_list.lock().len()
    }

    /// Labels attached to this socket, most recent first.
    pub fn bound_labels(&self) -> Vec<u32> {
        self.fl_list.lock().iter().map(|fl| fl.label()).collect()
    }

    /// Find an attached label and take a transient reference on it.
    pub fn find_by_label(&self, label: u32) -> Option<FlowLabelRef> {
        let label = mask_flowlabel(label);
        let list = self.fl_list.lock();
        let bound = list.iter().find(|fl| fl.label() == label)?;
        if !bound.hold_not_zero() {
            return None;
        }
        bound.touch(self.netns.flowlabel_table().now_ms());
        Some(FlowLabelRef::adopt(
            bound.table().clone(),
            bound.entry().clone(),
        ))
    }

    /// Attach a counted reference to this socket.
    ///
    /// On allocation failure the reference is released.
    pub fn link(&self, fl: FlowLabelRef) -> Result<(), FlowLabelError> {
        let mut list = self.fl_list.lock();
        if list.try_reserve(1).is_err() {
            drop(list);
            drop(fl);
            return Err(FlowLabelError::OutOfMemory);
        }
        list.insert(0, fl);
        Ok(())
    }

    /// Detach `label` and release it.
    ///
    /// Clears the active marker if it pointed at the label.
    pub fn unlink_and_release(&self, label: u32) -> Result<(), FlowLabelError> {
        let removed = {
            let mut list = self.fl_list.lock();
            let pos = list
                .iter()
                .position(|fl| fl.label() == label)
                .ok_or(FlowLabelError::NotFound)?;
            if label == self.active_label() {
                self.flow_label
                    .fetch_and(!IPV6_FLOWLABEL_MASK, Ordering::AcqRel);
            }
            list.remove(pos)
        };
        drop(removed);
        Ok(())
    }

    /// Socket teardown hook: release every attached label.
    pub fn release_all(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            klog!(
                Warn,
                "ip6_flowlabel: socket {} released twice",
                self.id
            );
            return;
        }
        let drained = mem::take(&mut *self.fl_list.lock());
        drop(drained);
    }

    // ========================================================================
    // Lifecycle Verbs
    // ========================================================================

    /// Build a candidate from a GET request.
    fn create_candidate(
        &self,
        ctx: &CallerCtx,
        req: &FlowLabelReq,
        control: &[u8],
    ) -> Result<FlowLabelCandidate, FlowLabelError> {
        let table = self.netns.flowlabel_table();
        let config = table.config();

        if control.len() > config.max_opt_len {
            return Err(FlowLabelError::InvalidArgument);
        }
        let opt = if control.is_empty() {
            None
        } else {
            let opt = self
                .netns
                .parser()
                .capture(&self.netns, ctx, control)
                .map_err(|e| {
                    klog!(
                        Info,
                        "ip6_flowlabel: socket {} bad ancillary data: {:?}",
                        self.id,
                        e
                    );
                    FlowLabelError::from(e)
                })?;
            if opt.opt_flen != 0 {
                return Err(FlowLabelError::InvalidArgument);
            }
            (opt.opt_nflen != 0).then(|| Arc::new(opt))
        };

        let linger_ms = config.check_linger(req.linger, ctx.cap_net_admin)?;
        let expires_ms = config.check_linger(req.expires, ctx.cap_net_admin)?;

        let share = FlowLabelShare::from_raw(req.share).ok_or(FlowLabelError::InvalidArgument)?;
        let owner = match share {
            FlowLabelShare::Exclusive | FlowLabelShare::Any => FlowLabelOwner::None,
            FlowLabelShare::Process => FlowLabelOwner::Process(ctx.pid),
            FlowLabelShare::User => FlowLabelOwner::User(ctx.euid),
            FlowLabelShare::None => return Err(FlowLabelError::InvalidArgument),
        };

        if !req.dst.is_valid_flowlabel_dst() {
            return Err(FlowLabelError::InvalidArgument);
        }

        let now = table.now_ms();
        let mut cand = FlowLabelCandidate::new(self.netns.id(), share, owner, req.dst, opt, now);
        cand.renew(linger_ms, expires_ms, now);
        if cand.forces_ownership() {
            self.netns.mark_exclusive_label();
        }
        Ok(cand)
    }

    /// Attach to an entry that already holds the requested label.
    fn attach_existing(
        &self,
        fl: FlowLabelRef,
        cand: FlowLabelCandidate,
        flags: FlowLabelFlags,
    ) -> Result<u32, FlowLabelError> {
        if flags.contains(FlowLabelFlags::EXCL) {
            return Err(FlowLabelError::AlreadyExists);
        }
        if !fl.shareable_with(&cand) {
            return Err(FlowLabelError::PermissionDenied);
        }
        fl.merge_times(&cand);
        let label = fl.label();
        self.link(fl)?;
        Ok(label)
    }

    /// GET: create or attach. Returns the label now bound to the socket.
    pub fn flowlabel_get(
        &self,
        ctx: &CallerCtx,
        req: &FlowLabelReq,
        control: &[u8],
    ) -> Result<u32, FlowLabelError> {
        let flags = req.flags();

        if flags.contains(FlowLabelFlags::REFLECT) {
            if self.netns.sysctl().flowlabel_consistency {
                klog!(
                    Info,
                    "ip6_flowlabel: reflect refused on socket {}, flowlabel_consistency is on",
                    self.id
                );
                return Err(FlowLabelError::PermissionDenied);
            }
            if !self.protocol.is_stream() {
                return Err(FlowLabelError::PermissionDenied);
            }
            self.repflow.store(true, Ordering::Release);
            return Ok(0);
        }

        if !self.netns.is_alive() {
            return Err(FlowLabelError::NamespaceExited);
        }
        let requested = validate_label(req.label)?;
        if self.netns.sysctl().flowlabel_state_ranges
            && requested & IPV6_FLOWLABEL_STATELESS_FLAG != 0
        {
            return Err(FlowLabelError::OutOfRange);
        }

        let table = self.netns.flowlabel_table();
        let cand = self.create_candidate(ctx, req, control)?;

        if requested != 0 {
            let found = match self.find_by_label(requested) {
                Some(_) if flags.contains(FlowLabelFlags::EXCL) => {
                    return Err(FlowLabelError::AlreadyExists);
                }
                Some(fl) => Some(fl),
                None => table.lookup(self.netns.id(), requested),
            };
            if let Some(fl) = found {
                return self.attach_existing(fl, cand, flags);
            }
        }

        if !flags.contains(FlowLabelFlags::CREATE) {
            return Err(FlowLabelError::NotFound);
        }

        table.admission_check(self.binding_count(), ctx.cap_net_admin)?;

        match table.intern(cand, requested)? {
            Interned::Existing(fl, cand) => self.attach_existing(fl, cand, flags),
            Interned::Inserted(fl) => {
                let label = fl.label();
                self.link(fl)?;
                Ok(label)
            }
        }
    }

    /// PUT: detach a label, or leave reflect mode.
    pub fn flowlabel_put(&self, req: &FlowLabelReq) -> Result<(), FlowLabelError> {
        if req.flags().contains(FlowLabelFlags::REFLECT) {
            if !self.protocol.is_stream() {
                return Err(FlowLabelError::ProtocolMismatch);
            }
            if !self.is_reflecting() {
                return Err(FlowLabelError::NoSuchState);
            }
            self.flow_label.store(0, Ordering::Release);
            self.repflow.store(false, Ordering::Release);
            return Ok(());
        }

        let label = validate_label(req.label)?;
        self.unlink_and_release(label)
    }

    /// RENEW: extend the lifetime of a bound label.
    ///
    /// Admins may renew any label of the namespace by asking for no sharing.
    pub fn flowlabel_renew(
        &self,
        ctx: &CallerCtx,
        req: &FlowLabelReq,
    ) -> Result<(), FlowLabelError> {
        if !self.netns.is_alive() {
            return Err(FlowLabelError::NamespaceExited);
        }
        let label = validate_label(req.label)?;
        let table = self.netns.flowlabel_table();

        let fl = match self.find_by_label(label) {
            Some(fl) => fl,
            None if req.share == FlowLabelShare::None.to_raw() && ctx.cap_net_admin => table
                .lookup(self.netns.id(), label)
                .ok_or(FlowLabelError::NotFound)?,
            None => return Err(FlowLabelError::NotFound),
        };

        let config = table.config();
        let linger_ms = config.check_linger(req.linger, ctx.cap_net_admin)?;
        let expires_ms = config.check_linger(req.expires, ctx.cap_net_admin)?;
        fl.times().renew(linger_ms, expires_ms, table.now_ms());
        Ok(())
    }

    /// setsockopt(IPV6_FLOWLABEL_MGR).
    ///
    /// `optval` holds the request record followed by ancillary data. A GET
    /// for label 0 writes the chosen label back into `optval`.
    pub fn setsockopt_flowlabel_mgr(
        &self,
        ctx: &CallerCtx,
        optval: &mut [u8],
    ) -> Result<(), FlowLabelError> {
        let (req, control) = FlowLabelReq::parse(optval)?;
        match req.action()? {
            FlowLabelAction::Get => {
                let label = self.flowlabel_get(ctx, &req, control)?;
                if req.label == 0 && !req.flags().contains(FlowLabelFlags::REFLECT) {
                    FlowLabelReq::write_label(optval, label);
                }
                Ok(())
            }
            FlowLabelAction::Put => self.flowlabel_put(&req),
            FlowLabelAction::Renew => self.flowlabel_renew(ctx, &req),
        }
    }

    /// getsockopt(IPV6_FLOWLABEL_MGR): describe the label in use.
    pub fn flowlabel_opt_get(&self, flags: FlowLabelFlags) -> Result<FlowLabelReq, FlowLabelError> {
        let mut out = FlowLabelReq::default();

        if flags.contains(FlowLabelFlags::REMOTE) {
            out.label = self.rcv_flowinfo.load(Ordering::Acquire) & IPV6_FLOWLABEL_MASK;
            return Ok(out);
        }
        if self.is_reflecting() {
            out.label = self.active_label();
            return Ok(out);
        }

        let active = self.active_label();
        let now = self.netns.flowlabel_table().now_ms();
        let list = self.fl_list.lock();
        let fl = list
            .iter()
            .find(|fl| fl.label() == active)
            .ok_or(FlowLabelError::NotFound)?;

        let times = fl.times();
        let remaining = times.expires_ms.saturating_sub(now) / MSEC_PER_SEC;
        out.label = fl.label();
        out.dst = fl.dst();
        out.share = fl.share().to_raw();
        out.expires = remaining.min(u16::MAX as u64) as u16;
        out.linger = (times.linger_ms / MSEC_PER_SEC).min(u16::MAX as u64) as u16;
        Ok(out)
    }

    // ========================================================================
    // Transmit / Receive
    // ========================================================================

    /// Resolve the label a caller wants to send with.
    ///
    /// Once the namespace holds exclusive or option-carrying labels, a
    /// non-zero label must be bound to this socket. Otherwise no lookup is
    /// done and `Ok(None)` is returned.
    pub fn lookup_for_xmit(&self, flowinfo: u32) -> Result<Option<FlowLabelRef>, FlowLabelError> {
        let label = flowinfo & IPV6_FLOWLABEL_MASK;
        if label == 0 || !self.netns.has_exclusive_labels() {
            return Ok(None);
        }
        self.find_by_label(label)
            .map(Some)
            .ok_or(FlowLabelError::NotFound)
    }

    /// Extension headers for a packet sent with `fl`.
    pub fn xmit_options(&self, fl: Option<&FlowLabelRef>) -> Option<Arc<Ip6TxOptions>> {
        let fl_opt = fl.and_then(|fl| fl.options());
        let sock_opt = self.tx_options.lock().clone();
        merge_tx_options(fl_opt.as_ref(), sock_opt.as_ref())
    }

    /// Record the flowinfo supplied on connect.
    ///
    /// Ignored unless IPV6_FLOWINFO_SEND is on.
    pub fn connect_flowinfo(&self, flowinfo: u32) -> Result<(), FlowLabelError> {
        let mut kept = 0;
        if self.sndflow.load(Ordering::Acquire) {
            kept = flowinfo & IPV6_FLOWINFO_MASK;
            self.lookup_for_xmit(kept)
                .map_err(|_| FlowLabelError::InvalidArgument)?;
        }
        self.flow_label.store(kept, Ordering::Release);
        Ok(())
    }

    /// Learn the flowinfo of a received IPv6 header.
    pub fn note_received_flowinfo(&self, hdr: &[u8]) -> Result<(), Ipv6Error> {
        let flowinfo = parse_flowinfo(hdr)?;
        self.rcv_flowinfo.store(flowinfo, Ordering::Release);
        if self.is_reflecting() {
            self.flow_label
                .store(flowinfo & IPV6_FLOWLABEL_MASK, Ordering::Release);
        }
        Ok(())
    }

    /// First IPv6 header word for an outgoing packet.
    pub fn tx_flow_word(&self, tclass: u8) -> [u8; 4] {
        build_flow_word(tclass, self.active_label())
    }
}

impl Drop for Ip6Sock {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            self.release_all();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exthdr::{
        push_cmsg, IPV6_DSTOPTS, IPV6_HOPOPTS, IPV6_RTHDRDSTOPTS, IPV6_TCLASS, SOL_IPV6,
    };
    use crate::flowlabel::FLOWLABEL_REQ_LEN;
    use crate::fltable::{FlowLabelConfig, GcTimer};
    use crate::ipv6::{parse_flowlabel, Ipv6Addr};
    use crate::netns::testing::{test_namespace, test_namespace_with_timer};
    use crate::netns::Ip6FlowLabelSysctl;

    const DST: Ipv6Addr = Ipv6Addr::new([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1]);
    const ALICE: CallerCtx = CallerCtx::user(100, 1000);
    const BOB: CallerCtx = CallerCtx::user(200, 1001);

    fn get(label: u32, share: FlowLabelShare, flags: FlowLabelFlags) -> FlowLabelReq {
        FlowLabelReq::new(FlowLabelAction::Get, label)
            .with_dst(DST)
            .with_share(share)
            .with_flags(flags)
    }

    fn put(label: u32) -> FlowLabelReq {
        FlowLabelReq::new(FlowLabelAction::Put, label)
    }

    fn hopopts_cmsg() -> Vec<u8> {
        let mut buf = Vec::new();
        push_cmsg(&mut buf, SOL_IPV6, IPV6_HOPOPTS, &[59, 0, 1, 4, 0, 0, 0, 0]);
        buf
    }

    #[test]
    fn test_get_auto_label_and_put() {
        let (table, ns) = test_namespace();
        let sk = Ip6Sock::new(ns, Ip6Protocol::Udp);

        let label = sk
            .flowlabel_get(&ALICE, &get(0, FlowLabelShare::Any, FlowLabelFlags::CREATE), &[])
            .unwrap();
        assert_ne!(label, 0);
        assert_eq!(sk.bound_labels(), [label]);
        assert_eq!(table.len(), 1);

        sk.flowlabel_put(&put(label)).unwrap();
        assert_eq!(sk.binding_count(), 0);
        assert_eq!(sk.flowlabel_put(&put(label)), Err(FlowLabelError::NotFound));
        // Entry lingers until GC.
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_get_without_create() {
        let (_table, ns) = test_namespace();
        let sk = Ip6Sock::new(ns, Ip6Protocol::Udp);
        assert_eq!(
            sk.flowlabel_get(&ALICE, &get(5, FlowLabelShare::Any, FlowLabelFlags::empty()), &[]),
            Err(FlowLabelError::NotFound)
        );
    }

    #[test]
    fn test_get_validates_request() {
        let (_table, ns) = test_namespace();
        let sk = Ip6Sock::new(ns.clone(), Ip6Protocol::Udp);
        let create = FlowLabelFlags::CREATE;

        assert_eq!(
            sk.flowlabel_get(&ALICE, &get(0x10_0000, FlowLabelShare::Any, create), &[]),
            Err(FlowLabelError::InvalidArgument)
        );
        assert_eq!(
            sk.flowlabel_get(&ALICE, &get(1, FlowLabelShare::None, create), &[]),
            Err(FlowLabelError::InvalidArgument)
        );
        let mut bad_share = get(1, FlowLabelShare::Any, create);
        bad_share.share = 9;
        assert_eq!(
            sk.flowlabel_get(&ALICE, &bad_share, &[]),
            Err(FlowLabelError::InvalidArgument)
        );
        let mapped = Ipv6Addr::new([0, 0, 0, 0, 0, 0xffff, 0x0a00, 1]);
        assert_eq!(
            sk.flowlabel_get(&ALICE, &get(1, FlowLabelShare::Any, create).with_dst(mapped), &[]),
            Err(FlowLabelError::InvalidArgument)
        );
        assert_eq!(
            sk.flowlabel_get(&ALICE, &get(1, FlowLabelShare::Any, create).with_linger(151), &[]),
            Err(FlowLabelError::PermissionDenied)
        );
        let admin = CallerCtx::admin(1, 0);
        assert!(sk
            .flowlabel_get(&admin, &get(1, FlowLabelShare::Any, create).with_linger(600), &[])
            .is_ok());

        ns.set_sysctl(Ip6FlowLabelSysctl {
            flowlabel_state_ranges: true,
            ..Ip6FlowLabelSysctl::default()
        });
        assert_eq!(
            sk.flowlabel_get(&ALICE, &get(0x8_0001, FlowLabelShare::Any, create), &[]),
            Err(FlowLabelError::OutOfRange)
        );
    }

    #[test]
    fn test_process_and_user_sharing() {
        let (_table, ns) = test_namespace();
        let a = Ip6Sock::new(ns.clone(), Ip6Protocol::Udp);
        let b = Ip6Sock::new(ns.clone(), Ip6Protocol::Udp);
        let c = Ip6Sock::new(ns, Ip6Protocol::Udp);
        let create = FlowLabelFlags::CREATE;

        a.flowlabel_get(&ALICE, &get(20, FlowLabelShare::Process, create), &[])
            .unwrap();
        // Same process, other socket.
        assert_eq!(
            b.flowlabel_get(&ALICE, &get(20, FlowLabelShare::Process, create), &[]),
            Ok(20)
        );
        assert_eq!(
            c.flowlabel_get(&BOB, &get(20, FlowLabelShare::Process, create), &[]),
            Err(FlowLabelError::PermissionDenied)
        );

        a.flowlabel_get(&ALICE, &get(21, FlowLabelShare::User, create), &[])
            .unwrap();
        let same_user = CallerCtx::user(300, ALICE.euid);
        assert_eq!(
            c.flowlabel_get(&same_user, &get(21, FlowLabelShare::User, create), &[]),
            Ok(21)
        );
        assert_eq!(
            c.flowlabel_get(&BOB, &get(21, FlowLabelShare::Any, create), &[]),
            Err(FlowLabelError::PermissionDenied)
        );
    }

    #[test]
    fn test_exclusive_flag_on_own_binding() {
        let (_table, ns) = test_namespace();
        let sk = Ip6Sock::new(ns, Ip6Protocol::Udp);
        let req = get(33, FlowLabelShare::Any, FlowLabelFlags::CREATE);
        sk.flowlabel_get(&ALICE, &req, &[]).unwrap();
        assert_eq!(
            sk.flowlabel_get(
                &ALICE,
                &req.with_flags(FlowLabelFlags::CREATE | FlowLabelFlags::EXCL),
                &[]
            ),
            Err(FlowLabelError::AlreadyExists)
        );
        // Without EXCL a second binding to the same entry is added.
        sk.flowlabel_get(&ALICE, &req, &[]).unwrap();
        assert_eq!(sk.bound_labels(), [33, 33]);
        assert_eq!(sk.find_by_label(33).unwrap().users(), 3);
    }

    #[test]
    fn test_attach_merges_lifetime() {
        let (_table, ns) = test_namespace();
        let a = Ip6Sock::new(ns.clone(), Ip6Protocol::Udp);
        let b = Ip6Sock::new(ns, Ip6Protocol::Udp);
        a.flowlabel_get(
            &ALICE,
            &get(40, FlowLabelShare::Any, FlowLabelFlags::CREATE).with_linger(10),
            &[],
        )
        .unwrap();
        b.flowlabel_get(
            &BOB,
            &get(40, FlowLabelShare::Any, FlowLabelFlags::empty()).with_linger(30),
            &[],
        )
        .unwrap();
        assert_eq!(a.find_by_label(40).unwrap().linger_ms(), 30_000);
    }

    #[test]
    fn test_renew_paths() {
        let (timer, table, ns) = test_namespace_with_timer(FlowLabelConfig::default());
        let a = Ip6Sock::new(ns.clone(), Ip6Protocol::Udp);
        let b = Ip6Sock::new(ns, Ip6Protocol::Udp);
        a.flowlabel_get(&ALICE, &get(50, FlowLabelShare::Any, FlowLabelFlags::CREATE), &[])
            .unwrap();

        let renew = FlowLabelReq::new(FlowLabelAction::Renew, 50).with_linger(60);
        assert_eq!(b.flowlabel_renew(&BOB, &renew), Err(FlowLabelError::NotFound));
        let admin = CallerCtx::admin(1, 0);
        assert_eq!(
            b.flowlabel_renew(&admin, &renew.with_share(FlowLabelShare::Any)),
            Err(FlowLabelError::NotFound)
        );
        b.flowlabel_renew(&admin, &renew.with_share(FlowLabelShare::None))
            .unwrap();
        assert_eq!(table.lookup(a.netns().id(), 50).unwrap().linger_ms(), 60_000);

        timer.advance(1_000);
        a.flowlabel_renew(&ALICE, &renew.with_linger(10).with_expires(100))
            .unwrap();
        let fl = a.find_by_label(50).unwrap();
        assert_eq!(fl.linger_ms(), 60_000);
        assert_eq!(fl.expires_ms(), timer.now_ms() + 100_000);
        assert_eq!(
            a.flowlabel_renew(&ALICE, &renew.with_linger(200)),
            Err(FlowLabelError::PermissionDenied)
        );
    }

    #[test]
    fn test_setsockopt_writes_label_back() {
        let (_table, ns) = test_namespace();
        let sk = Ip6Sock::new(ns, Ip6Protocol::Udp);
        let mut optval = get(0, FlowLabelShare::Exclusive, FlowLabelFlags::CREATE)
            .to_bytes()
            .to_vec();
        sk.setsockopt_flowlabel_mgr(&ALICE, &mut optval).unwrap();
        let (req, _) = FlowLabelReq::parse(&optval).unwrap();
        assert_ne!(req.label, 0);
        assert_eq!(sk.bound_labels(), [req.label]);

        let mut short = [0u8; FLOWLABEL_REQ_LEN - 1];
        assert_eq!(
            sk.setsockopt_flowlabel_mgr(&ALICE, &mut short),
            Err(FlowLabelError::InvalidArgument)
        );
        let mut bad_action = put(req.label).to_bytes();
        bad_action[20] = 9;
        assert_eq!(
            sk.setsockopt_flowlabel_mgr(&ALICE, &mut bad_action),
            Err(FlowLabelError::InvalidArgument)
        );

        let mut put_req = put(req.label).to_bytes();
        sk.setsockopt_flowlabel_mgr(&ALICE, &mut put_req).unwrap();
        assert_eq!(sk.binding_count(), 0);
    }

    #[test]
    fn test_get_with_options() {
        let (_table, ns) = test_namespace();
        let sk = Ip6Sock::new(ns.clone(), Ip6Protocol::Raw);
        let req = get(60, FlowLabelShare::Any, FlowLabelFlags::CREATE);

        assert_eq!(
            sk.flowlabel_get(&ALICE, &req, &hopopts_cmsg()),
            Err(FlowLabelError::PermissionDenied)
        );
        assert!(!ns.has_exclusive_labels());

        let raw = CallerCtx {
            cap_net_raw: true,
            ..ALICE
        };
        sk.flowlabel_get(&raw, &req, &hopopts_cmsg()).unwrap();
        assert!(ns.has_exclusive_labels());
        let fl = sk.find_by_label(60).unwrap();
        assert_eq!(fl.options().unwrap().opt_nflen, 8);

        // Fragmentable options cannot be attached to a label.
        let mut dstopts = Vec::new();
        push_cmsg(&mut dstopts, SOL_IPV6, IPV6_DSTOPTS, &[59, 0, 1, 4, 0, 0, 0, 0]);
        assert_eq!(
            sk.flowlabel_get(&raw, &get(61, FlowLabelShare::Any, FlowLabelFlags::CREATE), &dstopts),
            Err(FlowLabelError::InvalidArgument)
        );

        // Options without extension headers are dropped entirely.
        let mut tclass = Vec::new();
        push_cmsg(&mut tclass, SOL_IPV6, IPV6_TCLASS, &5i32.to_ne_bytes());
        sk.flowlabel_get(&ALICE, &get(62, FlowLabelShare::Any, FlowLabelFlags::CREATE), &tclass)
            .unwrap();
        assert!(sk.find_by_label(62).unwrap().options().is_none());
    }

    #[test]
    fn test_reflect_mode() {
        let (_table, ns) = test_namespace();
        let tcp = Ip6Sock::new(ns.clone(), Ip6Protocol::Tcp);
        let udp = Ip6Sock::new(ns.clone(), Ip6Protocol::Udp);
        let reflect = FlowLabelReq::new(FlowLabelAction::Get, 0).with_flags(FlowLabelFlags::REFLECT);
        let unreflect = put(0).with_flags(FlowLabelFlags::REFLECT);

        // Consistency sysctl is on by default.
        assert_eq!(
            tcp.flowlabel_get(&ALICE, &reflect, &[]),
            Err(FlowLabelError::PermissionDenied)
        );
        ns.set_sysctl(Ip6FlowLabelSysctl {
            flowlabel_consistency: false,
            ..Ip6FlowLabelSysctl::default()
        });
        assert_eq!(
            udp.flowlabel_get(&ALICE, &reflect, &[]),
            Err(FlowLabelError::PermissionDenied)
        );
        assert_eq!(udp.flowlabel_put(&unreflect), Err(FlowLabelError::ProtocolMismatch));
        assert_eq!(tcp.flowlabel_put(&unreflect), Err(FlowLabelError::NoSuchState));

        tcp.flowlabel_get(&ALICE, &reflect, &[]).unwrap();
        assert!(tcp.is_reflecting());
        tcp.note_received_flowinfo(&build_flow_word(0x10, 0xbeef))
            .unwrap();
        assert_eq!(tcp.active_label(), 0xbeef);
        assert_eq!(parse_flowlabel(&tcp.tx_flow_word(0)), Ok(0xbeef));
        assert_eq!(
            tcp.flowlabel_opt_get(FlowLabelFlags::empty()).unwrap().label,
            0xbeef
        );

        tcp.flowlabel_put(&unreflect).unwrap();
        assert!(!tcp.is_reflecting());
        assert_eq!(tcp.active_label(), 0);
    }

    #[test]
    fn test_query_active_label() {
        let (_table, ns) = test_namespace();
        let sk = Ip6Sock::new(ns, Ip6Protocol::Udp);
        assert_eq!(
            sk.flowlabel_opt_get(FlowLabelFlags::empty()),
            Err(FlowLabelError::NotFound)
        );

        sk.flowlabel_get(
            &ALICE,
            &get(70, FlowLabelShare::Any, FlowLabelFlags::CREATE)
                .with_linger(20)
                .with_expires(40),
            &[],
        )
        .unwrap();
        sk.set_flowinfo_send(true);
        sk.connect_flowinfo(70).unwrap();

        let cur = sk.flowlabel_opt_get(FlowLabelFlags::empty()).unwrap();
        assert_eq!(cur.label, 70);
        assert_eq!(cur.dst, DST);
        assert_eq!(cur.share, FlowLabelShare::Any.to_raw());
        assert_eq!(cur.linger, 20);
        assert_eq!(cur.expires, 40);

        sk.note_received_flowinfo(&build_flow_word(0, 0x123)).unwrap();
        assert_eq!(sk.flowlabel_opt_get(FlowLabelFlags::REMOTE).unwrap().label, 0x123);

        // PUT of the active label clears the marker.
        sk.flowlabel_put(&put(70)).unwrap();
        assert_eq!(sk.active_label(), 0);
    }

    #[test]
    fn test_xmit_ownership_enforced_after_exclusive() {
        let (_table, ns) = test_namespace();
        let owner = Ip6Sock::new(ns.clone(), Ip6Protocol::Udp);
        let other = Ip6Sock::new(ns.clone(), Ip6Protocol::Udp);
        other.set_flowinfo_send(true);

        // No exclusive labels yet: any label may be used.
        assert!(other.lookup_for_xmit(80).unwrap().is_none());
        other.connect_flowinfo(0x0a00_0050).unwrap();
        assert_eq!(other.active_label(), 0x50);
        assert_eq!(other.tx_flow_word(0), build_flow_word(0, 0x50));

        owner
            .flowlabel_get(&ALICE, &get(80, FlowLabelShare::Exclusive, FlowLabelFlags::CREATE), &[])
            .unwrap();
        assert!(ns.has_exclusive_labels());
        assert_eq!(other.lookup_for_xmit(80).unwrap_err(), FlowLabelError::NotFound);
        assert_eq!(
            other.connect_flowinfo(80),
            Err(FlowLabelError::InvalidArgument)
        );
        let fl = owner.lookup_for_xmit(80).unwrap().unwrap();
        assert_eq!(fl.label(), 80);
        assert!(owner.lookup_for_xmit(0).unwrap().is_none());
    }

    #[test]
    fn test_xmit_options_merge() {
        let (_table, ns) = test_namespace();
        let sk = Ip6Sock::new(ns, Ip6Protocol::Raw);
        let raw = CallerCtx::admin(1, 0);
        sk.flowlabel_get(&raw, &get(90, FlowLabelShare::Any, FlowLabelFlags::CREATE), &hopopts_cmsg())
            .unwrap();
        let fl = sk.lookup_for_xmit(90).unwrap();
        let merged = sk.xmit_options(fl.as_ref()).unwrap();
        assert_eq!(merged.opt_nflen, 8);
        assert_eq!(merged.opt_flen, 0);

        let sock_opt = Ip6TxOptions {
            dst1opt: Some(Arc::from(&[59u8, 0, 1, 4, 0, 0, 0, 0][..])),
            opt_flen: 8,
            ..Ip6TxOptions::default()
        };
        sk.set_tx_options(Some(Arc::new(sock_opt)));
        let merged = sk.xmit_options(fl.as_ref()).unwrap();
        assert_eq!(merged.total_len(), 16);
        assert!(merged.hopopt.is_some() && merged.dst1opt.is_some());
        assert!(sk.xmit_options(None).unwrap().hopopt.is_none());
    }

    #[test]
    fn test_release_all_once() {
        let (table, ns) = test_namespace();
        let sk = Ip6Sock::new(ns, Ip6Protocol::Udp);
        for label in 1..=3 {
            sk.flowlabel_get(&ALICE, &get(label, FlowLabelShare::Any, FlowLabelFlags::CREATE), &[])
                .unwrap();
        }
        let fl = table.lookup(sk.netns().id(), 2).unwrap();
        assert_eq!(fl.users(), 2);

        sk.release_all();
        assert_eq!(sk.binding_count(), 0);
        assert_eq!(fl.users(), 1);
        sk.release_all();
        assert_eq!(fl.users(), 1);
    }

    #[test]
    fn test_namespace_exited() {
        let (_table, ns) = test_namespace();
        let sk = Ip6Sock::new(ns.clone(), Ip6Protocol::Udp);
        ns.exit();
        assert_eq!(
            sk.flowlabel_get(&ALICE, &get(1, FlowLabelShare::Any, FlowLabelFlags::CREATE), &[]),
            Err(FlowLabelError::NamespaceExited)
        );
        assert_eq!(
            sk.flowlabel_renew(&ALICE, &FlowLabelReq::new(FlowLabelAction::Renew, 1)),
            Err(FlowLabelError::NamespaceExited)
        );
    }

    #[test]
    fn test_get_hopopts_after_rthdrdstopts() {
        let (_table, ns) = test_namespace();
        let sk = Ip6Sock::new(ns, Ip6Protocol::Udp);
        let raw = CallerCtx {
            cap_net_raw: true,
            ..ALICE
        };
        let mut control = Vec::new();
        push_cmsg(&mut control, SOL_IPV6, IPV6_RTHDRDSTOPTS, &[59, 0, 1, 4, 0, 0, 0, 0]);
        push_cmsg(&mut control, SOL_IPV6, IPV6_HOPOPTS, &[59, 0, 1, 4, 0, 0, 0, 0]);

        assert_eq!(
            sk.flowlabel_get(&raw, &get(16, FlowLabelShare::Any, FlowLabelFlags::CREATE), &control),
            Ok(16)
        );
        let fl = sk.find_by_label(16).unwrap();
        let opt = fl.options().unwrap();
        assert_eq!(opt.opt_nflen, 16);
        assert!(opt.hopopt.is_some());
        assert!(opt.dst0opt.is_some());
    }

    #[test]
    fn test_admission_per_socket() {
        let config = FlowLabelConfig {
            max_size: 64,
            max_per_sock: 4,
            ..FlowLabelConfig::default()
        };
        let (_timer, _table, ns) = test_namespace_with_timer(config);
        let sk = Ip6Sock::new(ns, Ip6Protocol::Udp);
        let req = get(0, FlowLabelShare::Any, FlowLabelFlags::CREATE);

        // Room stays above max - per_sock for the first four labels.
        for _ in 0..4 {
            sk.flowlabel_get(&ALICE, &req, &[]).unwrap();
        }
        assert_eq!(
            sk.flowlabel_get(&ALICE, &req, &[]),
            Err(FlowLabelError::ResourceExhausted)
        );
        assert!(sk.flowlabel_get(&CallerCtx::admin(1, 0), &req, &[]).is_ok());
    }
}
