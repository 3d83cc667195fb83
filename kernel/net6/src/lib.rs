//! Zero-OS IPv6 Flow Labels
//!
//! This crate implements the IPv6 flow-label manager:
//! - A registry of 20-bit flow labels keyed by network namespace, with
//!   sharing policies (exclusive, process, user, any)
//! - Per-socket binding lists and the GET / PUT / RENEW verbs behind
//!   `IPV6_FLOWLABEL_MGR`
//! - Linger-based reclamation driven by a host timer
//! - Capture of extension headers that travel with a label
//!
//! # Design
//!
//! The registry is an explicit [`FlowLabelTable`] handed to the namespaces
//! that use it; there is no global table. Entries are shared through `Arc`
//! and carry their own user count so that lookups never revive an entry
//! that is already on its way out.
//!
//! # Example
//!
//! ```ignore
//! let table = FlowLabelTable::new(FlowLabelConfig::default(), timer, seed);
//! let netns = NetNamespace::new_root(table);
//! let sk = Ip6Sock::new(netns, Ip6Protocol::Udp);
//!
//! let req = FlowLabelReq::new(FlowLabelAction::Get, 0)
//!     .with_dst(peer)
//!     .with_share(FlowLabelShare::Exclusive)
//!     .with_flags(FlowLabelFlags::CREATE);
//! let label = sk.flowlabel_get(&ctx, &req, &[])?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate klog;

pub mod exthdr;
pub mod flowlabel;
pub mod fltable;
pub mod ipv6;
pub mod netns;
pub mod socket;


pub use exthdr::{
    merge_tx_options, push_cmsg, AncillaryParser, Cmsg, CmsgIter, ExtHdr, ExtHdrError,
    Ip6CmsgParser, Ip6TxOptions,
};
pub use flowlabel::{
    CallerCtx, FlowLabel, FlowLabelAction, FlowLabelCandidate, FlowLabelError, FlowLabelFlags,
    FlowLabelOwner, FlowLabelRef, FlowLabelReq, FlowLabelShare, Pid, Uid, FLOWLABEL_REQ_LEN,
};
pub use fltable::{
    FlowLabelConfig, FlowLabelInfo, FlowLabelStats, FlowLabelTable, GcTimer, Interned,
    FL_HASH_SIZE, FL_LABEL_SPACE, FL_MAX_LINGER_SECS, FL_MAX_OPT_LEN, FL_MAX_PER_SOCK, FL_MAX_SIZE,
    FL_MIN_LINGER_SECS,
};
pub use ipv6::{
    build_flow_word, parse_flowinfo, parse_flowlabel, parse_tclass, Ipv6Addr, Ipv6Error,
    IPV6_FLOWINFO_MASK, IPV6_FLOWLABEL_MASK, IPV6_FLOWLABEL_STATELESS_FLAG,
};
pub use netns::{Ip6FlowLabelSysctl, NetNamespace, NetNsError, NetNsId};
pub use socket::{Ip6Protocol, Ip6Sock};
