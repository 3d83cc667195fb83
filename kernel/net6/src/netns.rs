//! Network namespaces as seen by the flow-label manager
//!
//! A namespace owns its IPv6 flow-label sysctls, the ancillary-data parser
//! used by GET, and a handle on the registry its labels are interned in.
//! Child namespaces share their parent's registry; entries never match
//! across namespaces because every key carries the namespace id.
//!
//! # Lifecycle
//!
//! ```rust,ignore
//! let root = NetNamespace::new_root(table);
//! let child = NetNamespace::new_child(&root)?;
//! // ... sockets come and go ...
//! child.exit(); // purge unreferenced labels, refuse further GET/RENEW
//! ```

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::RwLock;

use crate::exthdr::{AncillaryParser, Ip6CmsgParser};
use crate::fltable::FlowLabelTable;

// ============================================================================
// Constants
// ============================================================================

/// Maximum network namespace nesting depth
pub const MAX_NET_NS_LEVEL: u8 = 32;

/// Next available namespace ID (0 is reserved for root)
static NEXT_NET_NS_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Error Types
// ============================================================================

/// Network namespace operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetNsError {
    /// Maximum namespace depth exceeded
    MaxDepthExceeded,
    /// Parent namespace already exited
    Exited,
}

// ============================================================================
// Namespace ID
// ============================================================================

/// Network namespace identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetNsId(u64);

impl NetNsId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        NetNsId(raw)
    }

    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

// ============================================================================
// Sysctls
// ============================================================================

/// `net.ipv6.flowlabel_*` knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ip6FlowLabelSysctl {
    /// Refuse reflect mode so labels stay stable per flow
    pub flowlabel_consistency: bool,
    /// Reserve the top label bit for stateless labels
    pub flowlabel_state_ranges: bool,
}

impl Default for Ip6FlowLabelSysctl {
    fn default() -> Self {
        Self {
            flowlabel_consistency: true,
            flowlabel_state_ranges: false,
        }
    }
}

// ============================================================================
// Network Namespace
// ============================================================================

/// A network namespace.
pub struct NetNamespace {
    /// Unique namespace identifier
    id: NetNsId,

    /// Parent namespace (None for root)
    parent: Option<Arc<NetNamespace>>,

    /// Nesting level (0 = root)
    level: u8,

    /// Registry holding this namespace's labels
    flowlabels: Arc<FlowLabelTable>,

    /// Control-message parser used when a GET carries options
    parser: Arc<dyn AncillaryParser>,

    sysctl: RwLock<Ip6FlowLabelSysctl>,

    /// Set once an exclusive or option-carrying label was created; from then
    /// on transmit paths must prove ownership of the labels they use.
    flowlabel_has_excl: AtomicBool,

    /// Namespace exit has run
    exited: AtomicBool,
}

impl fmt::Debug for NetNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetNamespace")
            .field("id", &self.id.raw())
            .field("level", &self.level)
            .field("flowlabel_has_excl", &self.has_exclusive_labels())
            .field("exited", &self.exited.load(Ordering::Relaxed))
            .finish()
    }
}

impl NetNamespace {
    /// Create the root namespace on top of `table`.
    pub fn new_root(table: Arc<FlowLabelTable>) -> Arc<Self> {
        Self::with_parser(table, Arc::new(Ip6CmsgParser))
    }

    /// Create a root namespace with a custom control-message parser.
    pub fn with_parser(table: Arc<FlowLabelTable>, parser: Arc<dyn AncillaryParser>) -> Arc<Self> {
        Arc::new(Self {
            id: NetNsId::new(0),
            parent: None,
            level: 0,
            flowlabels: table,
            parser,
            sysctl: RwLock::new(Ip6FlowLabelSysctl::default()),
            flowlabel_has_excl: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        })
    }

    /// Create a child namespace sharing the parent's registry and parser.
    ///
    /// Sysctls start from their defaults, not from the parent's values.
    pub fn new_child(parent: &Arc<NetNamespace>) -> Result<Arc<Self>, NetNsError> {
        if parent.level >= MAX_NET_NS_LEVEL {
            return Err(NetNsError::MaxDepthExceeded);
        }
        if !parent.is_alive() {
            return Err(NetNsError::Exited);
        }

        let id = NEXT_NET_NS_ID.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(Self {
            id: NetNsId::new(id),
            parent: Some(parent.clone()),
            level: parent.level.saturating_add(1),
            flowlabels: parent.flowlabels.clone(),
            parser: parent.parser.clone(),
            sysctl: RwLock::new(Ip6FlowLabelSysctl::default()),
            flowlabel_has_excl: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        }))
    }

    #[inline]
    pub fn id(&self) -> NetNsId {
        self.id
    }

    #[inline]
    pub fn parent(&self) -> Option<Arc<NetNamespace>> {
        self.parent.clone()
    }

    #[inline]
    pub fn level(&self) -> u8 {
        self.level
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Registry this namespace interns its labels in.
    #[inline]
    pub fn flowlabel_table(&self) -> &Arc<FlowLabelTable> {
        &self.flowlabels
    }

    #[inline]
    pub fn parser(&self) -> &dyn AncillaryParser {
        &*self.parser
    }

    pub fn sysctl(&self) -> Ip6FlowLabelSysctl {
        *self.sysctl.read()
    }

    pub fn set_sysctl(&self, sysctl: Ip6FlowLabelSysctl) {
        *self.sysctl.write() = sysctl;
    }

    /// Whether transmit paths must check label ownership.
    #[inline]
    pub fn has_exclusive_labels(&self) -> bool {
        self.flowlabel_has_excl.load(Ordering::Acquire)
    }

    pub(crate) fn mark_exclusive_label(&self) {
        self.flowlabel_has_excl.store(true, Ordering::Release);
    }

    /// False once [`exit`](Self::exit) has run.
    #[inline]
    pub fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::Acquire)
    }

    /// Namespace exit hook.
    ///
    /// Frees every unreferenced label of this namespace and refuses later
    /// GET/RENEW requests. Labels still bound to sockets are left for the
    /// sockets to release. Returns the number of labels freed.
    pub fn exit(&self) -> usize {
        if self.exited.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let freed = self.flowlabels.purge_namespace(self.id);
        let remaining = self.flowlabels.count_in(self.id);
        if remaining != 0 {
            klog!(
                Warn,
                "ip6_flowlabel: netns {} exiting with {} labels still bound",
                self.id.raw(),
                remaining
            );
        }
        freed
    }
}

impl Drop for NetNamespace {
    fn drop(&mut self) {
        self.exit();
    }
}

// ============================================================================
// Test Support
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_root_namespace() {
        let (_table, root) = test_namespace();
        assert_eq!(root.id().raw(), 0);
        assert_eq!(root.level(), 0);
        assert!(root.is_root());
        assert!(root.is_alive());
        assert!(!root.has_exclusive_labels());
        assert_eq!(root.sysctl(), Ip6FlowLabelSysctl::default());
    }

    #[test]
    fn test_child_namespace_shares_table() {
        let (table, root) = test_namespace();
        let child = NetNamespace::new_child(&root).unwrap();
        assert_ne!(child.id(), root.id());
        assert_eq!(child.level(), 1);
        assert!(!child.is_root());
        assert!(Arc::ptr_eq(child.flowlabel_table(), &table));
        assert!(child.parent().is_some());
    }

    #[test]
    fn test_sysctl_update() {
        let (_table, root) = test_namespace();
        root.set_sysctl(Ip6FlowLabelSysctl {
            flowlabel_consistency: false,
            flowlabel_state_ranges: true,
        });
        assert!(!root.sysctl().flowlabel_consistency);
        assert!(root.sysctl().flowlabel_state_ranges);
    }

    #[test]
    fn test_exit_runs_once() {
        let (_table, root) = test_namespace();
        let child = NetNamespace::new_child(&root).unwrap();
        assert_eq!(child.exit(), 0);
        assert!(!child.is_alive());
        assert_eq!(child.exit(), 0);
        assert_eq!(
            NetNamespace::new_child(&child).unwrap_err(),
            NetNsError::Exited
        );
    }

    #[test]
    fn test_max_depth() {
        let (_table, root) = test_namespace();
        let mut ns = root;
        for _ in 0..MAX_NET_NS_LEVEL {
            ns = NetNamespace::new_child(&ns).unwrap();
        }
        assert_eq!(
            NetNamespace::new_child(&ns).unwrap_err(),
            NetNsError::MaxDepthExceeded
        );
    }
}
