//! Flow-label registry
//!
//! Canonical storage of interned flow labels, shared by every network
//! namespace that was handed the same table. Entries are keyed by
//! `(namespace, label)` and hashed on the low 8 bits of the label into a
//! fixed array of buckets.
//!
//! # Locking
//!
//! ```text
//! buckets: RwLock      read  -> lookup, dump
//!                      write -> intern, final release, GC, purge
//! entry.times: Mutex   linger / expires / lastuse / options
//! gc_pending: Mutex    taken under the bucket write lock only
//! ```
//!
//! Dropping the last [`FlowLabelRef`] takes the write lock, so no table
//! method may drop a reference while it holds the bucket lock.
//!
//! # Reclamation
//!
//! An entry whose user count reaches zero is not freed at once: it lingers
//! until `max(expires, lastuse + linger)` and is then collected by
//! [`FlowLabelTable::run_gc`], which the host calls when the deadline it was
//! asked to arm through [`GcTimer`] passes.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use spin::{Mutex, RwLock};

use crate::flowlabel::{
    FlowLabel, FlowLabelCandidate, FlowLabelError, FlowLabelOwner, FlowLabelRef,
    FlowLabelShare,
};
use crate::ipv6::{mask_flowlabel, Ipv6Addr, IPV6_FLOWLABEL_MASK};
use crate::netns::NetNsId;

// ============================================================================
// Constants
// ============================================================================

/// Number of hash buckets.
pub const FL_HASH_SIZE: usize = 256;

/// Minimum linger / expiry in seconds.
pub const FL_MIN_LINGER_SECS: u16 = 6;

/// Maximum linger / expiry in seconds without CAP_NET_ADMIN.
pub const FL_MAX_LINGER_SECS: u16 = 150;

/// Soft cap on the number of interned labels.
pub const FL_MAX_SIZE: usize = 4096;

/// Non-zero labels one namespace can hold. `max_size` never exceeds it.
pub const FL_LABEL_SPACE: usize = IPV6_FLOWLABEL_MASK as usize;

/// Labels a socket may hold before admission tightens.
pub const FL_MAX_PER_SOCK: usize = 32;

/// Largest ancillary buffer accepted with a GET.
pub const FL_MAX_OPT_LEN: usize = 64 * 1024;

const MSEC_PER_SEC: u64 = 1000;

/// Header line of the flow-label listing.
pub const FL_LISTING_HEADER: &str =
    "Label S Owner  Users  Linger Expires  Dst                              Opt\n";

#[inline]
fn fl_hash(label: u32) -> usize {
    (label as usize) & (FL_HASH_SIZE - 1)
}

// ============================================================================
// Configuration
// ============================================================================

/// Registry limits, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowLabelConfig {
    pub min_linger_secs: u16,
    pub max_linger_secs: u16,
    pub max_size: usize,
    pub max_per_sock: usize,
    pub max_opt_len: usize,
}

impl Default for FlowLabelConfig {
    fn default() -> Self {
        Self {
            min_linger_secs: FL_MIN_LINGER_SECS,
            max_linger_secs: FL_MAX_LINGER_SECS,
            max_size: FL_MAX_SIZE,
            max_per_sock: FL_MAX_PER_SOCK,
            max_opt_len: FL_MAX_OPT_LEN,
        }
    }
}

impl FlowLabelConfig {
    /// Validate a requested linger or expiry and convert it to milliseconds.
    ///
    /// Values below the minimum are raised to it. Values above the maximum
    /// need CAP_NET_ADMIN.
    pub fn check_linger(&self, secs: u16, privileged: bool) -> Result<u64, FlowLabelError> {
        let secs = if secs < self.min_linger_secs {
            self.min_linger_secs
        } else if secs > self.max_linger_secs && !privileged {
            return Err(FlowLabelError::PermissionDenied);
        } else {
            secs
        };
        Ok(secs as u64 * MSEC_PER_SEC)
    }

    /// Admission check for a new label.
    ///
    /// `in_use` is the number of interned labels, `sock_count` the number of
    /// labels the requesting socket already holds.
    pub fn admit(
        &self,
        in_use: usize,
        sock_count: usize,
        privileged: bool,
    ) -> Result<(), FlowLabelError> {
        let max = self.max_size as isize;
        let room = max - in_use as isize;

        if room > max - self.max_per_sock as isize {
            return Ok(());
        }
        if room <= 0 {
            return Err(FlowLabelError::ResourceExhausted);
        }
        let tight = sock_count >= self.max_per_sock
            || (sock_count > 0 && room < max / 2)
            || room < max / 4;
        if tight && !privileged {
            return Err(FlowLabelError::ResourceExhausted);
        }
        Ok(())
    }
}

// ============================================================================
// GC Timer
// ============================================================================

/// Host timer facility driving garbage collection.
///
/// The host calls [`FlowLabelTable::run_gc`] once the last armed deadline
/// has passed. Arming again replaces the previous deadline.
pub trait GcTimer: Send + Sync {
    /// Monotonic time in milliseconds.
    fn now_ms(&self) -> u64;

    /// Fire at `deadline_ms`.
    fn arm(&self, deadline_ms: u64);

    /// Cancel the pending deadline, if any.
    fn disarm(&self);
}

// ============================================================================
// Statistics
// ============================================================================

/// Registry statistics.
#[derive(Debug, Default)]
pub struct FlowLabelStats {
    /// Labels interned
    pub created: AtomicU64,
    /// Labels freed by the GC sweep
    pub gc_freed: AtomicU64,
    /// Labels freed by namespace purge
    pub purged: AtomicU64,
    /// Interning found the label already present
    pub intern_races: AtomicU64,
    /// GET requests refused by admission
    pub admission_rejects: AtomicU64,
    /// GC sweeps run
    pub gc_runs: AtomicU64,
}

impl FlowLabelStats {
    pub const fn new() -> Self {
        Self {
            created: AtomicU64::new(0),
            gc_freed: AtomicU64::new(0),
            purged: AtomicU64::new(0),
            intern_races: AtomicU64::new(0),
            admission_rejects: AtomicU64::new(0),
            gc_runs: AtomicU64::new(0),
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time view of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowLabelInfo {
    pub label: u32,
    pub share: FlowLabelShare,
    pub owner: FlowLabelOwner,
    pub users: u32,
    pub linger_secs: u64,
    /// Seconds until expiry; negative once the deadline passed
    pub expires_secs: i64,
    pub dst: Ipv6Addr,
    /// Non-fragmentable option bytes
    pub opt_len: u32,
}

/// Result of interning a candidate.
#[derive(Debug)]
pub enum Interned {
    /// The candidate became a new entry.
    Inserted(FlowLabelRef),
    /// The label was already taken; the candidate is handed back so the
    /// caller can check sharing and merge lifetimes.
    Existing(FlowLabelRef, FlowLabelCandidate),
}

// ============================================================================
// Flow Label Table
// ============================================================================

enum IdleState {
    /// Still has users
    InUse,
    /// Unreferenced, collectable at the given deadline
    Lingering(u64),
    /// Unreferenced and past its deadline
    Expired,
}

/// The flow-label registry.
pub struct FlowLabelTable {
    buckets: RwLock<Vec<Vec<Arc<FlowLabel>>>>,
    /// Interned entries across all namespaces
    size: AtomicUsize,
    /// Deadline last handed to the timer
    gc_pending: Mutex<Option<u64>>,
    timer: Arc<dyn GcTimer>,
    rng: Mutex<ChaCha20Rng>,
    config: FlowLabelConfig,
    stats: FlowLabelStats,
}

impl FlowLabelTable {
    /// Create an empty registry. `seed` keys the label generator.
    ///
    /// `max_size` is clamped to the label space so a random draw always has
    /// a free label to find.
    pub fn new(
        mut config: FlowLabelConfig,
        timer: Arc<dyn GcTimer>,
        seed: [u8; 32],
    ) -> Arc<Self> {
        config.max_size = config.max_size.min(FL_LABEL_SPACE);
        let mut buckets = Vec::with_capacity(FL_HASH_SIZE);
        buckets.resize_with(FL_HASH_SIZE, Vec::new);
        Arc::new(Self {
            buckets: RwLock::new(buckets),
            size: AtomicUsize::new(0),
            gc_pending: Mutex::new(None),
            timer,
            rng: Mutex::new(ChaCha20Rng::from_seed(seed)),
            config,
            stats: FlowLabelStats::new(),
        })
    }

    #[inline]
    pub fn config(&self) -> &FlowLabelConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &FlowLabelStats {
        &self.stats
    }

    /// Interned entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.timer.now_ms()
    }

    /// Deadline the GC timer is currently armed for.
    pub fn gc_deadline(&self) -> Option<u64> {
        *self.gc_pending.lock()
    }

    fn find<'a>(
        buckets: &'a [Vec<Arc<FlowLabel>>],
        netns: NetNsId,
        label: u32,
    ) -> Option<&'a Arc<FlowLabel>> {
        buckets[fl_hash(label)]
            .iter()
            .find(|fl| fl.matches(netns, label))
    }

    /// Look up a label and take a reference on it.
    ///
    /// Returns `None` if the label is absent or its last user is already
    /// gone; a lingering entry is not revived here.
    pub fn lookup(self: &Arc<Self>, netns: NetNsId, label: u32) -> Option<FlowLabelRef> {
        let label = mask_flowlabel(label);
        let buckets = self.buckets.read();
        let fl = Self::find(&buckets, netns, label)?;
        if !fl.hold_not_zero() {
            return None;
        }
        Some(FlowLabelRef::adopt(self.clone(), fl.clone()))
    }

    /// Whether `(netns, label)` is interned, referenced or not.
    pub fn contains(&self, netns: NetNsId, label: u32) -> bool {
        let buckets = self.buckets.read();
        Self::find(&buckets, netns, mask_flowlabel(label)).is_some()
    }

    /// Entries interned for one namespace.
    pub fn count_in(&self, netns: NetNsId) -> usize {
        self.buckets
            .read()
            .iter()
            .flat_map(|b| b.iter())
            .filter(|fl| fl.netns() == netns)
            .count()
    }

    /// Refuse a new label once the table is too full for this socket.
    ///
    /// Runs without the write lock, so concurrent callers may all pass.
    /// [`intern`](Self::intern) enforces `max_size` again under the lock.
    pub fn admission_check(
        &self,
        sock_count: usize,
        privileged: bool,
    ) -> Result<(), FlowLabelError> {
        let in_use = self.len();
        self.config.admit(in_use, sock_count, privileged).map_err(|e| {
            self.stats.admission_rejects.fetch_add(1, Ordering::Relaxed);
            klog!(
                Warn,
                "ip6_flowlabel: admission refused ({} in use, socket holds {})",
                in_use,
                sock_count
            );
            e
        })
    }

    /// Intern a candidate.
    ///
    /// With `requested == 0` a free random label is chosen. Otherwise, if the
    /// label is already present (even lingering at zero users), the existing
    /// entry gains a user and is returned along with the candidate.
    ///
    /// A new entry is refused with `ResourceExhausted` once `max_size`
    /// entries are interned.
    pub fn intern(
        self: &Arc<Self>,
        cand: FlowLabelCandidate,
        requested: u32,
    ) -> Result<Interned, FlowLabelError> {
        let now = self.timer.now_ms();
        let netns = cand.netns;
        let mut buckets = self.buckets.write();

        let label = if requested == 0 {
            self.check_capacity()?;
            let mut rng = self.rng.lock();
            loop {
                let label = mask_flowlabel(rng.next_u32());
                if label != 0 && Self::find(&buckets, netns, label).is_none() {
                    break label;
                }
            }
        } else {
            let label = mask_flowlabel(requested);
            if let Some(fl) = Self::find(&buckets, netns, label) {
                fl.hold();
                fl.touch(now);
                self.stats.intern_races.fetch_add(1, Ordering::Relaxed);
                return Ok(Interned::Existing(
                    FlowLabelRef::adopt(self.clone(), fl.clone()),
                    cand,
                ));
            }
            self.check_capacity()?;
            label
        };

        let bucket = &mut buckets[fl_hash(label)];
        bucket
            .try_reserve(1)
            .map_err(|_| FlowLabelError::OutOfMemory)?;
        let fl = Arc::new(cand.into_entry(label, now));
        bucket.insert(0, fl.clone());
        self.size.fetch_add(1, Ordering::AcqRel);
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        klog!(Debug, "ip6_flowlabel: interned {:05x} in netns {}", label, netns.raw());

        Ok(Interned::Inserted(FlowLabelRef::adopt(self.clone(), fl)))
    }

    /// Hard cap on new entries. Called with the bucket write lock held.
    fn check_capacity(&self) -> Result<(), FlowLabelError> {
        if self.len() >= self.config.max_size {
            self.stats.admission_rejects.fetch_add(1, Ordering::Relaxed);
            return Err(FlowLabelError::ResourceExhausted);
        }
        Ok(())
    }

    /// Drop one user of `fl`.
    ///
    /// The last user starts the linger period and arms the GC.
    pub(crate) fn release(&self, fl: &FlowLabel) {
        let now = self.timer.now_ms();
        fl.touch(now);
        if fl.put_not_last() {
            return;
        }

        let _buckets = self.buckets.write();
        match fl.put() {
            Some(1) => {
                let ttd = {
                    let mut times = fl.times();
                    let ttd = times.settle_deadline();
                    if fl.share() == FlowLabelShare::Exclusive {
                        times.opt = None;
                    }
                    ttd
                };
                self.arm_gc(ttd);
            }
            Some(_) => {}
            None => {
                klog!(
                    Error,
                    "ip6_flowlabel: release of unreferenced label {:05x}",
                    fl.label()
                );
            }
        }
    }

    /// Arm the GC unless it is already armed for an earlier deadline.
    ///
    /// Called with the bucket write lock held.
    fn arm_gc(&self, ttd: u64) {
        let mut pending = self.gc_pending.lock();
        match *pending {
            Some(deadline) if deadline <= ttd => {}
            _ => {
                *pending = Some(ttd);
                self.timer.arm(ttd);
            }
        }
    }

    /// Where `fl` stands with respect to collection at `now`.
    fn idle_state(fl: &FlowLabel, now: u64) -> IdleState {
        if fl.users() != 0 {
            return IdleState::InUse;
        }
        let times = fl.times();
        let ttd = times
            .expires_ms
            .max(times.lastuse_ms.saturating_add(times.linger_ms));
        if now >= ttd {
            IdleState::Expired
        } else {
            IdleState::Lingering(ttd)
        }
    }

    /// Remove `fl` if it is unreferenced and past its deadline.
    pub fn remove_if_unreferenced_and_expired(&self, fl: &Arc<FlowLabel>) -> bool {
        let now = self.timer.now_ms();
        let removed = {
            let mut buckets = self.buckets.write();
            match Self::idle_state(fl, now) {
                IdleState::Expired => {
                    let bucket = &mut buckets[fl_hash(fl.label())];
                    let pos = bucket.iter().position(|e| Arc::ptr_eq(e, fl));
                    pos.map(|pos| {
                        self.size.fetch_sub(1, Ordering::AcqRel);
                        bucket.remove(pos)
                    })
                }
                _ => None,
            }
        };
        match removed {
            Some(_) => {
                self.stats.gc_freed.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// GC sweep. Returns the number of entries freed.
    pub fn run_gc(&self) -> usize {
        let now = self.timer.now_ms();
        let mut freed: Vec<Arc<FlowLabel>> = Vec::new();
        let mut sched: Option<u64> = None;

        {
            let mut buckets = self.buckets.write();
            let mut pending = self.gc_pending.lock();
            *pending = None;

            for bucket in buckets.iter_mut() {
                bucket.retain(|fl| match Self::idle_state(fl, now) {
                    IdleState::Expired => {
                        freed.push(fl.clone());
                        false
                    }
                    IdleState::Lingering(ttd) => {
                        sched = Some(sched.map_or(ttd, |s| s.min(ttd)));
                        true
                    }
                    IdleState::InUse => true,
                });
            }

            let remaining = self.size.fetch_sub(freed.len(), Ordering::AcqRel) - freed.len();
            if sched.is_none() && remaining != 0 {
                sched = Some(now.saturating_add(self.config.max_linger_secs as u64 * MSEC_PER_SEC));
            }
            match sched {
                Some(deadline) => {
                    *pending = Some(deadline);
                    self.timer.arm(deadline);
                }
                None => self.timer.disarm(),
            }
        }

        self.stats.gc_runs.fetch_add(1, Ordering::Relaxed);
        self.stats
            .gc_freed
            .fetch_add(freed.len() as u64, Ordering::Relaxed);
        klog!(
            Debug,
            "ip6_flowlabel: gc freed {} entries, next sweep {:?}",
            freed.len(),
            sched
        );
        freed.len()
    }

    /// Free every unreferenced entry of a namespace being torn down.
    ///
    /// Entries still bound to sockets stay until those sockets release them.
    pub fn purge_namespace(&self, netns: NetNsId) -> usize {
        let mut freed: Vec<Arc<FlowLabel>> = Vec::new();
        {
            let mut buckets = self.buckets.write();
            for bucket in buckets.iter_mut() {
                bucket.retain(|fl| {
                    if fl.netns() == netns && fl.users() == 0 {
                        freed.push(fl.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            self.size.fetch_sub(freed.len(), Ordering::AcqRel);
        }
        self.stats
            .purged
            .fetch_add(freed.len() as u64, Ordering::Relaxed);
        freed.len()
    }

    /// Snapshot the entries of one namespace, bucket-major.
    pub fn dump(&self, netns: NetNsId) -> Vec<FlowLabelInfo> {
        let now = self.timer.now_ms() as i64;
        let buckets = self.buckets.read();
        buckets
            .iter()
            .flat_map(|b| b.iter())
            .filter(|fl| fl.netns() == netns)
            .map(|fl| {
                let times = fl.times();
                FlowLabelInfo {
                    label: fl.label(),
                    share: fl.share(),
                    owner: fl.owner(),
                    users: fl.users(),
                    linger_secs: times.linger_ms / MSEC_PER_SEC,
                    expires_secs: (times.expires_ms as i64 - now) / MSEC_PER_SEC as i64,
                    dst: fl.dst(),
                    opt_len: times.opt.as_ref().map_or(0, |o| o.opt_nflen),
                }
            })
            .collect()
    }

    /// Write the text listing of one namespace.
    ///
    /// `owner_view` translates a recorded pid/uid into the reader's view.
    pub fn write_listing(
        &self,
        netns: NetNsId,
        out: &mut dyn fmt::Write,
        owner_view: &dyn Fn(FlowLabelOwner) -> u32,
    ) -> fmt::Result {
        out.write_str(FL_LISTING_HEADER)?;
        for info in self.dump(netns) {
            writeln!(
                out,
                "{:05X} {:<1} {:<6} {:<6} {:<6} {:<8} {:x} {:<4}",
                info.label,
                info.share.to_raw(),
                owner_view(info.owner),
                info.users,
                info.linger_secs,
                info.expires_secs,
                info.dst,
                info.opt_len
            )?;
        }
        Ok(())
    }
}

impl Drop for FlowLabelTable {
    fn drop(&mut self) {
        self.timer.disarm();
    }
}

impl fmt::Debug for FlowLabelTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowLabelTable")
            .field("size", &self.len())
            .field("gc_pending", &self.gc_deadline())
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// Test Support
// ============================================================================


// ============================================================================
// Tests
// ============================================================================
