//! Kernel logging (`klog`) for the IPv6 flow-label subsystem.
//!
//! Profile-aware logging macros shared by every kernel sub-crate. The crate
//! has no knowledge of the console: the boot path registers a sink with
//! [`register_sink`] and every emitted record is handed to it together with
//! its [`Level`].
//!
//! # Macro Overview
//!
//! | Macro | Release build | Profile-aware | Use case |
//! |-------|--------------|---------------|----------|
//! | [`kprintln!`] | Compiled out | No | Debug diagnostics |
//! | [`klog!`] | Active | Yes | Operational logging with level filter |
//! | [`klog_always!`] | Active | Secure-gated | Status messages |
//! | [`klog_force!`] | Active | No | Critical errors |
//!
//! # Profiles
//!
//! Filtering is decided at runtime by [`set_profile`]:
//!
//! - **Secure** : no output
//! - **Balanced**: `Error` + `Warn` only
//! - **Performance**: all levels
//!
//! Until a profile is set, and while no sink is registered, nothing is
//! printed. The hot path is a single `Relaxed` atomic load + integer compare.

#![no_std]

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

// ============================================================================
// Log Levels
// ============================================================================

/// Severity level for [`klog!`] messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing (compiled out in release).
    Trace = 0,
    /// Developer-oriented debug information (compiled out in release).
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness.
    Error = 4,
}

impl Level {
    /// Short tag printed in front of a record.
    pub const fn tag(self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

// ============================================================================
// Profile Filter
// ============================================================================

const LEVEL_DISABLED: u8 = u8::MAX;

static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_DISABLED);

/// Gate for [`klog_always!`]; closed until [`set_profile`] opens it.
static LOG_ALWAYS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Logging profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KlogProfile {
    /// No klog output at all.
    Secure = 0,
    /// Errors and warnings only.
    Balanced = 1,
    /// All levels.
    Performance = 2,
}

/// Set the klog filter from a profile. May be called again at runtime.
#[inline]
pub fn set_profile(profile: KlogProfile) {
    let min = match profile {
        KlogProfile::Secure => LEVEL_DISABLED,
        KlogProfile::Balanced => Level::Warn as u8,
        KlogProfile::Performance => Level::Trace as u8,
    };
    LOG_MIN_LEVEL.store(min, Ordering::Release);
    LOG_ALWAYS_ENABLED.store(profile != KlogProfile::Secure, Ordering::Release);
}

/// Disable all [`klog!`] output. Does not affect [`klog_always!`].
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_always_enabled() -> bool {
    LOG_ALWAYS_ENABLED.load(Ordering::Relaxed)
}

// ============================================================================
// Sink
// ============================================================================

/// Output function receiving every emitted record.
///
/// `None` marks unlevelled output from [`klog_always!`] / [`klog_force!`].
pub type KlogSink = fn(Option<Level>, fmt::Arguments);

static SINK: spin::Once<KlogSink> = spin::Once::new();

/// Register the output sink. Only the first registration takes effect.
pub fn register_sink(sink: KlogSink) {
    SINK.call_once(|| sink);
}

/// Returns `true` once a sink has been registered.
pub fn has_sink() -> bool {
    SINK.get().is_some()
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_print(level: Option<Level>, args: fmt::Arguments) {
    if let Some(sink) = SINK.get() {
        sink(level, args);
    }
}

// ============================================================================
// Macros
// ============================================================================

/// Profile-gated output (status messages). Suppressed in `Secure`.
#[macro_export]
macro_rules! klog_always {
    () => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_print(None, format_args!("\n"));
        }
    }};
    ($($arg:tt)+) => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_print(None, format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}

/// Unconditional output, never suppressed by any profile.
#[macro_export]
macro_rules! klog_force {
    () => {{
        $crate::_klog_print(None, format_args!("\n"));
    }};
    ($($arg:tt)+) => {{
        $crate::_klog_print(None, format_args!("{}\n", format_args!($($arg)+)));
    }};
}

/// Debug-only print, fully compiled out in release builds.
#[macro_export]
macro_rules! kprintln {
    () => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!();
    }};
    ($($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!($($arg)+);
    }};
}

/// Profile-aware logging.
///
/// `Debug` and `Trace` are additionally compiled out in release builds.
///
/// ```ignore
/// klog!(Warn, "ip6_flowlabel: admission cap reached ({} in use)", used);
/// klog!(Debug, "ip6_flowlabel: gc freed {} entries", freed);
/// ```
#[macro_export]
macro_rules! klog {
    (Error, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Error) {
            $crate::_klog_print(
                Some($crate::Level::Error),
                format_args!("{}\n", format_args!($($arg)+)),
            );
        }
    }};
    (Warn, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Warn) {
            $crate::_klog_print(
                Some($crate::Level::Warn),
                format_args!("{}\n", format_args!($($arg)+)),
            );
        }
    }};
    (Info, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Info) {
            $crate::_klog_print(
                Some($crate::Level::Info),
                format_args!("{}\n", format_args!($($arg)+)),
            );
        }
    }};
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Debug) {
            $crate::_klog_print(
                Some($crate::Level::Debug),
                format_args!("{}\n", format_args!($($arg)+)),
            );
        }
    }};
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Trace) {
            $crate::_klog_print(
                Some($crate::Level::Trace),
                format_args!("{}\n", format_args!($($arg)+)),
            );
        }
    }};
}
