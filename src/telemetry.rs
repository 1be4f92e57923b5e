//! Structured reporting of contract violations and broken invariants.
//!
//! Violations are not errors returned to the caller: they describe a caller bug or a corrupted
//! stream that the library refused to act on. Each violation is logged through `tracing` and is
//! also handed to the [`ViolationObserver`] installed on the reporting thread, if any (see
//! [`observe_thread`]).
//!
//! ```
//! use rampart_rollback::report_violation;
//! use rampart_rollback::telemetry::{ViolationKind, ViolationSeverity};
//!
//! report_violation!(
//!     ViolationSeverity::Warning,
//!     ViolationKind::InputQueue,
//!     "dropping input for frame {}",
//!     7
//! );
//! ```

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::Mutex;

/// Severity of a violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable; the operation continued with a fallback.
    Warning,
    /// The operation was refused or degraded.
    Error,
    /// An internal invariant is broken and state may be corrupted.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for logging labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subsystem in which a violation was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Frame counter or rollback bookkeeping went wrong.
    FrameSync,
    /// Input arrived out of sequence or a queue was misused.
    InputQueue,
    /// Saving or loading a snapshot failed.
    StateManagement,
    /// A peer sent something the protocol could not use.
    NetworkProtocol,
    /// Bit-level input encoding or decoding failed or overflowed.
    Encoding,
    /// Invalid configuration detected at runtime.
    Configuration,
    /// Internal logic error.
    InternalError,
    /// A type's invariant check failed.
    Invariant,
    /// Handshake issues such as exhausted retries.
    Synchronization,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FrameSync => "frame_sync",
            Self::InputQueue => "input_queue",
            Self::StateManagement => "state_management",
            Self::NetworkProtocol => "network_protocol",
            Self::Encoding => "encoding",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
            Self::Invariant => "invariant",
            Self::Synchronization => "synchronization",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded contract violation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContractViolation {
    /// The severity level of this violation.
    pub severity: ViolationSeverity,
    /// The subsystem where the violation occurred.
    pub kind: ViolationKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Source location where the violation was detected (file:line).
    pub location: &'static str,
}

impl ContractViolation {
    /// Creates a new violation.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
        }
    }
}

impl std::fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {})",
            self.severity, self.kind, self.message, self.location
        )
    }
}

/// Receives violations as they are reported.
pub trait ViolationObserver: Send + Sync {
    /// Called when a violation is detected. Must be quick; it may run on the simulation path.
    fn on_violation(&self, violation: &ContractViolation);
}

/// Default observer: logs through `tracing` with structured fields.
///
/// `Warning` maps to `tracing::warn!`, `Error` and `Critical` map to `tracing::error!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &ContractViolation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(severity, kind, location, "{}", violation.message);
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(severity, kind, location, "{}", violation.message);
            },
        }
    }
}

/// Observer that stores every violation, for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<ContractViolation>>,
}

impl CollectingObserver {
    /// Creates an observer with an empty violation list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all collected violations.
    #[must_use]
    pub fn violations(&self) -> Vec<ContractViolation> {
        self.violations.lock().clone()
    }

    /// Returns true if any violation of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// True when nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &ContractViolation) {
        self.violations.lock().push(violation.clone());
    }
}

thread_local! {
    static THREAD_OBSERVER: RefCell<Option<Arc<dyn ViolationObserver>>> =
        const { RefCell::new(None) };
}

/// Routes violations reported on the current thread to `observer` until the guard is dropped.
///
/// Sessions run on the thread that drives them, so installing an observer there captures
/// everything the session and its components report. Logging through `tracing` continues.
///
/// ```
/// use std::sync::Arc;
/// use rampart_rollback::report_violation;
/// use rampart_rollback::telemetry::{
///     observe_thread, CollectingObserver, ViolationKind, ViolationSeverity,
/// };
///
/// let observer = Arc::new(CollectingObserver::new());
/// {
///     let _guard = observe_thread(observer.clone());
///     report_violation!(ViolationSeverity::Warning, ViolationKind::Encoding, "overflow");
/// }
/// assert!(observer.has_violation(ViolationKind::Encoding));
/// ```
#[must_use = "the observer is removed when the guard is dropped"]
pub fn observe_thread(observer: Arc<dyn ViolationObserver>) -> ObserverGuard {
    let previous = THREAD_OBSERVER.with(|slot| slot.borrow_mut().replace(observer));
    ObserverGuard { previous }
}

/// Restores the previously installed observer when dropped. Returned by [`observe_thread`].
pub struct ObserverGuard {
    previous: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for ObserverGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverGuard")
            .field("restores_previous", &self.previous.is_some())
            .finish()
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        THREAD_OBSERVER.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Logs `violation` and hands it to this thread's observer. Used by [`report_violation!`].
#[doc(hidden)]
pub fn dispatch(violation: &ContractViolation) {
    TracingObserver.on_violation(violation);
    // clone out of the slot so an observer may report violations itself
    let observer = THREAD_OBSERVER.with(|slot| slot.borrow().clone());
    if let Some(observer) = observer {
        observer.on_violation(violation);
    }
}

/// Reports a violation with the current file and line: it is logged through [`TracingObserver`]
/// and passed to the observer installed with [`observe_thread`].
///
/// ```text
/// report_violation!(severity, kind, "message");
/// report_violation!(severity, kind, "message with {}", args);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::ContractViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::dispatch(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::ContractViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::dispatch(&violation);
    }};
}

/// Result of a failed invariant check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InvariantViolation {
    /// Name of the type whose invariant was violated.
    pub type_name: &'static str,
    /// Description of the violated invariant.
    pub invariant: String,
    /// Additional diagnostic context.
    pub details: Option<String>,
}

impl InvariantViolation {
    /// Creates a new invariant violation.
    #[must_use]
    pub fn new(type_name: &'static str, invariant: impl Into<String>) -> Self {
        Self {
            type_name,
            invariant: invariant.into(),
            details: None,
        }
    }

    /// Adds additional details to the violation.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.type_name, self.invariant)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

/// Types that maintain internal invariants which can be checked at runtime.
pub trait InvariantChecker {
    /// Returns the first broken invariant, if any.
    fn check_invariants(&self) -> Result<(), InvariantViolation>;
}

/// Checks invariants in debug builds (or with the `paranoid` feature) and reports failures as
/// critical violations. Compiles to nothing otherwise.
#[macro_export]
#[cfg(any(debug_assertions, feature = "paranoid"))]
macro_rules! debug_check_invariants {
    ($expr:expr, $context:expr) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(violation) = $expr.check_invariants() {
            $crate::report_violation!(
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "{} [context: {}]",
                violation,
                $context
            );
        }
    }};
}

/// No-op version for release builds without `paranoid`.
#[macro_export]
#[cfg(not(any(debug_assertions, feature = "paranoid")))]
macro_rules! debug_check_invariants {
    ($expr:expr, $context:expr) => {{}};
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_ordered() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn kind_labels() {
        assert_eq!(ViolationKind::InputQueue.as_str(), "input_queue");
        assert_eq!(ViolationKind::Encoding.as_str(), "encoding");
        assert_eq!(ViolationKind::Synchronization.to_string(), "synchronization");
    }

    #[test]
    fn violation_display() {
        let violation = ContractViolation::new(
            ViolationSeverity::Error,
            ViolationKind::FrameSync,
            "load failed",
            "sync_layer.rs:10",
        );
        assert_eq!(
            violation.to_string(),
            "[error/frame_sync] load failed (at sync_layer.rs:10)"
        );
    }

    #[test]
    fn thread_observer_receives_reported_violations() {
        let observer = Arc::new(CollectingObserver::new());
        {
            let _guard = observe_thread(observer.clone());
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Encoding,
                "{} frames did not fit",
                3
            );
        }
        let violations = observer.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, ViolationSeverity::Warning);
        assert_eq!(violations[0].message, "3 frames did not fit");
        assert!(violations[0].location.contains("telemetry.rs"));
        assert!(!observer.has_violation(ViolationKind::InputQueue));

        // dropped guard: nothing is routed any more
        report_violation!(
            ViolationSeverity::Error,
            ViolationKind::InputQueue,
            "after the guard"
        );
        assert!(!observer.has_violation(ViolationKind::InputQueue));
    }

    #[test]
    fn nested_observers_restore_the_outer_one() {
        let outer = Arc::new(CollectingObserver::new());
        let inner = Arc::new(CollectingObserver::new());
        let _outer_guard = observe_thread(outer.clone());
        {
            let _inner_guard = observe_thread(inner.clone());
            report_violation!(ViolationSeverity::Error, ViolationKind::FrameSync, "inner");
        }
        report_violation!(ViolationSeverity::Error, ViolationKind::Encoding, "outer");

        assert!(inner.has_violation(ViolationKind::FrameSync));
        assert!(!inner.has_violation(ViolationKind::Encoding));
        assert!(outer.has_violation(ViolationKind::Encoding));
        assert!(!outer.has_violation(ViolationKind::FrameSync));
    }

    #[test]
    fn other_threads_are_not_observed() {
        let observer = Arc::new(CollectingObserver::new());
        let _guard = observe_thread(observer.clone());
        std::thread::spawn(|| {
            report_violation!(ViolationSeverity::Warning, ViolationKind::Encoding, "elsewhere");
        })
        .join()
        .unwrap();
        assert!(observer.is_empty());
    }

    #[test]
    fn invariant_violation_display() {
        let violation = InvariantViolation::new("InputQueue", "length exceeds capacity")
            .with_details("length=9, capacity=8");
        assert_eq!(
            violation.to_string(),
            "InputQueue: length exceeds capacity (length=9, capacity=8)"
        );
    }

    #[test]
    fn report_violation_macro_accepts_format_args() {
        report_violation!(
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "dropping packet from {}",
            "peer"
        );
        report_violation!(
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "plain message"
        );
    }
}
