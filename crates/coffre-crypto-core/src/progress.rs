//! Cancellable, weighted progress reporting for load/save pipelines.
//!
//! The CPU-heavy stages (key derivation, block encryption, compression)
//! each own a weighted sub-range of a parent [`Progress`]: the parent is
//! created with a fixed unit total and hands out children via
//! [`Progress::child`], pinning how many parent units the child's own
//! 0..total range maps onto. Completing a child drives the parent
//! forward proportionally.
//!
//! Cancellation is a single flag shared by the whole tree. Stages poll
//! it with [`Progress::check_cancelled`] and abort by returning
//! [`ProgressInterruption`] — a dedicated condition that must reach the
//! caller untouched, never rewrapped as a format or crypto error.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Raised when a long-running operation is interrupted by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProgressInterruption {
    /// The user pressed "cancel".
    #[error("cancelled by user")]
    CancelledByUser,
}

struct Shared {
    completed: AtomicU64,
    total: AtomicU64,
    cancelled: Arc<AtomicBool>,
    /// Link to the parent range: (parent shared state, parent units this
    /// child is worth, parent units already donated).
    parent: Option<(Arc<Shared>, u64, AtomicU64)>,
}

impl Shared {
    fn add_completed(self: &Arc<Self>, units: u64) {
        let before = self.completed.fetch_add(units, Ordering::AcqRel);
        let now = before.saturating_add(units);
        self.donate(now);
    }

    fn set_completed(self: &Arc<Self>, units: u64) {
        self.completed.store(units, Ordering::Release);
        self.donate(units);
    }

    /// Push this node's progress up into the parent's unit space.
    // The division is guarded by the total == 0 branch above it.
    #[allow(clippy::arithmetic_side_effects)]
    fn donate(self: &Arc<Self>, completed: u64) {
        let Some((parent, pending, donated)) = self.parent.as_ref() else {
            return;
        };
        let total = self.total.load(Ordering::Acquire);
        let target = if total == 0 {
            0
        } else {
            // pending * min(completed, total) / total, in u128 to avoid overflow
            let capped = completed.min(total);
            let scaled = u128::from(*pending).saturating_mul(u128::from(capped))
                / u128::from(total);
            u64::try_from(scaled).unwrap_or(u64::MAX)
        };
        let prev = donated.swap(target, Ordering::AcqRel);
        if target > prev {
            parent.add_completed(target.saturating_sub(prev));
        }
    }
}

/// A node in a cancellable progress tree.
///
/// Cloning is cheap and shares state; the root is typically created by
/// the caller of `Database::load`/`save` and observed from another
/// thread.
#[derive(Clone)]
pub struct Progress {
    shared: Arc<Shared>,
}

impl Progress {
    /// Create a root progress with the given unit total.
    #[must_use]
    pub fn new(total_units: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                completed: AtomicU64::new(0),
                total: AtomicU64::new(total_units),
                cancelled: Arc::new(AtomicBool::new(false)),
                parent: None,
            }),
        }
    }

    /// Spawn a child occupying `pending_units` of this node's range.
    ///
    /// The child starts with a zero total; the stage that owns it calls
    /// [`Progress::set_total`] once its workload size is known.
    #[must_use]
    pub fn child(&self, pending_units: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                completed: AtomicU64::new(0),
                total: AtomicU64::new(0),
                cancelled: Arc::clone(&self.shared.cancelled),
                parent: Some((Arc::clone(&self.shared), pending_units, AtomicU64::new(0))),
            }),
        }
    }

    /// Set this node's own unit total.
    pub fn set_total(&self, total_units: u64) {
        self.shared.total.store(total_units, Ordering::Release);
    }

    /// Advance by `units`.
    pub fn complete_units(&self, units: u64) {
        self.shared.add_completed(units);
    }

    /// Jump to an absolute completed count.
    pub fn set_completed(&self, units: u64) {
        self.shared.set_completed(units);
    }

    /// Mark this node fully complete (donates any remaining parent units).
    pub fn finish(&self) {
        let total = self.shared.total.load(Ordering::Acquire);
        self.shared.set_completed(total);
    }

    /// Completed fraction in `0.0..=1.0` (0.0 while the total is unset).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        let total = self.shared.total.load(Ordering::Acquire);
        if total == 0 {
            return 0.0;
        }
        let completed = self.shared.completed.load(Ordering::Acquire).min(total);
        completed as f64 / total as f64
    }

    /// Request cancellation of the whole tree.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    /// Returns `true` if cancellation was requested anywhere in the tree.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Poll the cancellation flag.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressInterruption::CancelledByUser`] if cancellation
    /// was requested.
    pub fn check_cancelled(&self) -> Result<(), ProgressInterruption> {
        if self.is_cancelled() {
            Err(ProgressInterruption::CancelledByUser)
        } else {
            Ok(())
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new(100)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_progress_tracks_fraction() {
        let p = Progress::new(100);
        assert!(p.fraction() < f64::EPSILON);
        p.complete_units(25);
        assert!((p.fraction() - 0.25).abs() < 1e-9);
        p.finish();
        assert!((p.fraction() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn child_donates_proportionally() {
        let root = Progress::new(100);
        let child = root.child(60);
        child.set_total(1000);
        child.complete_units(500);
        // half of the 60-unit range
        assert!((root.fraction() - 0.30).abs() < 1e-9);
        child.finish();
        assert!((root.fraction() - 0.60).abs() < 1e-9);
    }

    #[test]
    fn finished_child_never_overdonates() {
        let root = Progress::new(100);
        let child = root.child(60);
        child.set_total(10);
        child.complete_units(50); // way past its own total
        assert!((root.fraction() - 0.60).abs() < 1e-9);
    }

    #[test]
    fn nested_children_compose() {
        let root = Progress::new(100);
        let stage = root.child(20);
        stage.set_total(100);
        let sub = stage.child(100);
        sub.set_total(4);
        sub.complete_units(2);
        assert!((root.fraction() - 0.10).abs() < 1e-9);
    }

    #[test]
    fn cancellation_propagates_to_children() {
        let root = Progress::new(100);
        let child = root.child(60);
        root.cancel();
        assert!(child.is_cancelled());
        assert_eq!(
            child.check_cancelled(),
            Err(ProgressInterruption::CancelledByUser)
        );
    }

    #[test]
    fn cancellation_propagates_from_children() {
        let root = Progress::new(100);
        let child = root.child(60);
        child.cancel();
        assert!(root.is_cancelled());
    }

    #[test]
    fn zero_total_child_is_harmless() {
        let root = Progress::new(100);
        let child = root.child(10);
        child.complete_units(5);
        assert!(root.fraction() < f64::EPSILON);
    }
}
