//! [`SchedItem`]: one request for a buildlet, and the `Less` ordering
//! relation used by every [`crate::quota::QuotaQueue`] (§3).

use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};

/// Branch prefixes treated as release branches for the purposes of the
/// `automated` class's release-branch preference (§3, `Less`).
const RELEASE_BRANCH_PREFIX: &str = "release-branch.";

/// The four priority classes, ordered lowest-number-wins (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestClass {
    /// `release` — highest priority.
    Urgent,
    /// `gomote` — interactive, human at a terminal.
    Interactive,
    /// `try` — automated pre-submit verification.
    Automated,
    /// background continuous-build work; the default class.
    Batch,
}

impl RequestClass {
    /// Short name used in logs and status snapshots.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "release",
            Self::Interactive => "gomote",
            Self::Automated => "try",
            Self::Batch => "batch",
        }
    }
}

/// One request for a buildlet of a given host type (§3).
///
/// `request_time` is assigned by the scheduler at submission and, per the
/// data-model invariant, the item is logically immutable for ordering
/// purposes once that happens — nothing in this crate mutates `commit_time`,
/// `branch`, or `class` after construction.
#[derive(Debug, Clone)]
pub struct SchedItem {
    /// Host-type key into the host-configuration table.
    pub host_type: String,
    /// Priority class this request belongs to.
    pub class: RequestClass,
    /// `true` if this is a helper build triggered by another build; carried
    /// for observability only; it does not change priority-class ordering.
    pub helper: bool,
    /// Source-repo branch under test.
    pub branch: String,
    /// Last commit time of the change under test, if known.
    pub commit_time: Option<DateTime<Utc>>,
    /// Assigned by the scheduler at submission (§3 invariant: monotonic
    /// per-scheduler). `None` until `Scheduler::acquire` sets it.
    pub request_time: Option<DateTime<Utc>>,
    /// Optional owner/user tag for observability.
    pub owner: Option<String>,
}

impl SchedItem {
    /// Start building an item. `request_time` is left unset; the scheduler
    /// assigns it at submission.
    #[must_use]
    pub fn new(host_type: impl Into<String>, class: RequestClass, branch: impl Into<String>) -> Self {
        Self {
            host_type: host_type.into(),
            class,
            helper: false,
            branch: branch.into(),
            commit_time: None,
            request_time: None,
            owner: None,
        }
    }

    /// Attach a commit time.
    #[must_use]
    pub fn with_commit_time(mut self, commit_time: DateTime<Utc>) -> Self {
        self.commit_time = Some(commit_time);
        self
    }

    /// Mark this item as a helper build.
    #[must_use]
    pub fn with_helper(mut self, helper: bool) -> Self {
        self.helper = helper;
        self
    }

    /// Attach an owner/user tag.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// `true` if `branch` looks like a release branch.
    #[must_use]
    pub fn is_release_branch(&self) -> bool {
        self.branch.starts_with(RELEASE_BRANCH_PREFIX)
    }

    /// The timestamp used for FIFO/LIFO tie-breaking within a class (§3):
    /// `commit_time` if set and the class is neither `Interactive` nor
    /// `Automated`, otherwise `request_time`.
    ///
    /// Items with no `request_time` yet (not submitted) sort as if they
    /// arrived at the Unix epoch, which only matters for items under
    /// construction — nothing enqueues an item before the scheduler stamps it.
    #[must_use]
    pub fn sort_time(&self) -> DateTime<Utc> {
        let use_commit_time = self.commit_time.is_some()
            && !matches!(self.class, RequestClass::Interactive | RequestClass::Automated);
        if use_commit_time {
            self.commit_time.unwrap()
        } else {
            self.request_time.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        }
    }

    /// The `Less` relation (§3): `true` if `self` should be granted no
    /// later than `other` in the same queue.
    ///
    /// Strict and antisymmetric: ties (equal class, equal release-branch
    /// status, equal `sort_time`) return `false` both ways.
    #[must_use]
    pub fn precedes(&self, other: &Self) -> bool {
        if self.class != other.class {
            return self.class < other.class;
        }

        if self.class == RequestClass::Automated {
            let (a, b) = (self.is_release_branch(), other.is_release_branch());
            if a != b {
                return a;
            }
        }

        if self.class == RequestClass::Batch {
            // LIFO: newer first.
            return self.sort_time() > other.sort_time();
        }

        // FIFO: older first.
        self.sort_time() < other.sort_time()
    }
}

/// Monotonic per-scheduler clock used to assign `request_time` (§3
/// invariant). Wall-clock time with a forced tick forward on collision so
/// two items submitted in the same microsecond still get a strict order.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_nanos: AtomicI64,
}

impl MonotonicClock {
    /// Construct a fresh clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next timestamp, guaranteed strictly greater than every
    /// timestamp previously returned by this clock.
    pub fn next(&self) -> DateTime<Utc> {
        let now_nanos = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut prev = self.last_nanos.load(AtomicOrdering::Acquire);
        loop {
            let candidate = now_nanos.max(prev + 1);
            match self.last_nanos.compare_exchange_weak(
                prev,
                candidate,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => return DateTime::from_timestamp_nanos(candidate),
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_at(class: RequestClass, branch: &str, secs: i64) -> SchedItem {
        SchedItem {
            host_type: "linux-amd64".into(),
            class,
            helper: false,
            branch: branch.into(),
            commit_time: None,
            request_time: Some(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(secs)),
            owner: None,
        }
    }

    #[test]
    fn lower_class_always_precedes() {
        let release = item_at(RequestClass::Urgent, "main", 100);
        let batch = item_at(RequestClass::Batch, "main", 1);
        assert!(release.precedes(&batch));
        assert!(!batch.precedes(&release));
    }

    #[test]
    fn batch_is_lifo() {
        let older = item_at(RequestClass::Batch, "main", 1);
        let newer = item_at(RequestClass::Batch, "main", 2);
        assert!(newer.precedes(&older));
        assert!(!older.precedes(&newer));
    }

    #[test]
    fn try_is_fifo() {
        let older = item_at(RequestClass::Automated, "main", 1);
        let newer = item_at(RequestClass::Automated, "main", 2);
        assert!(older.precedes(&newer));
        assert!(!newer.precedes(&older));
    }

    #[test]
    fn automated_release_branch_precedes_non_release() {
        let release_branch = item_at(RequestClass::Automated, "release-branch.go1.21", 100);
        let main_branch = item_at(RequestClass::Automated, "main", 1);
        assert!(release_branch.precedes(&main_branch));
        assert!(!main_branch.precedes(&release_branch));
    }

    #[test]
    fn precedes_is_antisymmetric_on_ties() {
        let a = item_at(RequestClass::Batch, "main", 5);
        let b = item_at(RequestClass::Batch, "main", 5);
        assert!(!a.precedes(&b));
        assert!(!b.precedes(&a));
    }

    #[test]
    fn monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let mut last = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > last);
            last = next;
        }
    }

    fn arb_class() -> impl proptest::strategy::Strategy<Value = RequestClass> {
        use proptest::prelude::*;
        prop_oneof![
            Just(RequestClass::Urgent),
            Just(RequestClass::Interactive),
            Just(RequestClass::Automated),
            Just(RequestClass::Batch),
        ]
    }

    fn arb_item() -> impl proptest::strategy::Strategy<Value = SchedItem> {
        use proptest::prelude::*;
        (arb_class(), 0i64..1_000_000, any::<bool>()).prop_map(|(class, secs, release_branch)| {
            let branch = if release_branch {
                "release-branch.go1.21".to_string()
            } else {
                "main".to_string()
            };
            item_at(class, &branch, secs)
        })
    }

    proptest::proptest! {
        /// §8: `Less` is antisymmetric for any two items, not just the
        /// handful of hand-picked scenarios above.
        #[test]
        fn precedes_is_never_mutual(a in arb_item(), b in arb_item()) {
            proptest::prop_assert!(!(a.precedes(&b) && b.precedes(&a)));
        }
    }
}
