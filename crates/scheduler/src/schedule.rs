//! Interval keyword vocabulary and next-run calculation.
//!
//! Schedules are a small fixed set of interval keywords, not cron
//! expressions. Anything outside the vocabulary falls back to one hour so a
//! typo never blocks task creation; the fallback is logged at `warn`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

const HOUR: Duration = Duration::from_secs(3_600);

/// Interval used for descriptors outside the vocabulary.
pub const FALLBACK_INTERVAL: Duration = HOUR;

/// Recognized descriptors and the interval each maps to.
pub const VOCABULARY: &[(&str, Duration)] = &[
    ("hourly", HOUR),
    ("daily", Duration::from_secs(24 * 3_600)),
    ("every 30m", Duration::from_secs(30 * 60)),
    ("every 1h", HOUR),
    ("every 6h", Duration::from_secs(6 * 3_600)),
];

/// Result of resolving a schedule descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    /// Descriptor is part of the vocabulary.
    Known(Duration),
    /// Descriptor was not recognized; the fallback interval applies.
    Fallback(Duration),
}

impl Interval {
    pub fn duration(self) -> Duration {
        match self {
            Interval::Known(d) | Interval::Fallback(d) => d,
        }
    }

    pub fn is_fallback(self) -> bool {
        matches!(self, Interval::Fallback(_))
    }
}

/// Resolve a non-empty descriptor to its interval.
///
/// Matching ignores surrounding whitespace and ASCII case.
pub fn interval_for(descriptor: &str) -> Interval {
    let normalized = descriptor.trim().to_ascii_lowercase();
    VOCABULARY
        .iter()
        .find(|(keyword, _)| *keyword == normalized)
        .map(|(_, d)| Interval::Known(*d))
        .unwrap_or(Interval::Fallback(FALLBACK_INTERVAL))
}

/// Whether the descriptor disables automatic scheduling.
pub fn is_manual(descriptor: &str) -> bool {
    descriptor.trim().is_empty()
}

/// Next eligible run time for `descriptor`, counted from `now`.
///
/// Returns `None` for an empty descriptor (manual-only task).
pub fn next_run(descriptor: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if is_manual(descriptor) {
        return None;
    }

    let interval = interval_for(descriptor);
    if interval.is_fallback() {
        warn!(
            schedule = %descriptor,
            fallback_secs = FALLBACK_INTERVAL.as_secs(),
            "unrecognized schedule, using fallback interval"
        );
    }

    let step = chrono::Duration::from_std(interval.duration()).unwrap_or(chrono::Duration::hours(1));
    Some(now + step)
}
