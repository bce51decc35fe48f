//! Property tests for the staleness protocol's pure logic.
//!
//! The decision "is this mirrored row still fresh?" must be monotonic in
//! the freshness bound: loosening the bound can only keep more cached rows,
//! never fewer. These run against [`Freshness`] directly, the same
//! predicate the view cache consults before falling back to the remote
//! service.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use table_mirror::Freshness;

/// A fixed "now" keeps the properties deterministic.
fn anchor() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 1, 9, 12, 0, 0).unwrap()
}

proptest! {
    /// Fresh under a tight bound implies fresh under any looser bound.
    #[test]
    fn freshness_monotonic_in_bound(
        age_secs in 0i64..=86_400 * 30,
        d1_secs in 0i64..=86_400 * 30,
        extra_secs in 0i64..=86_400 * 30,
    ) {
        let now = anchor();
        let mirrored = now - Duration::seconds(age_secs);
        let tight = Freshness::MaxAge(Duration::seconds(d1_secs));
        let loose = Freshness::MaxAge(Duration::seconds(d1_secs + extra_secs));

        if tight.is_fresh(mirrored, now) {
            prop_assert!(loose.is_fresh(mirrored, now));
        }
    }

    /// The exact threshold: fresh iff age <= bound.
    #[test]
    fn freshness_matches_age_comparison(
        age_secs in 0i64..=86_400 * 30,
        bound_secs in 0i64..=86_400 * 30,
    ) {
        let now = anchor();
        let mirrored = now - Duration::seconds(age_secs);
        let bound = Freshness::MaxAge(Duration::seconds(bound_secs));

        prop_assert_eq!(bound.is_fresh(mirrored, now), age_secs <= bound_secs);
    }

    /// An absolute instant is exactly the relative bound `now - instant`.
    #[test]
    fn absolute_bound_equals_relative_conversion(
        age_secs in 0i64..=86_400 * 30,
        bound_secs in 0i64..=86_400 * 30,
    ) {
        let now = anchor();
        let mirrored = now - Duration::seconds(age_secs);

        let absolute = Freshness::Since(now - Duration::seconds(bound_secs));
        let relative = Freshness::MaxAge(Duration::seconds(bound_secs));

        prop_assert_eq!(
            absolute.is_fresh(mirrored, now),
            relative.is_fresh(mirrored, now)
        );
        prop_assert_eq!(absolute.max_age(now), relative.max_age(now));
    }

    /// A newer mirror stamp never turns a fresh read stale (monotonic in
    /// mirrored time too; the floor `max(row time, view time)` relies on
    /// this).
    #[test]
    fn freshness_monotonic_in_mirrored_time(
        age_secs in 0i64..=86_400 * 30,
        newer_by_secs in 0i64..=86_400 * 30,
        bound_secs in 0i64..=86_400 * 30,
    ) {
        let now = anchor();
        let older = now - Duration::seconds(age_secs);
        let newer = older + Duration::seconds(newer_by_secs.min(age_secs));
        let bound = Freshness::MaxAge(Duration::seconds(bound_secs));

        if bound.is_fresh(older, now) {
            prop_assert!(bound.is_fresh(newer, now));
        }
    }
}
