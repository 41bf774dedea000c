//! Property-based tests for core components using proptest.

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use embargo_core::DataValue;
use embargo_core::batch::{Batches, batched};
use embargo_core::filter::{FieldSource, Filter};
use embargo_core::timespan::{EmbargoWindow, hours_to_duration, parse_window};

fn instant(seconds: i64, micros: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).unwrap() + Duration::microseconds(micros)
}

struct Exposure(i64);

impl FieldSource for Exposure {
    fn field(&self, name: &str) -> Option<DataValue> {
        (name == "exposure").then_some(DataValue::Int(self.0))
    }
}

// --- Embargo boundary properties ---

proptest! {
    #[test]
    fn records_ending_before_the_boundary_are_admitted(
        seconds in 1_500_000_000i64..1_800_000_000,
        micros in 0i64..1_000_000,
        hours in 0.0f64..1000.0,
        offset in -10_000_000_000i64..10_000_000_000,
    ) {
        let now = instant(seconds, micros);
        let window = EmbargoWindow::resolve(now, hours, None).unwrap();
        let end = window.end + Duration::microseconds(offset);
        prop_assert_eq!(window.admits(end), offset < 0);
    }

    #[test]
    fn window_bounds_are_half_open(
        seconds in 1_500_000_000i64..1_800_000_000,
        hours in 0.0f64..100.0,
        span in 1i64..1_000_000_000,
        offset in -2_000_000_000i64..2_000_000_000,
    ) {
        let now = instant(seconds, 0);
        let window = EmbargoWindow::resolve(now, hours, Some(Duration::microseconds(span))).unwrap();
        let start = window.start.unwrap();
        prop_assert_eq!(window.end - start, Duration::microseconds(span));

        let at = start + Duration::microseconds(offset);
        prop_assert_eq!(window.admits(at), offset >= 0 && offset < span);
    }

    #[test]
    fn embargo_never_ends_after_now(
        seconds in 1_500_000_000i64..1_800_000_000,
        hours in 0.0f64..10_000.0,
    ) {
        let now = instant(seconds, 0);
        let window = EmbargoWindow::resolve(now, hours, None).unwrap();
        prop_assert!(window.end <= now);
        prop_assert_eq!(now - window.end, hours_to_duration(hours).unwrap());
    }

    #[test]
    fn negative_or_non_finite_hours_are_rejected(hours in prop_oneof![
        (-1e9f64..-1e-9),
        Just(f64::NAN),
        Just(f64::INFINITY),
    ]) {
        prop_assert!(EmbargoWindow::resolve(instant(1_600_000_000, 0), hours, None).is_err());
    }

    #[test]
    fn window_quantities_add_up(h in 0i64..200, m in 0i64..60, s in 0i64..60) {
        let parsed = parse_window(&format!("{h}hr {m}min {s}s")).unwrap();
        prop_assert_eq!(
            parsed,
            Duration::hours(h) + Duration::minutes(m) + Duration::seconds(s)
        );
    }
}

// --- Batching properties ---

proptest! {
    #[test]
    fn batches_cover_every_item_once(
        items in proptest::collection::vec(any::<i64>(), 0..500),
        size in 1usize..64,
    ) {
        let batches: Vec<&[i64]> = batched(&items, size).collect();
        prop_assert_eq!(batches.len(), items.len().div_ceil(size));
        prop_assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= size));
        let flat: Vec<i64> = batches.concat();
        prop_assert_eq!(flat, items);
    }

    #[test]
    fn lazy_batches_match_slices(
        items in proptest::collection::vec(any::<u32>(), 0..300),
        size in 1usize..40,
    ) {
        let lazy: Vec<Vec<u32>> = Batches::new(items.iter().copied(), size).collect();
        let eager: Vec<Vec<u32>> = batched(&items, size).map(<[u32]>::to_vec).collect();
        prop_assert_eq!(lazy, eager);
    }
}

// --- Filter properties ---

proptest! {
    #[test]
    fn in_list_matches_members_only(
        members in proptest::collection::btree_set(0i64..1000, 1..20),
        value in 0i64..1000,
    ) {
        let list = members.iter().map(i64::to_string).collect::<Vec<_>>().join(", ");
        let filter = Filter::parse(&format!("exposure IN ({list})")).unwrap().unwrap();
        prop_assert_eq!(filter.matches(&Exposure(value)), members.contains(&value));

        let negated = Filter::parse(&format!("NOT exposure IN ({list})")).unwrap().unwrap();
        prop_assert_eq!(negated.matches(&Exposure(value)), !members.contains(&value));
    }

    #[test]
    fn comparisons_agree_with_integers(bound in -1000i64..1000, value in -1000i64..1000) {
        let filter = Filter::parse(&format!("exposure >= {bound}")).unwrap().unwrap();
        prop_assert_eq!(filter.matches(&Exposure(value)), value >= bound);
    }
}
