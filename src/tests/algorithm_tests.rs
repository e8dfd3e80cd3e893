use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::fixtures::*;
use crate::holder_metrics::ClientPriorityHolderMetrics;
use crate::poll_algorithm::PollAlgorithmConfig;
use crate::rate_limit::RateLimiter;

proptest! {
    #[test]
    fn single_client_takes_every_offered_slot(available in 0usize..100_000) {
        let m = metrics(single(), clock(), None);
        prop_assert_eq!(m.algorithm().calculate_slots(available, &m), available);
    }

    #[test]
    fn multiple_client_capacity_stays_in_unit_range(
        polls in prop::collection::vec((1usize..64, 0usize..128, any::<bool>()), 1..50)
    ) {
        let mut m = metrics(multiple(), clock(), None);
        for (reserved, received, exception) in polls {
            m.poll_begin(reserved);
            m.poll_end(received, exception);
            m.release(exception);
            prop_assert!(m.capacity_percentage() >= Decimal::ZERO);
            prop_assert!(m.capacity_percentage() <= Decimal::ONE);
        }
    }
}

fn no_overage() -> PollAlgorithmConfig {
    PollAlgorithmConfig {
        allowed_overage: 0,
        ..Default::default()
    }
}

#[test]
fn test_multiple_slots_follow_capacity() {
    let m = metrics(multiple_with(no_overage()), clock(), None);
    let algorithm = Arc::clone(m.algorithm());

    assert_eq!(algorithm.calculate_slots(0, &m), 0);
    // ceil(0.75 * 10)
    assert_eq!(algorithm.calculate_slots(10, &m), 8);
    assert_eq!(algorithm.calculate_slots(1, &m), 1);
}

#[test]
fn test_multiple_slots_add_overage_up_to_available() {
    let m = metrics(multiple(), clock(), None);
    let algorithm = Arc::clone(m.algorithm());

    assert_eq!(algorithm.calculate_slots(10, &m), 10);
    assert_eq!(algorithm.calculate_slots(100, &m), 80);
}

#[test]
fn test_empty_capacity_still_takes_one_slot() {
    let mut m = metrics(multiple_with(no_overage()), clock(), None);
    m.capacity_percentage = Decimal::ZERO;
    assert_eq!(m.algorithm().calculate_slots(10, &m), 1);
}

#[test]
fn test_rate_limiter_scales_slots() {
    let limiter: Arc<dyn RateLimiter> = Arc::new(FixedRateLimiter(dec!(0.5)));
    let m = metrics(multiple_with(no_overage()), clock(), Some(limiter));
    assert_eq!(m.algorithm().calculate_slots(10, &m), 4);

    let limiter: Arc<dyn RateLimiter> = Arc::new(FixedRateLimiter(Decimal::ZERO));
    let m = metrics(multiple(), clock(), Some(limiter));
    assert_eq!(m.algorithm().calculate_slots(10, &m), 0);
}

#[test]
fn test_never_polled_holder_is_past_due() {
    let clock = clock();
    let mut m = metrics(multiple(), Arc::clone(&clock), None);
    assert!(m.is_poll_past_due());

    m.reserve(10);
    assert!(!m.is_poll_past_due());

    clock.advance(Duration::from_millis(1000));
    assert!(!m.is_poll_past_due());

    clock.advance(Duration::from_millis(1));
    assert!(m.is_poll_past_due());
}

#[test]
fn test_past_due_clears_pending_skips() {
    let clock = clock();
    let mut m = metrics(multiple(), Arc::clone(&clock), None);
    m.reserve(10);
    m.poll_begin(10);
    m.poll_end(0, false);
    m.poll_begin(10);
    m.poll_end(0, false);
    assert_eq!(m.skip_count(), 2);

    clock.advance(Duration::from_millis(1500));
    assert!(!m.should_skip());
    assert_eq!(m.skip_count(), 0);
}

#[test]
fn test_skip_count_is_capped() {
    let mut m = metrics(
        multiple_with(PollAlgorithmConfig {
            max_skip_cycles: 3,
            ..Default::default()
        }),
        clock(),
        None,
    );
    for _ in 0..10 {
        m.poll_begin(1);
        m.poll_end(0, false);
    }
    assert_eq!(m.skip_count(), 3);
}

#[test]
fn test_fabric_wait_follows_poll_outcome() {
    let mut m = metrics(multiple(), clock(), None);
    assert_eq!(m.fabric_poll_wait_time(), Some(1000));

    m.poll_begin(5);
    m.poll_end(5, false);
    assert_eq!(m.fabric_poll_wait_time(), Some(100));
    assert_eq!(m.skip_count(), 0);

    m.poll_begin(5);
    m.poll_end(2, true);
    assert_eq!(m.fabric_poll_wait_time(), Some(1000));
    assert_eq!(m.skip_count(), 1);
}

#[test]
fn test_full_success_rate_shortens_allowed_wait() {
    let mut m = metrics(multiple(), clock(), None);
    m.poll_begin(4);
    m.poll_end(4, false);
    m.release(false);

    assert_eq!(m.poll_success_rate(), Decimal::ONE);
    assert_eq!(m.max_allowed_poll_wait(), 100);

    m.capacity_reset();
    assert_eq!(m.max_allowed_poll_wait(), 1000);
    assert_eq!(m.capacity_percentage(), dec!(0.75));
}

#[test]
fn test_release_without_attempts_leaves_capacity() {
    let mut m = metrics(multiple(), clock(), None);
    m.release(false);
    assert_eq!(m.capacity_percentage(), dec!(0.75));
    assert_eq!(m.poll_out(), 1);
}

#[test]
fn test_multiple_priority_is_weighted_and_cached() {
    let clock = clock();
    let mut m = ClientPriorityHolderMetrics::new(multiple(), None, clock.clone(), 2, dec!(2));

    // (priority + never-polled wait + queue) * weighting
    assert_eq!(m.priority_recalculate(Some(10)), 2024);
    assert_eq!(m.priority_calculated(), Some(2024));

    clock.advance(Duration::from_millis(1000));
    assert_eq!(m.priority_recalculate(Some(500)), 2024);

    clock.advance(Duration::from_millis(600_000));
    assert_eq!(m.priority_recalculate(Some(20)), 2044);
}

#[test]
fn test_multiple_priority_counts_elapsed_wait() {
    let clock = clock();
    let mut m = ClientPriorityHolderMetrics::new(multiple(), None, clock.clone(), 1, Decimal::ONE);
    m.reserve(1);

    clock.advance(Duration::from_millis(250));
    assert_eq!(m.priority_recalculate(None), 251);
}

#[test]
fn test_multiple_priority_saturates_on_huge_queue() {
    let mut m = ClientPriorityHolderMetrics::new(multiple(), None, clock(), 7, Decimal::ONE);
    assert_eq!(m.priority_recalculate(Some(i64::MAX)), i64::MAX);

    let mut doubled = ClientPriorityHolderMetrics::new(multiple(), None, clock(), 7, dec!(2));
    assert_eq!(doubled.priority_recalculate(Some(i64::MAX - 1)), i64::MAX);
}

#[test]
fn test_single_priority_is_constant() {
    let mut m = metrics(single(), clock(), None);
    assert_eq!(m.priority_recalculate(Some(1_000)), 1);
    assert_eq!(m.priority_calculated(), Some(1));
    assert!(!m.should_skip());
}

#[test]
fn test_single_capacity_is_always_full() {
    let mut m = metrics(single(), clock(), None);
    m.poll_begin(10);
    m.poll_end(1, false);
    m.release(false);
    assert_eq!(m.capacity_percentage(), Decimal::ONE);
}
