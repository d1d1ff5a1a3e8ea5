use std::time::{Duration, Instant};

use hpdispatch::TimeBudgetGuard;

#[test]
fn stops_while_two_slowest_trials_still_fit() {
    let reserved = Duration::from_secs(100);
    for elapsed in (0..=100).step_by(10) {
        for worst in (0..=60).step_by(5) {
            let start = Instant::now();
            let mut guard = TimeBudgetGuard::starting_at(reserved, start);
            let stopped = guard.observe_at(
                Duration::from_secs(worst),
                start + Duration::from_secs(elapsed),
            );
            assert_eq!(
                stopped,
                elapsed + 2 * worst > 100,
                "elapsed {elapsed}s, worst {worst}s"
            );
        }
    }
}

#[test]
fn the_slowest_trial_is_remembered() {
    let start = Instant::now();
    let mut guard = TimeBudgetGuard::starting_at(Duration::from_secs(60), start);
    assert!(!guard.observe_at(Duration::from_secs(15), start + Duration::from_secs(15)));
    assert!(!guard.observe_at(Duration::from_secs(5), start + Duration::from_secs(20)));
    assert_eq!(guard.worst(), Duration::from_secs(15));
    // 31 + 2 * 15 > 60
    assert!(guard.observe_at(Duration::from_secs(11), start + Duration::from_secs(31)));
    assert!(guard.timed_out());
}

#[test]
fn tick_measures_from_the_previous_trial() {
    let start = Instant::now();
    let mut guard = TimeBudgetGuard::starting_at(Duration::from_secs(120), start);
    assert!(!guard.tick_at(start + Duration::from_secs(10)));
    assert!(!guard.tick_at(start + Duration::from_secs(40)));
    assert_eq!(guard.worst(), Duration::from_secs(30));
    assert!(!guard.tick_at(start + Duration::from_secs(45)));
    assert!(guard.tick_at(start + Duration::from_secs(61)));
}
