use super::*;

fn config(jitter: f64) -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(10),
        multiplier: 2.0,
        jitter,
    }
}

#[test]
fn ceiling_grows_exponentially_and_caps() {
    let config = config(0.0);
    assert_eq!(config.ceiling(0), Duration::from_millis(100));
    assert_eq!(config.ceiling(1), Duration::from_millis(200));
    assert_eq!(config.ceiling(3), Duration::from_millis(800));
    assert_eq!(config.ceiling(10), Duration::from_secs(10));
}

#[test]
fn without_jitter_delays_are_exact() {
    let backoff = ExponentialBackoff::new(config(0.0));
    assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    assert_eq!(backoff.next_delay(), Duration::from_millis(400));
    assert_eq!(backoff.attempts(), 3);
}

#[test]
fn jittered_delays_never_decrease_and_stay_under_ceiling() {
    for _ in 0..50 {
        let backoff = ExponentialBackoff::new(config(1.0));
        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= previous, "{delay:?} < {previous:?}");
            assert!(delay <= Duration::from_secs(10));
            previous = delay;
        }
    }
}

#[test]
fn overflowing_attempts_saturate_at_ceiling() {
    let backoff = ExponentialBackoff::new(config(0.5));
    assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    assert_eq!(backoff.delay_for_attempt(5_000), Duration::from_secs(10));
}

#[test]
fn reset_restarts_from_initial_delay() {
    let backoff = ExponentialBackoff::new(config(0.0));
    backoff.next_delay();
    backoff.next_delay();
    backoff.reset();
    assert_eq!(backoff.attempts(), 0);
    assert_eq!(backoff.next_delay(), Duration::from_millis(100));
}

#[test]
fn sub_unit_multiplier_is_treated_as_flat() {
    let backoff = ExponentialBackoff::new(RetryConfig {
        multiplier: 0.5,
        ..config(0.0)
    });
    assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
    assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(100));
}
