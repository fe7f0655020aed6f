use snapclient::sync::{local_now_micros, TimeProvider};

// =============================================================================
// Offset derivation
// =============================================================================

#[test]
fn test_offset_is_half_the_asymmetry() {
    let clock = TimeProvider::new();

    // client->server took 10 ms of apparent time, server->client 4 ms
    clock.update(10_000, 4_000);
    assert_eq!(clock.offset_micros(), Some(3_000));
}

#[test]
fn test_offset_can_be_negative() {
    let clock = TimeProvider::new();

    clock.update(-5_000, 5_000);
    assert_eq!(clock.offset_micros(), Some(-5_000));
}

#[test]
fn test_fresh_provider_has_no_offset() {
    let clock = TimeProvider::new();
    assert_eq!(clock.offset_micros(), None);
}

// =============================================================================
// Burst and smoothing
// =============================================================================

#[test]
fn test_burst_converges_to_sample_value() {
    let clock = TimeProvider::new();

    // the initial burst: 50 samples all deriving to d = 42 ms
    for _ in 0..50 {
        clock.update(84_000, 0);
    }

    let offset = clock.offset_micros().unwrap();
    assert!((offset - 42_000).abs() <= 1_000, "offset {offset}");
}

#[test]
fn test_post_burst_updates_are_smoothed() {
    let clock = TimeProvider::new();
    for _ in 0..50 {
        clock.update(84_000, 0);
    }

    // a 16 ms outlier moves the estimate by only ~1/16th of the jump
    clock.update(116_000, 0);
    let offset = clock.offset_micros().unwrap();
    assert!((42_900..=43_100).contains(&offset), "offset {offset}");
}

#[test]
fn test_converges_under_zero_mean_noise() {
    let clock = TimeProvider::new();
    for _ in 0..50 {
        clock.update(84_000, 0);
    }

    // alternate +-2 ms around the true 42 ms offset
    for i in 0..200 {
        let noise = if i % 2 == 0 { 4_000 } else { -4_000 };
        clock.update(84_000 + noise, 0);
    }

    let offset = clock.offset_micros().unwrap();
    assert!((offset - 42_000).abs() <= 1_000, "offset {offset}");
}

#[test]
fn test_reset_restarts_the_burst() {
    let clock = TimeProvider::new();
    for _ in 0..60 {
        clock.update(84_000, 0);
    }
    clock.reset();
    assert_eq!(clock.offset_micros(), None);

    // first post-reset sample is taken verbatim again
    clock.update(20_000, 0);
    assert_eq!(clock.offset_micros(), Some(10_000));
}

// =============================================================================
// Server clock
// =============================================================================

#[test]
fn test_server_now_applies_offset() {
    let clock = TimeProvider::new();
    clock.update(84_000, 0);

    let delta = clock.server_now_micros() - local_now_micros();
    // 42 ms offset, with some slack for the two clock reads
    assert!((41_000..=43_000).contains(&delta), "delta {delta}");
}

#[test]
fn test_shared_handle_sees_updates() {
    let clock = TimeProvider::new();
    let handle = clock.clone();

    clock.update(84_000, 0);
    assert_eq!(handle.offset_micros(), Some(42_000));
}
