use std::time::Duration;

use candela_core::Settings;

#[test]
fn defaults_match_the_documented_surface() {
    let s = Settings::default();
    assert_eq!(s.connector.inactivity_timeout, Duration::from_secs(3));
    assert_eq!(s.connector.reconnect_delay, Duration::from_secs(1));
    assert_eq!(s.connector.max_symbols_per_session, 50);
    assert_eq!(s.connector.breaker_failure_threshold, 5);
    assert_eq!(s.connector.closed_queue_max, 1000);
    assert_eq!(s.connector.open_queue_max, None);
    assert_eq!(s.connector.dedup_max_entries, 10_000);
    assert_eq!(s.connector.default_interval, "1m");
    assert_eq!(s.connector.router_queue_max, 1000);
    assert_eq!(s.connector.max_sessions_per_venue, 5);
    assert_eq!(s.server.host, "0.0.0.0");
    assert_eq!(s.server.port, 8765);
    assert_eq!(s.server.subscribe_timeout, Duration::from_secs(10));
    assert!(s.server.health_check_enabled);
}

// Environment mutation is process-global, so every env-dependent assertion
// lives in this one test.
#[test]
fn environment_overrides_and_rejects_garbage() {
    unsafe {
        std::env::set_var("CANDELA_INACTIVITY_TIMEOUT", "7.5");
        std::env::set_var("CANDELA_MAX_SYMBOLS_PER_SESSION", "25");
        std::env::set_var("CANDELA_OPEN_QUEUE_MAX", "64");
        std::env::set_var("CANDELA_WSS_PORT", "9100");
        std::env::set_var("CANDELA_HEALTH_CHECK_ENABLED", "false");
    }
    let s = Settings::from_env().unwrap();
    assert_eq!(s.connector.inactivity_timeout, Duration::from_secs_f64(7.5));
    assert_eq!(s.connector.max_symbols_per_session, 25);
    assert_eq!(s.connector.open_queue_max, Some(64));
    assert_eq!(s.server.port, 9100);
    assert!(!s.server.health_check_enabled);

    unsafe {
        std::env::set_var("CANDELA_WSS_PORT", "not-a-port");
    }
    assert!(Settings::from_env().is_err());

    unsafe {
        std::env::remove_var("CANDELA_INACTIVITY_TIMEOUT");
        std::env::remove_var("CANDELA_MAX_SYMBOLS_PER_SESSION");
        std::env::remove_var("CANDELA_OPEN_QUEUE_MAX");
        std::env::remove_var("CANDELA_WSS_PORT");
        std::env::remove_var("CANDELA_HEALTH_CHECK_ENABLED");
    }
}
