use ringhand_core::{backoff, install, set_yield_duration, BackoffConfig, ConfigError};
use std::time::Duration;

// Settings are process-wide and settable once, so the whole lifecycle lives in one test.
#[test]
fn backoff_settings_install_once() {
    let invalid = BackoffConfig {
        pause_cycles: 0,
        ..BackoffConfig::default()
    };
    assert!(matches!(install(&invalid), Err(ConfigError::Invalid(_))));

    let config = BackoffConfig::for_latency_sensitive();
    let installed = install(&config).unwrap();
    assert_eq!(installed.yield_duration, Duration::from_micros(100));
    assert_eq!(backoff().pause_cycles, config.pause_cycles);

    assert!(matches!(
        install(&BackoffConfig::for_general()),
        Err(ConfigError::AlreadyInstalled)
    ));
    assert!(matches!(
        set_yield_duration(Duration::from_millis(1)),
        Err(ConfigError::AlreadyInstalled)
    ));
    assert_eq!(backoff().yield_duration, Duration::from_micros(100));
}
