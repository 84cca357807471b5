use healthbus::config::{BusConfig, ConfigError};
use healthbus::protocol::{DeviceTag, PeripheralAddress};
use healthbus::responder::DrainPolicy;
use healthbus::scheduler::PollOrderError;
use std::time::Duration;

fn addr(value: u8) -> PeripheralAddress {
    PeripheralAddress::new(value).unwrap()
}

const THREE_NODE_BUS: &str = r#"
[bus]
baud_rate = 57600
settle_delay_ms = 2
turnaround_ms = 4
reply_timeout_ms = 150
drain_window_ms = 120
drain_policy = "any-peer"

[collector]
poll_order = [3, 1, 2]

[cadence]
temperature_every = 2

[[peripheral]]
address = 1
name = "LRF"
devices = ["A", "B", "K", "U"]

[[peripheral]]
address = 2
name = "Vise"
devices = ["A", "K"]

[[peripheral]]
address = 3
devices = ["C", "V", "W"]
"#;

#[test]
fn test_parse_full_file() {
    let config = BusConfig::from_toml_str(THREE_NODE_BUS).unwrap();

    assert_eq!(config.bus.drain_policy, DrainPolicy::AnyPeer);
    assert_eq!(config.peripherals.len(), 3);
    assert_eq!(config.poll_order().unwrap().as_slice(), &[addr(3), addr(1), addr(2)]);
    assert_eq!(config.cadence.temperature_every, 2);
    assert_eq!(config.cadence.acceleration_every, 1);

    let third = config.peripheral(addr(3)).unwrap();
    assert_eq!(third.label(), "peripheral 3");
    assert_eq!(
        third.devices,
        vec![
            DeviceTag::new('C').unwrap(),
            DeviceTag::new('V').unwrap(),
            DeviceTag::new('W').unwrap()
        ]
    );

    let timing = config.timing();
    assert_eq!(timing.reply_timeout, Duration::from_millis(150));
    assert_eq!(timing.drain_window, Duration::from_millis(120));
    // Unset values keep their defaults.
    assert_eq!(timing.cycle_interval, Duration::from_millis(100));
    assert_eq!(timing.byte_time, Duration::from_nanos(173_611));
}

#[test]
fn test_empty_file_is_the_default_bus() {
    let config = BusConfig::from_toml_str("").unwrap();
    assert_eq!(config, BusConfig::default());
    assert_eq!(config.bus.drain_policy, DrainPolicy::Neighbor);
}

#[test]
fn test_rendered_default_parses_back() {
    let text = BusConfig::default().to_toml().unwrap();
    assert!(text.contains("[[peripheral]]"));
    assert_eq!(BusConfig::from_toml_str(&text).unwrap(), BusConfig::default());
}

#[test]
fn test_out_of_range_address_rejected() {
    let text = r#"
[[peripheral]]
address = 12
devices = ["A"]
"#;
    assert!(matches!(BusConfig::from_toml_str(text), Err(ConfigError::Parse(_))));
}

#[test]
fn test_lowercase_tag_rejected() {
    let text = r#"
[collector]
poll_order = [1]

[[peripheral]]
address = 1
devices = ["a"]
"#;
    assert!(matches!(BusConfig::from_toml_str(text), Err(ConfigError::Parse(_))));
}

#[test]
fn test_structural_errors() {
    let duplicate_address = r#"
[collector]
poll_order = [1]

[[peripheral]]
address = 1
devices = ["A"]

[[peripheral]]
address = 1
devices = ["B"]
"#;
    assert!(matches!(
        BusConfig::from_toml_str(duplicate_address),
        Err(ConfigError::DuplicateAddress(a)) if a == addr(1)
    ));

    let duplicate_device = r#"
[collector]
poll_order = [1]

[[peripheral]]
address = 1
devices = ["A", "K", "A"]
"#;
    assert!(matches!(
        BusConfig::from_toml_str(duplicate_device),
        Err(ConfigError::DuplicateDevice { .. })
    ));

    let unknown_poll = r#"
[collector]
poll_order = [1, 4]

[[peripheral]]
address = 1
devices = ["A"]
"#;
    assert!(matches!(
        BusConfig::from_toml_str(unknown_poll),
        Err(ConfigError::UnknownPollAddress(a)) if a == addr(4)
    ));

    let repeated_poll = r#"
[collector]
poll_order = [1, 1]

[[peripheral]]
address = 1
devices = ["A"]
"#;
    assert!(matches!(
        BusConfig::from_toml_str(repeated_poll),
        Err(ConfigError::PollOrder(PollOrderError::Duplicate(_)))
    ));
}

#[test]
fn test_timing_errors() {
    let mut config = BusConfig::default();
    config.bus.read_poll_interval_ms = 0;
    assert!(matches!(config.validate(), Err(ConfigError::InvalidTiming(_))));

    let mut config = BusConfig::default();
    config.bus.baud_rate = 0;
    assert!(matches!(config.validate(), Err(ConfigError::InvalidTiming(_))));

    let mut config = BusConfig::default();
    config.cadence.pressure_every = 0;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidCadence("pressure"))
    ));
}

#[test]
fn test_missing_file_reports_path() {
    let err = BusConfig::load("/nonexistent/healthbus.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("/nonexistent/healthbus.toml"));
}
