use aircon_lan::{FanSpeed, OperationMode, SwingMode, Switch, Temperature, TemperatureUnit};

#[test]
fn from_celsius() {
    let t = Temperature::from_celsius(22.0);
    assert_eq!(t.celsius(), 22.0);
    assert!((t.fahrenheit() - 71.6).abs() < 0.01);
}

#[test]
fn from_fahrenheit() {
    let t = Temperature::from_fahrenheit(72.0);
    assert!((t.celsius() - 22.222).abs() < 0.01);
    assert!((t.fahrenheit() - 72.0).abs() < 0.01);
}

#[test]
fn wire_fahrenheit_rounds_to_whole_celsius() {
    assert_eq!(Temperature::from_wire(70.0, TemperatureUnit::Fahrenheit).celsius(), 21.0);
    assert_eq!(Temperature::from_wire(72.0, TemperatureUnit::Fahrenheit).celsius(), 22.0);
    assert_eq!(Temperature::from_wire(86.0, TemperatureUnit::Fahrenheit).celsius(), 30.0);
}

#[test]
fn wire_celsius_passes_through() {
    assert_eq!(Temperature::from_wire(24.0, TemperatureUnit::Celsius).celsius(), 24.0);
    assert_eq!(Temperature::from_celsius(23.6).to_wire(TemperatureUnit::Celsius), 24);
}

#[test]
fn to_wire_fahrenheit() {
    assert_eq!(Temperature::from_celsius(22.0).to_wire(TemperatureUnit::Fahrenheit), 72);
    assert_eq!(Temperature::from_celsius(16.0).to_wire(TemperatureUnit::Fahrenheit), 61);
    assert_eq!(Temperature::from_celsius(30.0).to_wire(TemperatureUnit::Fahrenheit), 86);
}

#[test]
fn display_in_celsius() {
    assert_eq!(Temperature::from_celsius(21.0).to_string(), "21.0\u{00b0}C");
}

#[test]
fn switch_wire_tokens() {
    assert_eq!(Switch::from_wire_str("on"), Some(Switch::On));
    assert_eq!(Switch::from_wire_str(" OFF "), Some(Switch::Off));
    assert_eq!(Switch::from_wire_str("1"), Some(Switch::On));
    assert_eq!(Switch::from_wire_str("maybe"), None);
    assert_eq!(Switch::On.as_wire_str(), "on");
}

#[test]
fn sleep_profile_token_means_on() {
    assert_eq!(Switch::from_sleep_token("sleepMode2:0:0:0"), Some(Switch::On));
    assert_eq!(Switch::from_sleep_token("off"), Some(Switch::Off));
    assert_eq!(Switch::from_sleep_token("sleepMode"), None);
}

#[test]
fn mode_wire_tokens() {
    for mode in [
        OperationMode::Auto,
        OperationMode::Cool,
        OperationMode::Heat,
        OperationMode::Dry,
        OperationMode::Fan,
        OperationMode::SelfFeel,
    ] {
        assert_eq!(OperationMode::from_wire_str(mode.as_wire_str()), Some(mode));
    }
    assert_eq!(OperationMode::from_wire_str("blast"), None);
}

#[test]
fn fan_speed_turbo_has_no_wind_token() {
    assert_eq!(FanSpeed::Turbo.as_wire_str(), None);
    assert_eq!(FanSpeed::Silent.as_wire_str(), Some("Mute"));
    assert_eq!(FanSpeed::from_wire_str("MidHigh"), Some(FanSpeed::MediumHigh));
    assert_eq!(FanSpeed::from_wire_str("Turbo"), None);
}

#[test]
fn swing_axes() {
    assert_eq!(SwingMode::from_axes(Switch::On, Switch::Off), SwingMode::Horizontal);
    assert_eq!(SwingMode::Both.axes(), (Switch::On, Switch::On));
    assert_eq!(SwingMode::from_axes(Switch::Off, Switch::Off), SwingMode::Off);
}
