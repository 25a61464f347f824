use std::fmt;

use serde::{Deserialize, Serialize};

/// Temperature stored as Celsius internally.
/// The device speaks whole degrees in its native unit; conversion rounds
/// to the nearest integer in both directions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperature(f64);

impl Temperature {
    pub fn from_celsius(c: f64) -> Self {
        Self(c)
    }

    pub fn from_fahrenheit(f: f64) -> Self {
        Self((f - 32.0) * (5.0 / 9.0))
    }

    /// Construct from an integer reading in the device's native unit.
    /// The Celsius value is rounded, matching what the device can represent.
    pub fn from_wire(value: f64, unit: TemperatureUnit) -> Self {
        match unit {
            TemperatureUnit::Celsius => Self(value.round()),
            TemperatureUnit::Fahrenheit => Self(Self::from_fahrenheit(value).0.round()),
        }
    }

    pub fn celsius(&self) -> f64 {
        self.0
    }

    pub fn fahrenheit(&self) -> f64 {
        self.0 * (9.0 / 5.0) + 32.0
    }

    /// Whole degrees in the device's native unit.
    pub fn to_wire(&self, unit: TemperatureUnit) -> i32 {
        match unit {
            TemperatureUnit::Celsius => self.0.round() as i32,
            TemperatureUnit::Fahrenheit => self.fahrenheit().round() as i32,
        }
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}\u{00b0}C", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    Celsius,
    #[default]
    Fahrenheit,
}

/// Two-state field shared by power and the option toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    #[default]
    Off,
    On,
}

impl Switch {
    pub fn is_on(self) -> bool {
        self == Switch::On
    }

    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Switch::Off => "off",
            Switch::On => "on",
        }
    }

    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "1" | "true" => Some(Switch::On),
            "off" | "0" | "false" => Some(Switch::Off),
            _ => None,
        }
    }

    /// `Opt_sleepMode` carries either a bare token or a colon-delimited
    /// profile such as `sleepMode1:0:0:...`. Only the leading token matters.
    pub fn from_sleep_token(raw: &str) -> Option<Self> {
        let lead = raw.split(':').next().unwrap_or("").trim();
        if lead.len() > "sleepMode".len() && lead.starts_with("sleepMode") {
            return Some(Switch::On);
        }
        Self::from_wire_str(lead)
    }
}

impl From<bool> for Switch {
    fn from(on: bool) -> Self {
        if on { Switch::On } else { Switch::Off }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationMode {
    #[default]
    Auto,
    Cool,
    Heat,
    Dry,
    Fan,
    SelfFeel,
}

impl OperationMode {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            OperationMode::Auto => "auto",
            OperationMode::Cool => "cool",
            OperationMode::Heat => "heat",
            OperationMode::Dry => "dry",
            OperationMode::Fan => "fan",
            OperationMode::SelfFeel => "selfFeel",
        }
    }

    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s.trim() {
            "auto" => Some(OperationMode::Auto),
            "cool" => Some(OperationMode::Cool),
            "heat" => Some(OperationMode::Heat),
            "dry" => Some(OperationMode::Dry),
            "fan" => Some(OperationMode::Fan),
            "selfFeel" => Some(OperationMode::SelfFeel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FanSpeed {
    #[default]
    Auto,
    Silent,
    Low,
    MediumLow,
    Medium,
    MediumHigh,
    High,
    /// Logical only: expressed on the wire through `Opt_super`.
    Turbo,
}

impl FanSpeed {
    /// `None` for `Turbo`, which has no `WindSpeed` token.
    pub fn as_wire_str(&self) -> Option<&'static str> {
        match self {
            FanSpeed::Auto => Some("Auto"),
            FanSpeed::Silent => Some("Mute"),
            FanSpeed::Low => Some("Low"),
            FanSpeed::MediumLow => Some("MidLow"),
            FanSpeed::Medium => Some("Middle"),
            FanSpeed::MediumHigh => Some("MidHigh"),
            FanSpeed::High => Some("High"),
            FanSpeed::Turbo => None,
        }
    }

    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s.trim() {
            "Auto" => Some(FanSpeed::Auto),
            "Mute" => Some(FanSpeed::Silent),
            "Low" => Some(FanSpeed::Low),
            "MidLow" => Some(FanSpeed::MediumLow),
            "Middle" => Some(FanSpeed::Medium),
            "MidHigh" => Some(FanSpeed::MediumHigh),
            "High" => Some(FanSpeed::High),
            _ => None,
        }
    }
}

/// Combined view of the `WindDirection_H` / `WindDirection_V` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SwingMode {
    #[default]
    Off,
    Horizontal,
    Vertical,
    Both,
}

impl SwingMode {
    pub fn from_axes(horizontal: Switch, vertical: Switch) -> Self {
        match (horizontal, vertical) {
            (Switch::Off, Switch::Off) => SwingMode::Off,
            (Switch::On, Switch::Off) => SwingMode::Horizontal,
            (Switch::Off, Switch::On) => SwingMode::Vertical,
            (Switch::On, Switch::On) => SwingMode::Both,
        }
    }

    /// (horizontal, vertical)
    pub fn axes(&self) -> (Switch, Switch) {
        match self {
            SwingMode::Off => (Switch::Off, Switch::Off),
            SwingMode::Horizontal => (Switch::On, Switch::Off),
            SwingMode::Vertical => (Switch::Off, Switch::On),
            SwingMode::Both => (Switch::On, Switch::On),
        }
    }
}

/// Typed projection of a device status response. Temperatures are Celsius.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub power: Switch,
    pub operation_mode: OperationMode,
    pub target_temperature: f64,
    pub current_temperature: Option<f64>,
    pub fan_speed: FanSpeed,
    pub swing_mode: SwingMode,
    pub turbo_mode: Switch,
    /// Raw `Opt_sleepMode` value, bare token or profile string.
    pub sleep_mode: String,
    pub eco_mode: Option<Switch>,
    pub display_mode: Option<Switch>,
    pub beep_mode: Option<Switch>,
    pub outdoor_temperature: Option<f64>,
}

impl StatusRecord {
    pub fn sleep(&self) -> Switch {
        Switch::from_sleep_token(&self.sleep_mode).unwrap_or_default()
    }

    /// The profile string, when the device reported one instead of a bare token.
    pub fn sleep_profile(&self) -> Option<&str> {
        self.sleep_mode.contains(':').then_some(self.sleep_mode.as_str())
    }
}
