use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{AutoFanPolicy, DeviceConfig, FeatureFlags};
use crate::diff::{pick, StateDiff};
use crate::protocol::DEFAULT_SLEEP_PROFILE;
use crate::types::*;

pub const MIN_TARGET_C: f64 = 16.0;
pub const MAX_TARGET_C: f64 = 30.0;
const DEFAULT_TARGET_C: f64 = 22.0;
const DEFAULT_PROTECTION_WINDOW: Duration = Duration::from_secs(10);

/// Called once per external mutation that changed anything.
/// Runs synchronously inside the mutation; must not block.
pub type StateListener = Arc<dyn Fn(&DeviceState) + Send + Sync>;

/// The logical configuration shared with the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub power: Switch,
    pub operation_mode: OperationMode,
    pub target_temperature: f64,
    pub fan_speed: FanSpeed,
    pub swing_mode: SwingMode,
    pub turbo_mode: Switch,
    pub sleep_mode: Switch,
    pub eco_mode: Switch,
    pub display_mode: Switch,
    pub beep_mode: Switch,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            power: Switch::Off,
            operation_mode: OperationMode::Auto,
            target_temperature: DEFAULT_TARGET_C,
            fan_speed: FanSpeed::Auto,
            swing_mode: SwingMode::Off,
            turbo_mode: Switch::Off,
            sleep_mode: Switch::Off,
            eco_mode: Switch::Off,
            display_mode: Switch::On,
            beep_mode: Switch::On,
        }
    }
}

/// When each transient-prone field was last changed locally.
#[derive(Debug, Clone, Copy, Default)]
struct Provenance {
    last_turbo_change_at: Option<Instant>,
    last_sleep_relevant_change_at: Option<Instant>,
    last_fan_speed_cmd_at: Option<Instant>,
}

impl Provenance {
    fn latest_of(self, other: Provenance) -> Provenance {
        Provenance {
            last_turbo_change_at: self.last_turbo_change_at.max(other.last_turbo_change_at),
            last_sleep_relevant_change_at: self
                .last_sleep_relevant_change_at
                .max(other.last_sleep_relevant_change_at),
            last_fan_speed_cmd_at: self.last_fan_speed_cmd_at.max(other.last_fan_speed_cmd_at),
        }
    }
}

/// Canonical state of one device.
///
/// Every setter leaves the fields mutually consistent before it returns:
/// turbo and sleep are exclusive, fan speed Turbo and turbo On imply each
/// other, and power Off resets every operational field. Device reports go
/// through [`ingest_wire_status`](Self::ingest_wire_status), which trusts
/// the device except for flips that contradict a recent local change.
///
/// Cloning yields an independent copy without the listeners.
pub struct DeviceState {
    settings: Settings,
    current_temperature: Option<f64>,
    outdoor_temperature: Option<f64>,
    sleep_profile: Option<String>,
    provenance: Provenance,
    force_sleep_clear: bool,
    auto_fan_policy: AutoFanPolicy,
    protection_window: Duration,
    listeners: Vec<StateListener>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for DeviceState {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings,
            current_temperature: self.current_temperature,
            outdoor_temperature: self.outdoor_temperature,
            sleep_profile: self.sleep_profile.clone(),
            provenance: self.provenance,
            force_sleep_clear: self.force_sleep_clear,
            auto_fan_policy: self.auto_fan_policy,
            protection_window: self.protection_window,
            listeners: Vec::new(),
        }
    }
}

impl fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceState")
            .field("settings", &self.settings)
            .field("current_temperature", &self.current_temperature)
            .field("outdoor_temperature", &self.outdoor_temperature)
            .field("sleep_profile", &self.sleep_profile)
            .field("force_sleep_clear", &self.force_sleep_clear)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl DeviceState {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            current_temperature: None,
            outdoor_temperature: None,
            sleep_profile: None,
            provenance: Provenance::default(),
            force_sleep_clear: false,
            auto_fan_policy: AutoFanPolicy::default(),
            protection_window: DEFAULT_PROTECTION_WINDOW,
            listeners: Vec::new(),
        }
    }

    pub fn with_config(config: &DeviceConfig) -> Self {
        Self::new()
            .with_auto_fan_policy(config.auto_fan_policy)
            .with_protection_window(config.protection_window())
    }

    pub fn with_auto_fan_policy(mut self, policy: AutoFanPolicy) -> Self {
        self.auto_fan_policy = policy;
        self
    }

    pub fn with_protection_window(mut self, window: Duration) -> Self {
        self.protection_window = window;
        self
    }

    pub fn subscribe(&mut self, listener: impl Fn(&DeviceState) + Send + Sync + 'static) {
        self.listeners.push(Arc::new(listener));
    }

    // -- Accessors --

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn power(&self) -> Switch {
        self.settings.power
    }

    pub fn operation_mode(&self) -> OperationMode {
        self.settings.operation_mode
    }

    pub fn target_temperature(&self) -> f64 {
        self.settings.target_temperature
    }

    pub fn fan_speed(&self) -> FanSpeed {
        self.settings.fan_speed
    }

    pub fn swing_mode(&self) -> SwingMode {
        self.settings.swing_mode
    }

    pub fn turbo_mode(&self) -> Switch {
        self.settings.turbo_mode
    }

    pub fn sleep_mode(&self) -> Switch {
        self.settings.sleep_mode
    }

    pub fn eco_mode(&self) -> Switch {
        self.settings.eco_mode
    }

    pub fn display_mode(&self) -> Switch {
        self.settings.display_mode
    }

    pub fn beep_mode(&self) -> Switch {
        self.settings.beep_mode
    }

    pub fn current_temperature(&self) -> Option<f64> {
        self.current_temperature
    }

    pub fn outdoor_temperature(&self) -> Option<f64> {
        self.outdoor_temperature
    }

    /// Last sleep profile string the device reported, if any.
    pub fn sleep_profile(&self) -> Option<&str> {
        self.sleep_profile.as_deref()
    }

    // -- Sleep clear workaround --

    /// Force the sleep field into the next command even when unchanged.
    pub fn request_sleep_clear(&mut self) {
        self.force_sleep_clear = true;
    }

    pub fn force_sleep_clear(&self) -> bool {
        self.force_sleep_clear
    }

    /// Read and clear the sleep-clear request.
    pub fn take_force_sleep_clear(&mut self) -> bool {
        std::mem::take(&mut self.force_sleep_clear)
    }

    // -- User-origin setters --

    pub fn set_power(&mut self, power: Switch) {
        self.user_change(|s| {
            s.settings.power = power;
            if power == Switch::Off {
                s.reset_for_power_off();
            }
        });
    }

    pub fn set_operation_mode(&mut self, mode: OperationMode) {
        self.user_change(|s| {
            if mode != OperationMode::Auto {
                s.ensure_powered();
            }
            s.settings.operation_mode = mode;
        });
    }

    /// Clamped to 16–30 °C. NaN is ignored.
    pub fn set_target_temperature(&mut self, celsius: f64) {
        if celsius.is_nan() {
            warn!("ignoring NaN target temperature");
            return;
        }
        let clamped = celsius.clamp(MIN_TARGET_C, MAX_TARGET_C);
        if clamped != celsius {
            debug!(requested = celsius, clamped, "target temperature clamped");
        }
        self.user_change(|s| s.settings.target_temperature = clamped);
    }

    pub fn set_fan_speed(&mut self, speed: FanSpeed) {
        self.user_change(|s| {
            if speed != FanSpeed::Auto {
                s.ensure_powered();
            }
            if speed == FanSpeed::Turbo {
                s.settings.turbo_mode = Switch::On;
                s.settings.sleep_mode = Switch::Off;
                s.settings.fan_speed = FanSpeed::Turbo;
                return;
            }
            s.settings.turbo_mode = Switch::Off;
            s.settings.fan_speed = s.resolve_user_fan(speed);
        });
    }

    pub fn set_swing_mode(&mut self, swing: SwingMode) {
        self.user_change(|s| {
            if swing != SwingMode::Off {
                s.ensure_powered();
            }
            s.settings.swing_mode = swing;
        });
    }

    pub fn set_turbo_mode(&mut self, turbo: Switch) {
        self.user_change(|s| match turbo {
            Switch::On => {
                s.ensure_powered();
                s.settings.turbo_mode = Switch::On;
                s.settings.fan_speed = FanSpeed::Turbo;
                s.settings.sleep_mode = Switch::Off;
            }
            Switch::Off => {
                s.settings.turbo_mode = Switch::Off;
                if s.settings.fan_speed == FanSpeed::Turbo {
                    s.settings.fan_speed = s.resolve_user_fan(FanSpeed::Auto);
                }
            }
        });
    }

    pub fn set_sleep_mode(&mut self, sleep: Switch) {
        self.user_change(|s| {
            if sleep == Switch::On {
                s.ensure_powered();
                s.settings.turbo_mode = Switch::Off;
                if s.settings.fan_speed == FanSpeed::Turbo {
                    s.settings.fan_speed = FanSpeed::Auto;
                }
            }
            s.settings.sleep_mode = sleep;
        });
    }

    pub fn set_eco_mode(&mut self, eco: Switch) {
        self.user_change(|s| {
            if eco == Switch::On {
                s.ensure_powered();
            }
            s.settings.eco_mode = eco;
        });
    }

    pub fn set_display_mode(&mut self, display: Switch) {
        self.user_change(|s| s.settings.display_mode = display);
    }

    pub fn set_beep_mode(&mut self, beep: Switch) {
        self.user_change(|s| s.settings.beep_mode = beep);
    }

    /// String entry point for outward layers. `field` uses the same names
    /// as [`to_plain_object`](Self::to_plain_object). Unknown fields and
    /// unparseable values are logged and leave the state untouched.
    pub fn set_from_str(&mut self, field: &str, value: &str) -> bool {
        fn parse<T: serde::de::DeserializeOwned>(value: &str) -> Option<T> {
            serde_json::from_value(Value::String(value.to_string())).ok()
        }

        let applied = match field {
            "power" => parse(value).map(|v| self.set_power(v)),
            "operationMode" => parse(value).map(|v| self.set_operation_mode(v)),
            "targetTemperature" => value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|t| !t.is_nan())
                .map(|v| self.set_target_temperature(v)),
            "fanSpeed" => parse(value).map(|v| self.set_fan_speed(v)),
            "swingMode" => parse(value).map(|v| self.set_swing_mode(v)),
            "turboMode" => parse(value).map(|v| self.set_turbo_mode(v)),
            "sleepMode" => parse(value).map(|v| self.set_sleep_mode(v)),
            "ecoMode" => parse(value).map(|v| self.set_eco_mode(v)),
            "displayMode" => parse(value).map(|v| self.set_display_mode(v)),
            "beepMode" => parse(value).map(|v| self.set_beep_mode(v)),
            _ => None,
        };
        if applied.is_none() {
            warn!(field, value, "rejected invalid state input");
        }
        applied.is_some()
    }

    // -- Ingestion --

    /// Merge a status reported by the device.
    ///
    /// Device values win, except a turbo, sleep or fan speed flip that lands
    /// inside the protection window after the matching local change. Auto
    /// fan is kept as reported. If the device reports turbo and sleep
    /// together, turbo wins.
    pub fn ingest_wire_status(&mut self, status: &StatusRecord) {
        let now = Instant::now();
        self.change(|s| {
            let current = s.settings;
            let mut next = current;

            next.power = status.power;
            next.operation_mode = status.operation_mode;
            if status.target_temperature.is_finite() {
                next.target_temperature =
                    status.target_temperature.clamp(MIN_TARGET_C, MAX_TARGET_C);
            } else {
                warn!(value = status.target_temperature, "ignoring non-finite target temperature");
            }
            next.swing_mode = status.swing_mode;
            if let Some(eco) = status.eco_mode {
                next.eco_mode = eco;
            }
            if let Some(display) = status.display_mode {
                next.display_mode = display;
            }
            if let Some(beep) = status.beep_mode {
                next.beep_mode = beep;
            }

            next.turbo_mode = s.filter_transient(
                "turbo",
                current.turbo_mode,
                status.turbo_mode,
                s.provenance.last_turbo_change_at,
                now,
            );
            next.sleep_mode = s.filter_transient(
                "sleep",
                current.sleep_mode,
                status.sleep(),
                s.provenance.last_sleep_relevant_change_at,
                now,
            );
            next.fan_speed = s.filter_transient(
                "fan speed",
                current.fan_speed,
                status.fan_speed,
                s.provenance.last_fan_speed_cmd_at,
                now,
            );

            if next.turbo_mode.is_on() {
                next.fan_speed = FanSpeed::Turbo;
                next.sleep_mode = Switch::Off;
            } else if next.fan_speed == FanSpeed::Turbo {
                next.fan_speed = match current.fan_speed {
                    FanSpeed::Turbo => FanSpeed::Auto,
                    other => other,
                };
            }

            s.settings = next;
            if s.settings.power == Switch::Off {
                s.reset_for_power_off();
            }

            if let Some(indoor) = status.current_temperature.filter(|t| t.is_finite()) {
                s.current_temperature = Some(indoor);
            }
            if let Some(outdoor) = status.outdoor_temperature.filter(|t| t.is_finite()) {
                s.outdoor_temperature = Some(outdoor);
            }
            if let Some(profile) = status.sleep_profile()
                && status.sleep().is_on()
            {
                s.sleep_profile = Some(profile.to_string());
            }
        });
    }

    /// Adopt the settings of another canonical state, typically a desired
    /// state the device just accepted. Keeps the later of each provenance
    /// timestamp so the protection window covers the accepted change.
    pub fn ingest_canonical_snapshot(&mut self, snapshot: &DeviceState) {
        self.ingest_accepted_snapshot(snapshot, FeatureFlags::default());
    }

    /// Like [`ingest_canonical_snapshot`](Self::ingest_canonical_snapshot),
    /// but fields of disabled features keep their current value, since
    /// they were never sent.
    pub fn ingest_accepted_snapshot(&mut self, snapshot: &DeviceState, features: FeatureFlags) {
        self.change(|s| {
            let kept = s.settings;
            s.settings = snapshot.settings;
            if !features.swing {
                s.settings.swing_mode = kept.swing_mode;
            }
            if !features.eco {
                s.settings.eco_mode = kept.eco_mode;
            }
            if !features.display {
                s.settings.display_mode = kept.display_mode;
            }
            if !features.beep {
                s.settings.beep_mode = kept.beep_mode;
            }
            if s.settings.power == Switch::Off {
                s.reset_for_power_off();
            }
            s.provenance = s.provenance.latest_of(snapshot.provenance);
            if snapshot.sleep_profile.is_some() {
                s.sleep_profile = snapshot.sleep_profile.clone();
            }
        });
    }

    // -- Projections --

    /// Fields of `other` that differ from `self`, with `other`'s values.
    pub fn diff(&self, other: &DeviceState) -> StateDiff {
        let a = &self.settings;
        let b = &other.settings;
        StateDiff {
            power: pick(a.power, b.power),
            operation_mode: pick(a.operation_mode, b.operation_mode),
            target_temperature: pick(a.target_temperature, b.target_temperature),
            fan_speed: pick(a.fan_speed, b.fan_speed),
            swing_mode: pick(a.swing_mode, b.swing_mode),
            turbo_mode: pick(a.turbo_mode, b.turbo_mode),
            sleep_mode: pick(a.sleep_mode, b.sleep_mode),
            eco_mode: pick(a.eco_mode, b.eco_mode),
            display_mode: pick(a.display_mode, b.display_mode),
            beep_mode: pick(a.beep_mode, b.beep_mode),
        }
    }

    pub fn to_wire_status(&self) -> StatusRecord {
        let s = &self.settings;
        let sleep_mode = match s.sleep_mode {
            Switch::On => self
                .sleep_profile
                .clone()
                .unwrap_or_else(|| DEFAULT_SLEEP_PROFILE.to_string()),
            Switch::Off => Switch::Off.as_wire_str().to_string(),
        };
        StatusRecord {
            power: s.power,
            operation_mode: s.operation_mode,
            target_temperature: s.target_temperature,
            current_temperature: self.current_temperature,
            fan_speed: s.fan_speed,
            swing_mode: s.swing_mode,
            turbo_mode: s.turbo_mode,
            sleep_mode,
            eco_mode: Some(s.eco_mode),
            display_mode: Some(s.display_mode),
            beep_mode: Some(s.beep_mode),
            outdoor_temperature: self.outdoor_temperature,
        }
    }

    pub fn to_plain_object(&self) -> Value {
        let mut value = serde_json::to_value(self.settings).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert("currentTemperature".into(), self.current_temperature.into());
            map.insert("outdoorTemperature".into(), self.outdoor_temperature.into());
        }
        value
    }

    // -- Internals --

    pub(crate) fn observable(&self) -> (Settings, Option<f64>, Option<f64>) {
        (self.settings, self.current_temperature, self.outdoor_temperature)
    }

    /// Run one external mutation and notify listeners once if it changed
    /// anything visible.
    fn change(&mut self, mutate: impl FnOnce(&mut Self)) {
        let before = self.observable();
        mutate(self);
        if self.observable() != before {
            for listener in &self.listeners {
                listener(self);
            }
        }
    }

    /// Like [`change`](Self::change), also stamping provenance for every
    /// transient-prone field the mutation touched.
    fn user_change(&mut self, mutate: impl FnOnce(&mut Self)) {
        let before = self.settings;
        self.change(|s| {
            mutate(s);
            let now = Instant::now();
            let after = s.settings;
            if before.turbo_mode != after.turbo_mode {
                s.provenance.last_turbo_change_at = Some(now);
            }
            if before.sleep_mode != after.sleep_mode || before.turbo_mode != after.turbo_mode {
                s.provenance.last_sleep_relevant_change_at = Some(now);
            }
            if before.fan_speed != after.fan_speed {
                s.provenance.last_fan_speed_cmd_at = Some(now);
            }
        });
    }

    fn ensure_powered(&mut self) {
        if self.settings.power == Switch::Off {
            debug!("operational change while off, powering on");
            self.settings.power = Switch::On;
        }
    }

    fn reset_for_power_off(&mut self) {
        let s = &mut self.settings;
        s.operation_mode = OperationMode::default();
        s.fan_speed = FanSpeed::Auto;
        s.turbo_mode = Switch::Off;
        s.sleep_mode = Switch::Off;
        s.eco_mode = Switch::Off;
        s.swing_mode = SwingMode::Off;
    }

    fn resolve_user_fan(&self, requested: FanSpeed) -> FanSpeed {
        let s = &self.settings;
        if requested != FanSpeed::Auto
            || s.power == Switch::Off
            || s.turbo_mode.is_on()
            || s.sleep_mode.is_on()
        {
            return requested;
        }
        match self.auto_fan_policy {
            AutoFanPolicy::Substitute(stand_in) if stand_in != FanSpeed::Turbo => {
                debug!(?stand_in, "auto fan substituted");
                stand_in
            }
            _ => FanSpeed::Auto,
        }
    }

    fn filter_transient<T: PartialEq + Copy + fmt::Debug>(
        &self,
        field: &'static str,
        local: T,
        reported: T,
        changed_at: Option<Instant>,
        now: Instant,
    ) -> T {
        let recent = changed_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.protection_window);
        if reported != local && recent {
            debug!(field, ?local, ?reported, "ignoring transient device report");
            return local;
        }
        reported
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.settings;
        write!(
            f,
            "power={:?} mode={:?} target={} fan={:?} swing={:?} turbo={:?} sleep={:?} eco={:?} display={:?} beep={:?}",
            s.power,
            s.operation_mode,
            Temperature::from_celsius(s.target_temperature),
            s.fan_speed,
            s.swing_mode,
            s.turbo_mode,
            s.sleep_mode,
            s.eco_mode,
            s.display_mode,
            s.beep_mode,
        )?;
        if let Some(indoor) = self.current_temperature {
            write!(f, " indoor={}", Temperature::from_celsius(indoor))?;
        }
        if let Some(outdoor) = self.outdoor_temperature {
            write!(f, " outdoor={}", Temperature::from_celsius(outdoor))?;
        }
        Ok(())
    }
}
