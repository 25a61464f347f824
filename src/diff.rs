use serde::Serialize;
use serde_json::{Map, Value};

use crate::protocol::SetCommand;
use crate::types::*;

/// Fields where a desired state differs from the canonical one, holding the
/// desired value. Measurements and provenance never appear here.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDiff {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<Switch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_mode: Option<OperationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_speed: Option<FanSpeed>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swing_mode: Option<SwingMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turbo_mode: Option<Switch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep_mode: Option<Switch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eco_mode: Option<Switch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_mode: Option<Switch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beep_mode: Option<Switch>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        *self == StateDiff::default()
    }

    pub fn len(&self) -> usize {
        [
            self.power.is_some(),
            self.operation_mode.is_some(),
            self.target_temperature.is_some(),
            self.fan_speed.is_some(),
            self.swing_mode.is_some(),
            self.turbo_mode.is_some(),
            self.sleep_mode.is_some(),
            self.eco_mode.is_some(),
            self.display_mode.is_some(),
            self.beep_mode.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    pub fn into_command(self) -> SetCommand {
        SetCommand {
            power: self.power,
            operation_mode: self.operation_mode,
            target_temperature: self.target_temperature,
            fan_speed: self.fan_speed,
            swing_mode: self.swing_mode,
            turbo_mode: self.turbo_mode,
            sleep_mode: self.sleep_mode,
            sleep_profile: None,
            eco_mode: self.eco_mode,
            display_mode: self.display_mode,
            beep_mode: self.beep_mode,
        }
    }
}

pub(crate) fn pick<T: PartialEq + Copy>(current: T, desired: T) -> Option<T> {
    (current != desired).then_some(desired)
}

/// Changed keys between two flat JSON objects as `(key, old, new)`.
/// Keys missing on one side compare against `null`.
pub(crate) fn diff_flat(previous: &Value, current: &Value) -> Vec<(String, Value, Value)> {
    let empty = Map::new();
    let prev = previous.as_object().unwrap_or(&empty);
    let curr = current.as_object().unwrap_or(&empty);

    let mut changes: Vec<(String, Value, Value)> = curr
        .iter()
        .filter(|(key, value)| prev.get(*key) != Some(*value))
        .map(|(key, value)| {
            let old = prev.get(key).cloned().unwrap_or(Value::Null);
            (key.clone(), old, value.clone())
        })
        .collect();

    for (key, old) in prev {
        if !curr.contains_key(key) {
            changes.push((key.clone(), old.clone(), Value::Null));
        }
    }
    changes
}
