use std::collections::HashMap;

use quick_xml::escape::escape;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use tracing::debug;

use crate::types::*;
use crate::{Error, Result};

pub const STATUS_BODY: &str = "statusUpdateMsg";

/// Profile written when sleep is switched on and the device never reported
/// one of its own.
pub const DEFAULT_SLEEP_PROFILE: &str =
    "sleepMode1:0:0:0:0:0:0:0:0:0:0:0:0:0:0:0:0:0:0:0:0:0:0:0:0:0";

const REQUIRED_STATUS_FIELDS: &[&str] = &["TurnOn", "BaseMode", "SetTemp", "WindSpeed"];

/// Field-set command. Only populated fields go on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetCommand {
    pub power: Option<Switch>,
    pub operation_mode: Option<OperationMode>,
    /// Celsius; converted to the device unit when serialized.
    pub target_temperature: Option<f64>,
    pub fan_speed: Option<FanSpeed>,
    pub swing_mode: Option<SwingMode>,
    pub turbo_mode: Option<Switch>,
    pub sleep_mode: Option<Switch>,
    /// Written instead of the default profile when sleep is switched on.
    pub sleep_profile: Option<String>,
    pub eco_mode: Option<Switch>,
    pub display_mode: Option<Switch>,
    pub beep_mode: Option<Switch>,
}

impl SetCommand {
    pub fn is_empty(&self) -> bool {
        self.power.is_none()
            && self.operation_mode.is_none()
            && self.target_temperature.is_none()
            && self.fan_speed.is_none()
            && self.swing_mode.is_none()
            && self.turbo_mode.is_none()
            && self.sleep_mode.is_none()
            && self.eco_mode.is_none()
            && self.display_mode.is_none()
            && self.beep_mode.is_none()
    }

    /// `(wire name, wire value)` pairs in the order the firmware expects.
    pub fn wire_fields(&self, unit: TemperatureUnit) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        if let Some(power) = self.power {
            fields.push(("TurnOn", power.as_wire_str().to_string()));
        }
        if let Some(mode) = self.operation_mode {
            fields.push(("BaseMode", mode.as_wire_str().to_string()));
        }
        if let Some(temp) = self.target_temperature {
            let wire = Temperature::from_celsius(temp).to_wire(unit);
            fields.push(("SetTemp", wire.to_string()));
        }
        if let Some(token) = self.fan_speed.and_then(|f| f.as_wire_str()) {
            fields.push(("WindSpeed", token.to_string()));
        }
        if let Some(swing) = self.swing_mode {
            let (h, v) = swing.axes();
            fields.push(("WindDirection_H", h.as_wire_str().to_string()));
            fields.push(("WindDirection_V", v.as_wire_str().to_string()));
        }
        let turbo = self
            .turbo_mode
            .or_else(|| (self.fan_speed == Some(FanSpeed::Turbo)).then_some(Switch::On));
        if let Some(turbo) = turbo {
            fields.push(("Opt_super", turbo.as_wire_str().to_string()));
        }
        if let Some(sleep) = self.sleep_mode {
            let value = match sleep {
                Switch::On => self
                    .sleep_profile
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SLEEP_PROFILE.to_string()),
                Switch::Off => Switch::Off.as_wire_str().to_string(),
            };
            fields.push(("Opt_sleepMode", value));
        }
        if let Some(eco) = self.eco_mode {
            fields.push(("Opt_eco", eco.as_wire_str().to_string()));
        }
        if let Some(display) = self.display_mode {
            fields.push(("Opt_display", display.as_wire_str().to_string()));
        }
        if let Some(beep) = self.beep_mode {
            fields.push(("Opt_beep", beep.as_wire_str().to_string()));
        }
        fields
    }
}

pub fn status_request(seq: u32) -> String {
    format!(
        r#"<msg msgid="SyncStatusReq" type="Control" seq="{seq}"><SyncStatusReq></SyncStatusReq></msg>"#
    )
}

pub fn set_message(seq: u32, command: &SetCommand, unit: TemperatureUnit) -> String {
    let mut body = String::new();
    for (name, value) in command.wire_fields(unit) {
        body.push_str(&format!("<{name}>{}</{name}>", escape(value.as_str())));
    }
    format!(r#"<msg msgid="SetMessage" type="Control" seq="{seq}"><SetMessage>{body}</SetMessage></msg>"#)
}

/// A parsed response envelope: the root's `seq` attribute plus the leaf
/// elements of its first child.
#[derive(Debug, Clone, Default)]
pub struct WireResponse {
    pub seq: Option<u32>,
    pub body: Option<String>,
    pub fields: HashMap<String, String>,
}

impl WireResponse {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    fn required(&self, name: &str) -> Result<&str> {
        self.field(name)
            .ok_or_else(|| Error::Parse(format!("status response missing <{name}>")))
    }
}

pub fn parse_response(xml: &str) -> Result<WireResponse> {
    if xml.trim().is_empty() {
        return Err(Error::Parse("empty response".to_string()));
    }

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut response = WireResponse::default();
    let mut stack: Vec<String> = Vec::new();
    let mut saw_root = false;

    loop {
        match reader.read_event()? {
            XmlEvent::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if stack.is_empty() {
                    if saw_root {
                        return Err(Error::Parse("multiple root elements".to_string()));
                    }
                    saw_root = true;
                    response.seq = root_seq(&e)?;
                } else if stack.len() == 1 && response.body.is_none() {
                    response.body = Some(name.clone());
                }
                stack.push(name);
            }
            XmlEvent::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match stack.len() {
                    0 => {
                        saw_root = true;
                        response.seq = root_seq(&e)?;
                    }
                    1 if response.body.is_none() => response.body = Some(name),
                    2 if in_body(&stack, &response) => {
                        response.fields.insert(name, String::new());
                    }
                    _ => {}
                }
            }
            XmlEvent::Text(t) => {
                if stack.len() == 3 && in_body(&stack, &response) {
                    let text = t.unescape()?.into_owned();
                    response.fields.insert(stack[2].clone(), text);
                }
            }
            XmlEvent::End(_) => {
                stack.pop();
            }
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(Error::Parse("no root element".to_string()));
    }
    if !stack.is_empty() {
        return Err(Error::Parse(format!("unclosed element <{}>", stack.join("><"))));
    }
    Ok(response)
}

fn in_body(stack: &[String], response: &WireResponse) -> bool {
    stack.get(1).map(String::as_str) == response.body.as_deref()
}

fn root_seq(e: &quick_xml::events::BytesStart<'_>) -> Result<Option<u32>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::Parse(err.to_string()))?;
        if attr.key.as_ref() == b"seq" {
            let raw = attr.unescape_value()?;
            // Some firmware formats the echo as a float ("12.0").
            let seq = raw
                .trim()
                .parse::<f64>()
                .map_err(|_| Error::Parse(format!("bad seq attribute: {raw}")))?;
            return Ok(Some(seq as u32));
        }
    }
    Ok(None)
}

/// Project a status response onto typed fields, converting temperatures
/// from the device unit to Celsius.
pub fn parse_status(response: &WireResponse, unit: TemperatureUnit) -> Result<StatusRecord> {
    if response.body.as_deref() != Some(STATUS_BODY) {
        return Err(Error::Parse(format!(
            "expected <{STATUS_BODY}>, got {:?}",
            response.body
        )));
    }
    for name in REQUIRED_STATUS_FIELDS {
        response.required(name)?;
    }

    let power = Switch::from_wire_str(response.required("TurnOn")?)
        .ok_or_else(|| bad_value("TurnOn", response))?;
    let operation_mode = OperationMode::from_wire_str(response.required("BaseMode")?)
        .ok_or_else(|| bad_value("BaseMode", response))?;
    let target_temperature = wire_temperature(response, "SetTemp", unit)?
        .ok_or_else(|| bad_value("SetTemp", response))?;
    let wind = FanSpeed::from_wire_str(response.required("WindSpeed")?)
        .ok_or_else(|| bad_value("WindSpeed", response))?;

    let turbo_mode = optional_switch(response, "Opt_super").unwrap_or_default();
    let fan_speed = if turbo_mode.is_on() { FanSpeed::Turbo } else { wind };

    let swing_mode = SwingMode::from_axes(
        optional_switch(response, "WindDirection_H").unwrap_or_default(),
        optional_switch(response, "WindDirection_V").unwrap_or_default(),
    );

    let sleep_mode = response
        .field("Opt_sleepMode")
        .unwrap_or(Switch::Off.as_wire_str())
        .trim()
        .to_string();
    if Switch::from_sleep_token(&sleep_mode).is_none() {
        debug!(value = %sleep_mode, "unrecognized sleep token, treating as off");
    }

    Ok(StatusRecord {
        power,
        operation_mode,
        target_temperature,
        current_temperature: wire_temperature(response, "IndoorTemp", unit)?,
        fan_speed,
        swing_mode,
        turbo_mode,
        sleep_mode,
        eco_mode: optional_switch(response, "Opt_eco"),
        display_mode: optional_switch(response, "Opt_display"),
        beep_mode: optional_switch(response, "Opt_beep"),
        outdoor_temperature: wire_temperature(response, "OutdoorTemp", unit)?,
    })
}

fn bad_value(name: &str, response: &WireResponse) -> Error {
    Error::Parse(format!(
        "unrecognized <{name}> value {:?}",
        response.field(name).unwrap_or_default()
    ))
}

fn optional_switch(response: &WireResponse, name: &str) -> Option<Switch> {
    let raw = response.field(name)?;
    let parsed = Switch::from_wire_str(raw);
    if parsed.is_none() {
        debug!(field = name, value = raw, "ignoring unrecognized on/off value");
    }
    parsed
}

fn wire_temperature(
    response: &WireResponse,
    name: &str,
    unit: TemperatureUnit,
) -> Result<Option<f64>> {
    let Some(raw) = response.field(name) else {
        return Ok(None);
    };
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| Error::Parse(format!("<{name}> is not a number: {raw:?}")))?;
    if !value.is_finite() {
        return Err(Error::Parse(format!("<{name}> is not a finite number: {raw:?}")));
    }
    Ok(Some(Temperature::from_wire(value, unit).celsius()))
}
