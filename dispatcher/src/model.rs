use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Report published by a field device as a JSON document.
///
/// Every field is optional: devices only send what applies to the reading,
/// and presence is the only validity signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(
        default,
        deserialize_with = "epoch_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub mtime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmdack: Option<bool>,
    #[serde(default, alias = "refid", skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// Device-reported command latency in microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tc: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tf: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pio: Option<PinState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_us: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_us: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc_mismatches: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_errors: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_errors: Option<u32>,
}

impl TelemetryEvent {
    /// Time the device stamped on the report, if it sent one.
    pub fn reported_at(&self) -> Option<DateTime<Utc>> {
        self.mtime
            .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0) as i64))
    }

    pub fn is_startup(&self) -> bool {
        self.startup.is_some()
    }

    pub fn is_ack(&self) -> bool {
        self.cmdack.is_some()
    }

    /// Substring match on the device type tag.
    pub fn kind_contains(&self, tag: &str) -> bool {
        self.kind.as_deref().is_some_and(|k| k.contains(tag))
    }
}

/// Accepts epoch seconds as a JSON number or a numeric string.
fn epoch_seconds<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(secs)) => Ok(Some(secs)),
        Some(Raw::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Digital pin state as reported by switch devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PinState {
    Bits(u64),
    Levels(Vec<bool>),
    Other(serde_json::Value),
}

impl fmt::Display for PinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinState::Bits(bits) => write!(f, "0x{:02x}", bits),
            PinState::Levels(levels) => {
                let levels: Vec<&str> = levels
                    .iter()
                    .map(|on| if *on { "on" } else { "off" })
                    .collect();
                write!(f, "[{}]", levels.join(","))
            }
            PinState::Other(value) => write!(f, "{}", value),
        }
    }
}

/// Comma-delimited record: identifier, timestamp, then samples.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatRecord {
    pub id: String,
    pub mtime: String,
    /// Strictly positive samples only, in arrival order.
    pub samples: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Telemetry(TelemetryEvent),
    Flat(FlatRecord),
}

/// Wire encoding of an inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Csv,
}

impl PayloadFormat {
    pub fn detect(body: &str) -> Self {
        if body.contains('{') {
            PayloadFormat::Json
        } else {
            PayloadFormat::Csv
        }
    }
}

impl std::str::FromStr for PayloadFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(PayloadFormat::Json),
            "csv" => Ok(PayloadFormat::Csv),
            other => Err(format!("Unsupported format ({})", other)),
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadFormat::Json => f.write_str("json"),
            PayloadFormat::Csv => f.write_str("csv"),
        }
    }
}

const PROTOCOL_VERSION: &str = "1";

/// Outbound command document published on the command topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub version: String,
    #[serde(flatten)]
    pub kind: CommandKind,
    pub mtime: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum CommandKind {
    #[serde(rename = "time.sync")]
    TimeSync,
    #[serde(rename = "heartbeat")]
    Heartbeat { master: String },
    #[serde(rename = "set.switch")]
    SetSwitch {
        switch: String,
        pio: Vec<BTreeMap<String, bool>>,
        pio_count: u32,
        cid: String,
    },
}

impl Command {
    fn new(kind: CommandKind, now: DateTime<Utc>, key: &str) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            kind,
            mtime: now.timestamp().to_string(),
            key: key.to_string(),
        }
    }

    pub fn time_sync(now: DateTime<Utc>, key: &str) -> Self {
        Self::new(CommandKind::TimeSync, now, key)
    }

    pub fn heartbeat(now: DateTime<Utc>, key: &str, master: &str) -> Self {
        Self::new(
            CommandKind::Heartbeat {
                master: master.to_string(),
            },
            now,
            key,
        )
    }

    /// Drives pin 0 of `address` to `state`.
    pub fn set_switch(
        now: DateTime<Utc>,
        key: &str,
        address: &str,
        state: bool,
        cid: &str,
    ) -> Self {
        let mut pin = BTreeMap::new();
        pin.insert("0".to_string(), state);

        Self::new(
            CommandKind::SetSwitch {
                switch: address.to_string(),
                pio: vec![pin],
                pio_count: 1,
                cid: cid.to_string(),
            },
            now,
            key,
        )
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            CommandKind::TimeSync => "time.sync",
            CommandKind::Heartbeat { .. } => "heartbeat",
            CommandKind::SetSwitch { .. } => "set.switch",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_switch_wire_format() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let cmd = Command::set_switch(now, "0xAA", "ds/12838421000000", true, "abc");

        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            value,
            json!({
                "version": "1",
                "cmd": "set.switch",
                "mtime": "1700000000",
                "key": "0xAA",
                "switch": "ds/12838421000000",
                "pio": [{"0": true}],
                "pio_count": 1,
                "cid": "abc"
            })
        );
    }

    #[test]
    fn test_heartbeat_carries_master() {
        let now = DateTime::from_timestamp(10, 0).unwrap();
        let value = serde_json::to_value(Command::heartbeat(now, "0xAA", "broker.local")).unwrap();

        assert_eq!(value["cmd"], "heartbeat");
        assert_eq!(value["master"], "broker.local");
        assert_eq!(value["mtime"], "10");
    }

    #[test]
    fn test_time_sync_has_no_extra_fields() {
        let now = DateTime::from_timestamp(10, 0).unwrap();
        let value = serde_json::to_value(Command::time_sync(now, "0xAA")).unwrap();

        assert_eq!(value.as_object().unwrap().len(), 4);
        assert_eq!(value["cmd"], "time.sync");
    }

    #[test]
    fn test_mtime_accepts_number_or_string() {
        let a: TelemetryEvent = serde_json::from_str(r#"{"mtime": 1700000000}"#).unwrap();
        let b: TelemetryEvent = serde_json::from_str(r#"{"mtime": "1700000000"}"#).unwrap();

        assert_eq!(a.mtime, Some(1_700_000_000.0));
        assert_eq!(a.reported_at(), b.reported_at());
    }

    #[test]
    fn test_refid_alias() {
        let event: TelemetryEvent = serde_json::from_str(r#"{"refid": "r-1"}"#).unwrap();
        assert_eq!(event.cid.as_deref(), Some("r-1"));
    }

    #[test]
    fn test_pin_state_display() {
        assert_eq!(PinState::Bits(3).to_string(), "0x03");
        assert_eq!(PinState::Levels(vec![true, false]).to_string(), "[on,off]");
    }

    #[test]
    fn test_payload_format_parse() {
        assert_eq!("json".parse::<PayloadFormat>(), Ok(PayloadFormat::Json));
        assert_eq!("csv".parse::<PayloadFormat>(), Ok(PayloadFormat::Csv));
        assert!("xml".parse::<PayloadFormat>().is_err());
    }
}
