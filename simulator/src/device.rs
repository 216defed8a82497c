use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Report document as field devices publish it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    pub version: u32,
    pub host: String,
    pub mtime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdack: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tc: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tf: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rh: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pio: Option<u64>,
}

/// Command document received from the dispatcher.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundCommand {
    pub cmd: String,
    #[serde(default)]
    pub mtime: Option<String>,
    #[serde(default)]
    pub switch: Option<String>,
    #[serde(default)]
    pub pio: Vec<BTreeMap<String, bool>>,
    #[serde(default)]
    pub cid: Option<String>,
}

/// A simulated controller: a few sensors plus a bank of switches.
pub struct Device {
    host: String,
    sensors: Vec<String>,
    switches: HashMap<String, u64>,
    latency_us: (u64, u64),
}

impl Device {
    pub fn new(host: String, sensors: usize, switches: &[String], latency_us: (u64, u64)) -> Self {
        Self {
            host,
            sensors: (0..sensors).map(|i| format!("ds/28ff{:010x}", i)).collect(),
            switches: switches.iter().map(|s| (s.clone(), 0)).collect(),
            latency_us,
        }
    }

    pub fn announce(&self) -> Report {
        Report {
            version: 1,
            host: self.host.clone(),
            mtime: Utc::now().timestamp(),
            startup: Some(true),
            ..Default::default()
        }
    }

    /// One reading per sensor, alternating temperature and humidity sensors.
    pub fn readings(&self, rng: &mut impl Rng, now: DateTime<Utc>) -> Vec<Report> {
        self.sensors
            .iter()
            .enumerate()
            .map(|(i, sensor)| {
                let tc: f64 = round1(rng.gen_range(15.0..30.0));
                let mut report = Report {
                    version: 1,
                    host: self.host.clone(),
                    mtime: now.timestamp(),
                    device: Some(sensor.clone()),
                    kind: Some("temp".to_string()),
                    tc: Some(tc),
                    tf: Some(round1(tc * 1.8 + 32.0)),
                    ..Default::default()
                };
                if i % 2 == 1 {
                    report.kind = Some("relh".to_string());
                    report.rh = Some(round1(rng.gen_range(30.0..80.0)));
                }
                report
            })
            .collect()
    }

    /// `id,mtime,samples...` with the occasional non-positive sample.
    pub fn flat_record(&self, rng: &mut impl Rng, now: DateTime<Utc>) -> String {
        let mut fields = vec![self.host.clone(), now.timestamp().to_string()];
        for _ in 0..4 {
            let sample = if rng.gen_bool(0.2) {
                -rng.gen_range(0.0..5.0)
            } else {
                rng.gen_range(0.1..100.0)
            };
            fields.push(format!("{:.2}", sample));
        }
        fields.join(",")
    }

    /// Applies a command and returns the acknowledgment to publish, if any.
    pub fn apply(&mut self, cmd: &InboundCommand, rng: &mut impl Rng) -> Option<Report> {
        if cmd.cmd != "set.switch" {
            return None;
        }

        let address = cmd.switch.as_ref()?;
        let state = self.switches.get_mut(address)?;
        for pins in &cmd.pio {
            for (pin, on) in pins {
                let bit = 1u64 << pin.parse::<u32>().ok()?.min(63);
                if *on {
                    *state |= bit;
                } else {
                    *state &= !bit;
                }
            }
        }

        Some(Report {
            version: 1,
            host: self.host.clone(),
            mtime: Utc::now().timestamp(),
            device: Some(address.clone()),
            kind: Some("switch".to_string()),
            cmdack: Some(true),
            latency: Some(rng.gen_range(self.latency_us.0..=self.latency_us.1)),
            cid: cmd.cid.clone(),
            pio: Some(*state),
            ..Default::default()
        })
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn device() -> Device {
        Device::new(
            "mcr.sim".to_string(),
            2,
            &["ds/291d1823000000".to_string()],
            (500, 1500),
        )
    }

    fn set_switch(address: &str, on: bool) -> InboundCommand {
        serde_json::from_value(serde_json::json!({
            "version": "1",
            "cmd": "set.switch",
            "mtime": "1700000000",
            "key": "0xAA",
            "switch": address,
            "pio": [{"0": on}],
            "pio_count": 1,
            "cid": "cid-1"
        }))
        .unwrap()
    }

    #[test]
    fn test_set_switch_is_acknowledged() {
        let mut dev = device();
        let mut rng = StepRng::new(0, 1);

        let ack = dev.apply(&set_switch("ds/291d1823000000", true), &mut rng).unwrap();

        assert_eq!(ack.cmdack, Some(true));
        assert_eq!(ack.cid.as_deref(), Some("cid-1"));
        assert_eq!(ack.kind.as_deref(), Some("switch"));
        assert_eq!(ack.pio, Some(1));

        let off = dev.apply(&set_switch("ds/291d1823000000", false), &mut rng).unwrap();
        assert_eq!(off.pio, Some(0));
    }

    #[test]
    fn test_foreign_switch_is_ignored() {
        let mut dev = device();
        let mut rng = StepRng::new(0, 1);

        assert!(dev.apply(&set_switch("ds/ffffffffffffff", true), &mut rng).is_none());
    }

    #[test]
    fn test_time_sync_needs_no_ack() {
        let mut dev = device();
        let mut rng = StepRng::new(0, 1);
        let cmd: InboundCommand =
            serde_json::from_str(r#"{"version":"1","cmd":"time.sync","mtime":"1","key":"0xAA"}"#).unwrap();

        assert!(dev.apply(&cmd, &mut rng).is_none());
    }

    #[test]
    fn test_flat_record_shape() {
        let dev = device();
        let mut rng = rand::thread_rng();
        let record = dev.flat_record(&mut rng, Utc::now());

        let fields: Vec<&str> = record.split(',').collect();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[0], "mcr.sim");
        assert!(fields[2..].iter().all(|f| f.parse::<f64>().is_ok()));
    }

    #[test]
    fn test_readings_alternate_kinds() {
        let dev = device();
        let mut rng = rand::thread_rng();
        let readings = dev.readings(&mut rng, Utc::now());

        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].kind.as_deref(), Some("temp"));
        assert_eq!(readings[1].kind.as_deref(), Some("relh"));
        assert!(readings[1].rh.is_some());
    }
}
