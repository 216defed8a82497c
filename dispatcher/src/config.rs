use crate::errors::{Error, Result};
use crate::model::PayloadFormat;
use chrono::Duration;
use clap::Parser;
use std::path::PathBuf;

/// Switch addresses exercised every cycle, in issue order.
const DEFAULT_DEVICES: [&str; 4] = [
    "ds/291d1823000000",
    "ds/124c8421000000",
    "ds/12398521000000",
    "ds/12838421000000",
];

/// Upper bound for every period and TTL, one year.
const MAX_PERIOD_SECS: u64 = 365 * 24 * 60 * 60;

/// Dispatcher settings, read once at startup from flags or the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "dispatcher", version, about = "Correlates device reports and drives switch commands over MQTT")]
pub struct Config {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    pub mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    #[arg(long, env = "MQTT_USER")]
    pub mqtt_user: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    /// Defaults to `dispatcher-<uuid>`
    #[arg(long, env = "MQTT_CLIENT_ID")]
    pub client_id: Option<String>,

    #[arg(long, env = "REPORT_TOPIC", default_value = "mcr/f/report")]
    pub report_topic: String,

    #[arg(long, env = "COMMAND_TOPIC", default_value = "mcr/f/command")]
    pub command_topic: String,

    /// Tag every command carries in its `key` field
    #[arg(long, env = "COMMAND_KEY", default_value = "0xAA")]
    pub command_key: String,

    /// Switch addresses for the exercise cycle (repeat or comma-separate)
    #[arg(long = "device", env = "DEVICES", value_delimiter = ',', default_values = DEFAULT_DEVICES)]
    pub devices: Vec<String>,

    /// Only process reports in this format (csv or json)
    #[arg(long, env = "PAYLOAD_FORMAT")]
    pub format: Option<String>,

    #[arg(long, env = "AUDIT_LOG", default_value = "/tmp/dispatcher-audit.log")]
    pub audit_log: PathBuf,

    /// Serve prometheus metrics on this address when set
    #[arg(long, env = "METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    #[arg(long, env = "TIME_SYNC_SECS", default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..=MAX_PERIOD_SECS))]
    pub time_sync_secs: u64,

    #[arg(long, env = "HEARTBEAT_SECS", default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..=MAX_PERIOD_SECS))]
    pub heartbeat_secs: u64,

    #[arg(long, env = "EXERCISE_SECS", default_value_t = 3, value_parser = clap::value_parser!(u64).range(1..=MAX_PERIOD_SECS))]
    pub exercise_secs: u64,

    /// Forget unacknowledged commands after this many seconds
    #[arg(long, env = "COMMAND_TTL_SECS", value_parser = clap::value_parser!(u64).range(1..=MAX_PERIOD_SECS))]
    pub command_ttl_secs: Option<u64>,

    /// Receive timeout while the inbound queue is empty
    #[arg(long, env = "IDLE_POLL_MS", default_value_t = 10)]
    pub idle_poll_ms: u64,
}

impl Config {
    /// Validated payload-format filter, `None` when every format is accepted.
    pub fn payload_format(&self) -> Result<Option<PayloadFormat>> {
        self.format
            .as_deref()
            .map(|f| f.parse::<PayloadFormat>().map_err(Error::Config))
            .transpose()
    }

    pub fn time_sync_interval(&self) -> Duration {
        period(self.time_sync_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        period(self.heartbeat_secs)
    }

    pub fn exercise_interval(&self) -> Duration {
        period(self.exercise_secs)
    }

    pub fn command_ttl(&self) -> Option<Duration> {
        self.command_ttl_secs.map(period)
    }

    pub fn idle_poll(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.idle_poll_ms)
    }
}

// Parsing caps every period at MAX_PERIOD_SECS, so the cast cannot wrap.
fn period(secs: u64) -> Duration {
    Duration::seconds(secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["dispatcher"]);

        assert_eq!(config.report_topic, "mcr/f/report");
        assert_eq!(config.command_topic, "mcr/f/command");
        assert_eq!(config.devices, DEFAULT_DEVICES);
        assert_eq!(config.time_sync_interval(), Duration::seconds(10));
        assert_eq!(config.exercise_interval(), Duration::seconds(3));
        assert!(config.command_ttl().is_none());
    }

    #[test]
    fn test_device_list_is_comma_separated() {
        let config = Config::parse_from(["dispatcher", "--device", "ds/a,ds/b"]);
        assert_eq!(config.devices, vec!["ds/a", "ds/b"]);
    }

    #[test]
    fn test_format_filter() {
        let json = Config::parse_from(["dispatcher", "--format", "json"]);
        assert_eq!(json.payload_format().unwrap(), Some(PayloadFormat::Json));

        let xml = Config::parse_from(["dispatcher", "--format", "xml"]);
        assert!(matches!(xml.payload_format(), Err(Error::Config(_))));
    }

    #[test]
    fn test_periods_must_be_positive_and_bounded() {
        for bad in ["0", "-5", "99999999999999999"] {
            let result = Config::try_parse_from(["dispatcher", "--exercise-secs", bad]);
            assert!(result.is_err(), "accepted --exercise-secs {}", bad);
        }

        let too_long = (MAX_PERIOD_SECS + 1).to_string();
        assert!(Config::try_parse_from(["dispatcher", "--command-ttl-secs", too_long.as_str()]).is_err());

        let config = Config::parse_from(["dispatcher", "--command-ttl-secs", "90"]);
        assert_eq!(config.command_ttl(), Some(Duration::seconds(90)));
    }
}
