use crate::audit::{AuditLog, Durable};
use crate::config::Config;
use crate::decode::decode;
use crate::errors::Result;
use crate::humanize;
use crate::metrics::{
    ACKS_RESOLVED_TOTAL, DECODE_FAILURES_TOTAL, MESSAGES_TOTAL, OUTSTANDING_COMMANDS,
    ROUND_TRIP_SECONDS,
};
use crate::model::{Decoded, FlatRecord, PayloadFormat, TelemetryEvent};
use crate::publish::Publisher;
use crate::scheduler::{Fired, Scheduler};
use crate::tracker::CorrelationTracker;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

/// Log lines rendered for one inbound report.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub headline: String,
    pub detail: Option<String>,
    /// Switch acknowledgments are also written to the audit log.
    pub durable: bool,
}

/// Per-message processing plus the periodic actions, all owned by the one
/// task that drives the transport.
pub struct Dispatcher<P, W> {
    publisher: P,
    audit: AuditLog<W>,
    tracker: CorrelationTracker,
    scheduler: Scheduler,
    format_filter: Option<PayloadFormat>,
}

impl<P, W> Dispatcher<P, W>
where
    P: Publisher,
    W: Durable,
{
    pub fn new(config: &Config, publisher: P, audit: AuditLog<W>, now: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            publisher,
            audit,
            tracker: CorrelationTracker::new(),
            scheduler: Scheduler::new(config, now),
            format_filter: config.payload_format()?,
        })
    }

    /// Decodes and accounts for one report, then emits its log lines.
    /// Returns `None` when the message was skipped.
    pub fn handle(&mut self, feed: &str, body: &str, now: DateTime<Utc>) -> Option<Report> {
        MESSAGES_TOTAL.inc();

        if let Some(wanted) = self.format_filter {
            let format = PayloadFormat::detect(body);
            if format != wanted {
                debug!("Skipping {} report on {} (filter is {})", format, feed, wanted);
                return None;
            }
        }

        let decoded = match decode(body) {
            Ok(decoded) => decoded,
            Err(e) => {
                DECODE_FAILURES_TOTAL.inc();
                warn!("Skipping undecodable report on {}: {}", feed, e);
                return None;
            }
        };

        let report = match decoded {
            Decoded::Telemetry(event) => self.on_telemetry(&event, now),
            Decoded::Flat(record) => on_flat(feed, &record, now),
        };
        self.emit(&report);

        Some(report)
    }

    /// Runs the periodic actions that are due at `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Fired {
        self.scheduler
            .tick(now, &mut self.publisher, &mut self.tracker)
    }

    pub fn tracker(&self) -> &CorrelationTracker {
        &self.tracker
    }

    #[cfg(test)]
    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    #[cfg(test)]
    pub fn audit(&self) -> &AuditLog<W> {
        &self.audit
    }

    fn on_telemetry(&mut self, event: &TelemetryEvent, now: DateTime<Utc>) -> Report {
        let reported_at = event.reported_at().unwrap_or(now);
        let mut headline = format!("{}  ", reported_at);
        let mut detail = String::new();

        if event.is_startup() {
            info!("Device {} started, sending time.sync", event.host.as_deref().unwrap_or("?"));
            self.scheduler.force_time_sync(now, &mut self.publisher);
            detail.push_str(&format!("startup={}", event.startup.unwrap_or_default()));
        }

        if let Some(device) = &event.device {
            let staleness = now - reported_at;
            debug!("{} report is {}s old", device, staleness.num_seconds());

            headline.push_str(&format!("{} {} ", device, event.kind.as_deref().unwrap_or("")));

            if event.is_ack() {
                let latency = event
                    .latency
                    .map(humanize::micros)
                    .unwrap_or_else(|| "?".to_string());
                headline.push_str(&format!("cmdack latency={} ", latency));

                if let Some(cid) = &event.cid {
                    self.resolve_ack(cid, now, &mut headline);
                }
            }

            detail.push_str(&readings(event));
        }

        Report {
            headline,
            detail: Some(detail),
            durable: event.kind_contains("switch") && event.is_ack(),
        }
    }

    fn resolve_ack(&mut self, cid: &str, now: DateTime<Utc>, headline: &mut String) {
        match self.tracker.resolve(cid, now) {
            Some(rt) => {
                ACKS_RESOLVED_TOTAL.inc();
                OUTSTANDING_COMMANDS.set(self.tracker.len() as f64);
                if let Some(us) = rt.num_microseconds() {
                    ROUND_TRIP_SECONDS.observe(us as f64 / 1_000_000.0);
                }
                headline.push_str(&format!("rt_latency={}", humanize::duration(rt)));
            }
            None => debug!("Ack for untracked cid {}", cid),
        }
    }

    fn emit(&mut self, report: &Report) {
        info!("{}", report.headline);
        if let Some(detail) = &report.detail {
            info!("   {}", detail);
        }

        if report.durable {
            let detail = report.detail.as_deref().unwrap_or_default();
            if let Err(e) = self.audit.record(&report.headline, detail) {
                error!("Failed to write audit log: {}", e);
            }
        }
    }
}

/// Type-specific readings for display.
fn readings(event: &TelemetryEvent) -> String {
    if event.kind_contains("temp") {
        format!("tf={} tc={}", opt(event.tf), opt(event.tc))
    } else if event.kind_contains("switch") {
        let pio = event
            .pio
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!("pio={}", pio)
    } else if event.kind_contains("relh") {
        format!("tf={} tc={} rh={}", opt(event.tf), opt(event.tc), opt(event.rh))
    } else if event.kind_contains("soil") {
        format!("tc={} cap={}", opt(event.tc), opt(event.cap))
    } else {
        String::new()
    }
}

fn opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Whole seconds of a flat-record timestamp. Fractions are truncated and
/// anything unparsable counts as the epoch.
fn flat_mtime(mtime: &str) -> i64 {
    mtime.parse::<f64>().map(|m| m as i64).unwrap_or(0)
}

fn on_flat(feed: &str, record: &FlatRecord, now: DateTime<Utc>) -> Report {
    let age = now.timestamp().saturating_sub(flat_mtime(&record.mtime));
    let samples: Vec<String> = record.samples.iter().map(|s| s.to_string()).collect();

    Report {
        headline: format!("{}: {} {} {}", feed, record.id, age, samples.join(" ")),
        detail: None,
        durable: false,
    }
}
