use crate::config::Config;
use crate::metrics::OUTSTANDING_COMMANDS;
use crate::model::Command;
use crate::publish::{send_command, Publisher};
use crate::tracker::CorrelationTracker;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pin states driven, in order, at every exercised address.
const EXERCISE_STATES: [bool; 2] = [true, false];

/// Which periodic actions ran during one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    pub time_sync: bool,
    pub heartbeat: bool,
    pub exercise: bool,
}

/// Last-fired bookkeeping for the periodic outbound actions.
///
/// Each action compares its own timestamp against `now`, so a slow tick
/// delays the next firing instead of letting missed periods pile up.
#[derive(Debug)]
pub struct Scheduler {
    command_topic: String,
    command_key: String,
    master: String,
    devices: Vec<String>,
    time_sync_every: Duration,
    heartbeat_every: Duration,
    exercise_every: Duration,
    command_ttl: Option<Duration>,
    last_time_sync: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    last_exercise: DateTime<Utc>,
    toggle: bool,
}

impl Scheduler {
    /// All timers start at `now`.
    pub fn new(config: &Config, now: DateTime<Utc>) -> Self {
        Self {
            command_topic: config.command_topic.clone(),
            command_key: config.command_key.clone(),
            master: config.mqtt_broker.clone(),
            devices: config.devices.clone(),
            time_sync_every: config.time_sync_interval(),
            heartbeat_every: config.heartbeat_interval(),
            exercise_every: config.exercise_interval(),
            command_ttl: config.command_ttl(),
            last_time_sync: now,
            last_heartbeat: now,
            last_exercise: now,
            toggle: true,
        }
    }

    /// Runs every due action in fixed order: time sync, heartbeat, exercise.
    pub fn tick<P>(
        &mut self,
        now: DateTime<Utc>,
        publisher: &mut P,
        tracker: &mut CorrelationTracker,
    ) -> Fired
    where
        P: Publisher + ?Sized,
    {
        let mut fired = Fired::default();

        if now - self.last_time_sync > self.time_sync_every {
            self.force_time_sync(now, publisher);
            fired.time_sync = true;
        }

        if now - self.last_heartbeat > self.heartbeat_every {
            let heartbeat = Command::heartbeat(now, &self.command_key, &self.master);
            if let Err(e) = send_command(publisher, &self.command_topic, &heartbeat) {
                warn!("Failed to publish heartbeat: {}", e);
            }
            self.last_heartbeat = now;
            fired.heartbeat = true;
        }

        if now - self.last_exercise >= self.exercise_every {
            self.exercise(now, publisher, tracker);
            fired.exercise = true;
        }

        if let Some(ttl) = self.command_ttl {
            let dropped = tracker.evict_older_than(now, ttl);
            if dropped > 0 {
                info!("Forgot {} unacknowledged commands older than {}s", dropped, ttl.num_seconds());
            }
        }
        OUTSTANDING_COMMANDS.set(tracker.len() as f64);

        fired
    }

    /// Publishes a time sync immediately and restarts its timer.
    pub fn force_time_sync<P>(&mut self, now: DateTime<Utc>, publisher: &mut P)
    where
        P: Publisher + ?Sized,
    {
        let sync = Command::time_sync(now, &self.command_key);
        match send_command(publisher, &self.command_topic, &sync) {
            Ok(()) => debug!("Published time.sync mtime={}", sync.mtime),
            Err(e) => warn!("Failed to publish time.sync: {}", e),
        }
        self.last_time_sync = now;
    }

    /// Drives every configured switch on then off, one tracked command each.
    fn exercise<P>(&mut self, now: DateTime<Utc>, publisher: &mut P, tracker: &mut CorrelationTracker)
    where
        P: Publisher + ?Sized,
    {
        for address in &self.devices {
            for state in EXERCISE_STATES {
                let cid = Uuid::new_v4().to_string();
                let command = Command::set_switch(now, &self.command_key, address, state, &cid);

                tracker.register(cid.as_str(), now);
                if let Err(e) = send_command(publisher, &self.command_topic, &command) {
                    warn!("Failed to publish set.switch to {}: {}", address, e);
                    // no ack can arrive for a command that never left
                    tracker.resolve(&cid, now);
                }
            }
        }

        debug!(
            "Exercised {} switches, {} commands outstanding",
            self.devices.len(),
            tracker.len()
        );
        self.toggle = !self.toggle;
        self.last_exercise = now;
    }
}
