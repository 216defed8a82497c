use crate::errors::{Error, Result};
use crate::metrics::{COMMANDS_PUBLISHED_TOTAL, PUBLISH_FAILURES_TOTAL};
use crate::model::Command;
use rumqttc::{AsyncClient, QoS};

/// Outbound side of the transport. Sends are fire-and-forget: a successful
/// return only means the message was queued.
pub trait Publisher {
    fn send(&mut self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()>;
}

impl Publisher for AsyncClient {
    fn send(&mut self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
        // Never awaits; the event loop driven by the dispatcher flushes the queue.
        self.try_publish(topic, qos, false, payload)
            .map_err(Error::Mqtt)
    }
}

/// Serializes `command` and publishes it at QoS 0.
pub fn send_command<P>(publisher: &mut P, topic: &str, command: &Command) -> Result<()>
where
    P: Publisher + ?Sized,
{
    let payload = serde_json::to_vec(command)?;

    match publisher.send(topic, QoS::AtMostOnce, payload) {
        Ok(()) => {
            COMMANDS_PUBLISHED_TOTAL
                .with_label_values(&[command.name()])
                .inc();
            Ok(())
        }
        Err(e) => {
            PUBLISH_FAILURES_TOTAL.inc();
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct Sent {
        pub topic: String,
        pub qos: QoS,
        pub payload: Vec<u8>,
    }

    impl Sent {
        pub fn command(&self) -> Command {
            serde_json::from_slice(&self.payload).unwrap()
        }
    }

    /// Records every send instead of talking to a broker.
    #[derive(Debug, Default)]
    pub struct RecordingPublisher {
        pub sent: Vec<Sent>,
        pub fail: bool,
    }

    impl RecordingPublisher {
        pub fn commands(&self) -> Vec<Command> {
            self.sent.iter().map(Sent::command).collect()
        }

        pub fn count(&self, name: &str) -> usize {
            self.commands().iter().filter(|c| c.name() == name).count()
        }
    }

    impl Publisher for RecordingPublisher {
        fn send(&mut self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
            if self.fail {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "client queue closed",
                )));
            }
            self.sent.push(Sent {
                topic: topic.to_string(),
                qos,
                payload,
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingPublisher;
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_send_command_uses_qos0() {
        let mut publisher = RecordingPublisher::default();
        send_command(&mut publisher, "mcr/f/command", &Command::time_sync(Utc::now(), "0xAA"))
            .unwrap();

        assert_eq!(publisher.sent.len(), 1);
        assert_eq!(publisher.sent[0].topic, "mcr/f/command");
        assert_eq!(publisher.sent[0].qos, QoS::AtMostOnce);
        assert_eq!(publisher.count("time.sync"), 1);
    }

    #[test]
    fn test_send_command_propagates_failure() {
        let mut publisher = RecordingPublisher {
            fail: true,
            ..Default::default()
        };
        let result = send_command(&mut publisher, "t", &Command::time_sync(Utc::now(), "0xAA"));

        assert!(matches!(result, Err(Error::Io(_))));
    }
}
