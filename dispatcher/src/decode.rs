use crate::errors::{Error, Result};
use crate::model::{Decoded, FlatRecord, PayloadFormat, TelemetryEvent};

const FIELD_DELIMITER: char = ',';

/// Decodes a raw report body, choosing the format by its content.
pub fn decode(body: &str) -> Result<Decoded> {
    match PayloadFormat::detect(body) {
        PayloadFormat::Json => decode_structured(body).map(Decoded::Telemetry),
        PayloadFormat::Csv => Ok(Decoded::Flat(decode_flat(body))),
    }
}

pub fn decode_structured(body: &str) -> Result<TelemetryEvent> {
    serde_json::from_str(body).map_err(Error::Decode)
}

/// Splits a delimited record. Missing leading fields come back empty and
/// unparsable samples count as zero, so this never fails.
pub fn decode_flat(body: &str) -> FlatRecord {
    let mut fields = body.trim().split(FIELD_DELIMITER);

    let id = fields.next().unwrap_or_default().trim().to_string();
    let mtime = fields.next().unwrap_or_default().trim().to_string();
    let samples = fields
        .map(|field| field.trim().parse::<f64>().unwrap_or(0.0))
        .filter(|sample| *sample > 0.0)
        .collect();

    FlatRecord { id, mtime, samples }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PinState;

    #[test]
    fn test_flat_keeps_positive_samples_in_order() {
        let record = decode_flat("sensor-7,1700000000,3.2,-1.0,0,5.5,bad");

        assert_eq!(record.id, "sensor-7");
        assert_eq!(record.mtime, "1700000000");
        assert_eq!(record.samples, vec![3.2, 5.5]);
    }

    #[test]
    fn test_flat_random_samples_are_all_positive() {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let values: Vec<f64> = (0..8).map(|_| rng.gen_range(-10.0..10.0)).collect();
            let body = format!(
                "dev,1700000000,{}",
                values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",")
            );

            let expected: Vec<f64> = values.iter().copied().filter(|v| *v > 0.0).collect();
            assert_eq!(decode_flat(&body).samples, expected);
        }
    }

    #[test]
    fn test_flat_short_record() {
        let record = decode_flat("lonely");

        assert_eq!(record.id, "lonely");
        assert!(record.mtime.is_empty());
        assert!(record.samples.is_empty());
    }

    #[test]
    fn test_brace_selects_structured() {
        let body = r#"{"device":"ds/291d1823000000","type":"switch","mtime":1700000000,
            "cmdack":true,"latency":1250,"cid":"c-1","pio":3,"host":"mcr.1"}"#;

        match decode(body).unwrap() {
            Decoded::Telemetry(event) => {
                assert_eq!(event.device.as_deref(), Some("ds/291d1823000000"));
                assert_eq!(event.kind.as_deref(), Some("switch"));
                assert_eq!(event.mtime, Some(1_700_000_000.0));
                assert_eq!(event.cmdack, Some(true));
                assert_eq!(event.latency, Some(1250.0));
                assert_eq!(event.cid.as_deref(), Some("c-1"));
                assert_eq!(event.pio, Some(PinState::Bits(3)));
                assert_eq!(event.host.as_deref(), Some("mcr.1"));
                assert!(event.startup.is_none());
                assert!(event.tc.is_none());
            }
            other => panic!("expected structured event, got {:?}", other),
        }
    }

    #[test]
    fn test_structured_round_trip() {
        let event = TelemetryEvent {
            mtime: Some(1_700_000_123.0),
            device: Some("ds/28ff000000".to_string()),
            kind: Some("relh".to_string()),
            tc: Some(21.5),
            tf: Some(70.7),
            rh: Some(44.0),
            ..Default::default()
        };
        let body = serde_json::to_string(&event).unwrap();

        assert_eq!(decode(&body).unwrap(), Decoded::Telemetry(event));
    }

    #[test]
    fn test_no_brace_selects_flat() {
        assert!(matches!(decode("a,b,1.0").unwrap(), Decoded::Flat(_)));
    }

    #[test]
    fn test_malformed_structured_is_error() {
        let err = decode("{\"device\": ").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
