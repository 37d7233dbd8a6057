use serde::{Deserialize, Serialize};

const PLACEHOLDER_SENSOR_ID: &str = "no data yet";

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("malformed structured payload: {0}")]
    Structured(#[from] serde_json::Error),
    #[error("payload carries an empty sensor id")]
    EmptySensorId,
}

/// A fill level reported by one sensor.
///
/// Field names on the wire follow what the devices and the front-end speak.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Reading {
    #[serde(rename = "id")]
    pub sensor_id: String,
    #[serde(rename = "nivelLixo")]
    pub fill_level: f64,
}

impl Reading {
    pub fn new<S: Into<String>>(sensor_id: S, fill_level: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            fill_level,
        }
    }
}

impl Default for Reading {
    fn default() -> Self {
        Self::new(PLACEHOLDER_SENSOR_ID, 0.0)
    }
}

/// The two payload shapes a device may publish.
#[derive(Debug)]
pub(crate) enum Frame<'a> {
    /// `{"id": "CCBLX0001", "nivelLixo": 42}`
    Structured(Reading),
    /// `CCBLX0001:42`, or a bare `CCBLX0001` with no level at all
    Delimited {
        sensor_id: &'a str,
        fill_level: Option<&'a str>,
    },
}

/// Reads the right-hand side of a delimited payload. A missing or
/// non-numeric level is NaN, a blank one is zero.
fn parse_fill_level(fill_level: Option<&str>) -> f64 {
    match fill_level.map(str::trim) {
        None => f64::NAN,
        Some("") => 0.0,
        Some(level) => level.parse().unwrap_or(f64::NAN),
    }
}

impl<'a> Frame<'a> {
    pub fn parse(text: &'a str) -> Result<Self, DecodeError> {
        if text.trim_start().starts_with('{') {
            return Ok(Frame::Structured(serde_json::from_str(text)?));
        }
        Ok(match text.split_once(':') {
            Some((sensor_id, fill_level)) => Frame::Delimited {
                sensor_id,
                fill_level: Some(fill_level),
            },
            None => Frame::Delimited {
                sensor_id: text,
                fill_level: None,
            },
        })
    }

    pub fn into_reading(self) -> Result<Reading, DecodeError> {
        let reading = match self {
            Frame::Structured(reading) => reading,
            Frame::Delimited {
                sensor_id,
                fill_level,
            } => Reading::new(sensor_id, parse_fill_level(fill_level)),
        };
        if reading.sensor_id.is_empty() {
            return Err(DecodeError::EmptySensorId);
        }
        Ok(reading)
    }
}

pub(crate) fn decode(payload: &[u8]) -> Result<Reading, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    Frame::parse(text)?.into_reading()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_structured_payload() {
        let reading = decode(br#"{"id":"CCBLX0001","nivelLixo":42}"#).unwrap();
        assert_eq!(reading, Reading::new("CCBLX0001", 42.0));
    }

    #[test]
    fn structured_payload_ignores_extra_fields() {
        let reading = decode(br#" {"nivelLixo": 12.5, "id": "A", "rssi": -70}"#).unwrap();
        assert_eq!(reading, Reading::new("A", 12.5));
    }

    #[test]
    fn decodes_delimited_payload() {
        assert_eq!(
            decode(b"CCBLX0002:7").unwrap(),
            Reading::new("CCBLX0002", 7.0)
        );
        assert_eq!(
            decode(b"CCBLX0002:63.5\n").unwrap(),
            Reading::new("CCBLX0002", 63.5)
        );
    }

    #[test]
    fn delimited_payload_splits_on_first_colon() {
        let reading = decode(b"bin:1:2").unwrap();
        assert_eq!(reading.sensor_id, "bin");
        assert!(reading.fill_level.is_nan());
    }

    #[test]
    fn non_numeric_fill_level_becomes_nan() {
        let reading = decode(b"CCBLX0001:abc").unwrap();
        assert_eq!(reading.sensor_id, "CCBLX0001");
        assert!(reading.fill_level.is_nan());
    }

    #[test]
    fn malformed_structured_payload_is_rejected() {
        assert!(matches!(
            decode(br#"{"id":"CCBLX0001","nivelLixo":}"#),
            Err(DecodeError::Structured(_))
        ));
        assert!(matches!(
            decode(br#"{"id":"CCBLX0001"}"#),
            Err(DecodeError::Structured(_))
        ));
        assert!(matches!(
            decode(br#"{"id":7,"nivelLixo":1}"#),
            Err(DecodeError::Structured(_))
        ));
    }

    #[test]
    fn payload_without_delimiter_is_a_bare_sensor_id() {
        let reading = decode(b"CCBLX0001").unwrap();
        assert_eq!(reading.sensor_id, "CCBLX0001");
        assert!(reading.fill_level.is_nan());
    }

    #[test]
    fn blank_fill_level_is_zero() {
        assert_eq!(decode(b"CCBLX0001:").unwrap(), Reading::new("CCBLX0001", 0.0));
        assert_eq!(
            decode(b"CCBLX0001: \n").unwrap(),
            Reading::new("CCBLX0001", 0.0)
        );
    }

    #[test]
    fn json_array_is_not_a_structured_reading() {
        let reading = decode(br#"["CCBLX0009", 5]"#).unwrap();
        assert_eq!(reading.sensor_id, r#"["CCBLX0009", 5]"#);
        assert!(reading.fill_level.is_nan());

        let reading = decode(br#"["CCBLX0009": 5]"#).unwrap();
        assert_eq!(reading.sensor_id, r#"["CCBLX0009""#);
        assert!(reading.fill_level.is_nan());
    }

    #[test]
    fn empty_sensor_id_is_rejected() {
        assert!(matches!(decode(b":5"), Err(DecodeError::EmptySensorId)));
        assert!(matches!(
            decode(br#"{"id":"","nivelLixo":5}"#),
            Err(DecodeError::EmptySensorId)
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert!(matches!(
            decode(&[0xff, 0xfe, b':', b'1']),
            Err(DecodeError::Utf8(_))
        ));
    }

    #[test]
    fn nan_fill_level_serializes_as_null() {
        let json = serde_json::to_string(&Reading::new("X", f64::NAN)).unwrap();
        assert_eq!(json, r#"{"id":"X","nivelLixo":null}"#);
    }
}
