//! Wire message types
//!
//! Inbound broker payloads, client commands and outbound server messages.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Blood pressure as it appears on the wire: either a bare number or a
/// composite "systolic/diastolic" string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BloodPressureField {
    Value(f64),
    Composite(String),
}

/// A blood-pressure sample with possibly partial detection.
///
/// A component the acquisition device did not detect is stored as a `0.0`
/// placeholder; averaging skips non-positive components.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BpSample {
    pub systolic: f64,
    pub diastolic: f64,
}

impl BloodPressureField {
    /// Convert the wire field into a sample.
    ///
    /// A bare number is taken as a systolic-only partial detection. A
    /// malformed composite string yields `None` and is dropped silently.
    pub fn sample(&self) -> Option<BpSample> {
        match self {
            BloodPressureField::Value(v) => Some(BpSample {
                systolic: *v,
                diastolic: 0.0,
            }),
            BloodPressureField::Composite(s) => {
                let (sys, dia) = parse_composite(s)?;
                Some(BpSample {
                    systolic: sys,
                    diastolic: dia,
                })
            }
        }
    }

    /// Parse the composite components, if this field carries any.
    pub fn components(&self) -> Option<(f64, f64)> {
        match self {
            BloodPressureField::Value(_) => None,
            BloodPressureField::Composite(s) => parse_composite(s),
        }
    }
}

fn parse_composite(s: &str) -> Option<(f64, f64)> {
    let (sys, dia) = s.split_once('/')?;
    let sys: f64 = sys.trim().parse().ok()?;
    let dia: f64 = dia.trim().parse().ok()?;
    Some((sys, dia))
}

/// Normalized sensor message consumed from the broker topics.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorMessage {
    pub patient_id: i64,
    #[serde(default)]
    pub doctor_id: Option<i64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub blood_pressure: Option<BloodPressureField>,
    #[serde(default)]
    pub oxygen_saturation: Option<f64>,
    #[serde(default)]
    pub heart_rate: Option<f64>,
}

/// Messages a connected client may send after the socket opens.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Command(ClientCommand),
    Identify { user_id: String, rol: String },
}

/// Commands toggling measurement state or observer registration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    Start {
        patient_id: i64,
        #[serde(default)]
        doctor_id: Option<i64>,
    },
    Stop {
        patient_id: i64,
        #[serde(default)]
        doctor_id: Option<i64>,
    },
    DoctorConfig {
        doctor_id: i64,
        patient_id: i64,
    },
}

/// `user_config` routing-key payload informing the acquisition device which
/// patient/doctor pairing is currently active.
#[derive(Debug, Clone, Serialize)]
pub struct UserConfig {
    pub patient_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doctor_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitored_patient_id: Option<i64>,
    pub action: String,
    pub timestamp: i64,
}

impl UserConfig {
    pub fn new(patient_id: i64, doctor_id: Option<i64>, action: &str) -> Self {
        Self {
            patient_id,
            doctor_id,
            monitored_patient_id: None,
            action: action.to_string(),
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn with_monitored(mut self, monitored_patient_id: i64) -> Self {
        self.monitored_patient_id = Some(monitored_patient_id);
        self
    }
}

/// Entry placed on the outbound dispatch queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Delivered to every open connection.
    Broadcast { payload: String },
    /// Delivered only to the listed user ids.
    Targeted {
        payload: String,
        targets: Vec<String>,
    },
}

/// Builders for the JSON messages the server pushes to clients.
pub mod server_msg {
    use super::*;

    /// Raw sensor echo broadcast to every connection.
    pub fn echo(topic: &str, data: &Value) -> String {
        json!({ "topic": topic, "data": data }).to_string()
    }

    /// Targeted risk alert.
    pub fn alerta(patient_id: i64, doctor_id: Option<i64>, alertas: &[String]) -> String {
        json!({
            "type": "alerta",
            "patient_id": patient_id,
            "doctor_id": doctor_id,
            "alertas": alertas,
        })
        .to_string()
    }

    /// Informational ack.
    pub fn info(message: &str) -> String {
        json!({ "type": "info", "message": message }).to_string()
    }

    /// Record-created notice targeted at patient and doctor, with the
    /// diagnostic risk flags derived from the averaged vitals.
    #[allow(clippy::too_many_arguments)]
    pub fn medical_record_created(
        patient_id: i64,
        doctor_id: Option<i64>,
        record_id: i64,
        timestamp: i64,
        temperature: f64,
        blood_pressure: &str,
        oxygen_saturation: f64,
        heart_rate: f64,
        risk: &crate::monitor::risk::RiskFlags,
    ) -> String {
        json!({
            "type": "medical_record_created",
            "patient_id": patient_id,
            "doctor_id": doctor_id,
            "record_id": record_id,
            "timestamp": timestamp,
            "data": {
                "temperature": temperature,
                "blood_pressure": blood_pressure,
                "oxygen_saturation": oxygen_saturation,
                "heart_rate": heart_rate,
            },
            "risk": risk,
            "message": "Expediente médico generado automáticamente",
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_composite_blood_pressure() {
        let field = BloodPressureField::Composite("120/80".to_string());
        assert_eq!(field.components(), Some((120.0, 80.0)));
        let sample = field.sample().unwrap();
        assert_eq!(sample.systolic, 120.0);
        assert_eq!(sample.diastolic, 80.0);
    }

    #[test]
    fn malformed_composite_is_dropped() {
        let field = BloodPressureField::Composite("abc".to_string());
        assert!(field.components().is_none());
        assert!(field.sample().is_none());
    }

    #[test]
    fn bare_value_is_partial_systolic() {
        let field = BloodPressureField::Value(118.0);
        let sample = field.sample().unwrap();
        assert_eq!(sample.systolic, 118.0);
        assert_eq!(sample.diastolic, 0.0);
    }

    #[test]
    fn deserializes_sensor_message() {
        let msg: SensorMessage = serde_json::from_str(
            r#"{"patient_id": 8, "doctor_id": 2, "temperature": 36.7, "blood_pressure": "118/76"}"#,
        )
        .unwrap();
        assert_eq!(msg.patient_id, 8);
        assert_eq!(msg.doctor_id, Some(2));
        assert_eq!(msg.temperature, Some(36.7));
        assert!(msg.heart_rate.is_none());
    }

    #[test]
    fn missing_patient_id_is_an_error() {
        let result = serde_json::from_str::<SensorMessage>(r#"{"temperature": 36.7}"#);
        assert!(result.is_err());
    }

    #[test]
    fn deserializes_client_messages() {
        let ident: ClientMessage =
            serde_json::from_str(r#"{"user_id": "5", "rol": "patient"}"#).unwrap();
        assert!(matches!(ident, ClientMessage::Identify { .. }));

        let start: ClientMessage =
            serde_json::from_str(r#"{"action": "start", "patient_id": 8, "doctor_id": 2}"#)
                .unwrap();
        match start {
            ClientMessage::Command(ClientCommand::Start {
                patient_id,
                doctor_id,
            }) => {
                assert_eq!(patient_id, 8);
                assert_eq!(doctor_id, Some(2));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let config: ClientMessage =
            serde_json::from_str(r#"{"action": "doctor_config", "doctor_id": 2, "patient_id": 8}"#)
                .unwrap();
        assert!(matches!(
            config,
            ClientMessage::Command(ClientCommand::DoctorConfig { .. })
        ));
    }

    #[test]
    fn user_config_serializes_without_empty_fields() {
        let cfg = UserConfig::new(8, None, "start");
        let value = serde_json::to_value(&cfg).unwrap();
        assert_eq!(value["patient_id"], 8);
        assert_eq!(value["action"], "start");
        assert!(value.get("doctor_id").is_none());
        assert!(value.get("monitored_patient_id").is_none());
    }
}
