//! Clinical risk evaluation
//!
//! Stateless threshold checks over a single reading or a persisted record.
//! Alert strings use the Spanish vocabulary the connected clients expect.

use serde::Serialize;

use super::message::SensorMessage;

/// Temperature below this is hypothermia.
pub const HYPOTHERMIA_MAX: f64 = 35.0;
/// Low-grade fever starts here.
pub const LOW_FEVER_MIN: f64 = 37.5;
/// Fever proper starts here.
pub const FEVER_MIN: f64 = 38.0;
/// Hyperthermia starts here.
pub const HYPERTHERMIA_MIN: f64 = 39.0;
/// Systolic / diastolic floors for hypotension.
pub const HYPOTENSION_SYS: f64 = 90.0;
pub const HYPOTENSION_DIA: f64 = 60.0;
/// Systolic / diastolic ceilings for hypertension.
pub const HYPERTENSION_SYS: f64 = 140.0;
pub const HYPERTENSION_DIA: f64 = 90.0;
/// Oxygen saturation bounds.
pub const SEVERE_HYPOXEMIA_MAX: f64 = 90.0;
pub const MILD_HYPOXEMIA_MAX: f64 = 93.0;
/// Heart rate below this is bradycardia.
pub const BRADYCARDIA_MAX: f64 = 50.0;

/// Normal heart-rate range for a patient of the given age, beats per minute.
///
/// Pediatric ranges are not differentiated yet; every age maps to the adult
/// 60-100 band.
pub fn heart_rate_range(_age: Option<u32>) -> (f64, f64) {
    (60.0, 100.0)
}

/// Evaluate a single reading against the alert thresholds.
///
/// Deterministic, no I/O. Zero or missing vitals never trigger an alert and
/// malformed blood-pressure composites are ignored silently.
pub fn evaluate(msg: &SensorMessage, age: Option<u32>) -> Vec<String> {
    let mut alerts = Vec::new();

    if let Some(t) = msg.temperature {
        if t != 0.0 {
            if t < HYPOTHERMIA_MAX {
                alerts.push("Hipotermia".to_string());
            } else if t >= HYPERTHERMIA_MIN {
                alerts.push("Hipertermia".to_string());
            } else if t >= FEVER_MIN {
                alerts.push("Fiebre".to_string());
            } else if t >= LOW_FEVER_MIN {
                alerts.push("Febrícula".to_string());
            }
        }
    }

    if let Some((sys, dia)) = msg.blood_pressure.as_ref().and_then(|f| f.components()) {
        // A zero component means the device did not detect it; only the
        // detected components are judged.
        if (sys != 0.0 && sys < HYPOTENSION_SYS) || (dia != 0.0 && dia < HYPOTENSION_DIA) {
            alerts.push("Hipotensión".to_string());
        }
        if (sys != 0.0 && sys > HYPERTENSION_SYS) || (dia != 0.0 && dia > HYPERTENSION_DIA) {
            alerts.push("Hipertensión".to_string());
        }
    }

    if let Some(o) = msg.oxygen_saturation {
        if o != 0.0 {
            if o < SEVERE_HYPOXEMIA_MAX {
                alerts.push("Hipoxemia severa".to_string());
            } else if o <= MILD_HYPOXEMIA_MAX {
                alerts.push("Hipoxemia leve".to_string());
            }
        }
    }

    if let Some(h) = msg.heart_rate {
        if h != 0.0 {
            let (_, tachy_min) = heart_rate_range(age);
            if h < BRADYCARDIA_MAX {
                alerts.push("Bradicardia".to_string());
            } else if h > tachy_min {
                alerts.push("Taquicardia".to_string());
            }
        }
    }

    alerts
}

/// Six independent risk flags derived from one persisted record, for
/// diagnostic display. Coarser variants of the alert thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RiskFlags {
    pub hipotermia: bool,
    pub fiebre: bool,
    pub arritmia: bool,
    pub hipoxemia: bool,
    pub hipertension: bool,
    pub hipotension: bool,
}

impl RiskFlags {
    /// Derive flags from a record's averaged vitals.
    ///
    /// `blood_pressure` is the composite "sys/dia" string stored on the
    /// record; the systolic component drives both pressure flags.
    pub fn from_record(
        temperature: f64,
        blood_pressure: &str,
        oxygen_saturation: f64,
        heart_rate: f64,
        age: Option<u32>,
    ) -> Self {
        let systolic = blood_pressure
            .split_once('/')
            .and_then(|(sys, _)| sys.trim().parse::<f64>().ok())
            .unwrap_or(0.0);
        let (hr_min, hr_max) = heart_rate_range(age);

        Self {
            hipotermia: temperature != 0.0 && temperature < HYPOTHERMIA_MAX,
            fiebre: temperature != 0.0 && temperature > LOW_FEVER_MIN,
            arritmia: heart_rate != 0.0 && (heart_rate < hr_min || heart_rate > hr_max),
            hipoxemia: oxygen_saturation != 0.0 && oxygen_saturation < SEVERE_HYPOXEMIA_MAX,
            hipertension: systolic != 0.0 && systolic > HYPERTENSION_SYS,
            hipotension: systolic != 0.0 && systolic < HYPOTENSION_SYS,
        }
    }
}
