//! Per-patient measurement buffer
//!
//! Accumulates raw sensor samples for the current aggregation window, gated
//! by an explicit per-patient measurement flag.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

use super::message::{BpSample, SensorMessage};

/// Samples accumulated for one patient during the current window.
#[derive(Debug, Clone, Default)]
pub struct PatientBuffer {
    pub patient_id: i64,
    pub doctor_id: Option<i64>,
    pub temperature: Vec<f64>,
    pub blood_pressure: Vec<BpSample>,
    pub oxygen_saturation: Vec<f64>,
    pub heart_rate: Vec<f64>,
}

impl PatientBuffer {
    /// True when no vital holds a sample.
    pub fn is_empty(&self) -> bool {
        self.temperature.is_empty()
            && self.blood_pressure.is_empty()
            && self.oxygen_saturation.is_empty()
            && self.heart_rate.is_empty()
    }
}

/// Outcome of an attempted sample recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Sample appended to the patient's buffer.
    Buffered,
    /// Measurement inactive for this patient; buffer untouched.
    Inactive,
}

/// Concurrent store of per-patient sample buffers and measurement flags.
///
/// All buffer mutations go through one lock, so samples are never lost or
/// duplicated between ingestion workers and the aggregation drain.
#[derive(Default)]
pub struct MeasurementBuffer {
    buffers: Mutex<HashMap<i64, PatientBuffer>>,
    active: RwLock<HashMap<i64, bool>>,
}

impl MeasurementBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle the measurement flag for a patient.
    pub fn set_active(&self, patient_id: i64, active: bool) {
        self.active.write().insert(patient_id, active);
    }

    /// Whether samples for this patient are currently buffered.
    /// An absent flag counts as inactive.
    pub fn is_active(&self, patient_id: i64) -> bool {
        self.active.read().get(&patient_id).copied().unwrap_or(false)
    }

    /// Append the vitals carried by `msg` to the patient's buffer.
    ///
    /// Zero or missing vitals are skipped; blood pressure is the exception
    /// and keeps placeholder-zero components, since partial detection is
    /// expected. No-op when measurement is inactive for the patient.
    pub fn record_sample(&self, msg: &SensorMessage) -> RecordOutcome {
        if !self.is_active(msg.patient_id) {
            return RecordOutcome::Inactive;
        }

        let mut buffers = self.buffers.lock();
        let buf = buffers.entry(msg.patient_id).or_default();
        buf.patient_id = msg.patient_id;
        if msg.doctor_id.is_some() {
            buf.doctor_id = msg.doctor_id;
        }

        if let Some(t) = msg.temperature {
            if t != 0.0 {
                buf.temperature.push(t);
            }
        }
        if let Some(bp) = msg.blood_pressure.as_ref().and_then(|f| f.sample()) {
            buf.blood_pressure.push(bp);
        }
        if let Some(o) = msg.oxygen_saturation {
            if o != 0.0 {
                buf.oxygen_saturation.push(o);
            }
        }
        if let Some(h) = msg.heart_rate {
            if h != 0.0 {
                buf.heart_rate.push(h);
            }
        }

        RecordOutcome::Buffered
    }

    /// Snapshot of all non-empty buffers, atomically reset to empty.
    ///
    /// The patient/doctor id pairing survives the reset so the next window
    /// keeps its attribution even before a new sample arrives.
    pub fn drain_all(&self) -> Vec<PatientBuffer> {
        let mut buffers = self.buffers.lock();
        let mut drained = Vec::new();
        for buf in buffers.values_mut() {
            if buf.is_empty() {
                continue;
            }
            let (patient_id, doctor_id) = (buf.patient_id, buf.doctor_id);
            let snapshot = std::mem::replace(
                buf,
                PatientBuffer {
                    patient_id,
                    doctor_id,
                    ..PatientBuffer::default()
                },
            );
            drained.push(snapshot);
        }
        drained
    }

    /// Number of patients with a buffer entry, for diagnostics.
    pub fn patient_count(&self) -> usize {
        self.buffers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(patient_id: i64, temperature: Option<f64>) -> SensorMessage {
        SensorMessage {
            patient_id,
            doctor_id: Some(2),
            temperature,
            blood_pressure: None,
            oxygen_saturation: None,
            heart_rate: None,
        }
    }

    #[test]
    fn inactive_patient_is_a_noop() {
        let buffer = MeasurementBuffer::new();
        assert_eq!(buffer.record_sample(&msg(8, Some(36.5))), RecordOutcome::Inactive);
        assert!(buffer.drain_all().is_empty());

        buffer.set_active(8, false);
        assert_eq!(buffer.record_sample(&msg(8, Some(36.5))), RecordOutcome::Inactive);
        assert!(buffer.drain_all().is_empty());
    }

    #[test]
    fn zero_temperature_is_skipped() {
        let buffer = MeasurementBuffer::new();
        buffer.set_active(8, true);
        buffer.record_sample(&msg(8, Some(0.0)));
        assert!(buffer.drain_all().is_empty());
    }

    #[test]
    fn drain_resets_but_keeps_attribution() {
        let buffer = MeasurementBuffer::new();
        buffer.set_active(8, true);
        buffer.record_sample(&msg(8, Some(36.0)));
        buffer.record_sample(&msg(8, Some(37.0)));

        let drained = buffer.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].temperature, vec![36.0, 37.0]);
        assert_eq!(drained[0].doctor_id, Some(2));

        // Buffer is empty immediately after the drain.
        assert!(buffer.drain_all().is_empty());

        // Attribution survives the reset.
        buffer.record_sample(&msg(8, Some(38.0)));
        let again = buffer.drain_all();
        assert_eq!(again[0].doctor_id, Some(2));
    }

    #[test]
    fn partial_blood_pressure_is_kept() {
        let buffer = MeasurementBuffer::new();
        buffer.set_active(8, true);
        let m = SensorMessage {
            patient_id: 8,
            doctor_id: None,
            temperature: None,
            blood_pressure: Some(super::super::message::BloodPressureField::Composite(
                "120/0".to_string(),
            )),
            oxygen_saturation: None,
            heart_rate: None,
        };
        buffer.record_sample(&m);
        let drained = buffer.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].blood_pressure[0].systolic, 120.0);
        assert_eq!(drained[0].blood_pressure[0].diastolic, 0.0);
    }

    #[test]
    fn heart_rate_only_buffer_still_drains() {
        let buffer = MeasurementBuffer::new();
        buffer.set_active(9, true);
        let m = SensorMessage {
            patient_id: 9,
            doctor_id: None,
            temperature: None,
            blood_pressure: None,
            oxygen_saturation: None,
            heart_rate: Some(72.0),
        };
        buffer.record_sample(&m);
        let drained = buffer.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].heart_rate, vec![72.0]);
    }
}
