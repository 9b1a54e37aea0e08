//! Aggregation cycle
//!
//! Periodic task draining the measurement buffer, persisting one averaged
//! medical record per patient and notifying the interested clients.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Duration;

use super::buffer::{MeasurementBuffer, PatientBuffer};
use super::dispatcher::DispatcherHandle;
use super::message::{server_msg, BpSample, Outbound};
use super::risk::RiskFlags;
use crate::storage::{MedicalRecordStore, NewMedicalRecord};

/// Diagnosis text for auto-generated records.
const AUTO_DIAGNOSIS: &str = "Automático por sensores";
/// Notes text for auto-generated records.
const AUTO_NOTES: &str = "Registro generado automáticamente por promedio de sensores";

/// Timer-driven flush of the measurement buffer.
pub struct AggregationCycle {
    buffer: Arc<MeasurementBuffer>,
    store: Arc<dyn MedicalRecordStore>,
    dispatcher: DispatcherHandle,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

impl AggregationCycle {
    pub fn new(
        buffer: Arc<MeasurementBuffer>,
        store: Arc<dyn MedicalRecordStore>,
        dispatcher: DispatcherHandle,
        interval: Duration,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            buffer,
            store,
            dispatcher,
            interval,
            shutdown_rx,
        }
    }

    /// Run ticks until shutdown is signalled.
    pub async fn run(mut self) {
        tracing::info!(interval_secs = self.interval.as_secs(), "aggregation cycle running");
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick of a tokio interval fires immediately; skip it so
        // the first window actually spans a full interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
                _ = self.shutdown_rx.recv() => {
                    tracing::info!("aggregation cycle received shutdown signal");
                    // Ingestion has already stopped; persist whatever the
                    // last partial window accumulated.
                    self.flush_once().await;
                    break;
                }
            }
        }

        tracing::info!("aggregation cycle stopped");
    }

    /// One tick: drain every non-empty buffer, persist and notify.
    ///
    /// A persistence failure is logged and the tick moves on to the next
    /// patient; that window's data is lost for the failing patient only.
    pub async fn flush_once(&self) {
        let drained = self.buffer.drain_all();
        if drained.is_empty() {
            return;
        }
        tracing::debug!(patients = drained.len(), "aggregation tick");

        for buf in drained {
            let record = aggregate(&buf);
            match self.store.create_record(&record).await {
                Ok(record_id) => {
                    tracing::info!(
                        patient_id = record.patient_id,
                        record_id,
                        "medical record created"
                    );
                    self.notify_created(&record, record_id).await;
                }
                Err(e) => {
                    tracing::error!(
                        patient_id = record.patient_id,
                        error = %e,
                        "failed to persist medical record"
                    );
                }
            }
        }
    }

    /// Only reached after a successful commit; a failed persist must never
    /// produce a created notice.
    async fn notify_created(&self, record: &NewMedicalRecord, record_id: i64) {
        let risk = RiskFlags::from_record(
            record.temperature,
            &record.blood_pressure,
            record.oxygen_saturation,
            record.heart_rate,
            None,
        );
        let payload = server_msg::medical_record_created(
            record.patient_id,
            record.doctor_id,
            record_id,
            Utc::now().timestamp(),
            record.temperature,
            &record.blood_pressure,
            record.oxygen_saturation,
            record.heart_rate,
            &risk,
        );

        let mut targets = vec![record.patient_id.to_string()];
        if let Some(doctor_id) = record.doctor_id {
            targets.push(doctor_id.to_string());
        }

        if let Err(e) = self.dispatcher.send(Outbound::Targeted { payload, targets }).await {
            // Notifications are best effort; the record is already committed.
            tracing::warn!(error = %e, "record-created notification dropped");
        }
    }
}

/// Arithmetic mean, zero when no samples exist.
fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Component-wise blood-pressure mean over positive components.
///
/// Components may be structurally absent from a subset of samples, so
/// systolic and diastolic are averaged independently. A component with no
/// valid values averages to zero.
fn blood_pressure_average(samples: &[BpSample]) -> String {
    let systolic: Vec<f64> = samples
        .iter()
        .map(|s| s.systolic)
        .filter(|v| *v > 0.0)
        .collect();
    let diastolic: Vec<f64> = samples
        .iter()
        .map(|s| s.diastolic)
        .filter(|v| *v > 0.0)
        .collect();

    format!(
        "{}/{}",
        average(&systolic).round() as i64,
        average(&diastolic).round() as i64
    )
}

/// Collapse one patient's window into a persistable record.
fn aggregate(buf: &PatientBuffer) -> NewMedicalRecord {
    NewMedicalRecord {
        patient_id: buf.patient_id,
        doctor_id: buf.doctor_id,
        temperature: average(&buf.temperature),
        blood_pressure: blood_pressure_average(&buf.blood_pressure),
        oxygen_saturation: average(&buf.oxygen_saturation),
        heart_rate: average(&buf.heart_rate),
        diagnosis: AUTO_DIAGNOSIS.to_string(),
        treatment: String::new(),
        notes: AUTO_NOTES.to_string(),
    }
}
