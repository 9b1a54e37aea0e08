//! Ingestion gateway
//!
//! Single typed handler for every broker topic. Runs on the broker worker
//! thread, so it only enqueues toward the connection side and never touches
//! a connection directly.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::buffer::{MeasurementBuffer, RecordOutcome};
use super::dispatcher::DispatcherHandle;
use super::message::{server_msg, BloodPressureField, Outbound, SensorMessage};
use super::registry::ClientRegistry;
use crate::storage::{MedicalRecordStore, RawSample};

/// Routes normalized sensor messages into the buffer, the risk evaluator
/// and the outbound dispatch queue.
pub struct IngestionGateway {
    buffer: Arc<MeasurementBuffer>,
    dispatcher: DispatcherHandle,
    registry: Arc<ClientRegistry>,
    /// Present when raw telemetry history is enabled.
    raw_tx: Option<mpsc::Sender<RawSample>>,
}

impl IngestionGateway {
    pub fn new(
        buffer: Arc<MeasurementBuffer>,
        dispatcher: DispatcherHandle,
        registry: Arc<ClientRegistry>,
        raw_tx: Option<mpsc::Sender<RawSample>>,
    ) -> Self {
        Self {
            buffer,
            dispatcher,
            registry,
            raw_tx,
        }
    }

    /// Handle one publish from any sensor topic.
    ///
    /// Malformed payloads are dropped with a warning; one bad message never
    /// affects the next one or the broker connection.
    pub fn handle_publish(&self, topic: &str, payload: &[u8]) {
        let raw: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(topic, error = %e, "dropping non-JSON sensor payload");
                return;
            }
        };
        let msg: SensorMessage = match serde_json::from_value(raw.clone()) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(topic, error = %e, "dropping malformed sensor message");
                return;
            }
        };

        // Observability feed: every connected client sees the raw reading.
        self.dispatcher.enqueue(Outbound::Broadcast {
            payload: server_msg::echo(topic, &raw),
        });

        let alerts = super::risk::evaluate(&msg, None);
        if !alerts.is_empty() {
            let payload = server_msg::alerta(msg.patient_id, msg.doctor_id, &alerts);
            self.dispatcher.enqueue(Outbound::Targeted {
                payload,
                targets: self.alert_targets(&msg),
            });
        }

        let outcome = self.buffer.record_sample(&msg);
        if outcome == RecordOutcome::Inactive {
            tracing::trace!(patient_id = msg.patient_id, "measurement inactive, sample not buffered");
        }

        // Raw history keeps every reading, buffered or not.
        if let Some(raw_tx) = &self.raw_tx {
            if let Err(e) = raw_tx.try_send(raw_sample(&msg)) {
                tracing::warn!(error = %e, "raw history queue full, sample dropped");
            }
        }
    }

    /// Patient, message doctor and any registered observers of the patient.
    fn alert_targets(&self, msg: &SensorMessage) -> Vec<String> {
        let mut targets = vec![msg.patient_id.to_string()];
        if let Some(doctor_id) = msg.doctor_id {
            targets.push(doctor_id.to_string());
        }
        for observer in self.registry.observers_of(msg.patient_id) {
            let id = observer.to_string();
            if !targets.contains(&id) {
                targets.push(id);
            }
        }
        targets
    }
}

fn raw_sample(msg: &SensorMessage) -> RawSample {
    RawSample {
        patient_id: msg.patient_id,
        doctor_id: msg.doctor_id,
        temperature: msg.temperature,
        blood_pressure: msg.blood_pressure.as_ref().map(|bp| match bp {
            BloodPressureField::Value(v) => v.to_string(),
            BloodPressureField::Composite(s) => s.clone(),
        }),
        oxygen_saturation: msg.oxygen_saturation,
        heart_rate: msg.heart_rate,
    }
}

/// Drains the raw-history channel into the store.
///
/// Runs as its own task so a slow database insert never backs up onto the
/// broker worker.
pub async fn raw_history_writer(
    store: Arc<dyn MedicalRecordStore>,
    mut rx: mpsc::Receiver<RawSample>,
) {
    while let Some(sample) = rx.recv().await {
        if let Err(e) = store.record_raw_sample(&sample).await {
            tracing::error!(patient_id = sample.patient_id, error = %e, "raw sample insert failed");
        }
    }
    tracing::info!("raw history writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::dispatcher::create_dispatcher;
    use tokio::time::{timeout, Duration};

    fn gateway() -> (
        IngestionGateway,
        Arc<MeasurementBuffer>,
        Arc<ClientRegistry>,
        super::super::dispatcher::DispatcherLoop,
    ) {
        let buffer = Arc::new(MeasurementBuffer::new());
        let registry = Arc::new(ClientRegistry::new());
        let (dispatcher, dispatch_loop) = create_dispatcher(registry.clone(), 16);
        let gw = IngestionGateway::new(buffer.clone(), dispatcher, registry.clone(), None);
        (gw, buffer, registry, dispatch_loop)
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_quietly() {
        let (gw, buffer, _registry, _dispatch_loop) = gateway();
        gw.handle_publish("temperatura", b"not json at all");
        gw.handle_publish("temperatura", br#"{"temperature": 36.5}"#); // no patient_id
        assert_eq!(buffer.patient_count(), 0);
    }

    #[tokio::test]
    async fn reading_is_echoed_alerted_and_buffered() {
        let (gw, buffer, registry, dispatch_loop) = gateway();
        buffer.set_active(8, true);

        let (observer_conn, mut observer_rx) = registry.add_connection();
        registry.register("42", observer_conn);
        let (patient_conn, mut patient_rx) = registry.add_connection();
        registry.register("8", patient_conn);

        let loop_handle = tokio::spawn(dispatch_loop.run());

        gw.handle_publish(
            "temperatura",
            br#"{"patient_id": 8, "doctor_id": 2, "temperature": 34.0}"#,
        );

        // Both connections get the broadcast echo.
        let echo: serde_json::Value = serde_json::from_str(
            &timeout(Duration::from_secs(1), observer_rx.recv())
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(echo["topic"], "temperatura");
        assert_eq!(echo["data"]["patient_id"], 8);

        // The patient additionally gets the targeted alert.
        let first = timeout(Duration::from_secs(1), patient_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(1), patient_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let alert = [first, second]
            .into_iter()
            .find(|m| m.contains("alerta"))
            .expect("targeted alert expected");
        assert!(alert.contains("Hipotermia"));

        // Sample landed in the buffer.
        let drained = buffer.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].temperature, vec![34.0]);

        loop_handle.abort();
    }

    #[tokio::test]
    async fn observers_receive_targeted_alerts() {
        let (gw, _buffer, registry, dispatch_loop) = gateway();
        registry.add_observer(8, 42);

        let (observer_conn, mut observer_rx) = registry.add_connection();
        registry.register("42", observer_conn);

        let loop_handle = tokio::spawn(dispatch_loop.run());

        gw.handle_publish("ritmo_cardiaco", br#"{"patient_id": 8, "heart_rate": 130.0}"#);

        // Echo first, then the alert targeted at the observer.
        let mut saw_alert = false;
        for _ in 0..2 {
            let msg = timeout(Duration::from_secs(1), observer_rx.recv())
                .await
                .unwrap()
                .unwrap();
            if msg.contains("Taquicardia") {
                saw_alert = true;
            }
        }
        assert!(saw_alert);

        loop_handle.abort();
    }

    #[tokio::test]
    async fn normal_reading_produces_no_alert() {
        let (gw, buffer, registry, dispatch_loop) = gateway();
        buffer.set_active(8, true);

        let (conn, mut rx) = registry.add_connection();
        registry.register("8", conn);

        let loop_handle = tokio::spawn(dispatch_loop.run());

        gw.handle_publish("temperatura", br#"{"patient_id": 8, "temperature": 36.6}"#);

        // Echo arrives, then nothing else.
        let echo = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(echo.contains("topic"));
        let nothing = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(nothing.is_err());

        loop_handle.abort();
    }
}
