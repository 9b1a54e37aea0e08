//! Storage module
//!
//! SQLite-backed medical record store. The pipeline only writes two tables:
//! aggregated records and, optionally, raw sensor history.

use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::DatabaseConfig;

/// Aggregated record ready to be persisted, one per patient per tick.
#[derive(Debug, Clone)]
pub struct NewMedicalRecord {
    pub patient_id: i64,
    pub doctor_id: Option<i64>,
    pub temperature: f64,
    pub blood_pressure: String,
    pub oxygen_saturation: f64,
    pub heart_rate: f64,
    pub diagnosis: String,
    pub treatment: String,
    pub notes: String,
}

/// Raw sensor sample kept as historical telemetry.
#[derive(Debug, Clone)]
pub struct RawSample {
    pub patient_id: i64,
    pub doctor_id: Option<i64>,
    pub temperature: Option<f64>,
    pub blood_pressure: Option<String>,
    pub oxygen_saturation: Option<f64>,
    pub heart_rate: Option<f64>,
}

/// Persisted medical record row.
#[derive(Debug, sqlx::FromRow)]
pub struct MedicalRecord {
    pub id: i64,
    pub patient_id: i64,
    pub doctor_id: Option<i64>,
    pub temperature: f64,
    pub blood_pressure: String,
    pub oxygen_saturation: f64,
    pub heart_rate: f64,
    pub diagnosis: Option<String>,
    pub treatment: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// External medical record store interface.
///
/// Failures are ordinary errors; callers must be able to catch them without
/// the tick or the ingestion path dying.
#[async_trait]
pub trait MedicalRecordStore: Send + Sync {
    /// Persist one aggregated record, returning its id.
    async fn create_record(&self, record: &NewMedicalRecord) -> Result<i64>;

    /// Append one raw sample to the telemetry history.
    async fn record_raw_sample(&self, sample: &RawSample) -> Result<()>;
}

/// SQLite implementation of the record store.
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (creating if missing) the database and run migrations.
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        tracing::info!(database_url = %config.url, "initializing storage layer");

        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout))
            .connect_with(options)
            .await
            .map_err(|e| anyhow::anyhow!("cannot connect to database: {e}"))?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("storage layer ready");
        Ok(Self { pool })
    }

    /// Fetch one record by id.
    pub async fn get_record(&self, id: i64) -> Result<Option<MedicalRecord>> {
        let query = "SELECT * FROM medical_record WHERE id = ?1";

        let record = sqlx::query_as::<_, MedicalRecord>(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// All records for one patient, newest first.
    pub async fn records_for_patient(&self, patient_id: i64) -> Result<Vec<MedicalRecord>> {
        let query = "SELECT * FROM medical_record WHERE patient_id = ?1 ORDER BY created_at DESC";

        let records = sqlx::query_as::<_, MedicalRecord>(query)
            .bind(patient_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Connection pool for advanced queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MedicalRecordStore for Storage {
    async fn create_record(&self, record: &NewMedicalRecord) -> Result<i64> {
        let query = r#"
            INSERT INTO medical_record (
                patient_id, doctor_id, temperature, blood_pressure,
                oxygen_saturation, heart_rate, diagnosis, treatment, notes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#;

        let result = sqlx::query(query)
            .bind(record.patient_id)
            .bind(record.doctor_id)
            .bind(record.temperature)
            .bind(&record.blood_pressure)
            .bind(record.oxygen_saturation)
            .bind(record.heart_rate)
            .bind(&record.diagnosis)
            .bind(&record.treatment)
            .bind(&record.notes)
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    async fn record_raw_sample(&self, sample: &RawSample) -> Result<()> {
        let query = r#"
            INSERT INTO record_sensor_data (
                patient_id, doctor_id, temperature, blood_pressure,
                oxygen_saturation, heart_rate
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#;

        sqlx::query(query)
            .bind(sample.patient_id)
            .bind(sample.doctor_id)
            .bind(sample.temperature)
            .bind(&sample.blood_pressure)
            .bind(sample.oxygen_saturation)
            .bind(sample.heart_rate)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_test_db() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let config = DatabaseConfig {
            url: format!("sqlite:{}", db_path.display()),
            ..Default::default()
        };

        let storage = Storage::new(&config).await.unwrap();
        (storage, temp_dir)
    }

    fn sample_record() -> NewMedicalRecord {
        NewMedicalRecord {
            patient_id: 8,
            doctor_id: Some(2),
            temperature: 36.5,
            blood_pressure: "118/76".to_string(),
            oxygen_saturation: 97.0,
            heart_rate: 72.0,
            diagnosis: "Automático por sensores".to_string(),
            treatment: String::new(),
            notes: "Registro generado automáticamente por promedio de sensores".to_string(),
        }
    }

    #[tokio::test]
    async fn create_and_fetch_record() {
        let (storage, _temp_dir) = setup_test_db().await;

        let id = storage.create_record(&sample_record()).await.unwrap();
        assert!(id > 0);

        let record = storage.get_record(id).await.unwrap().unwrap();
        assert_eq!(record.patient_id, 8);
        assert_eq!(record.doctor_id, Some(2));
        assert_eq!(record.blood_pressure, "118/76");
        assert_eq!(record.diagnosis.as_deref(), Some("Automático por sensores"));
    }

    #[tokio::test]
    async fn records_for_patient_filters_by_id() {
        let (storage, _temp_dir) = setup_test_db().await;

        storage.create_record(&sample_record()).await.unwrap();
        let mut other = sample_record();
        other.patient_id = 9;
        storage.create_record(&other).await.unwrap();

        let records = storage.records_for_patient(8).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].patient_id, 8);
    }

    #[tokio::test]
    async fn pool_respects_configured_connection_limit() {
        let temp_dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite:{}", temp_dir.path().join("test.db").display()),
            max_connections: 1,
            connect_timeout: 1,
        };
        let storage = Storage::new(&config).await.unwrap();

        let _held = storage.pool().acquire().await.unwrap();
        // The single connection is held, so a second acquire must time out
        // after the configured second instead of succeeding.
        let second = storage.pool().acquire().await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn raw_sample_round_trip() {
        let (storage, _temp_dir) = setup_test_db().await;

        let sample = RawSample {
            patient_id: 8,
            doctor_id: None,
            temperature: Some(36.7),
            blood_pressure: Some("120/80".to_string()),
            oxygen_saturation: None,
            heart_rate: Some(70.0),
        };
        storage.record_raw_sample(&sample).await.unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM record_sensor_data WHERE patient_id = 8")
                .fetch_one(storage.pool())
                .await
                .unwrap();
        assert_eq!(count, 1);
    }
}
