//! Vitalink - patient vital-sign streaming monitor
//!
//! Consumes sensor readings from an MQTT broker, evaluates them against
//! clinical risk thresholds, buffers them per patient and periodically
//! persists averaged medical records, pushing live updates to WebSocket
//! clients.

pub mod config;
pub mod monitor;
pub mod storage;

pub use anyhow::Result;
