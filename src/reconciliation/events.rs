use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const WORKER_CONNECTED: &str = "worker-connected";
pub const WORKER_DISCONNECTED: &str = "worker-disconnected";
pub const ORCHESTRATOR_RESET: &str = "orchestrator-reset";
pub const JOB_RECEIVED: &str = "job-received";
pub const JOB_PROCESSED: &str = "job-processed";

/// Event as delivered by a data source, before any interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(alias = "ID")]
    pub id: i64,
    /// Envelope, either as a JSON object or as a JSON-encoded string.
    #[serde(alias = "Payload")]
    pub payload: Value,
    #[serde(alias = "DT")]
    pub timestamp: DateTime<Utc>,
}

/// `{event_type, payload}` wrapper carried inside every raw event
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    #[serde(alias = "EventType")]
    pub event_type: String,
    #[serde(default, alias = "Payload")]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConnected {
    pub eth_address: String,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub connection: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDisconnected {
    pub eth_address: String,
    #[serde(default)]
    pub node_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReceived {
    pub eth_address: String,
    #[serde(default)]
    pub node_type: String,
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(default, rename = "modelID")]
    pub model_id: String,
    #[serde(default)]
    pub pipeline: String,
    #[serde(default, rename = "taskID")]
    pub task_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProcessed {
    /// Gross fee in wei.
    pub fees: i64,
    #[serde(default)]
    pub node_type: String,
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(default)]
    pub eth_address: String,
    #[serde(default)]
    pub compute_units: i64,
    #[serde(default)]
    pub price_per_compute_unit: i64,
    #[serde(default)]
    pub response_time: i64,
    #[serde(default)]
    pub pipeline: String,
    #[serde(default, rename = "modelID")]
    pub model_id: String,
}

/// Decoded pool event
#[derive(Debug, Clone)]
pub enum PoolEvent {
    WorkerConnected(WorkerConnected),
    WorkerDisconnected(WorkerDisconnected),
    OrchestratorReset,
    JobReceived(JobReceived),
    JobProcessed(JobProcessed),
    Unknown(String),
}

impl PoolEvent {
    /// Decode the typed payload for a known event type.
    pub fn from_envelope(envelope: EventEnvelope) -> Result<Self, serde_json::Error> {
        let payload = unwrap_json(envelope.payload)?;
        let event = match envelope.event_type.as_str() {
            WORKER_CONNECTED => PoolEvent::WorkerConnected(serde_json::from_value(payload)?),
            WORKER_DISCONNECTED => PoolEvent::WorkerDisconnected(serde_json::from_value(payload)?),
            ORCHESTRATOR_RESET => PoolEvent::OrchestratorReset,
            JOB_RECEIVED => PoolEvent::JobReceived(serde_json::from_value(payload)?),
            JOB_PROCESSED => PoolEvent::JobProcessed(serde_json::from_value(payload)?),
            other => PoolEvent::Unknown(other.to_string()),
        };
        Ok(event)
    }
}

impl RawEvent {
    /// Parse the `{event_type, payload}` envelope.
    pub fn envelope(&self) -> Result<EventEnvelope, serde_json::Error> {
        serde_json::from_value(unwrap_json(self.payload.clone())?)
    }
}

/// Sources double-encode JSON as strings; peel one layer if present.
fn unwrap_json(value: Value) -> Result<Value, serde_json::Error> {
    match value {
        Value::String(encoded) => serde_json::from_str(&encoded),
        other => Ok(other),
    }
}
