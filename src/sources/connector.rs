use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::DataSource;
use crate::error::SourceError;
use crate::reconciliation::RawEvent;

/// Supplies raw events for configured data sources.
#[async_trait]
pub trait DataSourceConnector: Send + Sync {
    /// Configured sources, one poll task each
    fn sources(&self) -> &[DataSource];

    /// Events strictly after `since`, in source order
    async fn fetch(
        &self,
        source: &DataSource,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>, SourceError>;
}

/// Polls `GET {endpoint}?lastCheckTime=...` and expects a JSON array of events
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    sources: Vec<DataSource>,
}

impl HttpConnector {
    pub fn new(sources: Vec<DataSource>, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, sources })
    }

    /// Endpoint with the window start appended as `lastCheckTime`.
    pub fn request_url(endpoint: &str, since: DateTime<Utc>) -> Result<Url, SourceError> {
        let mut url = Url::parse(endpoint).map_err(|e| SourceError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;
        url.query_pairs_mut().append_pair(
            "lastCheckTime",
            &since.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        Ok(url)
    }
}

/// Decode each array element on its own so one bad item does not sink the batch.
pub fn decode_events(body: Value) -> Result<Vec<RawEvent>, SourceError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(SourceError::Decode(format!(
                "expected a JSON array of events, got {}",
                json_kind(&other)
            )))
        }
    };

    let mut events = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<RawEvent>(item) {
            Ok(event) => events.push(event),
            Err(e) => warn!("Dropping undecodable event: {}", e),
        }
    }
    Ok(events)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl DataSourceConnector for HttpConnector {
    fn sources(&self) -> &[DataSource] {
        &self.sources
    }

    #[instrument(skip(self, source), fields(endpoint = %source.endpoint))]
    async fn fetch(
        &self,
        source: &DataSource,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>, SourceError> {
        let url = Self::request_url(&source.endpoint, since)?;
        let response = self.client.get(url).send().await?;

        if response.status() != StatusCode::OK {
            return Err(SourceError::HttpStatus {
                endpoint: source.endpoint.clone(),
                status: response.status().as_u16(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        let events = decode_events(body)?;

        debug!("Fetched {} events since {}", events.len(), since);
        Ok(events)
    }
}
