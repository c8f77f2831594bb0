pub mod connector;
pub mod poller;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use connector::{DataSourceConnector, HttpConnector};
pub use poller::SourcePoller;

/// A configured event endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub endpoint: String,
    /// Node type assumed for events whose payload omits one
    pub node_type: String,
    /// Stable identifier derived from the endpoint, used as the ledger scope
    pub source_id: String,
}

impl DataSource {
    pub fn new(endpoint: &str, node_type: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            node_type: node_type.to_string(),
            source_id: source_id_for(endpoint),
        }
    }
}

/// Hex SHA-256 of the endpoint URL.
pub fn source_id_for(endpoint: &str) -> String {
    hex::encode(Sha256::digest(endpoint.as_bytes()))
}
