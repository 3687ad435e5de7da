//! HTTP API Definitions
//!
//! Endpoints and DTOs served by the coordinator's HTTP listener.

use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// Public search endpoint (GET or POST, `query` parameter).
pub const ENDPOINT_SEARCH: &str = "/search";
/// Diagnostic listing of connected nodes.
pub const ENDPOINT_NODES: &str = "/nodes";

// --- Data Transfer Objects ---

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub query: String,
}

/// `result` is 1 when a worker found the query, `node` is that worker's id ("0" otherwise).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub result: u8,
    pub node: String,
}

/// Diagnostic view of one connected worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub name: String,
    pub chunks: Vec<String>,
    pub memory: Vec<String>,
}
