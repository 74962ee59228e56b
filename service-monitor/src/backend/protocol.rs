//! Wire types for the local supervisor's HTTP API.

use serde::{Deserialize, Serialize};

/// Body of `POST /v1/services`.
#[derive(Debug, Serialize)]
pub struct ServicesRequest<'a> {
    pub action: &'a str,
    pub services: Vec<&'a str>,
}

/// Body of `POST /v1/signals`.
#[derive(Debug, Serialize)]
pub struct SignalsRequest<'a> {
    pub signal: &'a str,
    pub services: Vec<&'a str>,
}

/// Envelope every POST response comes back in. `kind` is `"sync"` when the
/// operation completed inline and `"async"` when a change must be polled to
/// completion.
#[derive(Debug, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub change: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

/// Response to `GET /v1/services?names=<name>`.
#[derive(Debug, Deserialize)]
pub struct ServicesStatusResponse {
    pub result: Vec<ServiceStatusEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceStatusEntry {
    pub name: String,
    pub current: String,
}

/// Response to `GET /v1/changes/{id}`.
#[derive(Debug, Deserialize)]
pub struct ChangeResponse {
    pub result: ChangeInfo,
}

#[derive(Debug, Deserialize)]
pub struct ChangeInfo {
    pub status: String,
    pub ready: bool,
    #[serde(default)]
    pub err: Option<String>,
}
