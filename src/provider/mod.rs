//! KF-011: Provider service boundary.
//!
//! Resource, data and provider blocks reach outside the process only
//! through [`Provider`]. Payloads travel as JSON bytes; any response
//! carrying an `ERROR` diagnostic is a failed operation.

pub mod memory;

use crate::core::error::{Error, Result};
use crate::core::types::{Diagnostic, Value};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Resource families a provider serves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub read_data_sources: Vec<String>,
    #[serde(default)]
    pub list_data_sources: Vec<String>,
}

impl Capabilities {
    pub fn supports_resource(&self, resource_type: &str) -> bool {
        self.resources.iter().any(|r| r == resource_type)
    }

    pub fn supports_read(&self, resource_type: &str) -> bool {
        self.read_data_sources.iter().any(|r| r == resource_type)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigureRequest {
    pub config: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigureResponse {
    pub diagnostics: Vec<Diagnostic>,
}

/// Request shared by the read/create/update/delete operations.
#[derive(Debug, Clone, Default)]
pub struct ResourceRequest {
    /// Resource type (`kubernetes_manifest`)
    pub name: String,
    /// Module the block belongs to
    pub scope: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceResponse {
    pub data: Vec<u8>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ResourceResponse {
    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            data: Vec::new(),
            diagnostics: vec![Diagnostic::error("", detail)],
        }
    }
}

/// A provider session.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn capabilities(&self) -> Capabilities;
    async fn configure(&self, req: ConfigureRequest) -> ConfigureResponse;
    async fn read_resource(&self, req: ResourceRequest) -> ResourceResponse;
    async fn create_resource(&self, req: ResourceRequest) -> ResourceResponse;
    async fn update_resource(&self, req: ResourceRequest) -> ResourceResponse;
    async fn delete_resource(&self, req: ResourceRequest) -> ResourceResponse;
    /// Terminate the session.
    async fn stop(&self);
}

/// Fail on the first `ERROR` diagnostic; log warnings.
pub fn check_diagnostics(provider: &str, operation: &str, diagnostics: &[Diagnostic]) -> Result<()> {
    for d in diagnostics.iter().filter(|d| !d.is_error()) {
        warn!(provider, operation, detail = %d.detail, "provider warning");
    }
    let errors: Vec<&str> = diagnostics
        .iter()
        .filter(|d| d.is_error())
        .map(|d| d.detail.as_str())
        .collect();
    if errors.is_empty() {
        return Ok(());
    }
    Err(Error::Provider {
        provider: provider.to_string(),
        operation: operation.to_string(),
        detail: errors.join("; "),
    })
}

pub fn encode(value: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a payload; empty bytes decode to `Null`.
pub fn decode(data: &[u8]) -> Result<Value> {
    if data.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(data)?)
}

/// Provider name → session. Built once per run, then shared read-only.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: IndexMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, provider: Arc<dyn Provider>) {
        self.providers.insert(name.to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub async fn stop_all(&self) {
        for provider in self.providers.values() {
            provider.stop().await;
        }
    }
}
