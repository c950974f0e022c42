//! KF-012: In-process provider backed by a map.
//!
//! Objects are keyed `<scope>/<type>/<namespace>/<name>`, the last two
//! taken from the payload's `metadata`.

use super::{
    decode, Capabilities, ConfigureRequest, ConfigureResponse, Provider, ResourceRequest,
    ResourceResponse,
};
use crate::core::types::{Diagnostic, Value};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct MemoryState {
    config: Option<Value>,
    stopped: bool,
    objects: IndexMap<String, Value>,
}

/// Provider that keeps every object in memory for the session.
#[derive(Debug)]
pub struct MemoryProvider {
    name: String,
    capabilities: Capabilities,
    state: Mutex<MemoryState>,
}

impl MemoryProvider {
    /// Serves `<name>_manifest` as resource and data source.
    pub fn new(name: &str) -> Self {
        let manifest = format!("{}_manifest", name);
        Self::with_capabilities(
            name,
            Capabilities {
                resources: vec![manifest.clone()],
                read_data_sources: vec![manifest.clone()],
                list_data_sources: vec![manifest],
            },
        )
    }

    pub fn with_capabilities(name: &str, capabilities: Capabilities) -> Self {
        Self {
            name: name.to_string(),
            capabilities,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The last accepted provider config.
    pub fn config(&self) -> Option<Value> {
        self.lock().config.clone()
    }

    /// Snapshot of stored objects.
    pub fn objects(&self) -> IndexMap<String, Value> {
        self.lock().objects.clone()
    }

    /// Store an object directly, bypassing the session checks.
    pub fn seed(&self, key: &str, object: Value) {
        self.lock().objects.insert(key.to_string(), object);
    }

    fn session_error(&self, state: &MemoryState) -> Option<ResourceResponse> {
        if state.stopped {
            return Some(ResourceResponse::error(format!(
                "provider {} is stopped",
                self.name
            )));
        }
        if state.config.is_none() {
            return Some(ResourceResponse::error(format!(
                "provider {} is not configured",
                self.name
            )));
        }
        None
    }
}

/// Object key and payload of a request.
fn object_key(req: &ResourceRequest) -> Result<(String, Value), String> {
    let object = decode(&req.data).map_err(|e| e.to_string())?;
    let name = object
        .pointer("metadata.name")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("{} object has no metadata.name", req.name))?;
    let namespace = object
        .pointer("metadata.namespace")
        .and_then(Value::as_str)
        .unwrap_or("default");
    Ok((
        format!("{}/{}/{}/{}", req.scope, req.name, namespace, name),
        object,
    ))
}

fn respond(object: &Value) -> ResourceResponse {
    match serde_json::to_vec(object) {
        Ok(data) => ResourceResponse {
            data,
            diagnostics: Vec::new(),
        },
        Err(e) => ResourceResponse::error(e.to_string()),
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn configure(&self, req: ConfigureRequest) -> ConfigureResponse {
        let mut state = self.lock();
        if state.stopped {
            return ConfigureResponse {
                diagnostics: vec![Diagnostic::error("", format!("provider {} is stopped", self.name))],
            };
        }
        let config = match decode(&req.config) {
            Ok(c) => c,
            Err(e) => {
                return ConfigureResponse {
                    diagnostics: vec![Diagnostic::error("", e.to_string())],
                }
            }
        };
        let mut diagnostics = Vec::new();
        if config.pointer("kind").and_then(Value::as_str) != Some("ProviderConfig") {
            diagnostics.push(Diagnostic::warning(
                "",
                format!("provider {} config has no ProviderConfig kind", self.name),
            ));
        }
        debug!(provider = %self.name, "configured");
        state.config = Some(config);
        ConfigureResponse { diagnostics }
    }

    async fn read_resource(&self, req: ResourceRequest) -> ResourceResponse {
        let state = self.lock();
        if let Some(err) = self.session_error(&state) {
            return err;
        }
        let (key, _) = match object_key(&req) {
            Ok(k) => k,
            Err(e) => return ResourceResponse::error(e),
        };
        match state.objects.get(&key) {
            Some(object) => respond(object),
            None => ResourceResponse::error(format!("{} not found", key)),
        }
    }

    async fn create_resource(&self, req: ResourceRequest) -> ResourceResponse {
        let mut state = self.lock();
        if let Some(err) = self.session_error(&state) {
            return err;
        }
        let (key, object) = match object_key(&req) {
            Ok(k) => k,
            Err(e) => return ResourceResponse::error(e),
        };
        if state.objects.contains_key(&key) {
            return ResourceResponse::error(format!("{} already exists", key));
        }
        debug!(provider = %self.name, key = %key, "created");
        let resp = respond(&object);
        state.objects.insert(key, object);
        resp
    }

    async fn update_resource(&self, req: ResourceRequest) -> ResourceResponse {
        let mut state = self.lock();
        if let Some(err) = self.session_error(&state) {
            return err;
        }
        let (key, object) = match object_key(&req) {
            Ok(k) => k,
            Err(e) => return ResourceResponse::error(e),
        };
        match state.objects.get_mut(&key) {
            Some(slot) => {
                *slot = object;
                respond(slot)
            }
            None => ResourceResponse::error(format!("{} not found", key)),
        }
    }

    async fn delete_resource(&self, req: ResourceRequest) -> ResourceResponse {
        let mut state = self.lock();
        if let Some(err) = self.session_error(&state) {
            return err;
        }
        let (key, _) = match object_key(&req) {
            Ok(k) => k,
            Err(e) => return ResourceResponse::error(e),
        };
        match state.objects.shift_remove(&key) {
            Some(_) => ResourceResponse::default(),
            None => ResourceResponse::error(format!("{} not found", key)),
        }
    }

    async fn stop(&self) {
        self.lock().stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::encode;

    fn request(name: &str, ns: Option<&str>) -> ResourceRequest {
        let mut yaml = format!("{{kind: ConfigMap, metadata: {{name: {}", name);
        if let Some(ns) = ns {
            yaml.push_str(&format!(", namespace: {}", ns));
        }
        yaml.push_str("}}");
        let object: Value = serde_yaml_ng::from_str(&yaml).unwrap();
        ResourceRequest {
            name: "kubernetes_manifest".to_string(),
            scope: "demo".to_string(),
            data: encode(&object).unwrap(),
        }
    }

    async fn configured() -> MemoryProvider {
        let p = MemoryProvider::new("kubernetes");
        let config: Value = serde_yaml_ng::from_str("{kind: ProviderConfig}").unwrap();
        let resp = p
            .configure(ConfigureRequest {
                config: encode(&config).unwrap(),
            })
            .await;
        assert!(resp.diagnostics.is_empty());
        p
    }

    fn failed(resp: &ResourceResponse) -> bool {
        resp.diagnostics.iter().any(Diagnostic::is_error)
    }

    #[tokio::test]
    async fn test_kf012_requires_configure() {
        let p = MemoryProvider::new("kubernetes");
        assert!(failed(&p.create_resource(request("cm", None)).await));
        assert!(p.objects().is_empty());
    }

    #[tokio::test]
    async fn test_kf012_configure_warns_without_kind() {
        let p = MemoryProvider::new("kubernetes");
        let resp = p.configure(ConfigureRequest::default()).await;
        assert_eq!(resp.diagnostics.len(), 1);
        assert!(!resp.diagnostics[0].is_error());
        assert_eq!(p.config(), Some(Value::Null));
    }

    #[tokio::test]
    async fn test_kf012_create_read_update_delete() {
        let p = configured().await;
        let created = p.create_resource(request("cm", Some("apps"))).await;
        assert!(!failed(&created));
        assert!(p.objects().contains_key("demo/kubernetes_manifest/apps/cm"));

        let read = p.read_resource(request("cm", Some("apps"))).await;
        let object = decode(&read.data).unwrap();
        assert_eq!(object.pointer("kind"), Some(&Value::from("ConfigMap")));

        assert!(!failed(&p.update_resource(request("cm", Some("apps"))).await));
        assert!(!failed(&p.delete_resource(request("cm", Some("apps"))).await));
        assert!(p.objects().is_empty());
    }

    #[tokio::test]
    async fn test_kf012_refusals() {
        let p = configured().await;
        assert!(!failed(&p.create_resource(request("cm", None)).await));
        assert!(failed(&p.create_resource(request("cm", None)).await));
        assert!(failed(&p.read_resource(request("other", None)).await));
        assert!(failed(&p.update_resource(request("other", None)).await));
        assert!(failed(&p.delete_resource(request("other", None)).await));

        let nameless = ResourceRequest {
            name: "kubernetes_manifest".into(),
            scope: "demo".into(),
            data: b"{}".to_vec(),
        };
        assert!(failed(&p.create_resource(nameless).await));
    }

    #[tokio::test]
    async fn test_kf012_stopped() {
        let p = configured().await;
        p.stop().await;
        assert!(failed(&p.read_resource(request("cm", None)).await));
        let resp = p.configure(ConfigureRequest::default()).await;
        assert!(resp.diagnostics.iter().any(Diagnostic::is_error));
    }

    #[tokio::test]
    async fn test_kf012_default_capabilities() {
        let caps = MemoryProvider::new("kubernetes").capabilities().await;
        assert!(caps.supports_resource("kubernetes_manifest"));
        assert!(caps.supports_read("kubernetes_manifest"));
    }
}
