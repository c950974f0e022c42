//! KF-016: Resource and data blocks.
//!
//! The rendered config is stored first, then the provider is called:
//! `create_resource` for resources, `read_resource` for data sources.
//! A non-empty data read replaces the stored config with the response.

use super::{BlockRunner, InstanceContext};
use crate::core::error::{Error, Result};
use crate::core::types::Vertex;
use crate::provider::{check_diagnostics, decode, encode, ResourceRequest};
use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Managed,
    Data,
}

pub struct ResourceRunner {
    kind: Kind,
}

impl ResourceRunner {
    pub fn managed() -> Self {
        Self {
            kind: Kind::Managed,
        }
    }

    pub fn data() -> Self {
        Self { kind: Kind::Data }
    }
}

/// Resource type of a block: `kubernetes_manifest.cm` gives
/// `kubernetes_manifest`. Data sources are named the same way.
pub fn resource_type(vertex: &Vertex) -> &str {
    vertex.namespace()
}

/// Provider serving a block: the explicit `provider` attribute
/// (`kubernetes` or `provider.kubernetes`), else the resource type prefix.
pub fn provider_name(vertex: &Vertex) -> String {
    if let Some(p) = vertex.block_context.attributes.provider.as_deref() {
        return p.strip_prefix("provider.").unwrap_or(p).to_string();
    }
    let rt = resource_type(vertex);
    rt.split_once('_').map_or(rt, |(p, _)| p).to_string()
}

#[async_trait]
impl BlockRunner for ResourceRunner {
    async fn run(&self, ctx: &InstanceContext) -> Result<()> {
        let provider_name = provider_name(&ctx.vertex);
        let rt = resource_type(&ctx.vertex).to_string();
        let provider = ctx.engine.providers.get(&provider_name)?;

        let caps = provider.capabilities().await;
        let supported = match self.kind {
            Kind::Managed => caps.supports_resource(&rt),
            Kind::Data => caps.supports_read(&rt),
        };
        if !supported {
            return Err(Error::Unsupported {
                provider: provider_name,
                kind: match self.kind {
                    Kind::Managed => "resource".to_string(),
                    Kind::Data => "data source".to_string(),
                },
                resource_type: rt,
            });
        }

        let config = ctx.render(ctx.vertex.block_context.config.as_ref())?;
        ctx.commit(config.clone())?;

        let req = ResourceRequest {
            name: rt,
            scope: ctx.vertex.module_name.clone(),
            data: encode(&config)?,
        };
        ctx.ensure_active()?;
        match self.kind {
            Kind::Managed => {
                let resp = provider.create_resource(req).await;
                check_diagnostics(&provider_name, "create", &resp.diagnostics)?;
                debug!(block = %ctx.block_name(), index = ctx.index, "resource created");
            }
            Kind::Data => {
                let resp = provider.read_resource(req).await;
                check_diagnostics(&provider_name, "read", &resp.diagnostics)?;
                let observed = decode(&resp.data)?;
                if !observed.is_null() {
                    ctx.commit(observed)?;
                }
                debug!(block = %ctx.block_name(), index = ctx.index, "data source read");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::Store;
    use crate::core::types::{BlockType, Value};
    use crate::provider::memory::MemoryProvider;
    use crate::provider::{ConfigureRequest, Provider, ProviderRegistry};
    use crate::runners::testutil::{engine, instance};
    use std::sync::Arc;

    fn block(name: &str, bt: BlockType, config: &str) -> Vertex {
        let mut v = Vertex::new(name, bt);
        v.module_name = "demo".to_string();
        v.block_context.config = Some(serde_yaml_ng::from_str(config).unwrap());
        v
    }

    async fn kubernetes() -> (Arc<MemoryProvider>, ProviderRegistry) {
        let p = Arc::new(MemoryProvider::new("kubernetes"));
        p.configure(ConfigureRequest {
            config: encode(&serde_yaml_ng::from_str("{kind: ProviderConfig}").unwrap()).unwrap(),
        })
        .await;
        let mut registry = ProviderRegistry::new();
        registry.register("kubernetes", p.clone());
        (p, registry)
    }

    #[test]
    fn test_kf016_names() {
        let v = Vertex::new("kubernetes_manifest.cm", BlockType::Resource);
        assert_eq!(resource_type(&v), "kubernetes_manifest");
        assert_eq!(provider_name(&v), "kubernetes");

        let d = Vertex::new("kubernetes_manifest.cm", BlockType::Data);
        assert_eq!(resource_type(&d), "kubernetes_manifest");

        let mut explicit = Vertex::new("kubernetes_manifest.cm", BlockType::Resource);
        explicit.block_context.attributes.provider = Some("provider.k8s".to_string());
        assert_eq!(provider_name(&explicit), "k8s");
    }

    #[tokio::test]
    async fn test_kf016_resource_created() {
        let (p, registry) = kubernetes().await;
        let store = Arc::new(Store::new());
        store.add("local.name", crate::core::types::Variable::single(Value::from("web"))).unwrap();
        let ctx = instance(
            block(
                "kubernetes_manifest.cm",
                BlockType::Resource,
                "{kind: ConfigMap, metadata: {name: $local.name}}",
            ),
            store.clone(),
            engine(registry),
        );
        ResourceRunner::managed().run(&ctx).await.unwrap();
        assert!(p.objects().contains_key("demo/kubernetes_manifest/default/web"));
        let stored = store.get("kubernetes_manifest.cm").unwrap().to_value();
        assert_eq!(stored.pointer("metadata.name"), Some(&Value::from("web")));
    }

    #[tokio::test]
    async fn test_kf016_data_read_replaces_slot() {
        let (p, registry) = kubernetes().await;
        p.seed(
            "demo/kubernetes_manifest/default/cm",
            serde_yaml_ng::from_str("{kind: ConfigMap, metadata: {name: cm}, data: {k: v}}").unwrap(),
        );
        let store = Arc::new(Store::new());
        let ctx = instance(
            block(
                "kubernetes_manifest.cm",
                BlockType::Data,
                "{kind: ConfigMap, metadata: {name: cm}}",
            ),
            store.clone(),
            engine(registry),
        );
        ResourceRunner::data().run(&ctx).await.unwrap();
        let stored = store.get("kubernetes_manifest.cm").unwrap().to_value();
        assert_eq!(stored.pointer("data.k"), Some(&Value::from("v")));
    }

    #[tokio::test]
    async fn test_kf016_provider_error_fails_block() {
        let (_, registry) = kubernetes().await;
        let ctx = instance(
            block("kubernetes_manifest.cm", BlockType::Resource, "{kind: ConfigMap}"),
            Arc::new(Store::new()),
            engine(registry),
        );
        let err = ResourceRunner::managed().run(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Provider { ref operation, .. } if operation == "create"));
    }

    #[tokio::test]
    async fn test_kf016_unsupported_type() {
        let (_, registry) = kubernetes().await;
        let ctx = instance(
            block("kubernetes_secret.s", BlockType::Resource, "{}"),
            Arc::new(Store::new()),
            engine(registry),
        );
        assert!(matches!(
            ResourceRunner::managed().run(&ctx).await,
            Err(Error::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_kf016_unknown_provider() {
        let ctx = instance(
            block("aws_bucket.b", BlockType::Resource, "{}"),
            Arc::new(Store::new()),
            engine(ProviderRegistry::new()),
        );
        assert!(matches!(
            ResourceRunner::managed().run(&ctx).await,
            Err(Error::UnknownProvider(ref n)) if n == "aws"
        ));
    }
}
