//! KF-017: Provider blocks: render config and configure the session.

use super::{BlockRunner, InstanceContext};
use crate::core::error::{Error, Result};
use crate::core::types::Value;
use crate::provider::{check_diagnostics, encode, ConfigureRequest};
use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::debug;

pub struct ProviderRunner;

/// Rendered config with `apiVersion` and `kind` attached when absent.
pub fn provider_config(name: &str, rendered: Value) -> Result<Value> {
    let mut config = match rendered {
        Value::Map(m) => m,
        Value::Null => IndexMap::new(),
        other => {
            return Err(Error::TypeMismatch {
                attribute: format!("provider.{} config", name),
                expected: "map".to_string(),
                actual: other.type_name().to_string(),
            })
        }
    };
    config
        .entry("apiVersion".to_string())
        .or_insert_with(|| Value::String(format!("{}.kform.dev/v1alpha1", name)));
    config
        .entry("kind".to_string())
        .or_insert_with(|| Value::from("ProviderConfig"));
    Ok(Value::Map(config))
}

#[async_trait]
impl BlockRunner for ProviderRunner {
    async fn run(&self, ctx: &InstanceContext) -> Result<()> {
        let name = ctx.vertex.short_name().to_string();
        let provider = ctx.engine.providers.get(&name)?;
        let rendered = ctx.render(ctx.vertex.block_context.config.as_ref())?;
        let config = provider_config(&name, rendered)?;

        ctx.ensure_active()?;
        let resp = provider
            .configure(ConfigureRequest {
                config: encode(&config)?,
            })
            .await;
        check_diagnostics(&name, "configure", &resp.diagnostics)?;
        debug!(provider = %name, "provider configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::Store;
    use crate::core::types::{BlockType, Variable, Vertex};
    use crate::provider::memory::MemoryProvider;
    use crate::provider::{Provider, ProviderRegistry};
    use crate::runners::testutil::{engine, instance};
    use std::sync::Arc;

    #[test]
    fn test_kf017_metadata_attached() {
        let c = provider_config("kubernetes", Value::Null).unwrap();
        assert_eq!(
            c.pointer("apiVersion"),
            Some(&Value::from("kubernetes.kform.dev/v1alpha1"))
        );
        assert_eq!(c.pointer("kind"), Some(&Value::from("ProviderConfig")));

        let custom: Value = serde_yaml_ng::from_str("{kind: Custom, host: x}").unwrap();
        let c = provider_config("kubernetes", custom).unwrap();
        assert_eq!(c.pointer("kind"), Some(&Value::from("Custom")));
        assert_eq!(c.pointer("host"), Some(&Value::from("x")));

        assert!(provider_config("kubernetes", Value::Int(1)).is_err());
    }

    #[tokio::test]
    async fn test_kf017_configure_with_rendered_config() {
        let p = Arc::new(MemoryProvider::new("kubernetes"));
        let mut registry = ProviderRegistry::new();
        registry.register("kubernetes", p.clone());

        let store = Arc::new(Store::new());
        store
            .add("input.context", Variable::single(Value::from("kind-dev")))
            .unwrap();
        let mut v = Vertex::new("provider.kubernetes", BlockType::Provider);
        v.block_context.config = Some(serde_yaml_ng::from_str("{context: $input.context}").unwrap());
        let ctx = instance(v, store, engine(registry));

        ProviderRunner.run(&ctx).await.unwrap();
        let config = p.config().unwrap();
        assert_eq!(config.pointer("context"), Some(&Value::from("kind-dev")));
        assert_eq!(config.pointer("kind"), Some(&Value::from("ProviderConfig")));
    }

    #[tokio::test]
    async fn test_kf017_error_diagnostic_fails() {
        let p = Arc::new(MemoryProvider::new("kubernetes"));
        p.stop().await;
        let mut registry = ProviderRegistry::new();
        registry.register("kubernetes", p);
        let ctx = instance(
            Vertex::new("provider.kubernetes", BlockType::Provider),
            Arc::new(Store::new()),
            engine(registry),
        );
        assert!(matches!(
            ProviderRunner.run(&ctx).await,
            Err(Error::Provider { .. })
        ));
    }
}
