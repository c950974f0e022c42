//! KF-014: Input blocks.
//!
//! A value supplied before the run (CLI `--input`, module input params)
//! wins; otherwise the block's default is stored.

use super::{BlockRunner, InstanceContext};
use crate::core::error::{Error, Result};
use crate::core::types::Variable;
use async_trait::async_trait;
use tracing::debug;

pub struct InputRunner;

#[async_trait]
impl BlockRunner for InputRunner {
    async fn run(&self, ctx: &InstanceContext) -> Result<()> {
        let name = ctx.block_name();
        if ctx.store.contains(name) {
            debug!(block = %name, "input supplied by caller");
            return Ok(());
        }
        let Some(default) = ctx.vertex.block_context.default.as_ref() else {
            return Err(Error::MissingInput(name.to_string()));
        };
        let value = ctx.render(Some(default))?;
        ctx.commit_variable(Variable::single(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::Store;
    use crate::core::types::{BlockType, Value, Vertex};
    use crate::provider::ProviderRegistry;
    use crate::runners::testutil::{engine, instance};
    use std::sync::Arc;

    fn input(default: Option<Value>) -> Vertex {
        let mut v = Vertex::new("input.replicas", BlockType::Input);
        v.block_context.default = default;
        v
    }

    #[tokio::test]
    async fn test_kf014_default_seeded() {
        let store = Arc::new(Store::new());
        let ctx = instance(input(Some(Value::Int(3))), store.clone(), engine(ProviderRegistry::new()));
        InputRunner.run(&ctx).await.unwrap();
        assert_eq!(store.get("input.replicas").unwrap().to_value(), Value::Int(3));
    }

    #[tokio::test]
    async fn test_kf014_supplied_value_untouched() {
        let store = Arc::new(Store::new());
        store
            .add("input.replicas", Variable::single(Value::Int(9)))
            .unwrap();
        let ctx = instance(input(Some(Value::Int(3))), store.clone(), engine(ProviderRegistry::new()));
        InputRunner.run(&ctx).await.unwrap();
        assert_eq!(store.get("input.replicas").unwrap().to_value(), Value::Int(9));
    }

    #[tokio::test]
    async fn test_kf014_missing_default() {
        let ctx = instance(input(None), Arc::new(Store::new()), engine(ProviderRegistry::new()));
        assert!(matches!(
            InputRunner.run(&ctx).await,
            Err(Error::MissingInput(ref n)) if n == "input.replicas"
        ));
    }
}
