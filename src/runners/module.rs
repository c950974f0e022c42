//! KF-018: Module blocks: run the nested graph in its own store.
//!
//! Each instance renders its input params into a fresh store as
//! `input.<name>`, runs a child executor over the module's graph under a
//! child of the parent's cancellation token, and on success copies every
//! `output.<x>` into the parent variable `module.<name>` under key `x`.

use super::{BlockRunner, InstanceContext};
use crate::core::error::{Error, Result};
use crate::core::executor::Executor;
use crate::core::handler::BlockHandler;
use crate::core::store::Store;
use crate::core::types::Variable;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct ModuleRunner;

/// Fresh store seeded with the rendered input params.
fn child_store(ctx: &InstanceContext) -> Result<Store> {
    let store = Store::new();
    let renderer = ctx.renderer();
    for (param, raw) in &ctx.vertex.block_context.input_params {
        let value = renderer.render(raw.clone())?;
        store.add(&format!("input.{}", param), Variable::single(value))?;
    }
    Ok(store)
}

#[async_trait]
impl BlockRunner for ModuleRunner {
    async fn run(&self, ctx: &InstanceContext) -> Result<()> {
        let name = ctx.block_name().to_string();
        let dag = ctx
            .vertex
            .dag
            .clone()
            .ok_or_else(|| Error::MissingModuleGraph(name.clone()))?;

        let store = Arc::new(child_store(ctx)?);
        ctx.ensure_active()?;

        let handler = Arc::new(BlockHandler::new(ctx.engine.clone(), store.clone()));
        let executor =
            Executor::new(dag, handler).with_liveness_interval(ctx.engine.config.liveness_interval());
        debug!(module = %name, index = ctx.index, "running module");
        if !executor.run_with_token(&ctx.token).await {
            return Err(Error::ModuleFailed(name));
        }

        let mut outputs: Vec<(String, Variable)> = store
            .list()
            .into_iter()
            .filter_map(|(var, v)| var.strip_prefix("output.").map(|x| (x.to_string(), v)))
            .collect();
        outputs.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, variable) in outputs {
            ctx.commit_key(&key, variable.to_value())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dag::Dag;
    use crate::core::types::{BlockType, LocalVars, Value, Vertex, COUNT_INDEX};
    use crate::provider::ProviderRegistry;
    use crate::runners::testutil::{engine, instance};
    use indexmap::IndexMap;

    fn child_graph(output_value: &str) -> Arc<Dag> {
        let mut dag = Dag::new();
        dag.add_vertex(Vertex::new("input.name", BlockType::Input)).unwrap();
        let mut out = Vertex::new("output.x", BlockType::Output);
        out.block_context.value = Some(Value::from(output_value));
        out.dependencies = ["input.name".to_string()].into_iter().collect();
        dag.add_vertex(out).unwrap();
        dag.connect_dependencies().unwrap();
        Arc::new(dag)
    }

    fn module(params: &[(&str, Value)], dag: Option<Arc<Dag>>) -> Vertex {
        let mut v = Vertex::new("module.app", BlockType::Module);
        v.block_context.input_params = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<IndexMap<_, _>>();
        v.dag = dag;
        v
    }

    #[tokio::test]
    async fn test_kf018_output_propagates() {
        let store = Arc::new(Store::new());
        store.reserve_keyed("module.app");
        let ctx = instance(
            module(&[("name", Value::from("v"))], Some(child_graph("$input.name"))),
            store.clone(),
            engine(ProviderRegistry::new()),
        );
        ModuleRunner.run(&ctx).await.unwrap();
        let m = store.get("module.app").unwrap().to_value();
        assert_eq!(m.pointer("x"), Some(&Value::from("v")));
        assert!(!store.contains("output.x"));
        assert!(!store.contains("input.name"));
    }

    #[tokio::test]
    async fn test_kf018_params_rendered_with_instance_locals() {
        let store = Arc::new(Store::new());
        store.reserve_keyed("module.app");
        let mut ctx = instance(
            module(
                &[("name", Value::from("'app-' + string($count.index)"))],
                Some(child_graph("$input.name")),
            ),
            store.clone(),
            engine(ProviderRegistry::new()),
        );
        ctx.index = 1;
        ctx.total = 2;
        ctx.locals = LocalVars::new();
        ctx.locals.insert(COUNT_INDEX, Value::Int(1));
        ModuleRunner.run(&ctx).await.unwrap();
        let v = store.get("module.app").unwrap();
        assert_eq!(v.data["x"], vec![Value::Null, Value::from("app-1")]);
    }

    #[tokio::test]
    async fn test_kf018_child_failure_copies_nothing() {
        let store = Arc::new(Store::new());
        store.reserve_keyed("module.app");
        let engine = engine(ProviderRegistry::new());
        let ctx = instance(
            module(&[("name", Value::from("v"))], Some(child_graph("$input.name + 1"))),
            store.clone(),
            engine.clone(),
        );
        let err = ModuleRunner.run(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::ModuleFailed(ref n) if n == "module.app"));
        assert!(store.get("module.app").unwrap().data.is_empty());
        let diags = engine.recorder.get();
        assert_eq!(diags[0].context, "output.x");
    }

    #[tokio::test]
    async fn test_kf018_missing_graph() {
        let ctx = instance(
            module(&[], None),
            Arc::new(Store::new()),
            engine(ProviderRegistry::new()),
        );
        assert!(matches!(
            ModuleRunner.run(&ctx).await,
            Err(Error::MissingModuleGraph(_))
        ));
    }
}
