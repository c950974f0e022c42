//! Block runners: one strategy per block type.
//!
//! Each runner produces one loop instance's result and commits it to the
//! variable store through [`InstanceContext`]. Only resource, data and
//! provider runners reach outside the process.

pub mod input;
pub mod module;
pub mod provider;
pub mod resource;
pub mod root;
pub mod value;

use crate::core::error::{Error, Result};
use crate::core::handler::Engine;
use crate::core::render::Renderer;
use crate::core::store::Store;
use crate::core::types::{BlockType, LocalVars, Value, Variable, Vertex, DUMMY_KEY};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything one loop instance of a vertex needs.
pub struct InstanceContext {
    pub vertex: Arc<Vertex>,
    pub store: Arc<Store>,
    pub engine: Arc<Engine>,
    pub index: usize,
    pub total: usize,
    pub locals: LocalVars,
    pub token: CancellationToken,
}

impl InstanceContext {
    pub fn block_name(&self) -> &str {
        &self.vertex.block_name
    }

    pub fn renderer(&self) -> Renderer<'_> {
        Renderer::new(&self.store, &self.locals)
    }

    /// Render a payload, `None` rendering to `Null`.
    pub fn render(&self, raw: Option<&Value>) -> Result<Value> {
        match raw {
            Some(v) => self.renderer().render(v.clone()),
            None => Ok(Value::Null),
        }
    }

    /// Fail with [`Error::Cancelled`] once the run is cancelled.
    pub fn ensure_active(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled(self.vertex.block_name.clone()));
        }
        Ok(())
    }

    /// Write this instance's slot of a single-valued block.
    pub fn commit(&self, value: Value) -> Result<()> {
        self.commit_key(DUMMY_KEY, value)
    }

    /// Write this instance's slot under a named key.
    pub fn commit_key(&self, key: &str, value: Value) -> Result<()> {
        self.ensure_active()?;
        self.store
            .set_instance(&self.vertex.block_name, key, self.index, self.total, value)
    }

    /// Add a whole variable under the block name; fails if it exists.
    pub fn commit_variable(&self, variable: Variable) -> Result<()> {
        self.ensure_active()?;
        self.store.add(&self.vertex.block_name, variable)
    }
}

/// Produces one instance's result.
#[async_trait]
pub trait BlockRunner: Send + Sync {
    async fn run(&self, ctx: &InstanceContext) -> Result<()>;
}

/// Immutable block type → runner table.
pub struct RunnerTable {
    runners: FxHashMap<BlockType, Arc<dyn BlockRunner>>,
}

impl Default for RunnerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerTable {
    /// The standard table: one runner per block type.
    pub fn new() -> Self {
        Self::empty()
            .with_runner(BlockType::Root, Arc::new(root::RootRunner))
            .with_runner(BlockType::Input, Arc::new(input::InputRunner))
            .with_runner(BlockType::Local, Arc::new(value::ValueRunner))
            .with_runner(BlockType::Output, Arc::new(value::ValueRunner))
            .with_runner(BlockType::Resource, Arc::new(resource::ResourceRunner::managed()))
            .with_runner(BlockType::Data, Arc::new(resource::ResourceRunner::data()))
            .with_runner(BlockType::Provider, Arc::new(provider::ProviderRunner))
            .with_runner(BlockType::Module, Arc::new(module::ModuleRunner))
    }

    pub fn empty() -> Self {
        Self {
            runners: FxHashMap::default(),
        }
    }

    /// Register or replace the runner of one block type.
    pub fn with_runner(mut self, block_type: BlockType, runner: Arc<dyn BlockRunner>) -> Self {
        self.runners.insert(block_type, runner);
        self
    }

    pub fn get(&self, block_type: BlockType) -> Result<Arc<dyn BlockRunner>> {
        self.runners
            .get(&block_type)
            .cloned()
            .ok_or(Error::NoRunner(block_type))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::provider::ProviderRegistry;

    pub fn engine(providers: ProviderRegistry) -> Arc<Engine> {
        Arc::new(Engine::new(EngineConfig::default(), providers))
    }

    pub fn instance(vertex: Vertex, store: Arc<Store>, engine: Arc<Engine>) -> InstanceContext {
        InstanceContext {
            vertex: Arc::new(vertex),
            store,
            engine,
            index: 0,
            total: 1,
            locals: LocalVars::new(),
            token: CancellationToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::provider::ProviderRegistry;

    #[test]
    fn test_kf013_standard_table_covers_every_type() {
        let table = RunnerTable::new();
        for bt in [
            BlockType::Root,
            BlockType::Module,
            BlockType::Input,
            BlockType::Output,
            BlockType::Local,
            BlockType::Resource,
            BlockType::Data,
            BlockType::Provider,
        ] {
            assert!(table.get(bt).is_ok(), "missing runner for {}", bt);
        }
        assert!(matches!(
            RunnerTable::empty().get(BlockType::Local),
            Err(Error::NoRunner(BlockType::Local))
        ));
    }

    #[test]
    fn test_kf013_commit_refused_after_cancel() {
        let store = Arc::new(Store::new());
        let ctx = instance(
            Vertex::new("local.a", BlockType::Local),
            store.clone(),
            engine(ProviderRegistry::new()),
        );
        ctx.token.cancel();
        assert!(matches!(ctx.commit(Value::Int(1)), Err(Error::Cancelled(_))));
        assert!(matches!(
            ctx.commit_variable(Variable::single(Value::Int(1))),
            Err(Error::Cancelled(_))
        ));
        assert!(!store.contains("local.a"));
    }

    #[test]
    fn test_kf013_commit_writes_own_slot() {
        let store = Arc::new(Store::new());
        store.reserve("local.a", 2);
        let mut ctx = instance(
            Vertex::new("local.a", BlockType::Local),
            store.clone(),
            engine(ProviderRegistry::new()),
        );
        ctx.index = 1;
        ctx.total = 2;
        ctx.commit(Value::from("second")).unwrap();
        assert_eq!(
            store.get("local.a").unwrap().to_value(),
            Value::List(vec![Value::Null, Value::from("second")])
        );
    }
}
