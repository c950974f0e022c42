//! KF-010: Block handler: runs one vertex across its loop instances.
//!
//! Loop items are computed once per vertex. Vertices that store
//! per-instance results get their full-size variable committed before any
//! instance task is spawned. Instances run concurrently up to
//! `max_instance_concurrency`; the first error cancels the rest.

use super::config::EngineConfig;
use super::dag::Dag;
use super::error::{Error, Result};
use super::executor::{ExecHandler, Executor};
use super::loops::get_loop_items;
use super::recorder::Recorder;
use super::render::Renderer;
use super::store::Store;
use super::types::{BlockType, Diagnostic, LocalVars, Vertex};
use crate::provider::ProviderRegistry;
use crate::runners::{InstanceContext, RunnerTable};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Services shared by every handler of a run, nested modules included.
pub struct Engine {
    pub recorder: Arc<Recorder>,
    pub runners: Arc<RunnerTable>,
    pub providers: Arc<ProviderRegistry>,
    pub config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig, providers: ProviderRegistry) -> Self {
        Self {
            recorder: Arc::new(Recorder::new()),
            runners: Arc::new(RunnerTable::new()),
            providers: Arc::new(providers),
            config: config.normalized(),
        }
    }

    /// Replace the dispatch table (tests inject mock runners).
    pub fn with_runners(mut self, runners: RunnerTable) -> Self {
        self.runners = Arc::new(runners);
        self
    }

    /// Run a root graph against `store`. Diagnostics land in the recorder.
    pub async fn run(self: &Arc<Self>, dag: Arc<Dag>, store: Arc<Store>) -> bool {
        let handler = Arc::new(BlockHandler::new(self.clone(), store));
        let executor =
            Executor::new(dag, handler).with_liveness_interval(self.config.liveness_interval());
        executor.run().await
    }
}

/// [`ExecHandler`] bound to one variable store.
pub struct BlockHandler {
    engine: Arc<Engine>,
    store: Arc<Store>,
}

impl BlockHandler {
    pub fn new(engine: Arc<Engine>, store: Arc<Store>) -> Self {
        Self { engine, store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    async fn run_instances(&self, vertex: &Arc<Vertex>, token: &CancellationToken) -> Result<()> {
        let name = &vertex.block_name;
        let runner = self.engine.runners.get(vertex.block_type)?;

        let (is_for_each, items) = {
            let locals = LocalVars::new();
            let renderer = Renderer::new(&self.store, &locals);
            get_loop_items(
                &renderer,
                &vertex.block_context.attributes,
                self.engine.config.max_loop_instances,
            )?
        };
        let total = items.len();
        debug!(block = %name, instances = total, "expanding block");

        if vertex.block_type.stores_instances() {
            if token.is_cancelled() {
                return Err(Error::Cancelled(name.clone()));
            }
            if vertex.block_type == BlockType::Module {
                self.store.reserve_keyed(name);
            } else {
                self.store.reserve(name, total);
            }
        }

        let instances = token.child_token();
        let permits = Arc::new(Semaphore::new(self.engine.config.max_instance_concurrency));
        let mut set = JoinSet::new();
        for (index, item) in items.iter().enumerate() {
            let ctx = InstanceContext {
                vertex: vertex.clone(),
                store: self.store.clone(),
                engine: self.engine.clone(),
                index,
                total,
                locals: LocalVars::for_item(is_for_each, item),
                token: instances.clone(),
            };
            let runner = runner.clone();
            let permits = permits.clone();
            set.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Cancelled(ctx.vertex.block_name.clone()))?;
                ctx.ensure_active()?;
                runner.run(&ctx).await
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok(r) => r,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => Err(Error::InstanceAborted {
                    block: name.clone(),
                    detail: e.to_string(),
                }),
            };
            if let Err(e) = result {
                if first_error.is_none() {
                    instances.cancel();
                    set.abort_all();
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl ExecHandler for BlockHandler {
    async fn block_run(&self, vertex: &Arc<Vertex>, token: &CancellationToken) -> bool {
        match self.run_instances(vertex, token).await {
            Ok(()) => true,
            Err(Error::Cancelled(block)) => {
                debug!(block = %block, "block abandoned after cancellation");
                false
            }
            Err(e) => {
                error!(block = %vertex.block_name, error = %e, "block failed");
                self.engine
                    .recorder
                    .record(Diagnostic::error(&vertex.block_name, e.to_string()));
                false
            }
        }
    }

    fn post_run(&self, start: Instant, finish: Instant, success: bool) {
        info!(
            elapsed_ms = finish.duration_since(start).as_millis() as u64,
            success,
            "run finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Attributes, Value, DUMMY_KEY};
    use crate::runners::BlockRunner;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Writes `count.index * 10` or fails on a chosen index.
    struct IndexRunner {
        fail_on: Option<usize>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl IndexRunner {
        fn new(fail_on: Option<usize>) -> Self {
            Self {
                fail_on,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BlockRunner for IndexRunner {
        async fn run(&self, ctx: &InstanceContext) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if Some(ctx.index) == self.fail_on {
                return Err(Error::Graph("instance exploded".to_string()));
            }
            ctx.commit(Value::Int(ctx.index as i64 * 10))
        }
    }

    fn local(name: &str, count: i64) -> Vertex {
        let mut v = Vertex::new(name, BlockType::Local);
        v.block_context.attributes = Attributes {
            count: Some(Value::Int(count)),
            ..Default::default()
        };
        v
    }

    fn engine(runner: Arc<IndexRunner>, max: usize) -> Arc<Engine> {
        let config = EngineConfig::default().with_max_instance_concurrency(max);
        Arc::new(
            Engine::new(config, ProviderRegistry::new())
                .with_runners(RunnerTable::new().with_runner(BlockType::Local, runner)),
        )
    }

    #[tokio::test]
    async fn test_kf010_instances_fill_their_slots() {
        let runner = Arc::new(IndexRunner::new(None));
        let engine = engine(runner, 16);
        let store = Arc::new(Store::new());
        let handler = BlockHandler::new(engine.clone(), store.clone());
        let vertex = Arc::new(local("local.many", 4));
        assert!(handler.block_run(&vertex, &CancellationToken::new()).await);
        let v = store.get("local.many").unwrap();
        assert_eq!(
            v.data[DUMMY_KEY],
            (0..4).map(|i| Value::Int(i * 10)).collect::<Vec<_>>()
        );
        assert!(!engine.recorder.has_error());
    }

    #[tokio::test]
    async fn test_kf010_bounded_fan_out() {
        let runner = Arc::new(IndexRunner::new(None));
        let engine = engine(runner.clone(), 2);
        let handler = BlockHandler::new(engine, Arc::new(Store::new()));
        let vertex = Arc::new(local("local.many", 8));
        assert!(handler.block_run(&vertex, &CancellationToken::new()).await);
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_kf010_zero_instances() {
        let runner = Arc::new(IndexRunner::new(None));
        let store = Arc::new(Store::new());
        let handler = BlockHandler::new(engine(runner, 4), store.clone());
        let vertex = Arc::new(local("local.none", 0));
        assert!(handler.block_run(&vertex, &CancellationToken::new()).await);
        assert_eq!(store.get("local.none").unwrap().to_value(), Value::List(vec![]));
    }

    #[tokio::test]
    async fn test_kf010_first_error_recorded() {
        let runner = Arc::new(IndexRunner::new(Some(1)));
        let engine = engine(runner, 16);
        let handler = BlockHandler::new(engine.clone(), Arc::new(Store::new()));
        let vertex = Arc::new(local("local.many", 3));
        assert!(!handler.block_run(&vertex, &CancellationToken::new()).await);
        let diags = engine.recorder.get();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].context, "local.many");
        assert!(diags[0].detail.contains("instance exploded"));
    }

    #[tokio::test]
    async fn test_kf010_cancelled_token_never_writes() {
        let runner = Arc::new(IndexRunner::new(None));
        let engine = engine(runner, 16);
        let store = Arc::new(Store::new());
        let handler = BlockHandler::new(engine.clone(), store.clone());
        let token = CancellationToken::new();
        token.cancel();
        let vertex = Arc::new(local("local.many", 3));
        assert!(!handler.block_run(&vertex, &token).await);
        assert!(!store.contains("local.many"));
        assert!(!engine.recorder.has_error());
    }

    #[tokio::test]
    async fn test_kf010_missing_runner() {
        let engine = Arc::new(
            Engine::new(EngineConfig::default(), ProviderRegistry::new())
                .with_runners(RunnerTable::empty()),
        );
        let handler = BlockHandler::new(engine.clone(), Arc::new(Store::new()));
        let vertex = Arc::new(local("local.a", 1));
        assert!(!handler.block_run(&vertex, &CancellationToken::new()).await);
        assert!(engine.recorder.get()[0].detail.contains("no runner"));
    }

    #[tokio::test]
    async fn test_kf010_loop_error_is_recorded() {
        let runner = Arc::new(IndexRunner::new(None));
        let engine = engine(runner, 16);
        let handler = BlockHandler::new(engine.clone(), Arc::new(Store::new()));
        let mut v = Vertex::new("local.bad", BlockType::Local);
        v.block_context.attributes.count = Some(Value::List(vec![]));
        assert!(!handler.block_run(&Arc::new(v), &CancellationToken::new()).await);
        assert!(engine.recorder.get()[0].detail.contains("type mismatch"));
    }

    #[tokio::test]
    async fn test_kf010_oversized_count_is_recorded() {
        let runner = Arc::new(IndexRunner::new(None));
        let engine = Arc::new(
            Engine::new(
                EngineConfig::default().with_max_loop_instances(10),
                ProviderRegistry::new(),
            )
            .with_runners(RunnerTable::new().with_runner(BlockType::Local, runner.clone())),
        );
        let store = Arc::new(Store::new());
        let handler = BlockHandler::new(engine.clone(), store.clone());
        let vertex = Arc::new(local("local.big", 1_000_000_000_000));
        assert!(!handler.block_run(&vertex, &CancellationToken::new()).await);
        assert!(!store.contains("local.big"));
        assert_eq!(runner.peak.load(Ordering::SeqCst), 0);
        let diags = engine.recorder.get();
        assert_eq!(diags.len(), 1);
        assert!(diags[0].detail.contains("count <= 10"));
    }

    #[tokio::test]
    async fn test_kf010_drives_executor() {
        let runner = Arc::new(IndexRunner::new(None));
        let engine = engine(runner, 16);
        let store = Arc::new(Store::new());
        let mut dag = Dag::new();
        dag.add_vertex(local("local.a", 2)).unwrap();
        dag.connect_dependencies().unwrap();
        let exec = Executor::new(
            Arc::new(dag),
            Arc::new(BlockHandler::new(engine, store.clone())),
        );
        assert!(exec.run().await);
        assert_eq!(
            store.get("local.a").unwrap().to_value(),
            Value::List(vec![Value::Int(0), Value::Int(10)])
        );
    }
}
