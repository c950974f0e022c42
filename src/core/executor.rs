//! KF-009: Executor: dependency graph scheduler.
//!
//! One task per vertex. Every edge `u → v` of the graph gets its own
//! oneshot channel: `u` sends its result, `v` waits for it. A vertex runs
//! its handler only after every upstream channel delivered `true`; a
//! dropped sender or a cancelled run counts as failure.
//!
//! The top-level waiter collects a per-vertex completion signal and
//! cancels the run on the first failure (abort-on-first-failure).

use super::dag::Dag;
use super::types::{Vertex, ROOT_VERTEX};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Default period of the "still waiting" log line.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

/// What the executor calls for every vertex.
#[async_trait]
pub trait ExecHandler: Send + Sync + 'static {
    /// Run one vertex. Returns true on success.
    async fn block_run(&self, vertex: &Arc<Vertex>, token: &CancellationToken) -> bool;

    /// Called exactly once when a run finishes.
    fn post_run(&self, start: Instant, finish: Instant, success: bool);
}

/// Lifecycle of a vertex within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VertexState {
    Pending = 0,
    Running = 1,
    Done = 2,
    Failed = 3,
}

impl VertexState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Done,
            _ => Self::Failed,
        }
    }
}

struct Channels {
    /// One receiver per upstream vertex.
    deps: Vec<(String, oneshot::Receiver<bool>)>,
    /// One sender per downstream vertex.
    dependents: Vec<oneshot::Sender<bool>>,
    done: oneshot::Sender<bool>,
}

/// Per-vertex bookkeeping.
struct ExecContext {
    vertex: Arc<Vertex>,
    state: AtomicU8,
    channels: Mutex<Option<Channels>>,
}

impl ExecContext {
    fn state(&self) -> VertexState {
        VertexState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: VertexState, to: VertexState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn take_channels(&self) -> Option<Channels> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

type DoneReceivers = Vec<(String, oneshot::Receiver<bool>)>;

/// Schedules every vertex of one graph. A single executor runs once.
pub struct Executor<H: ExecHandler> {
    dag: Arc<Dag>,
    handler: Arc<H>,
    contexts: IndexMap<String, Arc<ExecContext>>,
    done: Mutex<Option<DoneReceivers>>,
    liveness_interval: Duration,
}

impl<H: ExecHandler> Executor<H> {
    /// Build the channel matrix for `dag`.
    pub fn new(dag: Arc<Dag>, handler: Arc<H>) -> Self {
        let mut channels: IndexMap<String, (Channels, oneshot::Receiver<bool>)> = dag
            .vertices()
            .map(|v| {
                let (done_tx, done_rx) = oneshot::channel();
                (
                    v.block_name.clone(),
                    (
                        Channels {
                            deps: Vec::new(),
                            dependents: Vec::new(),
                            done: done_tx,
                        },
                        done_rx,
                    ),
                )
            })
            .collect();

        for (from, to) in dag.edges() {
            let (tx, rx) = oneshot::channel();
            if let Some((c, _)) = channels.get_mut(&from) {
                c.dependents.push(tx);
            }
            if let Some((c, _)) = channels.get_mut(&to) {
                c.deps.push((from, rx));
            }
        }

        let mut contexts = IndexMap::with_capacity(channels.len());
        let mut done = Vec::with_capacity(channels.len());
        for (name, (c, done_rx)) in channels {
            let Some(vertex) = dag.get_vertex(&name) else {
                continue;
            };
            contexts.insert(
                name.clone(),
                Arc::new(ExecContext {
                    vertex,
                    state: AtomicU8::new(VertexState::Pending as u8),
                    channels: Mutex::new(Some(c)),
                }),
            );
            done.push((name, done_rx));
        }

        Self {
            dag,
            handler,
            contexts,
            done: Mutex::new(Some(done)),
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
        }
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// State of a vertex, if it belongs to this graph.
    pub fn state(&self, name: &str) -> Option<VertexState> {
        self.contexts.get(name).map(|c| c.state())
    }

    /// Run the whole graph. True iff every vertex succeeded.
    pub async fn run(&self) -> bool {
        self.run_with_token(&CancellationToken::new()).await
    }

    /// Run under a child of `parent`; cancelling the parent aborts the run.
    pub async fn run_with_token(&self, parent: &CancellationToken) -> bool {
        let start = Instant::now();
        let Some(done) = self.done.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            error!("executor already ran; a graph can be executed once per executor");
            return false;
        };
        let token = parent.child_token();

        self.walk(&token);
        self.release_unreached();

        let success = self.wait_completion(done, &token).await;
        self.handler.post_run(start, Instant::now(), success);
        success
    }

    /// Walk every down-edge from the root, scheduling each vertex once.
    fn walk(&self, token: &CancellationToken) {
        let mut walked: HashSet<String> = HashSet::new();
        let mut stack = vec![ROOT_VERTEX.to_string()];
        while let Some(name) = stack.pop() {
            if !walked.insert(name.clone()) {
                continue;
            }
            if let Some(ctx) = self.contexts.get(&name) {
                if ctx.transition(VertexState::Pending, VertexState::Running) {
                    self.spawn_vertex(ctx.clone(), token.clone());
                }
            }
            stack.extend(self.dag.get_down_vertexes(&name));
        }
    }

    fn spawn_vertex(&self, ctx: Arc<ExecContext>, token: CancellationToken) {
        let handler = self.handler.clone();
        tokio::spawn(async move {
            let Some(channels) = ctx.take_channels() else {
                return;
            };
            let name = ctx.vertex.block_name.clone();

            let mut ready = true;
            for (upstream, rx) in channels.deps {
                let ok = tokio::select! {
                    biased;
                    _ = token.cancelled() => false,
                    r = rx => r.unwrap_or(false),
                };
                if !ok {
                    debug!(vertex = %name, upstream = %upstream, "dependency failed or run cancelled");
                    ready = false;
                    break;
                }
            }

            let success = if ready && !token.is_cancelled() {
                debug!(vertex = %name, "vertex started");
                let ok = handler.block_run(&ctx.vertex, &token).await;
                debug!(vertex = %name, success = ok, "vertex finished");
                ok
            } else {
                false
            };

            let terminal = if success {
                VertexState::Done
            } else {
                VertexState::Failed
            };
            ctx.transition(VertexState::Running, terminal);
            for tx in channels.dependents {
                let _ = tx.send(success);
            }
            let _ = channels.done.send(success);
        });
    }

    /// Fail every vertex the walk never reached.
    fn release_unreached(&self) {
        for (name, ctx) in &self.contexts {
            if !ctx.transition(VertexState::Pending, VertexState::Failed) {
                continue;
            }
            error!(vertex = %name, "vertex is not reachable from the root vertex");
            if let Some(channels) = ctx.take_channels() {
                let _ = channels.done.send(false);
            }
        }
    }

    async fn wait_completion(&self, done: DoneReceivers, token: &CancellationToken) -> bool {
        let total = done.len();
        let mut pending: FuturesUnordered<_> = done
            .into_iter()
            .map(|(name, rx)| async move { (name, rx.await.unwrap_or(false)) })
            .collect();

        let period = self.liveness_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut completed = 0usize;

        loop {
            tokio::select! {
                next = pending.next() => match next {
                    None => return true,
                    Some((_, true)) => completed += 1,
                    Some((name, false)) => {
                        error!(vertex = %name, "vertex failed, cancelling run");
                        token.cancel();
                        return false;
                    }
                },
                _ = ticker.tick() => {
                    info!(completed, total, "waiting for vertices to complete");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BlockType;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockHandler {
        calls: Mutex<HashMap<String, usize>>,
        events: Mutex<Vec<String>>,
        fail: HashSet<String>,
        slow: HashSet<String>,
        post_runs: Mutex<Vec<bool>>,
    }

    impl MockHandler {
        fn failing(names: &[&str]) -> Self {
            Self {
                fail: names.iter().map(|n| n.to_string()).collect(),
                ..Default::default()
            }
        }

        fn calls(&self, name: &str) -> usize {
            self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
        }

        fn position(&self, event: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .position(|e| e == event)
                .unwrap()
        }
    }

    #[async_trait]
    impl ExecHandler for MockHandler {
        async fn block_run(&self, vertex: &Arc<Vertex>, _token: &CancellationToken) -> bool {
            let name = vertex.block_name.clone();
            *self.calls.lock().unwrap().entry(name.clone()).or_default() += 1;
            self.events.lock().unwrap().push(format!("start:{}", name));
            if self.slow.contains(&name) {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            self.events.lock().unwrap().push(format!("end:{}", name));
            !self.fail.contains(&name)
        }

        fn post_run(&self, _start: Instant, _finish: Instant, success: bool) {
            self.post_runs.lock().unwrap().push(success);
        }
    }

    fn dag(spec: &[(&str, &[&str])]) -> Arc<Dag> {
        let mut dag = Dag::new();
        for (name, deps) in spec {
            let mut v = Vertex::new(name, BlockType::Local);
            v.dependencies = deps.iter().map(|d| d.to_string()).collect();
            dag.add_vertex(v).unwrap();
        }
        dag.connect_dependencies().unwrap();
        Arc::new(dag)
    }

    #[tokio::test]
    async fn test_kf009_linear_success() {
        let handler = Arc::new(MockHandler::default());
        let g = dag(&[
            ("local.a", &[]),
            ("local.b", &["local.a"]),
            ("output.c", &["local.b"]),
        ]);
        let exec = Executor::new(g, handler.clone());
        assert!(exec.run().await);
        for name in [ROOT_VERTEX, "local.a", "local.b", "output.c"] {
            assert_eq!(handler.calls(name), 1);
            assert_eq!(exec.state(name), Some(VertexState::Done));
        }
        assert_eq!(*handler.post_runs.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_kf009_dependency_ordering() {
        let handler = Arc::new(MockHandler {
            slow: ["local.a".to_string()].into(),
            ..Default::default()
        });
        let g = dag(&[
            ("local.a", &[]),
            ("local.b", &["local.a"]),
            ("local.c", &["local.a", "local.b"]),
        ]);
        assert!(Executor::new(g, handler.clone()).run().await);
        assert!(handler.position("end:local.a") < handler.position("start:local.b"));
        assert!(handler.position("end:local.b") < handler.position("start:local.c"));
    }

    #[tokio::test]
    async fn test_kf009_at_most_once_diamond() {
        let handler = Arc::new(MockHandler::default());
        let g = dag(&[
            ("local.top", &[]),
            ("local.left", &["local.top"]),
            ("local.right", &["local.top"]),
            ("local.bottom", &["local.left", "local.right", "local.top"]),
        ]);
        assert!(Executor::new(g, handler.clone()).run().await);
        assert_eq!(handler.calls("local.top"), 1);
        assert_eq!(handler.calls("local.bottom"), 1);
        assert_eq!(handler.calls.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_kf009_abort_on_failure() {
        let handler = Arc::new(MockHandler::failing(&["local.a"]));
        let g = dag(&[
            ("local.a", &[]),
            ("local.b", &["local.a"]),
            ("output.c", &["local.b"]),
        ]);
        let exec = Executor::new(g, handler.clone());
        assert!(!exec.run().await);
        assert_eq!(handler.calls("local.a"), 1);
        assert_eq!(handler.calls("local.b"), 0);
        assert_eq!(handler.calls("output.c"), 0);
        assert_eq!(*handler.post_runs.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_kf009_unreached_vertex_fails_run() {
        let mut g = Dag::new();
        g.add_vertex(Vertex::new("local.x", BlockType::Local)).unwrap();
        g.add_vertex(Vertex::new("local.y", BlockType::Local)).unwrap();
        g.connect("local.x", "local.y").unwrap();
        let handler = Arc::new(MockHandler::default());
        let exec = Executor::new(Arc::new(g), handler.clone());
        assert!(!exec.run().await);
        assert_eq!(handler.calls("local.x"), 0);
        assert_eq!(exec.state("local.x"), Some(VertexState::Failed));
    }

    #[tokio::test]
    async fn test_kf009_parent_cancellation() {
        let handler = Arc::new(MockHandler::default());
        let g = dag(&[("local.a", &[]), ("local.b", &["local.a"])]);
        let parent = CancellationToken::new();
        parent.cancel();
        let exec = Executor::new(g, handler.clone());
        assert!(!exec.run_with_token(&parent).await);
        assert_eq!(handler.calls("local.b"), 0);
    }

    #[tokio::test]
    async fn test_kf009_single_run_per_executor() {
        let handler = Arc::new(MockHandler::default());
        let exec = Executor::new(dag(&[("local.a", &[])]), handler.clone());
        assert!(exec.run().await);
        assert!(!exec.run().await);
        assert_eq!(handler.calls("local.a"), 1);
        assert_eq!(handler.post_runs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_kf009_liveness_tick_does_not_cancel() {
        let handler = Arc::new(MockHandler {
            slow: ["local.a".to_string()].into(),
            ..Default::default()
        });
        let exec = Executor::new(dag(&[("local.a", &[])]), handler)
            .with_liveness_interval(Duration::from_millis(5));
        assert!(exec.run().await);
    }
}
