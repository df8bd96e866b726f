use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use guardsymbi_core::types::{EventKind, StepFailure, TaskFailure, TaskState};

use crate::graph::{DependencyGraph, TaskId};
use crate::state::StateTable;
use crate::task::{RunScope, TaskDriver, TaskRun};

/// Terminal results for every task in the entry closure.
pub struct Schedule {
    /// Closure tasks in topological order.
    pub runs: Vec<(TaskId, TaskRun)>,
    pub cancelled: bool,
}

/// Ready-queue dispatcher over the entry task's dependency closure.
///
/// A task is dispatched once every dependency has succeeded (or failed under
/// `continue`). When a dependency fails or aborts, its dependents are aborted
/// without running. Independent branches are unaffected by each other.
pub struct Scheduler {
    graph: Arc<DependencyGraph>,
    scope: Arc<RunScope>,
    max_parallel: usize,
    run_timeout: Option<Duration>,
}

/// Mutable bookkeeping for one schedule.
struct Frontier {
    in_closure: Vec<bool>,
    remaining: Vec<usize>,
    degraded: Vec<bool>,
    ready: VecDeque<TaskId>,
    results: HashMap<TaskId, TaskRun>,
}

impl Scheduler {
    pub fn new(graph: Arc<DependencyGraph>, scope: Arc<RunScope>, max_parallel: usize) -> Self {
        Self {
            graph,
            scope,
            max_parallel: max_parallel.max(1),
            run_timeout: None,
        }
    }

    /// Cancel the run token once `timeout` elapses.
    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub async fn run(&self, entry: TaskId) -> Schedule {
        let closure = self.graph.closure(entry);
        let len = self.graph.len();
        let states = StateTable::new(len);

        let mut frontier = Frontier {
            in_closure: vec![false; len],
            remaining: (0..len).map(|id| self.graph.deps(id).len()).collect(),
            degraded: vec![false; len],
            ready: VecDeque::new(),
            results: HashMap::new(),
        };
        for &id in &closure {
            frontier.in_closure[id] = true;
        }
        for &id in &closure {
            if frontier.remaining[id] == 0 {
                self.mark_ready(&states, &mut frontier, id);
            }
        }

        debug!(entry = %self.graph.display_name(entry), tasks = closure.len(), "Scheduling closure");

        let deadline = self.run_timeout.map(|t| Instant::now() + t);
        let mut join_set: JoinSet<(TaskId, TaskRun)> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if !self.scope.cancel.is_cancelled() {
                while join_set.len() < self.max_parallel {
                    let Some(id) = frontier.ready.pop_front() else {
                        break;
                    };
                    self.dispatch(&mut join_set, &states, &frontier, id);
                }
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.scope.cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    warn!(in_flight = join_set.len(), "Run cancelled, aborting in-flight tasks");
                    if let Some(gateway) = &self.scope.gateway {
                        gateway.cancel_all();
                    }
                }
                _ = sleep_until(deadline), if !cancelled => {
                    warn!(timeout_secs = ?self.run_timeout.map(|t| t.as_secs()), "Run deadline reached");
                    self.scope.cancel.cancel();
                }
                Some(joined) = join_set.join_next() => match joined {
                    Ok((id, run)) => self.complete(&states, &mut frontier, id, run),
                    Err(e) => error!(error = %e, "Task worker did not complete"),
                },
            }
        }

        let cancelled = cancelled || self.scope.cancel.is_cancelled();
        for &id in &closure {
            if !states.get(id).is_terminal() {
                self.abort(&states, &mut frontier, id, TaskFailure::Cancelled);
            }
        }

        let runs = closure
            .into_iter()
            .map(|id| {
                let run = frontier
                    .results
                    .remove(&id)
                    .unwrap_or_else(|| TaskRun::aborted(TaskFailure::Cancelled));
                (id, run)
            })
            .collect();

        Schedule { runs, cancelled }
    }

    fn mark_ready(&self, states: &StateTable, frontier: &mut Frontier, id: TaskId) {
        if states.transition(id, TaskState::Ready).is_ok() {
            self.record(id, EventKind::TaskReady);
            frontier.ready.push_back(id);
        }
    }

    fn dispatch(
        &self,
        join_set: &mut JoinSet<(TaskId, TaskRun)>,
        states: &StateTable,
        frontier: &Frontier,
        id: TaskId,
    ) {
        if let Err(current) = states.transition(id, TaskState::Running) {
            debug!(task = %self.graph.display_name(id), state = %current, "Skipping dispatch");
            return;
        }

        let node = self.graph.node(id);
        let inputs: Vec<(String, serde_json::Value)> = self
            .graph
            .input_bindings(id)
            .into_iter()
            .map(|(binding, dep)| {
                let value = frontier
                    .results
                    .get(&dep)
                    .and_then(|r| r.output.clone())
                    .unwrap_or(serde_json::Value::Null);
                (binding, value)
            })
            .collect();

        let name = self.graph.display_name(id);
        let module = node.module.clone();
        let function = node.name().to_string();
        let degraded = frontier.degraded[id];
        let driver = TaskDriver::new(self.scope.clone(), name, node.decl.clone());

        join_set.spawn(async move {
            let run = AssertUnwindSafe(driver.run(inputs, degraded))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(task = %function, error = %message, "Task worker panicked");
                    TaskRun::aborted(TaskFailure::Fatal {
                        failure: StepFailure::runtime(format!("task panicked: {}", message))
                            .at(&module, &function),
                    })
                });
            (id, run)
        });
    }

    fn complete(&self, states: &StateTable, frontier: &mut Frontier, id: TaskId, run: TaskRun) {
        let name = self.graph.display_name(id);
        match (&run.state, &run.failure) {
            (TaskState::Succeeded, _) => {
                info!(task = %name, elapsed_ms = run.elapsed_ms, "Task succeeded");
                self.record(id, EventKind::TaskSucceeded);
            }
            (TaskState::Failed, failure) => {
                let reason = failure.as_ref().map(|f| f.to_string()).unwrap_or_default();
                warn!(task = %name, reason = %reason, "Task failed");
                self.record(id, EventKind::TaskFailed { reason });
            }
            (_, failure) => {
                let reason = failure.as_ref().map(|f| f.to_string()).unwrap_or_default();
                warn!(task = %name, reason = %reason, "Task aborted");
                self.record(id, EventKind::TaskAborted { reason });
            }
        }
        if let Err(current) = states.transition(id, run.state) {
            warn!(task = %name, state = %current, next = %run.state, "Rejected task transition");
        }

        let proceed = run.state == TaskState::Succeeded || run.continue_downstream;
        let continued = run.continue_downstream;
        frontier.results.insert(id, run);

        if self.scope.cancel.is_cancelled() {
            return;
        }

        for &dependent in self.graph.dependents(id) {
            if !frontier.in_closure[dependent] {
                continue;
            }
            if proceed {
                if continued {
                    frontier.degraded[dependent] = true;
                }
                frontier.remaining[dependent] = frontier.remaining[dependent].saturating_sub(1);
                if frontier.remaining[dependent] == 0 && states.get(dependent) == TaskState::Pending
                {
                    self.mark_ready(states, frontier, dependent);
                }
            } else {
                self.propagate_abort(states, frontier, dependent, id);
            }
        }
    }

    /// Abort `start` and everything downstream of it in the closure.
    fn propagate_abort(
        &self,
        states: &StateTable,
        frontier: &mut Frontier,
        start: TaskId,
        upstream: TaskId,
    ) {
        let mut worklist = vec![(start, upstream)];
        while let Some((id, upstream)) = worklist.pop() {
            if states.get(id).is_terminal() {
                continue;
            }
            let failure = TaskFailure::AbortedDependency {
                upstream: self.graph.display_name(upstream),
            };
            self.abort(states, frontier, id, failure);
            for &dependent in self.graph.dependents(id) {
                if frontier.in_closure[dependent] {
                    worklist.push((dependent, id));
                }
            }
        }
    }

    fn abort(&self, states: &StateTable, frontier: &mut Frontier, id: TaskId, failure: TaskFailure) {
        if states.transition(id, TaskState::Aborted).is_err() {
            return;
        }
        frontier.ready.retain(|&queued| queued != id);
        let reason = failure.to_string();
        info!(task = %self.graph.display_name(id), reason = %reason, "Task aborted without running");
        self.record(id, EventKind::TaskAborted { reason });
        frontier.results.insert(id, TaskRun::aborted(failure));
    }

    fn record(&self, id: TaskId, kind: EventKind) {
        let name = self.graph.display_name(id);
        self.scope.journal.record(Some(name.as_str()), None, kind);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
