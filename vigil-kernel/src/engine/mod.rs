/**
 * WORKFLOW ENGINE - Runs a recovery task graph to completion
 *
 * ROLE:
 * Executes the tasks of a [`TaskGraph`] in dependency order, each on its own
 * tokio task, and reports the terminal state of every task that ran.
 *
 * BEHAVIOUR:
 * - A task starts as soon as every slot it requires is available
 * - Independent branches run concurrently
 * - A failed task halts everything downstream of it; other branches go on
 * - Completed tasks are never rolled back
 * - A panicking task is recorded as an error and flags an engine fault
 * - Every transition goes to the injected EventSink
 */

mod graph;

pub use graph::{GraphError, RetryPolicy, Slot, Task, TaskError, TaskGraph, TaskGraphBuilder, Values};

use crate::events::{SharedEventSink, TaskEvent, TaskTransition};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error};
use uuid::Uuid;

/// Terminal state of a task that ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskOutcome {
    Ok,
    Error { cause: String },
}

impl TaskOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, TaskOutcome::Ok)
    }
}

#[derive(Debug)]
pub struct RunResult {
    pub graph: String,
    pub succeeded: bool,
    /// Outcome of every task that ran; halted tasks are absent
    pub outcomes: BTreeMap<String, TaskOutcome>,
    /// Tasks that never ran because something upstream failed
    pub halted: Vec<String>,
    /// Set when a task panicked or could not be joined
    pub engine_fault: Option<String>,
    /// Graph inputs plus every output published by a successful task
    pub values: Values,
}

impl RunResult {
    /// First failed task by name, with its cause
    pub fn first_failure(&self) -> Option<(&str, &str)> {
        self.outcomes.iter().find_map(|(name, outcome)| match outcome {
            TaskOutcome::Error { cause } => Some((name.as_str(), cause.as_str())),
            TaskOutcome::Ok => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Pending,
    Running,
    Done,
    Failed,
    Halted,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    sink: SharedEventSink,
}

impl WorkflowEngine {
    pub fn new(sink: SharedEventSink) -> Self {
        Self { sink }
    }

    pub async fn run(&self, graph: TaskGraph) -> RunResult {
        let TaskGraph { name, notification, inputs, tasks, deps } = graph;
        let mut progress = vec![Progress::Pending; tasks.len()];
        let mut values = inputs;
        let mut outcomes = BTreeMap::new();
        let mut engine_fault = None;
        let mut running = JoinSet::new();

        debug!(graph = %name, tasks = tasks.len(), "starting workflow");

        loop {
            for idx in 0..tasks.len() {
                let ready = progress[idx] == Progress::Pending
                    && deps[idx].iter().all(|d| progress[*d] == Progress::Done);
                if !ready {
                    continue;
                }
                progress[idx] = Progress::Running;
                let task = Arc::clone(&tasks[idx]);
                let task_inputs = values.subset(&task.requires());
                let sink = Arc::clone(&self.sink);
                running.spawn(async move {
                    let result = attempt(task, task_inputs, sink, notification).await;
                    (idx, result)
                });
            }

            let Some(joined) = running.join_next().await else { break };
            let (idx, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // tasks are never aborted, so this only happens on runtime shutdown
                    error!(graph = %name, "workflow task could not be joined: {e}");
                    engine_fault.get_or_insert_with(|| format!("task join failure: {e}"));
                    continue;
                }
            };

            let task_name = tasks[idx].name().to_string();
            match result {
                Ok(outputs) => {
                    values.merge(outputs);
                    progress[idx] = Progress::Done;
                    outcomes.insert(task_name.clone(), TaskOutcome::Ok);
                    self.sink.emit(TaskEvent::new(&task_name, notification, TaskTransition::Succeeded));
                }
                Err(err) => {
                    if let TaskError::Panicked(msg) = &err {
                        engine_fault.get_or_insert_with(|| format!("task '{task_name}' panicked: {msg}"));
                    }
                    progress[idx] = Progress::Failed;
                    let cause = err.to_string();
                    self.sink.emit(
                        TaskEvent::new(&task_name, notification, TaskTransition::Failed).with_cause(&cause),
                    );
                    outcomes.insert(task_name, TaskOutcome::Error { cause });
                    halt_dependants(&deps, &mut progress);
                }
            }
        }

        // Anything still marked running lost its join handle
        for (idx, state) in progress.iter_mut().enumerate() {
            if *state == Progress::Running {
                *state = Progress::Failed;
                outcomes.insert(
                    tasks[idx].name().to_string(),
                    TaskOutcome::Error { cause: "task aborted".to_string() },
                );
            }
        }
        halt_dependants(&deps, &mut progress);

        let halted: Vec<String> = progress
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == Progress::Halted)
            .map(|(idx, _)| tasks[idx].name().to_string())
            .collect();
        let succeeded = engine_fault.is_none()
            && halted.is_empty()
            && outcomes.values().all(TaskOutcome::is_ok);

        debug!(graph = %name, succeeded, halted = halted.len(), "workflow finished");

        RunResult { graph: name, succeeded, outcomes, halted, engine_fault, values }
    }
}

/// Marks every pending task downstream of a failed or halted task as halted.
/// Tasks are stored in topological order, so one forward pass is enough.
fn halt_dependants(deps: &[Vec<usize>], progress: &mut [Progress]) {
    for idx in 0..deps.len() {
        if progress[idx] != Progress::Pending {
            continue;
        }
        let blocked = deps[idx]
            .iter()
            .any(|d| matches!(progress[*d], Progress::Failed | Progress::Halted));
        if blocked {
            progress[idx] = Progress::Halted;
        }
    }
}

/// Runs one task under its retry policy and checks its outputs against its declaration
async fn attempt(
    task: Arc<dyn Task>,
    inputs: Values,
    sink: SharedEventSink,
    notification: Option<Uuid>,
) -> Result<Values, TaskError> {
    let policy = task.retry_policy();
    sink.emit(TaskEvent::new(task.name(), notification, TaskTransition::Started));

    let mut attempt_no = 1;
    loop {
        let result = AssertUnwindSafe(task.execute(&inputs)).catch_unwind().await;
        let err = match result {
            Ok(Ok(outputs)) => return check_outputs(task.as_ref(), outputs),
            Ok(Err(err)) => err,
            Err(panic) => return Err(TaskError::Panicked(panic_message(panic))),
        };

        if attempt_no >= policy.attempts {
            return Err(err);
        }
        sink.emit(
            TaskEvent::new(task.name(), notification, TaskTransition::Retrying)
                .with_cause(format!("attempt {attempt_no}/{}: {err}", policy.attempts)),
        );
        attempt_no += 1;
        if !policy.backoff.is_zero() {
            tokio::time::sleep(policy.backoff).await;
        }
    }
}

fn check_outputs(task: &dyn Task, outputs: Values) -> Result<Values, TaskError> {
    let declared = task.provides();
    if let Some(extra) = outputs.names().into_iter().find(|name| !declared.contains(name)) {
        return Err(TaskError::UndeclaredOutput(extra.to_string()));
    }
    if let Some(missing) = declared.iter().find(|name| !outputs.contains(name)) {
        return Err(TaskError::MissingOutput(missing.to_string()));
    }
    Ok(outputs)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
