//! Task graph: named tasks with typed input/output slots.
//!
//! Edges are never declared by hand. Each task lists the slots it requires and
//! the slots it provides; [`TaskGraphBuilder::build`] matches providers to
//! consumers, rejects ambiguous or dangling slots and cycles, and stores the
//! tasks in a topological order.

use async_trait::async_trait;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Typed name of a value flowing between tasks
pub struct Slot<T> {
    name: &'static str,
    _ty: PhantomData<fn() -> T>,
}

impl<T> Slot<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _ty: PhantomData }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Slot<T> {}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.name)
    }
}

/// Bag of slot values. Tasks receive one holding exactly their declared inputs
/// and return one holding exactly their declared outputs.
#[derive(Clone, Default)]
pub struct Values {
    entries: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, slot: Slot<T>, value: T) {
        self.entries.insert(slot.name, Arc::new(value));
    }

    pub fn with<T: Any + Send + Sync>(mut self, slot: Slot<T>, value: T) -> Self {
        self.insert(slot, value);
        self
    }

    pub fn get<T: Any + Send + Sync>(&self, slot: Slot<T>) -> Result<&T, TaskError> {
        let value = self
            .entries
            .get(slot.name)
            .ok_or_else(|| TaskError::MissingInput(slot.name.to_string()))?;
        value
            .downcast_ref::<T>()
            .ok_or_else(|| TaskError::InputType(slot.name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn subset(&self, names: &[&'static str]) -> Values {
        let entries = names
            .iter()
            .filter_map(|name| self.entries.get(name).map(|v| (*name, Arc::clone(v))))
            .collect();
        Values { entries }
    }

    pub(crate) fn merge(&mut self, other: Values) {
        self.entries.extend(other.entries);
    }
}

impl fmt::Debug for Values {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// Why a task did not complete
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("missing input '{0}'")]
    MissingInput(String),
    #[error("input '{0}' does not hold the expected type")]
    InputType(String),
    #[error("task produced undeclared output '{0}'")]
    UndeclaredOutput(String),
    #[error("task did not produce declared output '{0}'")]
    MissingOutput(String),
    #[error("failed to disable compute service on {host}: {cause}")]
    ServiceDisableFailed { host: String, cause: String },
    #[error("failed to list instances on {host}: {cause}")]
    InstanceListFailed { host: String, cause: String },
    #[error("evacuation rejected for {rejected} of {total} instances on {host}")]
    EvacuationRejected { host: String, rejected: usize, total: usize },
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Other(String),
}

/// How many times the engine invokes a task before recording its failure.
/// The policy belongs to the task; the default is a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn attempts(attempts: u32) -> Self {
        Self { attempts: attempts.max(1), backoff: Duration::ZERO }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::attempts(1)
    }
}

/// A unit of recovery work
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Slots this task reads
    fn requires(&self) -> Vec<&'static str>;

    /// Slots this task writes
    fn provides(&self) -> Vec<&'static str>;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    async fn execute(&self, inputs: &Values) -> Result<Values, TaskError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("graph '{0}' has no tasks")]
    Empty(String),
    #[error("task '{0}' is declared twice")]
    DuplicateTask(String),
    #[error("slot '{slot}' is provided by both '{first}' and '{second}'")]
    DuplicateProvider { slot: String, first: String, second: String },
    #[error("task '{task}' requires '{slot}' which nothing provides")]
    MissingInput { task: String, slot: String },
    #[error("dependency cycle between tasks [{}]", .0.join(", "))]
    Cycle(Vec<String>),
}

const INITIAL_INPUT: &str = "<graph input>";

/// A validated, topologically ordered set of tasks plus the initial values
pub struct TaskGraph {
    pub(crate) name: String,
    pub(crate) notification: Option<Uuid>,
    pub(crate) inputs: Values,
    pub(crate) tasks: Vec<Arc<dyn Task>>,
    /// Indices of the direct providers of each task
    pub(crate) deps: Vec<Vec<usize>>,
}

impl TaskGraph {
    pub fn builder(name: impl Into<String>) -> TaskGraphBuilder {
        TaskGraphBuilder {
            name: name.into(),
            notification: None,
            inputs: Values::new(),
            tasks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn notification(&self) -> Option<Uuid> {
        self.notification
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task names in execution order
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Direct upstream tasks of `task`
    pub fn dependencies_of(&self, task: &str) -> Option<Vec<&str>> {
        let idx = self.tasks.iter().position(|t| t.name() == task)?;
        Some(self.deps[idx].iter().map(|d| self.tasks[*d].name()).collect())
    }
}

impl fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGraph")
            .field("name", &self.name)
            .field("notification", &self.notification)
            .field("tasks", &self.task_names())
            .finish()
    }
}

pub struct TaskGraphBuilder {
    name: String,
    notification: Option<Uuid>,
    inputs: Values,
    tasks: Vec<Arc<dyn Task>>,
}

impl TaskGraphBuilder {
    /// Notification the run is attributed to in emitted events
    pub fn notification(mut self, uuid: Uuid) -> Self {
        self.notification = Some(uuid);
        self
    }

    pub fn input<T: Any + Send + Sync>(mut self, slot: Slot<T>, value: T) -> Self {
        self.inputs.insert(slot, value);
        self
    }

    pub fn task(mut self, task: impl Task + 'static) -> Self {
        self.tasks.push(Arc::new(task));
        self
    }

    pub fn build(self) -> Result<TaskGraph, GraphError> {
        if self.tasks.is_empty() {
            return Err(GraphError::Empty(self.name));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.name().to_string()) {
                return Err(GraphError::DuplicateTask(task.name().to_string()));
            }
        }

        // slot -> providing task index (None = initial graph input)
        let mut providers: HashMap<&'static str, Option<usize>> =
            self.inputs.names().into_iter().map(|name| (name, None)).collect();
        for (idx, task) in self.tasks.iter().enumerate() {
            for slot in task.provides() {
                if let Some(previous) = providers.insert(slot, Some(idx)) {
                    let first = previous
                        .map(|p| self.tasks[p].name().to_string())
                        .unwrap_or_else(|| INITIAL_INPUT.to_string());
                    return Err(GraphError::DuplicateProvider {
                        slot: slot.to_string(),
                        first,
                        second: task.name().to_string(),
                    });
                }
            }
        }

        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let mut direct = Vec::new();
            for slot in task.requires() {
                match providers.get(slot) {
                    Some(Some(provider)) => {
                        if !direct.contains(provider) {
                            direct.push(*provider);
                        }
                    }
                    Some(None) => {}
                    None => {
                        return Err(GraphError::MissingInput {
                            task: task.name().to_string(),
                            slot: slot.to_string(),
                        })
                    }
                }
            }
            deps.push(direct);
        }

        let order = topological_order(&deps).map_err(|stuck| {
            GraphError::Cycle(stuck.into_iter().map(|i| self.tasks[i].name().to_string()).collect())
        })?;

        // Re-index everything into execution order
        let mut position = vec![0; order.len()];
        for (new_idx, old_idx) in order.iter().enumerate() {
            position[*old_idx] = new_idx;
        }
        let tasks = order.iter().map(|i| Arc::clone(&self.tasks[*i])).collect();
        let deps = order
            .iter()
            .map(|i| deps[*i].iter().map(|d| position[*d]).collect())
            .collect();

        Ok(TaskGraph {
            name: self.name,
            notification: self.notification,
            inputs: self.inputs,
            tasks,
            deps,
        })
    }
}

/// Kahn's algorithm, stable with respect to declaration order.
/// On a cycle, returns the indices that could not be ordered.
fn topological_order(deps: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let mut placed = vec![false; deps.len()];
    let mut order = Vec::with_capacity(deps.len());

    while order.len() < deps.len() {
        let next = (0..deps.len())
            .find(|i| !placed[*i] && deps[*i].iter().all(|d| placed[*d]));
        match next {
            Some(i) => {
                placed[i] = true;
                order.push(i);
            }
            None => return Err((0..deps.len()).filter(|i| !placed[*i]).collect()),
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: Slot<u32> = Slot::new("seed");
    const DOUBLED: Slot<u32> = Slot::new("doubled");
    const LABEL: Slot<String> = Slot::new("label");

    struct Shape {
        name: &'static str,
        requires: Vec<&'static str>,
        provides: Vec<&'static str>,
    }

    #[async_trait]
    impl Task for Shape {
        fn name(&self) -> &str {
            self.name
        }
        fn requires(&self) -> Vec<&'static str> {
            self.requires.clone()
        }
        fn provides(&self) -> Vec<&'static str> {
            self.provides.clone()
        }
        async fn execute(&self, _inputs: &Values) -> Result<Values, TaskError> {
            Ok(Values::new())
        }
    }

    fn shape(name: &'static str, requires: &[&'static str], provides: &[&'static str]) -> Shape {
        Shape { name, requires: requires.to_vec(), provides: provides.to_vec() }
    }

    #[test]
    fn test_values_are_typed() {
        let values = Values::new().with(SEED, 21);
        assert_eq!(*values.get(SEED).unwrap(), 21);
        assert_eq!(values.get(DOUBLED), Err(TaskError::MissingInput("doubled".into())));

        let wrong: Slot<String> = Slot::new("seed");
        assert_eq!(values.get(wrong), Err(TaskError::InputType("seed".into())));
    }

    #[test]
    fn test_build_orders_by_data_dependency() {
        // declared out of order on purpose
        let graph = TaskGraph::builder("chain")
            .input(SEED, 1)
            .task(shape("format", &["doubled"], &["label"]))
            .task(shape("double", &["seed"], &["doubled"]))
            .build()
            .unwrap();

        assert_eq!(graph.task_names(), vec!["double", "format"]);
        assert_eq!(graph.dependencies_of("format"), Some(vec!["double"]));
        assert_eq!(graph.dependencies_of("double"), Some(vec![]));
        assert_eq!(LABEL.name(), "label");
    }

    #[test]
    fn test_build_rejects_dangling_input() {
        let err = TaskGraph::builder("dangling")
            .task(shape("format", &["doubled"], &[]))
            .build()
            .unwrap_err();
        assert_eq!(err, GraphError::MissingInput { task: "format".into(), slot: "doubled".into() });
    }

    #[test]
    fn test_build_rejects_two_providers() {
        let err = TaskGraph::builder("ambiguous")
            .input(SEED, 1)
            .task(shape("reseed", &[], &["seed"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateProvider { ref first, .. } if first == INITIAL_INPUT));
    }

    #[test]
    fn test_build_rejects_cycles_and_duplicates() {
        let err = TaskGraph::builder("loop")
            .task(shape("a", &["b_out"], &["a_out"]))
            .task(shape("b", &["a_out"], &["b_out"]))
            .build()
            .unwrap_err();
        assert_eq!(err, GraphError::Cycle(vec!["a".into(), "b".into()]));

        let err = TaskGraph::builder("dup")
            .task(shape("a", &[], &[]))
            .task(shape("a", &[], &[]))
            .build()
            .unwrap_err();
        assert_eq!(err, GraphError::DuplicateTask("a".into()));

        assert_eq!(TaskGraph::builder("none").build().unwrap_err(), GraphError::Empty("none".into()));
    }
}
