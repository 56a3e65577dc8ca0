// Per-host and aggregated task results

use std::collections::HashMap;
use std::fmt;
use std::ops::Index;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use super::task::Outcome;
use crate::output::errors::DispatchError;

/// The error a task raised against one host.
///
/// Keeps the original error object so callers can downcast to the concrete
/// type the task produced. Cheap to clone.
#[derive(Clone)]
pub struct TaskError(Arc<anyhow::Error>);

impl TaskError {
    pub fn new(error: anyhow::Error) -> Self {
        TaskError(Arc::new(error))
    }

    /// Downcast to the concrete error type the task returned
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// True if this error came from a panicking task
    pub fn is_panic(&self) -> bool {
        self.downcast_ref::<TaskPanicked>().is_some()
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// A task panicked instead of returning
#[derive(Debug, Error)]
#[error("task panicked: {message}")]
pub struct TaskPanicked {
    pub message: String,
}

/// Outcome of running one task against one host
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub host: String,
    pub name: String,
    /// Value the task returned, or the rendered error when it failed
    pub result: Value,
    pub changed: bool,
    pub exception: Option<TaskError>,
    /// Results of sub-tasks the task ran on the same host, in run order
    pub sub_results: Vec<TaskResult>,
}

impl TaskResult {
    pub fn success(
        host: impl Into<String>,
        name: impl Into<String>,
        outcome: Outcome,
        sub_results: Vec<TaskResult>,
    ) -> Self {
        TaskResult {
            host: host.into(),
            name: name.into(),
            result: outcome.result,
            changed: outcome.changed,
            exception: None,
            sub_results,
        }
    }

    pub fn failure(
        host: impl Into<String>,
        name: impl Into<String>,
        error: TaskError,
        sub_results: Vec<TaskResult>,
    ) -> Self {
        TaskResult {
            host: host.into(),
            name: name.into(),
            result: Value::String(error.to_string()),
            changed: false,
            exception: Some(error),
            sub_results,
        }
    }

    pub fn failed(&self) -> bool {
        self.exception.is_some()
    }

    /// The returned value, or the captured error.
    ///
    /// Lets a task propagate a failed sub-task with `?`.
    pub fn ok_or_error(&self) -> Result<&Value, TaskError> {
        match &self.exception {
            Some(err) => Err(err.clone()),
            None => Ok(&self.result),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "host": self.host,
            "name": self.name,
            "result": self.result,
            "changed": self.changed,
            "failed": self.failed(),
            "sub_results": self.sub_results.iter().map(TaskResult::to_value).collect::<Vec<_>>(),
        })
    }
}

// Errors compare by their rendered message; the objects themselves are opaque.
impl PartialEq for TaskResult {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.name == other.name
            && self.result == other.result
            && self.changed == other.changed
            && self.exception.as_ref().map(ToString::to_string)
                == other.exception.as_ref().map(ToString::to_string)
            && self.sub_results == other.sub_results
    }
}

/// Results of one run, one entry per scheduled host, in scheduling order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedResult {
    name: String,
    results: Vec<TaskResult>,
    index: HashMap<String, usize>,
}

impl AggregatedResult {
    pub fn new(name: impl Into<String>) -> Self {
        AggregatedResult {
            name: name.into(),
            results: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub(crate) fn push(&mut self, result: TaskResult) {
        self.index
            .entry(result.host.clone())
            .or_insert(self.results.len());
        self.results.push(result);
    }

    /// Name of the task that produced these results
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, host: &str) -> Option<&TaskResult> {
        self.index.get(host).map(|&pos| &self.results[pos])
    }

    pub fn contains(&self, host: &str) -> bool {
        self.index.contains_key(host)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TaskResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Host names in scheduling order
    pub fn hosts(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.host.as_str()).collect()
    }

    /// True if any host failed
    pub fn failed(&self) -> bool {
        self.results.iter().any(TaskResult::failed)
    }

    pub fn failed_hosts(&self) -> Vec<&TaskResult> {
        self.results.iter().filter(|r| r.failed()).collect()
    }

    pub fn failed_host_names(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.failed())
            .map(|r| r.host.clone())
            .collect()
    }

    /// Keyed view, for comparisons that should ignore ordering
    pub fn as_map(&self) -> HashMap<&str, &TaskResult> {
        self.results.iter().map(|r| (r.host.as_str(), r)).collect()
    }

    /// Turn a result with failures into [`DispatchError::Execution`]
    pub fn raise_on_error(self) -> Result<Self, DispatchError> {
        if self.failed() {
            Err(DispatchError::Execution(Box::new(self)))
        } else {
            Ok(self)
        }
    }

    pub fn to_value(&self) -> Value {
        let hosts: serde_json::Map<String, Value> = self
            .results
            .iter()
            .map(|r| (r.host.clone(), r.to_value()))
            .collect();
        json!({ "name": self.name, "failed": self.failed(), "hosts": hosts })
    }
}

impl Index<&str> for AggregatedResult {
    type Output = TaskResult;

    fn index(&self, host: &str) -> &TaskResult {
        match self.get(host) {
            Some(result) => result,
            None => panic!("no result for host '{}'", host),
        }
    }
}

impl IntoIterator for AggregatedResult {
    type Item = TaskResult;
    type IntoIter = std::vec::IntoIter<TaskResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl<'a> IntoIterator for &'a AggregatedResult {
    type Item = &'a TaskResult;
    type IntoIter = std::slice::Iter<'a, TaskResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}
