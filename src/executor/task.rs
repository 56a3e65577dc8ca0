// Tasks, their parameters and the per-host execution handle

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::result::{TaskError, TaskPanicked, TaskResult};
use crate::connections::{ConnectionHandle, ConnectionOptions, ConnectionPlugin};
use crate::inventory::Host;
use crate::output::errors::{ConnectionError, DispatchError};
use crate::session::SessionData;

/// Parameter keys every task accepts
const RESERVED_PARAMS: &[&str] = &["name", "dry_run"];

/// A unit of work run once per host.
///
/// Errors returned from [`Task::run`] are recorded against the host and
/// never abort the other hosts in the run.
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, handle: &mut TaskHandle<'_>, params: &TaskParams) -> anyhow::Result<Outcome>;
}

/// A [`Task`] backed by a closure
pub struct FnTask<F> {
    name: String,
    func: F,
}

impl<F> Task for FnTask<F>
where
    F: Fn(&mut TaskHandle<'_>, &TaskParams) -> anyhow::Result<Outcome> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, handle: &mut TaskHandle<'_>, params: &TaskParams) -> anyhow::Result<Outcome> {
        (self.func)(handle, params)
    }
}

/// Wrap a closure as a named task
pub fn task_fn<F>(name: impl Into<String>, func: F) -> FnTask<F>
where
    F: Fn(&mut TaskHandle<'_>, &TaskParams) -> anyhow::Result<Outcome> + Send + Sync,
{
    FnTask {
        name: name.into(),
        func,
    }
}

/// Keyword parameters bound to a task for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskParams(Map<String, Value>);

impl TaskParams {
    pub fn new() -> Self {
        TaskParams::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Typed lookup; `Ok(None)` when the key is absent
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .with_context(|| format!("invalid value for parameter '{}'", key)),
        }
    }

    /// Typed lookup of a parameter the task cannot run without
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        self.get(key)?
            .ok_or_else(|| anyhow!("missing required parameter '{}'", key))
    }

    /// Reject any key outside `allowed` and the reserved keys
    pub fn ensure_only(&self, allowed: &[&str]) -> anyhow::Result<()> {
        for key in self.0.keys() {
            if !allowed.contains(&key.as_str()) && !RESERVED_PARAMS.contains(&key.as_str()) {
                return Err(UnexpectedParam(key.clone()).into());
            }
        }
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Display name override passed as the `name` parameter
    pub fn display_name(&self) -> Option<&str> {
        self.0.get("name").and_then(Value::as_str)
    }

    /// Per-task dry-run override passed as the `dry_run` parameter
    pub fn dry_run(&self) -> Option<bool> {
        self.0.get("dry_run").and_then(Value::as_bool)
    }
}

impl From<Map<String, Value>> for TaskParams {
    fn from(map: Map<String, Value>) -> Self {
        TaskParams(map)
    }
}

/// A parameter the task does not understand
#[derive(Debug, thiserror::Error)]
#[error("unexpected keyword argument '{0}'")]
pub struct UnexpectedParam(pub String);

/// What a task returns on success
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub result: Value,
    pub changed: bool,
}

impl Outcome {
    pub fn ok(result: impl Into<Value>) -> Self {
        Outcome {
            result: result.into(),
            changed: false,
        }
    }

    /// A result that reports the host as changed
    pub fn changed(result: impl Into<Value>) -> Self {
        Outcome {
            result: result.into(),
            changed: true,
        }
    }

    pub fn none() -> Self {
        Outcome::default()
    }
}

impl From<Value> for Outcome {
    fn from(result: Value) -> Self {
        Outcome::ok(result)
    }
}

/// A task bound to its parameters and to the session that runs it
#[derive(Clone)]
pub struct TaskContext {
    task: Arc<dyn Task>,
    params: Arc<TaskParams>,
    data: Arc<SessionData>,
}

impl TaskContext {
    pub fn new(task: Arc<dyn Task>, params: TaskParams, data: Arc<SessionData>) -> Self {
        TaskContext {
            task,
            params: Arc::new(params),
            data,
        }
    }

    /// The `name` parameter if given, else the task's own name
    pub fn name(&self) -> &str {
        self.params
            .display_name()
            .unwrap_or_else(|| self.task.name())
    }

    pub fn params(&self) -> &TaskParams {
        &self.params
    }

    pub fn data(&self) -> &Arc<SessionData> {
        &self.data
    }

    /// Run the task against one host.
    ///
    /// This is the only place task failures are caught: an `Err` or a
    /// panic becomes a failed [`TaskResult`] for this host.
    pub fn start(&self, host: &Arc<Host>) -> TaskResult {
        let name = self.name();
        debug!(host = %host.name, task = %name, "task started");

        let mut handle = TaskHandle::new(host, &self.data, &self.params);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.task.run(&mut handle, &self.params)
        }));
        let sub_results = handle.into_sub_results();

        let result = match outcome {
            Ok(Ok(outcome)) => TaskResult::success(&host.name, name, outcome, sub_results),
            Ok(Err(err)) => {
                TaskResult::failure(&host.name, name, TaskError::new(err), sub_results)
            }
            Err(payload) => {
                let panicked = TaskPanicked {
                    message: panic_message(payload.as_ref()),
                };
                TaskResult::failure(&host.name, name, TaskError::new(panicked.into()), sub_results)
            }
        };

        debug!(
            host = %host.name,
            task = %name,
            failed = result.failed(),
            changed = result.changed,
            "task finished"
        );
        result
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// What a task sees while it runs against one host
pub struct TaskHandle<'a> {
    host: &'a Arc<Host>,
    data: &'a Arc<SessionData>,
    params: &'a TaskParams,
    sub_results: Vec<TaskResult>,
}

impl<'a> TaskHandle<'a> {
    fn new(host: &'a Arc<Host>, data: &'a Arc<SessionData>, params: &'a TaskParams) -> Self {
        TaskHandle {
            host,
            data,
            params,
            sub_results: Vec::new(),
        }
    }

    pub fn host(&self) -> &Host {
        self.host
    }

    /// Session dry-run flag, unless the task was given its own
    pub fn dry_run(&self) -> bool {
        self.params.dry_run().unwrap_or_else(|| self.data.dry_run())
    }

    pub fn params(&self) -> &TaskParams {
        self.params
    }

    /// The named connection on this host, opened on first use
    pub fn get_connection(&self, name: &str) -> Result<ConnectionHandle, DispatchError> {
        self.host.get_connection(name, self.data.connections(), None)
    }

    /// Like [`get_connection`](Self::get_connection), with explicit options
    /// used only if the connection has to be opened
    pub fn get_connection_with(
        &self,
        name: &str,
        options: &ConnectionOptions,
    ) -> Result<ConnectionHandle, DispatchError> {
        self.host
            .get_connection(name, self.data.connections(), Some(options))
    }

    /// Borrow the named connection as its concrete plugin type
    pub fn with_connection<T, R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, DispatchError>
    where
        T: ConnectionPlugin + 'static,
    {
        let handle = self.get_connection(name)?;
        let mut guard = handle.lock();
        let plugin = guard
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| DispatchError::Connection {
                host: self.host.name.clone(),
                connection: name.to_string(),
                source: ConnectionError::WrongType(std::any::type_name::<T>()),
            })?;
        Ok(f(plugin))
    }

    /// Run another task against this same host.
    ///
    /// The sub-task inherits this task's dry-run override unless it sets
    /// its own. Its result is attached to this task's result and also
    /// returned.
    pub fn run<T: Task + 'static>(&mut self, task: T, mut params: TaskParams) -> TaskResult {
        if !params.contains("dry_run") {
            if let Some(dry_run) = self.params.dry_run() {
                params.insert("dry_run", dry_run);
            }
        }

        let context = TaskContext::new(Arc::new(task), params, self.data.clone());
        let result = context.start(self.host);
        self.sub_results.push(result.clone());
        result
    }

    pub fn sub_results(&self) -> &[TaskResult] {
        &self.sub_results
    }

    fn into_sub_results(self) -> Vec<TaskResult> {
        self.sub_results
    }
}
