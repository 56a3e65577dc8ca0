// Session: the inventory view plus failure state shared across runs

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::Config;
use crate::connections::{ConnectionFactory, ConnectionRegistry};
use crate::executor::{
    AggregatedResult, Outcome, Scheduler, Task, TaskContext, TaskHandle, TaskParams,
};
use crate::inventory::{Host, HostFilter, Inventory};
use crate::output::errors::DispatchError;

/// State shared by a session and every session filtered from it.
///
/// Failures recorded by a run on any filtered view are visible to all
/// the others.
pub struct SessionData {
    failed_hosts: RwLock<HashSet<String>>,
    dry_run: bool,
    connections: ConnectionRegistry,
}

impl SessionData {
    pub fn new(dry_run: bool, connections: ConnectionRegistry) -> Self {
        SessionData {
            failed_hosts: RwLock::new(HashSet::new()),
            dry_run,
            connections,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Names of the hosts currently marked failed, sorted
    pub fn failed_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.failed_hosts.read().iter().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn is_failed(&self, host: &str) -> bool {
        self.failed_hosts.read().contains(host)
    }

    /// Remove one host from the failed set
    pub fn recover_host(&self, host: &str) {
        self.failed_hosts.write().remove(host);
    }

    /// Mark every host as good again
    pub fn reset_failed_hosts(&self) {
        self.failed_hosts.write().clear();
    }

    pub(crate) fn record_failed<I>(&self, hosts: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.failed_hosts.write().extend(hosts);
    }

    pub fn to_value(&self) -> Value {
        json!({
            "failed_hosts": self.failed_hosts(),
            "dry_run": self.dry_run,
            "available_connections": self.connections.names(),
        })
    }
}

impl Default for SessionData {
    fn default() -> Self {
        SessionData::new(false, ConnectionRegistry::default())
    }
}

impl fmt::Debug for SessionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionData")
            .field("failed_hosts", &self.failed_hosts())
            .field("dry_run", &self.dry_run)
            .field("connections", &self.connections)
            .finish()
    }
}

/// Per-run overrides for [`Session::run`]
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Overrides `Config::num_workers`; 1 runs serially
    pub num_workers: Option<usize>,
    /// Overrides `Config::raise_on_error`
    pub raise_on_error: Option<bool>,
    /// Run on hosts not marked failed
    pub on_good: bool,
    /// Run on hosts marked failed
    pub on_failed: bool,
    pub params: TaskParams,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            num_workers: None,
            raise_on_error: None,
            on_good: true,
            on_failed: false,
            params: TaskParams::new(),
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        RunOptions::default()
    }

    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers);
        self
    }

    pub fn raise_on_error(mut self, raise: bool) -> Self {
        self.raise_on_error = Some(raise);
        self
    }

    pub fn on_good(mut self, on_good: bool) -> Self {
        self.on_good = on_good;
        self
    }

    pub fn on_failed(mut self, on_failed: bool) -> Self {
        self.on_failed = on_failed;
        self
    }

    pub fn params(mut self, params: TaskParams) -> Self {
        self.params = params;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key, value);
        self
    }
}

/// Closes every open connection on the host it runs on
pub struct CloseConnections;

impl Task for CloseConnections {
    fn name(&self) -> &str {
        "close_connections"
    }

    fn run(&self, handle: &mut TaskHandle<'_>, _params: &TaskParams) -> anyhow::Result<Outcome> {
        handle.host().close_connections();
        Ok(Outcome::none())
    }
}

/// The main object to work with: a view over the inventory that dispatches
/// tasks to its hosts.
#[derive(Debug, Clone)]
pub struct Session {
    inventory: Inventory,
    data: Arc<SessionData>,
    config: Arc<Config>,
}

impl Session {
    pub fn builder(inventory: Inventory) -> SessionBuilder {
        SessionBuilder::new(inventory)
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn data(&self) -> &Arc<SessionData> {
        &self.data
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dry_run(&self) -> bool {
        self.data.dry_run()
    }

    /// A new session over the hosts matching `filter`.
    ///
    /// The new session shares this one's failure state and configuration;
    /// this session's inventory is left as it was.
    pub fn filter(&self, filter: &HostFilter) -> Session {
        Session {
            inventory: self.inventory.filter(filter),
            data: Arc::clone(&self.data),
            config: Arc::clone(&self.config),
        }
    }

    /// Run `task` on the selected hosts.
    ///
    /// Hosts that fail are added to the shared failed set, unless
    /// raise-on-error is active, in which case any failure is returned as
    /// [`DispatchError::Execution`] and the failed set is left alone.
    /// Success never removes a host from the failed set; use
    /// [`reset_failed`](Self::reset_failed) for that.
    ///
    /// With one worker the task runs inline on the calling thread, so a
    /// serial run blocks the runtime worker polling this future until every
    /// host is done. Parallel runs use tokio's blocking pool instead.
    pub async fn run<T: Task + 'static>(
        &self,
        task: T,
        options: RunOptions,
    ) -> Result<AggregatedResult, DispatchError> {
        self.run_shared(Arc::new(task), options).await
    }

    /// [`run`](Self::run) for a task that is already shared
    pub async fn run_shared(
        &self,
        task: Arc<dyn Task>,
        options: RunOptions,
    ) -> Result<AggregatedResult, DispatchError> {
        let num_workers = options
            .num_workers
            .filter(|n| *n > 0)
            .unwrap_or(self.config.num_workers);
        let hosts = self.select_hosts(options.on_good, options.on_failed);

        let context = TaskContext::new(task, options.params, Arc::clone(&self.data));
        info!(
            task = %context.name(),
            num_workers,
            hosts = hosts.len(),
            "running task"
        );
        debug!(params = ?context.params(), "task parameters");

        let scheduler = Scheduler::new(context, hosts);
        let result = if num_workers == 1 {
            scheduler.run_serial()
        } else {
            scheduler.run_parallel(num_workers).await?
        };

        let raise = options
            .raise_on_error
            .unwrap_or(self.config.raise_on_error);
        if raise {
            result.raise_on_error()
        } else {
            self.data.record_failed(result.failed_host_names());
            Ok(result)
        }
    }

    /// Hosts to run on, in inventory order, each at most once
    fn select_hosts(&self, on_good: bool, on_failed: bool) -> Vec<Arc<Host>> {
        self.inventory
            .hosts()
            .iter()
            .filter(|host| {
                if self.data.is_failed(&host.name) {
                    on_failed
                } else {
                    on_good
                }
            })
            .cloned()
            .collect()
    }

    /// Clear one host's failed mark
    pub fn reset_failed(&self, host: &str) -> Result<(), DispatchError> {
        if !self.inventory.contains(host) {
            return Err(DispatchError::UnknownHost(host.to_string()));
        }
        self.data.recover_host(host);
        Ok(())
    }

    /// Clear every failed mark, including those of hosts outside this view
    pub fn reset_all_failed(&self) {
        self.data.reset_failed_hosts();
    }

    /// Close every open connection on the selected hosts
    pub async fn close_connections(
        &self,
        on_good: bool,
        on_failed: bool,
    ) -> Result<AggregatedResult, DispatchError> {
        self.run(
            CloseConnections,
            RunOptions::new()
                .on_good(on_good)
                .on_failed(on_failed)
                .raise_on_error(false),
        )
        .await
    }

    /// Run `f` with this session, then close the connections of every host
    /// in the session, good or failed, however `f` exits.
    ///
    /// A panic inside `f` is resumed after the connections are closed.
    pub async fn scoped<F, Fut, R, E>(self, f: F) -> Result<R, E>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<DispatchError>,
    {
        let teardown = self.clone();
        // Guard the call as well as the future: `f` may panic before it
        // returns one.
        let outcome = AssertUnwindSafe(async move { f(self).await })
            .catch_unwind()
            .await;
        let closed = teardown.close_connections(true, true).await;

        match outcome {
            Err(panic) => std::panic::resume_unwind(panic),
            Ok(result) => {
                let value = result?;
                closed?;
                Ok(value)
            }
        }
    }

    /// The plugin factory registered under `name`
    pub fn get_connection_type(&self, name: &str) -> Result<ConnectionFactory, DispatchError> {
        self.data.connections().resolve(name)
    }

    pub fn to_value(&self) -> Value {
        json!({
            "data": self.data.to_value(),
            "inventory": self.inventory.to_value(),
        })
    }
}

/// Builds a [`Session`].
///
/// Either start from fresh shared state (optionally with a dry-run flag
/// and a connection registry) or join existing state with
/// [`data`](Self::data), in which case those two come from the state.
pub struct SessionBuilder {
    inventory: Inventory,
    dry_run: Option<bool>,
    config: Option<Config>,
    data: Option<Arc<SessionData>>,
    connections: Option<ConnectionRegistry>,
}

impl SessionBuilder {
    fn new(inventory: Inventory) -> Self {
        SessionBuilder {
            inventory,
            dry_run: None,
            config: None,
            data: None,
            connections: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = Some(dry_run);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Share failure state with another session
    pub fn data(mut self, data: Arc<SessionData>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn connections(mut self, connections: ConnectionRegistry) -> Self {
        self.connections = Some(connections);
        self
    }

    pub fn build(self) -> Result<Session, DispatchError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let data = match self.data {
            Some(data) => {
                if self.connections.is_some() || self.dry_run.is_some() {
                    return Err(DispatchError::Config {
                        message: "connections and dry_run come from the shared session data when it is supplied".to_string(),
                        path: None,
                    });
                }
                data
            }
            None => Arc::new(SessionData::new(
                self.dry_run.unwrap_or(false),
                self.connections.unwrap_or_default(),
            )),
        };

        Ok(Session {
            inventory: self.inventory,
            data,
            config: Arc::new(config),
        })
    }
}

/// Build a session from a loaded configuration and inventory
pub fn init_session(
    config: Config,
    inventory: Inventory,
    dry_run: bool,
) -> Result<Session, DispatchError> {
    Session::builder(inventory)
        .config(config)
        .dry_run(dry_run)
        .build()
}
