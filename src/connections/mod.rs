// Connection plugins and the registry that names them

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::inventory::Host;
use crate::output::errors::{ConnectionError, DispatchError};

mod local;

pub use local::{CommandResult, LocalConnection};

/// A protocol client that a host keeps open between tasks
pub trait ConnectionPlugin: Send {
    /// Establish the connection
    fn open(&mut self, options: &ConnectionOptions) -> Result<(), ConnectionError>;

    /// Tear the connection down
    fn close(&mut self) -> Result<(), ConnectionError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// An open connection as stored in a host's connections table
pub type ConnectionHandle = Arc<Mutex<Box<dyn ConnectionPlugin>>>;

/// Builds a fresh, unopened plugin instance
pub type ConnectionFactory = Arc<dyn Fn() -> Box<dyn ConnectionPlugin> + Send + Sync>;

/// Parameters for opening a connection.
///
/// Anything left unset is taken from the host when the connection opens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub platform: Option<String>,
    #[serde(default)]
    pub extras: Map<String, Value>,
}

impl ConnectionOptions {
    pub fn new() -> Self {
        ConnectionOptions::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Fill unset fields from the host
    pub fn resolve_for(mut self, host: &Host) -> Self {
        if self.hostname.is_none() {
            self.hostname = Some(host.hostname().to_string());
        }
        if self.port.is_none() {
            self.port = host.port;
        }
        if self.username.is_none() {
            self.username = host.username.clone();
        }
        if self.password.is_none() {
            self.password = host.password.clone();
        }
        if self.platform.is_none() {
            self.platform = host.platform.clone();
        }
        self
    }
}

/// Maps connection type names to plugin factories
#[derive(Clone)]
pub struct ConnectionRegistry {
    plugins: HashMap<String, ConnectionFactory>,
}

impl ConnectionRegistry {
    /// A registry with no plugins at all
    pub fn empty() -> Self {
        ConnectionRegistry {
            plugins: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ConnectionPlugin> + Send + Sync + 'static,
    {
        self.plugins.insert(name.into(), Arc::new(factory));
    }

    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ConnectionPlugin> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    /// Look up a connection type, failing if it is not registered
    pub fn resolve(&self, name: &str) -> Result<ConnectionFactory, DispatchError> {
        self.plugins
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownConnection {
                name: name.to_string(),
                available: self.names(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ConnectionRegistry {
    /// The built-in plugins: `local`
    fn default() -> Self {
        ConnectionRegistry::empty().with(LocalConnection::NAME, || {
            Box::new(LocalConnection::new()) as Box<dyn ConnectionPlugin>
        })
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
