// Inventory module: hosts, groups and their open connections

mod filter;

pub use filter::*;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::connections::{ConnectionHandle, ConnectionOptions, ConnectionRegistry};
use crate::output::errors::DispatchError;

/// A single host in the inventory
pub struct Host {
    pub name: String,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub platform: Option<String>,
    pub groups: Vec<String>,
    pub data: HashMap<String, Value>,
    connections: Mutex<HashMap<String, ConnectionHandle>>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Host {
            name: name.into(),
            hostname: None,
            port: None,
            username: None,
            password: None,
            platform: None,
            groups: Vec::new(),
            data: HashMap::new(),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Address to connect to; falls back to the host name
    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.name)
    }

    /// Host-level data only; see [`Inventory::get_data`] for group inheritance
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// A built-in attribute by name, else a data key
    pub fn attribute(&self, key: &str) -> Option<Value> {
        match key {
            "name" => Some(Value::String(self.name.clone())),
            "hostname" => Some(Value::String(self.hostname().to_string())),
            "port" => self.port.map(Value::from),
            "username" => self.username.clone().map(Value::String),
            "platform" => self.platform.clone().map(Value::String),
            _ => self.data.get(key).cloned(),
        }
    }

    /// Return the named connection, opening it if it is not open yet.
    ///
    /// `options` only matter when the connection has to be opened; an
    /// already open connection is returned as is.
    pub fn get_connection(
        &self,
        name: &str,
        registry: &ConnectionRegistry,
        options: Option<&ConnectionOptions>,
    ) -> Result<ConnectionHandle, DispatchError> {
        let mut connections = self.connections.lock();
        if let Some(handle) = connections.get(name) {
            return Ok(handle.clone());
        }

        let handle = self.connect(name, registry, options)?;
        connections.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Open the named connection, failing if it is already open
    pub fn open_connection(
        &self,
        name: &str,
        registry: &ConnectionRegistry,
        options: Option<&ConnectionOptions>,
    ) -> Result<ConnectionHandle, DispatchError> {
        let mut connections = self.connections.lock();
        if connections.contains_key(name) {
            return Err(DispatchError::ConnectionAlreadyOpen {
                host: self.name.clone(),
                connection: name.to_string(),
            });
        }

        let handle = self.connect(name, registry, options)?;
        connections.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    fn connect(
        &self,
        name: &str,
        registry: &ConnectionRegistry,
        options: Option<&ConnectionOptions>,
    ) -> Result<ConnectionHandle, DispatchError> {
        let factory = registry.resolve(name)?;
        let options = options.cloned().unwrap_or_default().resolve_for(self);

        let mut plugin = factory();
        plugin
            .open(&options)
            .map_err(|source| DispatchError::Connection {
                host: self.name.clone(),
                connection: name.to_string(),
                source,
            })?;

        debug!(host = %self.name, connection = %name, "connection opened");
        Ok(Arc::new(Mutex::new(plugin)))
    }

    /// Close and forget one connection. Unknown names are ignored.
    pub fn close_connection(&self, name: &str) {
        let handle = self.connections.lock().remove(name);
        if let Some(handle) = handle {
            self.close_handle(name, &handle);
        }
    }

    /// Close and forget every open connection
    pub fn close_connections(&self) {
        let mut drained: Vec<(String, ConnectionHandle)> =
            self.connections.lock().drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, handle) in drained {
            self.close_handle(&name, &handle);
        }
    }

    // Close errors leave the connection dropped anyway, so they are only logged.
    fn close_handle(&self, name: &str, handle: &ConnectionHandle) {
        match handle.lock().close() {
            Ok(()) => debug!(host = %self.name, connection = %name, "connection closed"),
            Err(err) => warn!(
                host = %self.name,
                connection = %name,
                error = %err,
                "failed to close connection"
            ),
        }
    }

    pub fn connected(&self, name: &str) -> bool {
        self.connections.lock().contains_key(name)
    }

    /// Names of the open connections, sorted
    pub fn connection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "hostname": self.hostname(),
            "port": self.port,
            "username": self.username,
            "platform": self.platform,
            "groups": self.groups,
            "data": self.data,
            "connections": self.connection_names(),
        })
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("platform", &self.platform)
            .field("groups", &self.groups)
            .field("data", &self.data)
            .field("connections", &self.connection_names())
            .finish()
    }
}

/// A group of hosts; groups may themselves belong to parent groups
#[derive(Debug, Clone, Default)]
pub struct Group {
    pub name: String,
    pub groups: Vec<String>,
    pub data: HashMap<String, Value>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Group {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// An ordered set of hosts plus the groups they refer to.
///
/// Cloning or filtering an inventory copies the list, not the hosts: every
/// copy refers to the same `Host` objects and so to the same connections.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: Vec<Arc<Host>>,
    index: HashMap<String, usize>,
    groups: HashMap<String, Group>,
}

impl Inventory {
    pub fn new() -> Self {
        Inventory::default()
    }

    /// Add a host, replacing any host with the same name in place
    pub fn add_host(&mut self, host: Host) -> Arc<Host> {
        let host = Arc::new(host);
        self.insert_shared(host.clone());
        host
    }

    fn insert_shared(&mut self, host: Arc<Host>) {
        match self.index.get(&host.name) {
            Some(&pos) => self.hosts[pos] = host,
            None => {
                self.index.insert(host.name.clone(), self.hosts.len());
                self.hosts.push(host);
            }
        }
    }

    pub fn add_group(&mut self, group: Group) {
        self.groups.insert(group.name.clone(), group);
    }

    pub fn with_host(mut self, host: Host) -> Self {
        self.add_host(host);
        self
    }

    pub fn with_group(mut self, group: Group) -> Self {
        self.add_group(group);
        self
    }

    pub fn host(&self, name: &str) -> Option<&Arc<Host>> {
        self.index.get(name).map(|&pos| &self.hosts[pos])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Hosts in insertion order
    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn names(&self) -> Vec<&str> {
        self.hosts.iter().map(|h| h.name.as_str()).collect()
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> &HashMap<String, Group> {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Groups a host belongs to, directly or through parents, nearest first
    pub fn ancestry(&self, host: &Host) -> Vec<&Group> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = host.groups.iter().map(String::as_str).collect();
        let mut result = Vec::new();

        while let Some(name) = queue.pop_front() {
            if !seen.insert(name) {
                continue;
            }
            if let Some(group) = self.groups.get(name) {
                queue.extend(group.groups.iter().map(String::as_str));
                result.push(group);
            }
        }

        result
    }

    /// True if the host is in `group` directly or through a parent group
    pub fn has_group(&self, host: &Host, group: &str) -> bool {
        host.groups.iter().any(|g| g == group)
            || self.ancestry(host).iter().any(|g| g.name == group)
    }

    /// Host data, falling back to the data of its groups
    pub fn get_data<'a>(&'a self, host: &'a Host, key: &str) -> Option<&'a Value> {
        host.data.get(key).or_else(|| {
            self.ancestry(host)
                .into_iter()
                .find_map(|group| group.data.get(key))
        })
    }

    /// [`Host::attribute`] with group data as the fallback
    pub fn attribute(&self, host: &Host, key: &str) -> Option<Value> {
        host.attribute(key)
            .or_else(|| self.get_data(host, key).cloned())
    }

    /// A new inventory holding the hosts that match `filter`, in order.
    ///
    /// The hosts are shared with `self`, which is left untouched.
    pub fn filter(&self, filter: &HostFilter) -> Inventory {
        let mut filtered = Inventory {
            hosts: Vec::new(),
            index: HashMap::new(),
            groups: self.groups.clone(),
        };

        for host in &self.hosts {
            if filter.matches(self, host) {
                filtered.insert_shared(host.clone());
            }
        }

        filtered
    }

    pub fn to_value(&self) -> Value {
        let groups: serde_json::Map<String, Value> = self
            .groups
            .values()
            .map(|g| {
                (
                    g.name.clone(),
                    json!({ "groups": g.groups, "data": g.data }),
                )
            })
            .collect();

        json!({
            "hosts": self.hosts.iter().map(|h| h.to_value()).collect::<Vec<_>>(),
            "groups": groups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionPlugin;
    use crate::output::errors::ConnectionError;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConnection {
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl ConnectionPlugin for CountingConnection {
        fn open(&mut self, _options: &ConnectionOptions) -> Result<(), ConnectionError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) -> Result<(), ConnectionError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn counting_registry() -> (ConnectionRegistry, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let (o, c) = (opens.clone(), closes.clone());
        let registry = ConnectionRegistry::empty()
            .with("ssh", {
                let (o, c) = (o.clone(), c.clone());
                move || {
                    Box::new(CountingConnection {
                        opens: o.clone(),
                        closes: c.clone(),
                    }) as Box<dyn ConnectionPlugin>
                }
            })
            .with("netconf", move || {
                Box::new(CountingConnection {
                    opens: o.clone(),
                    closes: c.clone(),
                }) as Box<dyn ConnectionPlugin>
            });
        (registry, opens, closes)
    }

    fn sample_inventory() -> Inventory {
        Inventory::new()
            .with_group(Group::new("global").with_data("ntp", "10.0.0.1"))
            .with_group(
                Group::new("core")
                    .with_parent("global")
                    .with_data("site", "bma"),
            )
            .with_group(Group::new("edge").with_data("site", "cmh"))
            .with_host(
                Host::new("r1")
                    .with_group("core")
                    .with_platform("eos")
                    .with_data("role", "spine"),
            )
            .with_host(Host::new("r2").with_group("edge").with_platform("junos"))
            .with_host(Host::new("r3").with_group("core").with_data("site", "lab"))
    }

    #[test]
    fn test_connection_opened_once() {
        let (registry, opens, _) = counting_registry();
        let host = Host::new("r1");

        let first = host.get_connection("ssh", &registry, None).unwrap();
        let second = host.get_connection("ssh", &registry, None).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(host.connected("ssh"));
    }

    #[test]
    fn test_open_connection_rejects_duplicates() {
        let (registry, _, _) = counting_registry();
        let host = Host::new("r1");

        host.open_connection("ssh", &registry, None).unwrap();
        assert!(matches!(
            host.open_connection("ssh", &registry, None),
            Err(DispatchError::ConnectionAlreadyOpen { .. })
        ));
    }

    #[test]
    fn test_unknown_connection_type() {
        let (registry, _, _) = counting_registry();
        let host = Host::new("r1");

        assert!(matches!(
            host.get_connection("telnet", &registry, None),
            Err(DispatchError::UnknownConnection { .. })
        ));
        assert!(host.connection_names().is_empty());
    }

    #[test]
    fn test_close_connections_empties_table() {
        let (registry, opens, closes) = counting_registry();
        let host = Host::new("r1");
        host.get_connection("ssh", &registry, None).unwrap();
        host.get_connection("netconf", &registry, None).unwrap();
        assert_eq!(host.connection_names(), vec!["netconf", "ssh"]);

        host.close_connections();
        assert!(host.connection_names().is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 2);

        // closing again is a no-op
        host.close_connections();
        host.close_connection("ssh");
        assert_eq!(closes.load(Ordering::SeqCst), 2);

        // a closed connection can be reopened
        host.get_connection("ssh", &registry, None).unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_group_inheritance() {
        let inv = sample_inventory();
        let r1 = inv.host("r1").unwrap();
        let r3 = inv.host("r3").unwrap();

        assert!(inv.has_group(r1, "core"));
        assert!(inv.has_group(r1, "global"));
        assert!(!inv.has_group(r1, "edge"));
        assert_eq!(inv.get_data(r1, "ntp"), Some(&json!("10.0.0.1")));
        assert_eq!(inv.get_data(r1, "site"), Some(&json!("bma")));
        assert_eq!(inv.get_data(r3, "site"), Some(&json!("lab")));
        assert_eq!(inv.get_data(r1, "missing"), None);
    }

    #[test]
    fn test_group_cycle_terminates() {
        let inv = Inventory::new()
            .with_group(Group::new("a").with_parent("b"))
            .with_group(Group::new("b").with_parent("a"))
            .with_host(Host::new("h").with_group("a"));

        let host = inv.host("h").unwrap();
        assert_eq!(inv.ancestry(host).len(), 2);
        assert!(!inv.has_group(host, "c"));
    }

    #[test]
    fn test_add_host_replaces_in_place() {
        let mut inv = sample_inventory();
        inv.add_host(Host::new("r2").with_platform("iosxr"));

        assert_eq!(inv.names(), vec!["r1", "r2", "r3"]);
        assert_eq!(inv.host("r2").unwrap().platform.as_deref(), Some("iosxr"));
    }

    #[test]
    fn test_filter_shares_hosts_and_keeps_parent() {
        let inv = sample_inventory();
        let core = inv.filter(&HostFilter::new().group("core"));

        assert_eq!(core.names(), vec!["r1", "r3"]);
        assert_eq!(inv.len(), 3);
        assert!(Arc::ptr_eq(core.host("r1").unwrap(), inv.host("r1").unwrap()));
    }
}
