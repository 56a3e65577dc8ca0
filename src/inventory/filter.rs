// Host selection criteria for narrowing an inventory

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::{Host, Inventory};

type Predicate = Arc<dyn Fn(&Host) -> bool + Send + Sync>;

/// Criteria a host must all satisfy to be kept.
///
/// An empty filter keeps every host.
#[derive(Clone, Default)]
pub struct HostFilter {
    attrs: Vec<(String, Value)>,
    groups: Vec<String>,
    predicates: Vec<Predicate>,
}

impl HostFilter {
    pub fn new() -> Self {
        HostFilter::default()
    }

    /// Keep only the host with this name
    pub fn name(self, name: impl Into<String>) -> Self {
        self.attr("name", Value::String(name.into()))
    }

    /// Exact equality on a host attribute or data key.
    ///
    /// Data keys missing from the host are looked up in its groups.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    /// Membership in a group, directly or through a parent group
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    /// An arbitrary predicate over the host
    pub fn func<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Host) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty() && self.groups.is_empty() && self.predicates.is_empty()
    }

    pub fn matches(&self, inventory: &Inventory, host: &Host) -> bool {
        self.attrs
            .iter()
            .all(|(key, expected)| inventory.attribute(host, key).as_ref() == Some(expected))
            && self.groups.iter().all(|g| inventory.has_group(host, g))
            && self.predicates.iter().all(|p| p(host))
    }
}

impl fmt::Debug for HostFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFilter")
            .field("attrs", &self.attrs)
            .field("groups", &self.groups)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}
