// Nexus Dispatch - task dispatch engine for fleets of hosts
//
// Runs a unit of work against a filterable inventory of network devices or
// servers, serially or across a bounded worker pool, and keeps track of
// which hosts failed across runs.

pub mod config;
pub mod connections;
pub mod executor;
pub mod inventory;
pub mod output;
pub mod session;

pub use config::{init_logging, Config, LoggingConfig};
pub use connections::{ConnectionOptions, ConnectionPlugin, ConnectionRegistry};
pub use executor::{task_fn, AggregatedResult, Outcome, Task, TaskHandle, TaskParams, TaskResult};
pub use inventory::{Group, Host, HostFilter, Inventory};
pub use output::{print_result, ConnectionError, DispatchError, PrintOptions};
pub use session::{init_session, RunOptions, Session, SessionData};

/// Version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::executor::{task_fn, AggregatedResult, Outcome, Task, TaskHandle, TaskParams};
    pub use crate::inventory::{Group, Host, HostFilter, Inventory};
    pub use crate::output::DispatchError;
    pub use crate::session::{RunOptions, Session};
}
