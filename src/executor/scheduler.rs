// Serial and parallel task scheduler

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::debug;

use super::result::AggregatedResult;
use super::task::TaskContext;
use crate::inventory::Host;
use crate::output::errors::DispatchError;

/// Runs one bound task against a list of hosts
pub struct Scheduler {
    context: TaskContext,
    hosts: Vec<Arc<Host>>,
}

impl Scheduler {
    pub fn new(context: TaskContext, hosts: Vec<Arc<Host>>) -> Self {
        Scheduler { context, hosts }
    }

    /// Run on each host in turn, on the calling thread
    pub fn run_serial(&self) -> AggregatedResult {
        debug!(task = %self.context.name(), hosts = self.hosts.len(), "running serially");

        let mut result = AggregatedResult::new(self.context.name());
        for host in &self.hosts {
            result.push(self.context.start(host));
        }
        result
    }

    /// Run on up to `num_workers` hosts at a time, each on a blocking worker
    /// thread.
    ///
    /// Results come back in host order whatever order the workers finish
    /// in. Task failures are recorded per host; an `Err` here means the
    /// worker pool itself failed.
    pub async fn run_parallel(&self, num_workers: usize) -> Result<AggregatedResult, DispatchError> {
        let mut result = AggregatedResult::new(self.context.name());
        if self.hosts.is_empty() {
            return Ok(result);
        }

        let workers = num_workers.clamp(1, self.hosts.len());
        debug!(
            task = %self.context.name(),
            hosts = self.hosts.len(),
            workers,
            "running in parallel"
        );

        // Semaphore to limit concurrent hosts
        let semaphore = Arc::new(Semaphore::new(workers));

        let futures: Vec<_> = self
            .hosts
            .iter()
            .map(|host| {
                let sem = semaphore.clone();
                let context = self.context.clone();
                let host = host.clone();

                async move {
                    let permit = sem
                        .acquire_owned()
                        .await
                        .map_err(|e| DispatchError::Pool(format!("semaphore closed: {}", e)))?;

                    tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        context.start(&host)
                    })
                    .await
                    .map_err(|e| DispatchError::Pool(format!("worker failed: {}", e)))
                }
            })
            .collect();

        for outcome in join_all(futures).await {
            result.push(outcome?);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{task_fn, Outcome, TaskHandle, TaskParams};
    use crate::session::SessionData;
    use anyhow::anyhow;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn hosts(names: &[&str]) -> Vec<Arc<Host>> {
        names.iter().map(|n| Arc::new(Host::new(*n))).collect()
    }

    fn context<F>(func: F) -> TaskContext
    where
        F: Fn(&mut TaskHandle<'_>, &TaskParams) -> anyhow::Result<Outcome> + Send + Sync + 'static,
    {
        TaskContext::new(
            Arc::new(task_fn("probe", func)),
            TaskParams::new(),
            Arc::new(SessionData::default()),
        )
    }

    // Later hosts finish first so completion order is reversed.
    fn staggered(handle: &mut TaskHandle<'_>, _: &TaskParams) -> anyhow::Result<Outcome> {
        let index: u64 = handle.host().name[1..].parse()?;
        thread::sleep(Duration::from_millis(60 - index * 10));
        if handle.host().name == "h2" {
            return Err(anyhow!("h2 is down"));
        }
        Ok(Outcome::ok(handle.host().name.clone()))
    }

    #[test]
    fn test_serial_runs_on_calling_thread_in_order() {
        let caller = thread::current().id();
        let ctx = context(move |handle: &mut TaskHandle<'_>, _: &TaskParams| {
            assert_eq!(thread::current().id(), caller);
            Ok(Outcome::ok(handle.host().name.clone()))
        });
        let scheduler = Scheduler::new(ctx, hosts(&["c", "a", "b"]));

        let result = scheduler.run_serial();
        assert_eq!(result.hosts(), vec!["c", "a", "b"]);
        assert!(!result.failed());
    }

    #[tokio::test]
    async fn test_parallel_keeps_host_order() {
        let scheduler = Scheduler::new(context(staggered), hosts(&["h1", "h2", "h3", "h4", "h5"]));

        let result = scheduler.run_parallel(5).await.unwrap();
        assert_eq!(result.hosts(), vec!["h1", "h2", "h3", "h4", "h5"]);
        assert_eq!(result.failed_host_names(), vec!["h2".to_string()]);
    }

    #[tokio::test]
    async fn test_parallel_matches_serial() {
        let names = ["h1", "h2", "h3", "h4"];
        let serial = Scheduler::new(context(staggered), hosts(&names)).run_serial();
        let parallel = Scheduler::new(context(staggered), hosts(&names))
            .run_parallel(3)
            .await
            .unwrap();

        assert_eq!(serial.as_map(), parallel.as_map());
    }

    #[tokio::test]
    async fn test_parallel_respects_worker_bound() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());

        let ctx = context(move |_: &mut TaskHandle<'_>, _: &TaskParams| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(Outcome::none())
        });
        let scheduler = Scheduler::new(ctx, hosts(&["a", "b", "c", "d", "e", "f", "g", "h"]));

        let result = scheduler.run_parallel(3).await.unwrap();
        assert_eq!(result.len(), 8);
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak > 1, "expected concurrent execution, peak was {}", peak);
        assert!(peak <= 3, "worker bound exceeded, peak was {}", peak);
    }

    #[tokio::test]
    async fn test_parallel_isolates_panics() {
        let ctx = context(|handle: &mut TaskHandle<'_>, _: &TaskParams| {
            if handle.host().name == "b" {
                panic!("driver crashed");
            }
            Ok(Outcome::changed("done"))
        });
        let scheduler = Scheduler::new(ctx, hosts(&["a", "b", "c"]));

        let result = scheduler.run_parallel(2).await.unwrap();
        assert_eq!(result.len(), 3);
        assert!(result["b"].exception.as_ref().unwrap().is_panic());
        assert!(result["a"].changed);
        assert!(result["c"].changed);
    }

    #[tokio::test]
    async fn test_parallel_with_no_hosts() {
        let scheduler = Scheduler::new(
            context(|_: &mut TaskHandle<'_>, _: &TaskParams| Ok(Outcome::none())),
            Vec::new(),
        );
        let result = scheduler.run_parallel(4).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.name(), "probe");
    }
}
