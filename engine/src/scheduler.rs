//! Scheduler (C8): the four long-lived cooperative tasks per
//! deployment, a 5s supervisor that restarts any task that exits
//! (normally or with an error) without backoff, and coordinated
//! shutdown on `ctrl_c`.
//!
//! Loop/shutdown shape grounded on `momentum-trader/src/main.rs`'s
//! `tokio::select!` main loop (heartbeat interval + `ctrl_c` branch);
//! generalized here into a reusable supervisor since this engine runs
//! four independent loops rather than one.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

pub const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(5);

pub const MARKET_DETECTION_INTERVAL: Duration = Duration::from_secs(60);
pub const RESOLUTION_POLL_INTERVAL: Duration = Duration::from_secs(30);

type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type TaskFactory = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

struct Supervised {
    name: &'static str,
    factory: TaskFactory,
    handle: tokio::task::JoinHandle<Result<()>>,
}

/// Runs a closure on a fixed interval until it returns an error, which
/// propagates up to the supervisor as a task exit.
pub async fn interval_task<F, Fut>(interval: Duration, mut tick: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        tick().await?;
    }
}

/// Owns the deployment's cooperative tasks and supervises them.
#[derive(Default)]
pub struct Scheduler {
    specs: Vec<(&'static str, TaskFactory)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task. `factory` is called once at startup and again
    /// every time the task needs to be restarted, so it must rebuild
    /// any per-task state fresh rather than closing over mutable state
    /// from a previous run.
    pub fn register<F, Fut>(&mut self, name: &'static str, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.specs.push((name, Arc::new(move || Box::pin(factory()) as BoxFuture)));
    }

    /// Spawns every registered task, then supervises until `ctrl_c` is
    /// received: every `SUPERVISOR_INTERVAL` it reaps and restarts any
    /// task that has exited, with no exponential backoff. On shutdown
    /// it aborts every task and awaits them before returning.
    pub async fn run(self) -> Result<()> {
        let mut supervised: Vec<Supervised> = self
            .specs
            .into_iter()
            .map(|(name, factory)| {
                let handle = tokio::spawn((factory)());
                Supervised { name, factory, handle }
            })
            .collect();

        info!(task_count = supervised.len(), "scheduler started");

        let mut tick = tokio::time::interval(SUPERVISOR_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received, stopping all tasks");
                    for task in &supervised {
                        task.handle.abort();
                    }
                    for task in supervised {
                        let _ = task.handle.await;
                    }
                    info!("all tasks stopped");
                    return Ok(());
                }
                _ = tick.tick() => {
                    for task in supervised.iter_mut() {
                        if task.handle.is_finished() {
                            match (&mut task.handle).await {
                                Ok(Ok(())) => warn!(name = task.name, "task exited normally, restarting"),
                                Ok(Err(e)) => error!(name = task.name, error = %e, "task exited with error, restarting"),
                                Err(join_err) => error!(name = task.name, panic = %join_err, "task panicked, restarting"),
                            }
                            task.handle = tokio::spawn((task.factory)());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn interval_task_ticks_and_propagates_errors() {
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            interval_task(Duration::from_millis(10), move || {
                let count = count2.clone();
                async move {
                    let n = count.fetch_add(1, Ordering::SeqCst);
                    if n >= 3 {
                        anyhow::bail!("stop after 3 ticks");
                    }
                    Ok(())
                }
            }),
        )
        .await;

        assert!(result.unwrap().is_err());
        assert!(count.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn registered_factory_rebuilds_state_on_each_call() {
        // `run`'s restart path calls the stored factory again rather than
        // reusing the original future; a factory must therefore produce
        // fresh, independently-runnable state on every invocation.
        let runs = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new();

        let runs_for_factory = runs.clone();
        scheduler.register("flaky", move || {
            let runs = runs_for_factory.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let (_, factory) = scheduler.specs.pop().unwrap();
        factory().await.unwrap();
        factory().await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
