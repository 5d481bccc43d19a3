//! In-process collaborator implementations.
//!
//! [`FixedAgentPool`] hands out seats from a fixed roster and runs prompts on
//! them through a pluggable [`TaskRunner`]; [`InMemoryEventBus`] fans events
//! out over a tokio broadcast channel. Both are what the CLI binds for local
//! runs, and what tests bind instead of real infrastructure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::traits::{AgentAllocator, EventBus, TaskOptions, TaskResult};

/// The default roster.
pub const DEFAULT_ROSTER: [&str; 5] = ["alex", "betty", "cleo", "dany", "eddy"];

/// Executes one prompt on behalf of an allocated agent.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, agent_id: &str, prompt: &str, options: &TaskOptions) -> anyhow::Result<String>;
}

/// Dry-run runner: answers every prompt with the prompt itself.
pub struct EchoRunner;

#[async_trait]
impl TaskRunner for EchoRunner {
    async fn run(&self, _agent_id: &str, prompt: &str, _options: &TaskOptions) -> anyhow::Result<String> {
        Ok(prompt.to_owned())
    }
}

struct Seat {
    role: String,
    _permit: OwnedSemaphorePermit,
}

/// A fixed set of named agent seats.
///
/// `request` waits for a free seat when all are taken; dropping the seat's
/// permit on `release` wakes the next waiter.
pub struct FixedAgentPool {
    roster: Vec<String>,
    permits: Arc<Semaphore>,
    busy: Mutex<HashMap<String, Seat>>,
    runner: Arc<dyn TaskRunner>,
    tasks_run: AtomicUsize,
}

impl FixedAgentPool {
    pub fn new<I, S>(roster: I, runner: Arc<dyn TaskRunner>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let roster: Vec<String> = roster.into_iter().map(Into::into).collect();
        Self {
            permits: Arc::new(Semaphore::new(roster.len())),
            roster,
            busy: Mutex::new(HashMap::new()),
            runner,
            tasks_run: AtomicUsize::new(0),
        }
    }

    /// The first `size` names of the default roster, numbered past five.
    pub fn with_size(size: usize, runner: Arc<dyn TaskRunner>) -> Self {
        let roster = (0..size).map(|i| match DEFAULT_ROSTER.get(i) {
            Some(name) => (*name).to_owned(),
            None => format!("agent-{}", i + 1),
        });
        Self::new(roster, runner)
    }

    /// Seats not currently allocated.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Tasks dispatched to the runner so far.
    pub fn tasks_run(&self) -> usize {
        self.tasks_run.load(Ordering::Relaxed)
    }

    fn busy(&self) -> std::sync::MutexGuard<'_, HashMap<String, Seat>> {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AgentAllocator for FixedAgentPool {
    async fn request(&self, role_id: &str) -> Result<String, String> {
        if self.roster.is_empty() {
            return Err("configuration error: agent pool has no seats".into());
        }
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| "agent pool closed".to_string())?;

        let mut busy = self.busy();
        let name = self
            .roster
            .iter()
            .find(|name| !busy.contains_key(*name))
            .cloned()
            .ok_or_else(|| "no free seat despite a permit".to_string())?;
        busy.insert(name.clone(), Seat { role: role_id.to_owned(), _permit: permit });
        debug!(agent_id = %name, role = role_id, "seat assigned");
        Ok(name)
    }

    async fn release(&self, agent_id: &str) -> Result<(), String> {
        match self.busy().remove(agent_id) {
            Some(seat) => {
                debug!(agent_id, role = %seat.role, "seat freed");
                Ok(())
            }
            None => Err(format!("agent '{agent_id}' is not allocated")),
        }
    }

    async fn run_task(&self, agent_id: &str, prompt: &str, options: &TaskOptions) -> Result<TaskResult, String> {
        if !self.busy().contains_key(agent_id) {
            return Err(format!("agent '{agent_id}' is not allocated"));
        }
        self.tasks_run.fetch_add(1, Ordering::Relaxed);
        info!(agent_id, prompt_len = prompt.len(), "running agent task");

        let run = self.runner.run(agent_id, prompt, options);
        let result = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("task timed out after {}s", limit.as_secs())),
            },
            None => run.await,
        };

        Ok(match result {
            Ok(output) => TaskResult { success: true, output },
            Err(e) => TaskResult { success: false, output: e.to_string() },
        })
    }
}

/// Broadcast-backed event bus. Waiters only observe events emitted after
/// they started waiting.
pub struct InMemoryEventBus {
    tx: broadcast::Sender<(String, Value)>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn emit(&self, event_type: &str, payload: Value) -> Result<(), String> {
        // No subscribers is not an error; the event is simply unobserved.
        let receivers = self.tx.send((event_type.to_owned(), payload)).unwrap_or(0);
        debug!(event_type, receivers, "event emitted");
        Ok(())
    }

    async fn wait(&self, event_type: &str, timeout: Option<Duration>) -> Result<Value, String> {
        let mut rx = self.tx.subscribe();
        let next = async {
            loop {
                match rx.recv().await {
                    Ok((kind, payload)) if kind == event_type => return Ok(payload),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err("event bus closed".to_string()),
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, next)
                .await
                .map_err(|_| format!("timed out waiting for event '{event_type}'"))?,
            None => next.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn seats_are_exclusive_until_released() {
        let pool = Arc::new(FixedAgentPool::new(["alex", "betty"], Arc::new(EchoRunner)));
        let a = pool.request("dev").await.unwrap();
        let b = pool.request("dev").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.available(), 0);

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.request("qa").await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        pool.release(&a).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), a);
    }

    #[tokio::test]
    async fn release_of_unknown_agent_fails() {
        let pool = FixedAgentPool::with_size(1, Arc::new(EchoRunner));
        assert!(pool.release("nobody").await.is_err());
    }

    #[tokio::test]
    async fn run_task_echoes_and_counts() {
        let pool = FixedAgentPool::with_size(7, Arc::new(EchoRunner));
        assert_eq!(pool.available(), 7);
        let id = pool.request("dev").await.unwrap();
        assert_eq!(id, "alex");
        let result = pool.run_task(&id, "hello", &TaskOptions::default()).await.unwrap();
        assert_eq!(result, TaskResult { success: true, output: "hello".into() });
        assert_eq!(pool.tasks_run(), 1);
        assert!(pool.run_task("betty", "x", &TaskOptions::default()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_runner_times_out() {
        struct Slow;
        #[async_trait]
        impl TaskRunner for Slow {
            async fn run(&self, _: &str, _: &str, _: &TaskOptions) -> anyhow::Result<String> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("late".into())
            }
        }
        let pool = FixedAgentPool::with_size(1, Arc::new(Slow));
        let id = pool.request("dev").await.unwrap();
        let options = TaskOptions { timeout: Some(Duration::from_secs(1)), ..Default::default() };
        let result = pool.run_task(&id, "x", &options).await.unwrap();
        assert!(!result.success);
        assert!(result.output.contains("timed out"));
    }

    #[tokio::test]
    async fn wait_filters_by_type() {
        let bus = Arc::new(InMemoryEventBus::new());
        let waiter = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.wait("ready", Some(Duration::from_secs(5))).await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.emit("other", json!(1)).await.unwrap();
        bus.emit("ready", json!(2)).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let bus = InMemoryEventBus::new();
        let err = bus.wait("never", Some(Duration::from_millis(50))).await.unwrap_err();
        assert!(err.contains("timed out"));
    }
}
