//! Serialized Mutation Queue
//!
//! One FIFO queue per guild, each drained by its own worker task. A task
//! starts only after the previous task of the same guild finished, whether
//! it succeeded, failed or panicked. Guilds do not wait on each other.
//!
//! ```text
//! enqueue(g1, a) ─┐
//! enqueue(g1, b) ─┼─► [g1 worker] a ─ delay ─ b ─ delay ─ ...
//! enqueue(g2, c) ─┼─► [g2 worker] c ─ delay ─ ...
//! ```

use dashmap::DashMap;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, info_span, Instrument};

use crate::types::{BotError, GuildId, MemberId, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// What a queued task is about, used in its span and failure logs
#[derive(Debug, Clone)]
pub struct TaskLabel {
    pub name: &'static str,
    pub member_id: Option<MemberId>,
}

impl TaskLabel {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            member_id: None,
        }
    }

    pub fn member(name: &'static str, member_id: impl Into<MemberId>) -> Self {
        Self {
            name,
            member_id: Some(member_id.into()),
        }
    }
}

impl From<&'static str> for TaskLabel {
    fn from(name: &'static str) -> Self {
        TaskLabel::new(name)
    }
}

impl fmt::Display for TaskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.member_id {
            Some(member_id) => write!(f, "{}({})", self.name, member_id),
            None => f.write_str(self.name),
        }
    }
}

struct QueuedTask {
    label: TaskLabel,
    job: Job,
}

/// Completion signal of a queued task
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Handle of a task that was rejected before reaching a queue
    pub fn failed(error: BotError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { rx }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx.poll_unpin(cx).map(|received| {
            received.unwrap_or_else(|_| Err(BotError::Queue("task was dropped".into())))
        })
    }
}

/// Registry of per-guild queues, created lazily and kept for the process
/// lifetime
pub struct GuildQueues {
    queues: DashMap<GuildId, mpsc::UnboundedSender<QueuedTask>>,
    step_delay: Duration,
}

impl GuildQueues {
    /// `step_delay` is slept after every task, before the next one starts
    pub fn new(step_delay: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            step_delay,
        }
    }

    /// Append a task to the guild's queue. The returned handle resolves
    /// with the task's result once it ran.
    pub fn enqueue<F, T>(
        &self,
        guild_id: &str,
        label: impl Into<TaskLabel>,
        task: F,
    ) -> TaskHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let label = label.into();
        let (tx, rx) = oneshot::channel();

        let job_label = label.clone();
        let job_guild = guild_id.to_string();
        let job: Job = Box::pin(async move {
            let result = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(BotError::Internal("task panicked".into())),
            };
            if let Err(e) = &result {
                error!(
                    guild_id = %job_guild,
                    task = job_label.name,
                    member_id = job_label.member_id.as_deref().unwrap_or("-"),
                    error = %e,
                    "Guild task failed"
                );
            }
            // The caller may have stopped waiting
            let _ = tx.send(result);
        });

        let sender = self.sender(guild_id);
        if sender.send(QueuedTask { label, job }).is_err() {
            // Worker is gone; dropping the job resolves the handle with an error
            error!(guild_id = %guild_id, "Guild queue closed");
        }
        TaskHandle { rx }
    }

    fn sender(&self, guild_id: &str) -> mpsc::UnboundedSender<QueuedTask> {
        self.queues
            .entry(guild_id.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(guild_worker(guild_id.to_string(), rx, self.step_delay));
                info!(guild_id = %guild_id, "Started guild queue");
                tx
            })
            .clone()
    }

    /// Number of guild queues created so far
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

async fn guild_worker(
    guild_id: GuildId,
    mut rx: mpsc::UnboundedReceiver<QueuedTask>,
    step_delay: Duration,
) {
    while let Some(task) = rx.recv().await {
        let span = info_span!("guild_task", guild_id = %guild_id, task = %task.label);
        debug!(guild_id = %guild_id, task = %task.label, "Running guild task");
        task.job.instrument(span).await;

        if !step_delay.is_zero() {
            tokio::time::sleep(step_delay).await;
        }
    }
    debug!(guild_id = %guild_id, "Guild queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_tasks_run_in_order() {
        let queues = GuildQueues::new(Duration::ZERO);
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (i, delay) in [30u64, 10, 20].into_iter().enumerate() {
            let log = log.clone();
            handles.push(queues.enqueue("g1", "step", async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().await.push(i);
                Ok(i)
            }));
        }

        let results: Vec<usize> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(results, vec![0, 1, 2]);
        assert_eq!(*log.lock().await, vec![0, 1, 2]);
        assert_eq!(queues.queue_count(), 1);
    }

    #[tokio::test]
    async fn test_failures_and_panics_do_not_block() {
        let queues = GuildQueues::new(Duration::ZERO);

        let failed = queues.enqueue("g1", "fails", async {
            Err::<(), _>(BotError::Platform("boom".into()))
        });
        let panicked = queues.enqueue("g1", "panics", async {
            if true {
                panic!("task panic");
            }
            Ok(())
        });
        let after = queues.enqueue("g1", TaskLabel::member("after", "m1"), async { Ok(7) });

        assert!(matches!(failed.await, Err(BotError::Platform(_))));
        assert!(matches!(panicked.await, Err(BotError::Internal(_))));
        assert_eq!(after.await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guilds_run_concurrently_with_step_delay() {
        let queues = GuildQueues::new(Duration::from_millis(100));
        let start = Instant::now();

        let slow = |ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(())
        };
        let a1 = queues.enqueue("g1", "a1", slow(500));
        let a2 = queues.enqueue("g1", "a2", slow(500));
        let b1 = queues.enqueue("g2", "b1", slow(500));

        b1.await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(600));
        a1.await.unwrap();
        a2.await.unwrap();
        // Second task waits for the first plus the step delay
        assert!(start.elapsed() >= Duration::from_millis(1100));
        assert_eq!(queues.queue_count(), 2);
    }

    #[test]
    fn test_label_display() {
        assert_eq!(TaskLabel::member("sync", "42").to_string(), "sync(42)");
        assert_eq!(TaskLabel::from("reconcile").to_string(), "reconcile");
    }
}
