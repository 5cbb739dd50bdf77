//! # Task Group
//!
//! A scoped set of sibling tokio tasks with an optional cap on how many run at
//! the same time.
//!
//! ## Semantics
//!
//! - [`TaskGroup::spawn`] waits for a free slot before starting the member when
//!   the group is capped, so callers get backpressure simply by awaiting it.
//!   The slot is released when the member finishes, whatever the outcome.
//! - [`TaskGroup::wait`] is the normal exit: it drains every member.
//! - Dropping the group (for example when an error is propagated with `?` out
//!   of the code that owns it) or calling [`TaskGroup::cancel`] aborts every
//!   outstanding member.
//! - [`TaskGroup::gather`] collects every member's result, in creation order,
//!   without failing because one member panicked.
//!
//! ```ignore
//! let mut group = TaskGroup::with_limit(4);
//! for url in urls {
//!     group.spawn(fetch(url)).await?;
//! }
//! let results = group.gather().await;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{Instrument, debug, trace, warn};

/// Errors returned by the group itself (never by its members).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskGroupError {
    #[error("task group is closed")]
    Closed,
}

/// Why a member did not produce a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    #[error("task '{name}' panicked: {message}")]
    Panicked { name: String, message: String },

    #[error("task '{name}' was cancelled")]
    Cancelled { name: String },
}

impl TaskFailure {
    /// Name of the member that failed.
    pub fn name(&self) -> &str {
        match self {
            TaskFailure::Panicked { name, .. } | TaskFailure::Cancelled { name } => name,
        }
    }
}

/// Point-in-time view of the group counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskGroupStats {
    /// Members currently running.
    pub active: usize,
    /// Members ever started by this group.
    pub total_created: u64,
    /// Members that reached a terminal state (finished, panicked or aborted).
    pub total_completed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    total_created: AtomicU64,
    total_completed: AtomicU64,
}

/// Moved into every member future so the counters stay correct even when the
/// member is aborted before it is ever polled.
struct CompletionGuard(Arc<Counters>);

impl CompletionGuard {
    fn start(counters: Arc<Counters>) -> Self {
        counters.active.fetch_add(1, Ordering::Relaxed);
        counters.total_created.fetch_add(1, Ordering::Relaxed);
        Self(counters)
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
        self.0.total_completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A scoped group of sibling tasks returning `T`.
pub struct TaskGroup<T> {
    tasks: JoinSet<T>,
    semaphore: Option<Arc<Semaphore>>,
    limit: Option<usize>,
    counters: Arc<Counters>,
    /// Creation index and name of each member, by tokio task id.
    members: HashMap<Id, (usize, String)>,
    closed: bool,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Create an unbounded group.
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            semaphore: None,
            limit: None,
            counters: Arc::new(Counters::default()),
            members: HashMap::new(),
            closed: false,
        }
    }

    /// Create a group running at most `limit` members at once.
    ///
    /// A limit of zero is treated as one.
    pub fn with_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            tasks: JoinSet::new(),
            semaphore: Some(Arc::new(Semaphore::new(limit))),
            limit: Some(limit),
            counters: Arc::new(Counters::default()),
            members: HashMap::new(),
            closed: false,
        }
    }

    /// Concurrency cap, if any.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Start a member, waiting for a free slot first if the group is capped.
    pub async fn spawn<F>(&mut self, future: F) -> Result<(), TaskGroupError>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let name = format!("task-{}", self.members.len());
        self.spawn_named(name, future).await
    }

    /// Start a named member. The name shows up in tracing spans and failures.
    pub async fn spawn_named<F>(
        &mut self,
        name: impl Into<String>,
        future: F,
    ) -> Result<(), TaskGroupError>
    where
        F: Future<Output = T> + Send + 'static,
    {
        if self.closed {
            return Err(TaskGroupError::Closed);
        }

        let name = name.into();
        let permit = match &self.semaphore {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| TaskGroupError::Closed)?,
            ),
            None => None,
        };

        let guard = CompletionGuard::start(self.counters.clone());
        let span = tracing::debug_span!("task_group.member", task = %name);
        let handle = self.tasks.spawn(
            async move {
                let _permit = permit;
                let _guard = guard;
                future.await
            }
            .instrument(span),
        );

        trace!(task = %name, "Task group member started");
        let index = self.members.len();
        self.members.insert(handle.id(), (index, name));
        Ok(())
    }

    /// Refuse further members. Already running members are unaffected.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of members that have not been joined yet.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Members currently running.
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::Relaxed)
    }

    pub fn total_created(&self) -> u64 {
        self.counters.total_created.load(Ordering::Relaxed)
    }

    pub fn total_completed(&self) -> u64 {
        self.counters.total_completed.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> TaskGroupStats {
        TaskGroupStats {
            active: self.active(),
            total_created: self.total_created(),
            total_completed: self.total_completed(),
        }
    }

    /// Drain every member and discard the results.
    ///
    /// Panicking members are logged, not propagated.
    pub async fn wait(mut self) -> TaskGroupStats {
        self.close();
        while let Some(result) = self.tasks.join_next_with_id().await {
            if let Err(e) = result {
                let failure = self.failure_from(e);
                warn!(error = %failure, "Task group member failed");
            }
        }
        self.stats()
    }

    /// Drain every member and return the results in creation order.
    pub async fn gather(mut self) -> Vec<Result<T, TaskFailure>> {
        self.close();

        let mut slots: Vec<Option<Result<T, TaskFailure>>> =
            (0..self.members.len()).map(|_| None).collect();

        while let Some(result) = self.tasks.join_next_with_id().await {
            let (id, outcome) = match result {
                Ok((id, value)) => (id, Ok(value)),
                Err(e) => (e.id(), Err(self.failure_from(e))),
            };
            if let Some((index, _)) = self.members.get(&id) {
                slots[*index] = Some(outcome);
            }
        }

        let mut names: Vec<(usize, String)> = self.members.values().cloned().collect();
        names.sort_unstable_by_key(|(index, _)| *index);

        slots
            .into_iter()
            .zip(names)
            .map(|(slot, (_, name))| slot.unwrap_or(Err(TaskFailure::Cancelled { name })))
            .collect()
    }

    /// Abort every outstanding member and wait for them to unwind.
    ///
    /// Cancellation errors raised while unwinding are swallowed.
    pub async fn cancel(mut self) -> TaskGroupStats {
        self.close();
        let outstanding = self.tasks.len();
        if outstanding > 0 {
            debug!(outstanding, "Cancelling task group members");
        }
        self.tasks.abort_all();

        while let Some(result) = self.tasks.join_next_with_id().await {
            match result {
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    let failure = self.failure_from(e);
                    warn!(error = %failure, "Task group member failed while cancelling");
                }
                Ok(_) => {}
            }
        }
        self.stats()
    }

    fn failure_from(&self, error: JoinError) -> TaskFailure {
        let name = self
            .members
            .get(&error.id())
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| "unknown".to_string());

        if error.is_panic() {
            TaskFailure::Panicked {
                name,
                message: panic_message(error.into_panic()),
            }
        } else {
            TaskFailure::Cancelled { name }
        }
    }
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TaskGroup<T> {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            // JoinSet aborts its tasks when dropped.
            debug!(
                outstanding = self.tasks.len(),
                "Task group dropped with outstanding members, aborting"
            );
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_wait_drains_all_members() {
        let mut group = TaskGroup::new();
        for i in 0..5u64 {
            group
                .spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100 * i)).await;
                })
                .await
                .unwrap();
        }

        assert_eq!(group.total_created(), 5);
        let stats = group.wait().await;
        assert_eq!(stats.total_completed, 5);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_bounds_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut group = TaskGroup::with_limit(2);
        assert_eq!(group.limit(), Some(2));

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            group
                .spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            assert!(group.active() <= 2);
        }

        group.wait().await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_limit_is_treated_as_one() {
        let group: TaskGroup<()> = TaskGroup::with_limit(0);
        assert_eq!(group.limit(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gather_keeps_creation_order_and_captures_panics() {
        let mut group = TaskGroup::new();
        group
            .spawn_named("slow", async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                1
            })
            .await
            .unwrap();
        group
            .spawn_named("broken", async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if true {
                    panic!("boom");
                }
                2
            })
            .await
            .unwrap();
        group.spawn_named("fast", async { 3 }).await.unwrap();

        let results = group.gather().await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], Ok(1));
        match &results[1] {
            Err(TaskFailure::Panicked { name, message }) => {
                assert_eq!(name, "broken");
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(results[2], Ok(3));
    }

    #[tokio::test]
    async fn test_spawn_after_close_fails() {
        let mut group: TaskGroup<()> = TaskGroup::new();
        group.close();
        assert!(group.is_closed());
        assert_eq!(group.spawn(async {}).await, Err(TaskGroupError::Closed));
        assert_eq!(group.total_created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_outstanding_members() {
        let finished = Arc::new(AtomicBool::new(false));

        async fn surrounding_step() -> Result<(), &'static str> {
            Err("surrounding code failed")
        }

        async fn failing_scope(finished: Arc<AtomicBool>) -> Result<(), &'static str> {
            let mut group = TaskGroup::new();
            group
                .spawn(async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    finished.store(true, Ordering::SeqCst);
                })
                .await
                .map_err(|_| "closed")?;

            surrounding_step().await?;
            group.wait().await;
            Ok(())
        }

        let result = failing_scope(finished.clone()).await;
        assert_eq!(result, Err("surrounding code failed"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_swallows_cancellation() {
        let mut group = TaskGroup::with_limit(4);
        for _ in 0..3 {
            group
                .spawn(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                })
                .await
                .unwrap();
        }
        // Let the members start.
        tokio::task::yield_now().await;

        let stats = group.cancel().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total_created, 3);
        assert_eq!(stats.total_completed, 3);
    }

    #[tokio::test]
    async fn test_failure_name() {
        let failure = TaskFailure::Cancelled {
            name: "collector".to_string(),
        };
        assert_eq!(failure.name(), "collector");
        assert_eq!(failure.to_string(), "task 'collector' was cancelled");
    }
}
