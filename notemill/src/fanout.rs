// Copyright (C) 2025 The notemill authors
//
// This file is part of notemill.
//
// notemill is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// notemill is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with notemill.  If not,
// see <http://www.gnu.org/licenses/>.

//! # fan-out
//!
//! Write events (a note created, updated or deleted) land on a bounded in-process queue; a single
//! long-running consumer turns each into per-follower effects: cache invalidations & stream
//! pushes. The single consumer is intentional — it bounds the load one burst of writes can put on
//! the follow graph.
//!
//! Backpressure here is *shedding*, not blocking: when the queue is full the oldest task is
//! dropped and a counter incremented, and the write path never waits. That is a deliberate
//! partial-failure policy; a missed invalidation only means a stale cached timeline until its TTL
//! expires.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::Poll,
    time::Duration,
};

use pin_project::pin_project;
use snafu::{ResultExt, Snafu};
use tokio::{
    sync::Notify,
    task::{JoinError, JoinHandle},
};
use tracing::{debug, warn};

use crate::{
    cache::TimelineCache,
    counter_add, gauge_setu,
    entities::{Note, TimelineUpdate, UpdateType},
    metrics::{self, Instruments, Sort},
    storage::FollowGraph,
    streaming::SessionRegistry,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Timed out shutting down the fan-out worker: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
    },
    #[snafu(display("The fan-out worker did not run to completion: {source}"))]
    Join { source: tokio::task::JoinError },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        tasks & the queue                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// One write event awaiting fan-out
#[derive(Clone, Debug)]
pub struct FanoutTask {
    pub note: Note,
    pub kind: EventKind,
}

inventory::submit! { metrics::Registration::new("fanout.sheds", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fanout.queue.depth", Sort::IntegralGauge) }

/// The bounded FIFO between the write path & the worker. Multi-producer (any handler may submit),
/// single-consumer (the worker).
pub struct FanoutQueue {
    tasks: Mutex<VecDeque<FanoutTask>>,
    notify: Notify,
    capacity: usize,
    instruments: Arc<Instruments>,
}

impl FanoutQueue {
    pub fn new(capacity: usize, instruments: Arc<Instruments>) -> FanoutQueue {
        FanoutQueue {
            tasks: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: std::cmp::max(1, capacity),
            instruments,
        }
    }
    /// Enqueue a task, shedding the oldest one if the queue is full. Never blocks.
    pub fn submit(&self, task: FanoutTask) {
        let depth = {
            let mut tasks = self.tasks.lock().expect("fanout queue lock poisoned");
            if tasks.len() >= self.capacity {
                tasks.pop_front();
                counter_add!(self.instruments, "fanout.sheds", 1, &[]);
                warn!("fan-out queue full; shed the oldest task");
            }
            tasks.push_back(task);
            tasks.len()
        };
        gauge_setu!(self.instruments, "fanout.queue.depth", depth as u64, &[]);
        self.notify.notify_one();
    }
    fn pop(&self) -> Option<FanoutTask> {
        self.tasks.lock().expect("fanout queue lock poisoned").pop_front()
    }
    /// Wait until a task is available, then take it
    async fn recv(&self) -> FanoutTask {
        loop {
            if let Some(task) = self.pop() {
                return task;
            }
            self.notify.notified().await;
        }
    }
    pub fn depth(&self) -> usize {
        self.tasks.lock().expect("fanout queue lock poisoned").len()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, serde::Deserialize)]
pub struct Config {
    /// Bound on queued tasks; beyond it the oldest is shed
    #[serde(rename = "queue-capacity")]
    pub queue_capacity: usize,
    /// Followers handled between cooperative yields
    #[serde(rename = "batch-size")]
    pub batch_size: usize,
    /// Follow-graph lookup attempts before a task is dropped
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,
    /// Base of the exponential backoff between attempts
    #[serde(rename = "backoff-ms")]
    pub backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queue_capacity: 1024,
            batch_size: 1000,
            max_attempts: 3,
            backoff_ms: 100,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the worker                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("fanout.tasks.processed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fanout.tasks.dropped", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fanout.graph.retries", Sort::IntegralCounter) }

/// Everything the worker needs to turn one task into its effects
#[derive(Clone)]
pub struct Context {
    pub graph: Arc<dyn FollowGraph + Send + Sync>,
    pub cache: Arc<TimelineCache>,
    pub registry: Arc<SessionRegistry>,
}

fn update_for(task: &FanoutTask) -> TimelineUpdate {
    match task.kind {
        EventKind::Created => TimelineUpdate {
            update_type: UpdateType::NewItems,
            affected_note_id: Some(task.note.id().clone()),
            affected_items: Vec::new(),
        },
        EventKind::Updated => TimelineUpdate::item_updated(task.note.id().clone()),
        EventKind::Deleted => TimelineUpdate::item_deleted(task.note.id().clone()),
    }
}

async fn handle_task(
    task: FanoutTask,
    context: &Context,
    config: &Config,
    instruments: &Arc<Instruments>,
) {
    let author = task.note.author_id().clone();
    // The follow-graph lookup is the only remote call here; retry it with exponential backoff,
    // then give up and drop the task. Correctness is eventual: the TTL is the backstop.
    let mut followers = None;
    for attempt in 1..=config.max_attempts {
        match context.graph.followers_of(&author).await {
            Ok(list) => {
                followers = Some(list);
                break;
            }
            Err(err) => {
                warn!(author = %author, attempt, "follow-graph lookup failed: {err}");
                counter_add!(instruments, "fanout.graph.retries", 1, &[]);
                if attempt < config.max_attempts {
                    let backoff = config.backoff_ms.saturating_mul(1 << (attempt - 1));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }
    let Some(followers) = followers else {
        counter_add!(instruments, "fanout.tasks.dropped", 1, &[]);
        return;
    };

    // Updated & deleted notes may sit in caches of viewers who never followed the author (they
    // arrived via trending, say); the author index catches those.
    if task.kind != EventKind::Created {
        context.cache.invalidate_author(&author).await;
    }

    let update = update_for(&task);
    debug!(author = %author, followers = followers.len(), kind = ?task.kind, "fanning out");
    for batch in followers.chunks(std::cmp::max(1, config.batch_size)) {
        for follower in batch {
            context.cache.invalidate(follower).await;
            context.registry.push_to(follower, &update);
        }
        // Give the rest of the runtime a turn between batches; a 100k-follower author must not
        // monopolize the worker's thread.
        tokio::task::yield_now().await;
    }
    counter_add!(instruments, "fanout.tasks.processed", 1, &[]);
}

/// The consumer loop: take a task, run it to completion, check for shutdown in between. A task is
/// never cancelled mid-execution, but queued tasks are skippable at the head once shutdown is
/// requested.
async fn process(
    queue: Arc<FanoutQueue>,
    context: Context,
    config: Config,
    shutdown: Arc<Notify>,
    instruments: Arc<Instruments>,
) -> Result<()> {
    let mut done = false;
    while !done {
        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                done = true;
            }
            task = queue.recv() => {
                handle_task(task, &context, &config, &instruments).await;
            }
        }
    }
    debug!("fan-out worker exiting");
    Ok(())
}

/// Handle on the running worker; dropping it does *not* stop the worker, call
/// [Processor::shutdown].
#[pin_project]
pub struct Processor {
    #[pin]
    worker: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Future for Processor {
    type Output = StdResult<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.worker.poll(cx)
    }
}

impl Processor {
    /// Signal the worker to stop & wait up to `timeout` for it to finish its current task
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.worker)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into its parts; convenient when waiting on the worker alongside
    /// other futures in a `tokio::select!`
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.worker, self.shutdown)
    }
}

/// Spawn the fan-out worker over `queue`
pub fn spawn(
    queue: Arc<FanoutQueue>,
    context: Context,
    config: Config,
    instruments: Arc<Instruments>,
) -> Processor {
    let shutdown = Arc::new(Notify::new());
    let worker = tokio::spawn(process(
        queue,
        context,
        config,
        shutdown.clone(),
        instruments,
    ));
    Processor { worker, shutdown }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::HashSet;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::{
        cache,
        entities::{AuthorId, ContentSource, NoteId, RankedItem, RankingSignals, ViewerId},
        storage::{self, Memory},
    };

    fn note(id: &str, author: &str) -> Note {
        Note::new(NoteId::from(id), AuthorId::from(author), "text", Utc::now())
    }

    fn item(n: &Note) -> RankedItem {
        RankedItem {
            note: n.clone(),
            source: ContentSource::Following,
            final_score: 1.0,
            signals: RankingSignals::default(),
            injected_at: Utc::now(),
            injection_reason: "following".to_owned(),
        }
    }

    fn instruments() -> Arc<Instruments> {
        Arc::new(Instruments::new("notemill-test"))
    }

    #[tokio::test]
    async fn full_queue_sheds_oldest() {
        let queue = FanoutQueue::new(2, instruments());
        for id in ["n1", "n2", "n3"] {
            queue.submit(FanoutTask {
                note: note(id, "a"),
                kind: EventKind::Created,
            });
        }
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.pop().unwrap().note.id().as_str(), "n2");
        assert_eq!(queue.pop().unwrap().note.id().as_str(), "n3");
    }

    #[tokio::test]
    async fn drain_invalidates_followers_and_pushes_updates() {
        let mem = Arc::new(Memory::new());
        let viewer = ViewerId::from("v");
        let author = AuthorId::from("a");
        mem.add_follow(&viewer, &author).await;

        let timeline_cache = Arc::new(TimelineCache::new(cache::Config::default(), None));
        let n1 = note("n1", "a");
        timeline_cache.put(&viewer, vec![item(&n1)], None).await;

        let registry = Arc::new(SessionRegistry::new());
        let session = registry.subscribe(&viewer);

        let queue = Arc::new(FanoutQueue::new(16, instruments()));
        let processor = spawn(
            queue.clone(),
            Context {
                graph: mem.clone(),
                cache: timeline_cache.clone(),
                registry: registry.clone(),
            },
            Config::default(),
            instruments(),
        );

        queue.submit(FanoutTask {
            note: note("n2", "a"),
            kind: EventKind::Created,
        });

        // Give the worker a moment to drain, then verify the cache & the stream
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(timeline_cache.get(&viewer).await.is_none());
        assert_eq!(
            session.dropped(),
            0,
            "the update should have fit the session's budget"
        );
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    /// A follow graph that always fails; exercises the retry-then-drop path
    struct DownGraph;

    #[async_trait]
    impl FollowGraph for DownGraph {
        async fn follow_set(
            &self,
            _viewer: &ViewerId,
        ) -> StdResult<HashSet<AuthorId>, storage::Error> {
            Err(storage::Error::msg("graph down"))
        }
        async fn followers_of(
            &self,
            _author: &AuthorId,
        ) -> StdResult<Vec<ViewerId>, storage::Error> {
            Err(storage::Error::msg("graph down"))
        }
        async fn list_members(
            &self,
            _viewer: &ViewerId,
        ) -> StdResult<HashSet<AuthorId>, storage::Error> {
            Err(storage::Error::msg("graph down"))
        }
    }

    #[tokio::test]
    async fn graph_failure_drops_the_task_after_retries() {
        let timeline_cache = Arc::new(TimelineCache::new(cache::Config::default(), None));
        let queue = Arc::new(FanoutQueue::new(16, instruments()));
        let processor = spawn(
            queue.clone(),
            Context {
                graph: Arc::new(DownGraph),
                cache: timeline_cache,
                registry: Arc::new(SessionRegistry::new()),
            },
            Config {
                backoff_ms: 1,
                ..Default::default()
            },
            instruments(),
        );
        queue.submit(FanoutTask {
            note: note("n1", "a"),
            kind: EventKind::Created,
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The queue drained (the task was taken & dropped) and the worker is still alive
        assert_eq!(queue.depth(), 0);
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
