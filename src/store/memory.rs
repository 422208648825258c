//! In-process counter store backed by sharded concurrent maps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::counter::WindowCounter;
use super::{CallContext, CounterStore};
use crate::error::StoreError;

const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

/// In-memory [`CounterStore`].
///
/// Updates to one key go through that key's shard lock, so concurrent
/// increments on the same key serialize while different keys proceed in
/// parallel. Expired entries stay in the maps until they are touched again
/// or a sweep removes them.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<String, WindowCounter>,
    blocks: DashMap<String, Instant>,
}

/// Number of entries removed by a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub counters: usize,
    pub blocks: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.counters + self.blocks
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every counter and block that has expired.
    pub fn sweep(&self) -> SweepStats {
        let now = Instant::now();

        let counters_before = self.counters.len();
        self.counters.retain(|_, counter| counter.is_live(now));
        let blocks_before = self.blocks.len();
        self.blocks.retain(|_, blocked_until| now < *blocked_until);

        SweepStats {
            counters: counters_before.saturating_sub(self.counters.len()),
            blocks: blocks_before.saturating_sub(self.blocks.len()),
        }
    }

    /// Start a background task that sweeps every `period`.
    ///
    /// The task runs until the returned handle is shut down or dropped. A
    /// zero `period` is raised to one millisecond.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> SweeperHandle {
        let period = period.max(MIN_SWEEP_PERIOD);
        let cancel = CancellationToken::new();
        let store = Arc::clone(self);
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        if removed.total() > 0 {
                            debug!(
                                counters = removed.counters,
                                blocks = removed.blocks,
                                "Swept expired entries"
                            );
                        }
                    }
                }
            }

            debug!("Memory store sweeper stopped");
        });

        info!(period = ?period, "Memory store sweeper started");

        SweeperHandle {
            cancel,
            task: Some(task),
        }
    }

    /// Number of counter entries currently held, expired or not.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Number of block entries currently held, expired or not.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(
        &self,
        _ctx: &CallContext,
        key: &str,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let now = Instant::now();

        let count = match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => occupied.get_mut().bump(now, window),
            Entry::Vacant(vacant) => {
                vacant.insert(WindowCounter::start(now, window));
                1
            }
        };

        Ok(count)
    }

    async fn get(&self, _ctx: &CallContext, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .map(|counter| counter.count_at(now))
            .unwrap_or(0))
    }

    async fn set_block(
        &self,
        _ctx: &CallContext,
        key: &str,
        cooldown: Duration,
    ) -> Result<(), StoreError> {
        self.blocks.insert(key.to_string(), Instant::now() + cooldown);
        Ok(())
    }

    async fn is_blocked(&self, _ctx: &CallContext, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .blocks
            .get(key)
            .is_some_and(|blocked_until| now < *blocked_until))
    }
}

/// Owns a running sweeper task.
///
/// Dropping the handle cancels the task; [`SweeperHandle::shutdown`] also
/// waits for it to finish.
#[derive(Debug)]
pub struct SweeperHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for its task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Memory store sweeper did not exit cleanly");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
