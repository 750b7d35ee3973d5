//! Garbage collection scheduler
//!
//! Collections are triggered by explicit requests, by accumulated deletions
//! or mutations reported by the store, and are spaced so the fraction of
//! time spent collecting stays under the pause threshold.

use berth_common::config::GcConfig;
use berth_common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Result of one collection
pub trait Stats: Clone + Send + 'static {
    /// Wall time the collection took
    fn elapsed(&self) -> Duration;
}

/// Something that can run a full collection cycle.
///
/// `garbage_collect` is blocking; the scheduler runs it on the blocking
/// thread pool.
pub trait Collector: Send + Sync + 'static {
    type Stats: Stats;

    fn garbage_collect(&self) -> Result<Self::Stats>;
}

/// Scheduler configuration
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Maximum fraction of time spent collecting, in `(0, 0.5]`
    pub pause_threshold: f64,
    /// Deletions that trigger an immediate collection (0 disables)
    pub deletion_threshold: u32,
    /// Mutations that trigger a collection (0 disables)
    pub mutation_threshold: u32,
    /// Delay applied to triggered collections
    pub schedule_delay: Duration,
    /// Delay before the first collection
    pub startup_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        GcConfig::default().into()
    }
}

impl From<GcConfig> for SchedulerConfig {
    fn from(cfg: GcConfig) -> Self {
        Self {
            pause_threshold: cfg.pause_threshold,
            deletion_threshold: cfg.deletion_threshold,
            mutation_threshold: cfg.mutation_threshold,
            schedule_delay: Duration::from_millis(cfg.schedule_delay_ms),
            startup_delay: Duration::from_millis(cfg.startup_delay_ms),
        }
    }
}

enum Event<S> {
    Mutation { at: Instant, dirty: bool },
    Trigger { at: Instant, waiter: oneshot::Sender<Result<S>> },
    Shutdown,
}

/// Cloneable handle used to report mutations and request collections
pub struct SchedulerHandle<S> {
    tx: mpsc::UnboundedSender<Event<S>>,
}

impl<S> Clone for SchedulerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: Stats> SchedulerHandle<S> {
    /// Report a store mutation; `dirty` marks a deletion
    pub fn mutation(&self, dirty: bool) {
        let _ = self.tx.send(Event::Mutation {
            at: Instant::now(),
            dirty,
        });
    }

    /// Request a collection and wait for its statistics
    pub async fn schedule_and_wait(&self) -> Result<S> {
        let (waiter, rx) = oneshot::channel();
        self.tx
            .send(Event::Trigger {
                at: Instant::now(),
                waiter,
            })
            .map_err(|_| Error::internal("gc scheduler is not running"))?;
        rx.await
            .map_err(|_| Error::internal("gc scheduler stopped before collecting"))?
    }

    /// Stop the scheduler loop
    pub fn shutdown(&self) {
        let _ = self.tx.send(Event::Shutdown);
    }
}

/// Background garbage collection scheduler
pub struct Scheduler<C: Collector> {
    collector: Arc<C>,
    config: SchedulerConfig,
    rx: mpsc::UnboundedReceiver<Event<C::Stats>>,
    waiters: Vec<oneshot::Sender<Result<C::Stats>>>,
}

impl<C: Collector> Scheduler<C> {
    /// Spawn the scheduler loop on the current tokio runtime
    pub fn spawn(collector: Arc<C>, mut config: SchedulerConfig) -> (SchedulerHandle<C::Stats>, JoinHandle<()>) {
        if !(0.0..=0.5).contains(&config.pause_threshold) {
            warn!(
                "gc pause threshold {} out of range, clamping to (0, 0.5]",
                config.pause_threshold
            );
            config.pause_threshold = config.pause_threshold.clamp(0.0, 0.5);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            collector,
            config,
            rx,
            waiters: Vec::new(),
        };
        let task = tokio::spawn(scheduler.run());
        (SchedulerHandle { tx }, task)
    }

    async fn run(mut self) {
        let mut interval = Duration::from_secs(1);
        let mut next_collection: Option<Instant> = None;
        let mut last_collection: Option<Instant> = None;
        let mut gc_time = Duration::ZERO;
        let mut collections: u32 = 0;
        let mut triggered = false;
        let mut deletions: u32 = 0;
        let mut mutations: u32 = 0;

        if self.config.startup_delay > Duration::ZERO {
            next_collection = Some(Instant::now() + self.config.startup_delay);
        }

        loop {
            tokio::select! {
                () = sleep_until(next_collection) => {
                    // Nothing requested and nothing changed: check again later.
                    if !triggered
                        && last_collection.is_some()
                        && deletions == 0
                        && (self.config.mutation_threshold == 0
                            || mutations < self.config.mutation_threshold)
                    {
                        next_collection = Some(Instant::now() + interval);
                        continue;
                    }
                }
                event = self.rx.recv() => {
                    let at = match event {
                        None | Some(Event::Shutdown) => break,
                        Some(Event::Mutation { at, dirty }) => {
                            if last_collection.is_some_and(|l| l > at) {
                                continue;
                            }
                            if dirty {
                                deletions += 1;
                            }
                            mutations += 1;
                            at
                        }
                        Some(Event::Trigger { at, waiter }) => {
                            self.waiters.push(waiter);
                            triggered = true;
                            at
                        }
                    };
                    debug!(?at, deletions, mutations, triggered, "gc event");

                    let cfg = &self.config;
                    let immediate = triggered
                        || (cfg.deletion_threshold > 0 && deletions >= cfg.deletion_threshold)
                        || (next_collection.is_none()
                            && ((cfg.deletion_threshold == 0 && deletions > 0)
                                || (cfg.mutation_threshold > 0
                                    && mutations >= cfg.mutation_threshold)));
                    if immediate {
                        let target = Instant::now() + cfg.schedule_delay;
                        if next_collection.is_none_or(|n| n > target) {
                            next_collection = Some(target);
                        }
                    }
                    continue;
                }
            }

            let scheduled = next_collection.unwrap_or_else(Instant::now);
            let collector = Arc::clone(&self.collector);
            let result = tokio::task::spawn_blocking(move || collector.garbage_collect())
                .await
                .unwrap_or_else(|e| Err(Error::internal(format!("gc task failed: {e}"))));
            let last = Instant::now();

            match result {
                Ok(stats) => {
                    debug!(elapsed = ?stats.elapsed(), "garbage collected");
                    gc_time += stats.elapsed();
                    collections += 1;
                    triggered = false;
                    deletions = 0;
                    mutations = 0;

                    if self.config.pause_threshold > 0.0 {
                        // Space collections so average gc time over the
                        // interval stays at the pause threshold.
                        let avg = gc_time.as_secs_f64() / f64::from(collections);
                        interval = Duration::from_secs_f64(
                            avg / self.config.pause_threshold - avg,
                        );
                    }
                    last_collection = Some(last);
                    next_collection = Some(last + interval);

                    for waiter in self.waiters.drain(..) {
                        let _ = waiter.send(Ok(stats.clone()));
                    }
                }
                Err(e) => {
                    error!("garbage collection failed: {}", e);
                    let retry = last_collection
                        .map_or(Duration::ZERO, |l| scheduled.saturating_duration_since(l))
                        + Duration::from_secs(1);
                    next_collection = Some(last + retry);
                    last_collection = Some(last);

                    let msg = e.to_string();
                    for waiter in self.waiters.drain(..) {
                        let _ = waiter.send(Err(Error::internal(format!(
                            "garbage collection failed: {msg}"
                        ))));
                    }
                }
            }
        }
        debug!("gc scheduler stopped");
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
