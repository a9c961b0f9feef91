//! Two-wave discovery scheduler
//!
//! # Cycle
//!
//! 1. Wave one: seeds are dealt round-robin over the workers whose backend is
//!    active. Each worker processes its partition strictly in order, pacing
//!    between items.
//! 2. Discoveries from wave one are merged, filtered against the processed
//!    set, passed through the promotion predicate and capped.
//! 3. Wave two runs the promoted targets the same way.
//!
//! The control flag is checked before each wave and between items. Every item
//! is marked processed once attempted, whether it succeeded, failed or timed
//! out. A cycle-wide streak of failed items aborts the cycle.

use crate::cache::TtlSet;
use crate::client::WorkerClient;
use crate::config::{Config, StealthConfig};
use crate::control::ControlFlag;
use crate::proxy::{ProxyRegistry, WorkerSlot};
use crate::scheduler::item::{DiscoveryResult, ItemState, Target, TrackedItem};
use crate::scheduler::partition::partition;
use crate::scheduler::stealth::StealthPacer;
use crate::HarvestError;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What processing one target produced
#[derive(Debug, Default)]
pub struct ItemOutput {
    /// Records handed to the writer
    pub records: usize,
    /// Candidates for wave two
    pub discovered: Vec<DiscoveryResult>,
    /// True when there was nothing to harvest
    pub skipped: bool,
}

/// Harvests one target using the worker's client
#[async_trait]
pub trait TargetProcessor: Send + Sync {
    async fn process(
        &self,
        client: &mut WorkerClient,
        target: &Target,
    ) -> Result<ItemOutput, HarvestError>;
}

/// Decides whether a discovery is worth a wave-two visit
pub type PromotionPredicate = Arc<dyn Fn(&DiscoveryResult) -> bool + Send + Sync>;

/// Counters for one wave
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaveStats {
    pub workers: usize,
    pub assigned: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Subset of `failed`
    pub timed_out: usize,
    /// Assigned but never started (stop, abort or disabled backend)
    pub abandoned: usize,
    pub expanded: usize,
    pub records: usize,
}

impl WaveStats {
    fn merge(&mut self, other: &WaveStats) {
        self.workers += other.workers;
        self.assigned += other.assigned;
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.abandoned += other.abandoned;
        self.expanded += other.expanded;
        self.records += other.records;
    }

    /// Items that were attempted
    pub fn processed(&self) -> usize {
        self.succeeded + self.skipped + self.failed
    }
}

/// Aggregate result of one cycle
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub wave_one: WaveStats,
    pub wave_two: WaveStats,
    /// Raw discoveries from wave one, before filtering
    pub discovered: usize,
    /// Targets promoted to wave two
    pub promoted: usize,
    /// Backends disabled during the cycle
    pub disabled_backends: Vec<String>,
    /// The consecutive-error guard tripped
    pub aborted: bool,
    /// The control flag turned the cycle off
    pub stopped: bool,
    pub elapsed: Duration,
}

impl CycleStats {
    pub fn total_processed(&self) -> usize {
        self.wave_one.processed() + self.wave_two.processed()
    }

    pub fn total_failed(&self) -> usize {
        self.wave_one.failed + self.wave_two.failed
    }

    pub fn total_records(&self) -> usize {
        self.wave_one.records + self.wave_two.records
    }
}

/// Cycle-wide consecutive failure counter shared by all workers
struct CycleGuard {
    consecutive: AtomicU32,
    aborted: AtomicBool,
    limit: u32,
}

impl CycleGuard {
    fn new(limit: u32) -> Self {
        Self {
            consecutive: AtomicU32::new(0),
            aborted: AtomicBool::new(false),
            limit,
        }
    }

    fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    fn record_failure(&self) {
        let streak = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if self.limit > 0 && streak >= self.limit && !self.aborted.swap(true, Ordering::SeqCst) {
            error!(
                "Aborting cycle after {} consecutive item failures",
                streak
            );
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// State shared by the workers of one wave
struct WaveContext {
    processor: Arc<dyn TargetProcessor>,
    registry: Arc<ProxyRegistry>,
    processed: Arc<TtlSet<String>>,
    control: Arc<dyn ControlFlag>,
    guard: Arc<CycleGuard>,
    stealth: StealthConfig,
    item_timeout: Duration,
    discoveries: Mutex<Vec<DiscoveryResult>>,
}

impl WaveContext {
    fn push_discoveries(&self, found: Vec<DiscoveryResult>) {
        self.discoveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(found);
    }

    fn take_discoveries(&self) -> Vec<DiscoveryResult> {
        std::mem::take(
            &mut *self
                .discoveries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

/// Runs discovery cycles over a pool of worker clients
pub struct DiscoveryScheduler {
    processor: Arc<dyn TargetProcessor>,
    registry: Arc<ProxyRegistry>,
    processed: Arc<TtlSet<String>>,
    control: Arc<dyn ControlFlag>,
    promote: PromotionPredicate,
    stealth: StealthConfig,
    item_timeout: Duration,
    wave_two_cap: usize,
    max_consecutive_errors: u32,
    unhealthy_threshold: u32,
}

impl DiscoveryScheduler {
    pub fn new(
        processor: Arc<dyn TargetProcessor>,
        registry: Arc<ProxyRegistry>,
        processed: Arc<TtlSet<String>>,
        control: Arc<dyn ControlFlag>,
        config: &Config,
    ) -> Self {
        Self {
            processor,
            registry,
            processed,
            control,
            promote: Arc::new(|_: &DiscoveryResult| true),
            stealth: config.stealth.clone(),
            item_timeout: Duration::from_secs(config.workers.item_timeout_secs),
            wave_two_cap: config.scheduler.wave_two_cap,
            max_consecutive_errors: config.scheduler.max_consecutive_errors,
            unhealthy_threshold: config.scheduler.unhealthy_threshold,
        }
    }

    /// Replaces the wave-two promotion predicate (default: promote everything)
    pub fn with_promotion<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DiscoveryResult) -> bool + Send + Sync + 'static,
    {
        self.promote = Arc::new(predicate);
        self
    }

    /// Runs one cycle and hands the workers back
    ///
    /// Workers move into their tasks for the duration of a wave and are
    /// returned in slot order, so sessions survive across cycles.
    pub async fn run_cycle(
        &self,
        workers: Vec<WorkerClient>,
        seeds: &[Target],
    ) -> (Vec<WorkerClient>, CycleStats) {
        let started = Instant::now();
        let mut stats = CycleStats::default();

        if !self.control.is_enabled() {
            info!("Control flag is off, skipping cycle");
            stats.stopped = true;
            return (workers, stats);
        }

        let guard = Arc::new(CycleGuard::new(self.max_consecutive_errors));
        let active_before: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|b| b.active)
            .map(|b| b.id)
            .collect();

        let wave_one = dedupe(seeds);
        info!(
            "Wave one: {} targets, {} workers",
            wave_one.len(),
            workers.len()
        );
        let (workers, wave_stats, discoveries) = self.run_wave(workers, wave_one, &guard).await;
        stats.wave_one = wave_stats;
        stats.discovered = discoveries.len();
        self.registry.disable_if_unhealthy(self.unhealthy_threshold);
        stats.disabled_backends = self.newly_disabled(&active_before);

        if guard.is_aborted() {
            stats.aborted = true;
            stats.elapsed = started.elapsed();
            return (workers, stats);
        }
        if !self.control.is_enabled() {
            info!("Control flag turned off after wave one");
            stats.stopped = true;
            stats.elapsed = started.elapsed();
            return (workers, stats);
        }

        let promoted = self.select_wave_two(discoveries);
        stats.promoted = promoted.len();
        info!(
            "Wave two: {} of {} discoveries promoted",
            stats.promoted, stats.discovered
        );

        let (workers, wave_stats, _) = self.run_wave(workers, promoted, &guard).await;
        stats.wave_two = wave_stats;
        self.registry.disable_if_unhealthy(self.unhealthy_threshold);
        stats.disabled_backends = self.newly_disabled(&active_before);
        stats.aborted = guard.is_aborted();
        stats.stopped = !self.control.is_enabled();
        stats.elapsed = started.elapsed();

        info!(
            "Cycle finished in {:?}: {} processed, {} failed, {} records",
            stats.elapsed,
            stats.total_processed(),
            stats.total_failed(),
            stats.total_records()
        );

        (workers, stats)
    }

    /// Backends that were active at cycle start and are not any more
    ///
    /// Covers both mid-wave deactivation by the registry and the sweep
    /// between waves.
    fn newly_disabled(&self, active_before: &[String]) -> Vec<String> {
        active_before
            .iter()
            .filter(|id| !self.registry.is_active(id))
            .cloned()
            .collect()
    }

    /// Filters, ranks and caps wave-one discoveries
    ///
    /// Duplicates keep their highest weight; already-processed targets and
    /// rejected candidates are dropped; the rest are ordered by weight.
    pub fn select_wave_two(&self, discoveries: Vec<DiscoveryResult>) -> Vec<Target> {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut merged: Vec<DiscoveryResult> = Vec::new();

        for found in discoveries {
            let key = found.key();
            if self.processed.contains(&key) {
                continue;
            }
            match index.get(&key) {
                Some(&i) => {
                    if found.weight > merged[i].weight {
                        merged[i] = found;
                    }
                }
                None => {
                    index.insert(key, merged.len());
                    merged.push(found);
                }
            }
        }

        // stable: equal weights keep discovery order
        merged.sort_by(|a, b| b.weight.cmp(&a.weight));

        merged
            .into_iter()
            .filter(|d| (self.promote)(d))
            .take(self.wave_two_cap)
            .map(DiscoveryResult::into_target)
            .collect()
    }

    async fn run_wave(
        &self,
        workers: Vec<WorkerClient>,
        targets: Vec<Target>,
        guard: &Arc<CycleGuard>,
    ) -> (Vec<WorkerClient>, WaveStats, Vec<DiscoveryResult>) {
        let mut stats = WaveStats::default();
        if targets.is_empty() {
            return (workers, stats, Vec::new());
        }

        let assigned: Vec<WorkerSlot> = workers.iter().map(|w| w.slot().clone()).collect();
        let slots = self.registry.active_slots(&assigned);
        let mut by_slot: HashMap<usize, WorkerClient> = workers
            .into_iter()
            .map(|w| (w.slot().slot_id, w))
            .collect();

        if slots.is_empty() {
            warn!(
                "No worker has an active backend, abandoning {} targets",
                targets.len()
            );
            stats.assigned = targets.len();
            stats.abandoned = targets.len();
            let mut workers: Vec<WorkerClient> = by_slot.into_values().collect();
            workers.sort_by_key(|w| w.slot().slot_id);
            return (workers, stats, Vec::new());
        }
        let mut idle = Vec::new();

        let ctx = Arc::new(WaveContext {
            processor: Arc::clone(&self.processor),
            registry: Arc::clone(&self.registry),
            processed: Arc::clone(&self.processed),
            control: Arc::clone(&self.control),
            guard: Arc::clone(guard),
            stealth: self.stealth.clone(),
            item_timeout: self.item_timeout,
            discoveries: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        for (slot, items) in partition(targets, &slots) {
            let Some(client) = by_slot.remove(&slot.slot_id) else {
                continue;
            };
            if items.is_empty() {
                idle.push(client);
                continue;
            }
            let ctx = Arc::clone(&ctx);
            handles.push(tokio::spawn(run_worker(ctx, client, items)));
        }

        let mut workers = idle;
        workers.extend(by_slot.into_values());
        for joined in join_all(handles).await {
            match joined {
                Ok((client, worker_stats)) => {
                    stats.merge(&worker_stats);
                    workers.push(client);
                }
                Err(e) => error!("Worker task failed, its client is lost: {}", e),
            }
        }
        workers.sort_by_key(|w| w.slot().slot_id);

        (workers, stats, ctx.take_discoveries())
    }
}

/// Processes one partition in order
async fn run_worker(
    ctx: Arc<WaveContext>,
    mut client: WorkerClient,
    targets: Vec<Target>,
) -> (WorkerClient, WaveStats) {
    let slot_id = client.slot().slot_id;
    let total = targets.len();
    let mut stats = WaveStats {
        workers: 1,
        assigned: total,
        ..WaveStats::default()
    };
    let mut pacer = StealthPacer::from_config(&ctx.stealth);

    for (i, target) in targets.into_iter().enumerate() {
        if ctx.guard.is_aborted() || !ctx.control.is_enabled() {
            stats.abandoned += total - i;
            debug!("[slot {}] stopping with {} items left", slot_id, total - i);
            break;
        }
        if !ctx.registry.is_active(client.backend_id()) {
            stats.abandoned += total - i;
            warn!(
                "[slot {}] backend '{}' disabled, abandoning {} items",
                slot_id,
                client.backend_id(),
                total - i
            );
            break;
        }

        if i > 0 {
            pacer.pause().await;
        }

        let mut item = TrackedItem::new(target);
        item.advance(ItemState::Assigned);
        item.advance(ItemState::Fetching);

        let result = tokio::time::timeout(
            ctx.item_timeout,
            ctx.processor.process(&mut client, &item.target),
        )
        .await;
        ctx.processed.insert(item.target.key());

        match result {
            Ok(Ok(output)) => {
                ctx.guard.record_success();
                stats.records += output.records;
                if output.skipped {
                    item.advance(ItemState::Skipped);
                    stats.skipped += 1;
                } else {
                    item.advance(ItemState::Succeeded);
                    stats.succeeded += 1;
                }
                debug!(
                    "[slot {}] {} -> {} records, {} discoveries",
                    slot_id,
                    item.target.name,
                    output.records,
                    output.discovered.len()
                );
                ctx.push_discoveries(output.discovered);
                if item.advance(ItemState::Expanded) {
                    stats.expanded += 1;
                }
            }
            Ok(Err(e)) if e.is_terminal() => {
                item.advance(ItemState::Skipped);
                stats.skipped += 1;
                info!("[slot {}] skipping {}: {}", slot_id, item.target.name, e);
            }
            Ok(Err(e)) => {
                item.advance(ItemState::Failed);
                stats.failed += 1;
                error!("[slot {}] {} failed: {}", slot_id, item.target.name, e);
                ctx.guard.record_failure();
            }
            Err(_) => {
                item.advance(ItemState::Failed);
                stats.failed += 1;
                stats.timed_out += 1;
                let e = HarvestError::Timeout {
                    target: item.target.name.clone(),
                    after: ctx.item_timeout,
                };
                error!("[slot {}] {}", slot_id, e);
                ctx.guard.record_failure();
            }
        }
    }

    (client, stats)
}

/// Drops repeated targets, keeping the first occurrence
fn dedupe(targets: &[Target]) -> Vec<Target> {
    let mut seen = HashSet::new();
    targets
        .iter()
        .filter(|t| !t.name.is_empty() && seen.insert(t.key()))
        .cloned()
        .collect()
}
