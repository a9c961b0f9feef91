//! Harvester engine - wires every component and runs cycles
//!
//! This module contains the orchestration loop that:
//! - Opens the store and builds the breaker-guarded writer
//! - Loads the proxy registry and runs the startup self-test
//! - Builds one worker client per assigned slot
//! - Runs discovery cycles while the control flag is enabled
//! - Owns the background tasks (cache sweep, auto-flush, memory sampling)
//!   and stops them on shutdown

use crate::cache::{spawn_sweeper, Sweepable, TtlCache, TtlSet};
use crate::client::{proxied_factory, IdentityPool, SessionFactory, WorkerClient};
use crate::config::{Config, ControlConfig};
use crate::control::{AllOf, ControlFlag, FileFlag, SharedSwitch};
use crate::harvest::{register_collections, CommunityProcessor};
use crate::lifecycle::BackgroundTask;
use crate::monitor::{MemoryMonitor, ProcessSampler};
use crate::proxy::{probe_with, ProxyRegistry};
use crate::ratelimit::RateLimiter;
use crate::resilience::CircuitBreaker;
use crate::scheduler::{CycleStats, DiscoveryResult, DiscoveryScheduler, Target};
use crate::storage::{RecordStore, SqliteStore};
use crate::writer::{BatchWriter, FlushReport};
use crate::HarvestError;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Fraction of capacity kept when memory cleanup shrinks a cache
const CLEANUP_KEEP_FRACTION: f64 = 0.5;

/// Granularity of the between-cycle pause, so shutdown is noticed promptly
const PAUSE_TICK: Duration = Duration::from_secs(1);

/// Builds the control flag named by the configuration
///
/// Without a flag file the harvester is always enabled.
pub fn control_from_config(config: &ControlConfig) -> Arc<dyn ControlFlag> {
    match &config.flag_path {
        Some(path) => Arc::new(FileFlag::new(path)),
        None => Arc::new(SharedSwitch::new(true)),
    }
}

/// Main harvester structure
pub struct Harvester {
    config: Config,
    store: Arc<dyn RecordStore>,
    registry: Arc<ProxyRegistry>,
    breaker: Arc<CircuitBreaker>,
    writer: Arc<BatchWriter>,
    about_cache: Arc<TtlCache<String, Value>>,
    processed: Arc<TtlSet<String>>,
    scheduler: DiscoveryScheduler,
    monitor: Arc<MemoryMonitor>,
    control: Arc<dyn ControlFlag>,
    stop: SharedSwitch,
    gate: Arc<Semaphore>,
    session_factory: Option<SessionFactory>,
    workers: Vec<WorkerClient>,
    seeds: Vec<Target>,
    tasks: Vec<BackgroundTask>,
    started: bool,
    cycles: u64,
}

impl Harvester {
    /// Creates a harvester from a validated configuration
    ///
    /// Opens the SQLite store named in `[storage]` and the control flag named
    /// in `[control]`.
    ///
    /// # Returns
    ///
    /// * `Ok(Harvester)` - All components were built
    /// * `Err(HarvestError)` - The store could not be opened or no proxy is usable
    pub fn new(config: Config) -> Result<Self, HarvestError> {
        let store = SqliteStore::new(Path::new(&config.storage.database_path))?;
        let control = control_from_config(&config.control);
        Self::with_parts(config, Arc::new(store), control, None)
    }

    /// Creates a harvester around an existing store and control flag
    ///
    /// `session_factory` replaces the proxied HTTP session builder; it is
    /// still called once per slot with that slot's backend.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn RecordStore>,
        control: Arc<dyn ControlFlag>,
        session_factory: Option<SessionFactory>,
    ) -> Result<Self, HarvestError> {
        let registry = Arc::new(ProxyRegistry::from_config(&config)?);
        let gate = RateLimiter::shared_gate(config.rate_limit.max_concurrent);

        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker.failure_threshold,
            Duration::from_secs(config.breaker.cooldown_secs),
        ));
        let writer = Arc::new(register_collections(BatchWriter::new(
            Arc::clone(&store),
            Arc::clone(&breaker),
            RateLimiter::from_config(&config.rate_limit, Arc::clone(&gate)),
            &config.writer,
        )));

        let about_cache = Arc::new(TtlCache::new(
            config.cache.community_capacity,
            Duration::from_secs(config.cache.community_ttl_secs),
        ));
        let processed = Arc::new(TtlSet::new(
            config.cache.processed_capacity,
            Duration::from_secs(config.cache.processed_ttl_secs),
        ));

        let stop = SharedSwitch::new(true);
        let control: Arc<dyn ControlFlag> = Arc::new(AllOf(vec![
            control,
            Arc::new(stop.clone()) as Arc<dyn ControlFlag>,
        ]));

        let processor = Arc::new(CommunityProcessor::new(
            Arc::clone(&writer),
            Arc::clone(&about_cache),
            &config,
        ));
        let scheduler = DiscoveryScheduler::new(
            processor,
            Arc::clone(&registry),
            Arc::clone(&processed),
            Arc::clone(&control),
            &config,
        );

        let monitor = Arc::new(MemoryMonitor::new(
            Arc::new(ProcessSampler::new()),
            &config.memory,
        ));
        {
            let caches: [(&str, Arc<dyn Sweepable>); 2] = [
                ("processed-set", Arc::clone(&processed) as Arc<dyn Sweepable>),
                ("community-cache", Arc::clone(&about_cache) as Arc<dyn Sweepable>),
            ];
            for (name, cache) in caches {
                monitor.register_cleanup(name, move || cache.shrink(CLEANUP_KEEP_FRACTION));
            }

            // buffered records leave memory once the woken auto-flush writes them
            let buffers = Arc::clone(&writer);
            monitor.register_cleanup("writer-buffers", move || {
                let buffered = buffers.buffered_total();
                buffers.request_flush();
                buffered
            });
            let backlog = Arc::clone(&writer);
            monitor.register_cleanup("failed-backlog", move || backlog.purge_failed());
        }

        let seeds = config
            .scheduler
            .seeds
            .iter()
            .map(|name| Target::seed(name))
            .collect();

        Ok(Self {
            config,
            store,
            registry,
            breaker,
            writer,
            about_cache,
            processed,
            scheduler,
            monitor,
            control,
            stop,
            gate,
            session_factory,
            workers: Vec::new(),
            seeds,
            tasks: Vec::new(),
            started: false,
            cycles: 0,
        })
    }

    /// Replaces the wave-two promotion predicate
    pub fn with_promotion<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DiscoveryResult) -> bool + Send + Sync + 'static,
    {
        self.scheduler = self.scheduler.with_promotion(predicate);
        self
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn writer(&self) -> &Arc<BatchWriter> {
        &self.writer
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn processed(&self) -> &Arc<TtlSet<String>> {
        &self.processed
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    pub fn seeds(&self) -> &[Target] {
        &self.seeds
    }

    /// Completed cycles
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Number of worker clients built so far
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Probes every backend once through its own proxy
    ///
    /// Failing backends are deactivated; when none passes, the harvester
    /// refuses to start rather than send unproxied traffic.
    pub async fn self_test(&self) -> Result<usize, HarvestError> {
        let (factory, url, user_agent) = self.probe_parts();
        let passed = self
            .registry
            .self_test(|conn| {
                probe_with(Arc::clone(&factory), conn, url.clone(), user_agent.clone())
            })
            .await?;
        info!(
            "Proxy self-test: {}/{} backends usable",
            passed,
            self.registry.len()
        );
        Ok(passed)
    }

    /// Probes deactivated backends and brings back those that answer
    pub async fn reprobe_backends(&self) -> Vec<String> {
        if self.registry.active_count() == self.registry.len() {
            return Vec::new();
        }

        let (factory, url, user_agent) = self.probe_parts();
        let revived = self
            .registry
            .reprobe_inactive(|conn| {
                probe_with(Arc::clone(&factory), conn, url.clone(), user_agent.clone())
            })
            .await;
        if !revived.is_empty() {
            info!("Reactivated proxy backends: {:?}", revived);
        }
        revived
    }

    /// Session factory, probe URL and user agent for backend probes
    fn probe_parts(&self) -> (SessionFactory, String, String) {
        let factory = match &self.session_factory {
            Some(factory) => Arc::clone(factory),
            None => proxied_factory(Duration::from_secs(
                self.config.workers.request_timeout_secs,
            )),
        };
        let url = format!(
            "{}{}",
            self.config.upstream.base_url.trim_end_matches('/'),
            self.config.upstream.probe_path
        );
        let mut identities = IdentityPool::from_config(&self.config.upstream);
        let user_agent = identities.next_agent().to_string();
        (factory, url, user_agent)
    }

    /// Builds the worker pool and starts background tasks
    ///
    /// Called implicitly by [`run_once`](Self::run_once); calling it again is a no-op.
    pub fn start(&mut self) -> Result<(), HarvestError> {
        if self.started {
            return Ok(());
        }

        let slots = self.registry.assign_slots(self.registry.total_quota());
        let mut workers = Vec::with_capacity(slots.len());
        for slot in slots {
            let limiter = RateLimiter::from_config(&self.config.rate_limit, Arc::clone(&self.gate));
            let client = match &self.session_factory {
                Some(factory) => WorkerClient::with_session_factory(
                    slot,
                    Arc::clone(&self.registry),
                    limiter,
                    &self.config,
                    Arc::clone(factory),
                )?,
                None => WorkerClient::new(slot, Arc::clone(&self.registry), limiter, &self.config)?,
            };
            workers.push(client);
        }
        info!(
            "Built {} workers over {} active backends",
            workers.len(),
            self.registry.active_count()
        );
        self.workers = workers;

        let caches: Vec<Arc<dyn Sweepable>> = vec![
            Arc::clone(&self.about_cache) as Arc<dyn Sweepable>,
            Arc::clone(&self.processed) as Arc<dyn Sweepable>,
        ];
        self.tasks.push(spawn_sweeper(
            caches,
            Duration::from_secs(self.config.cache.sweep_interval_secs),
        ));
        self.tasks.push(
            self.writer
                .spawn_auto_flush(Duration::from_secs(self.config.writer.flush_interval_secs)),
        );
        self.tasks.push(
            self.monitor
                .spawn(Duration::from_secs(self.config.memory.check_interval_secs)),
        );

        self.started = true;
        Ok(())
    }

    /// Runs a single discovery cycle and flushes the writer
    pub async fn run_once(&mut self) -> Result<CycleStats, HarvestError> {
        self.start()?;
        if self.control.is_enabled() {
            self.reprobe_backends().await;
        }

        let workers = std::mem::take(&mut self.workers);
        let (workers, stats) = self.scheduler.run_cycle(workers, &self.seeds).await;
        self.workers = workers;
        self.cycles += 1;

        let report = self.writer.flush_all().await?;
        if !report.is_empty() {
            info!(
                "Cycle {} flush: {} written, {} placeholders, {} failed, {} deferred",
                self.cycles, report.written, report.placeholders, report.failed, report.deferred
            );
        }
        for backend in self.registry.snapshot() {
            debug!("Backend {:?}", backend);
        }
        if stats.aborted {
            warn!("Cycle {} aborted by the consecutive-error guard", self.cycles);
        }

        Ok(stats)
    }

    /// Runs cycles until `shutdown` resolves
    ///
    /// Cycles only start while the control flag is enabled; otherwise the
    /// loop idles for one pause and polls again. On shutdown the in-flight
    /// cycle winds down at the next item boundary, background tasks are
    /// stopped and buffers are flushed.
    ///
    /// # Returns
    ///
    /// * `Ok(cycles)` - Number of cycles run by this call
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<u64, HarvestError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let stop = self.stop.clone();
        let watcher = tokio::spawn(async move {
            shutdown.await;
            info!("Shutdown requested, finishing current items");
            stop.disable();
        });

        let pause = Duration::from_secs(self.config.scheduler.cycle_pause_secs);
        let mut ran = 0;
        while self.stop.is_enabled() {
            if self.control.is_enabled() {
                match self.run_once().await {
                    Ok(stats) => {
                        ran += 1;
                        info!(
                            "Cycle {}: {} processed ({} wave two), {} records in {:?}",
                            self.cycles,
                            stats.total_processed(),
                            stats.wave_two.processed(),
                            stats.total_records(),
                            stats.elapsed
                        );
                    }
                    Err(e) => error!("Cycle failed: {}", e),
                }
            } else {
                info!("Control flag is off, waiting");
            }
            self.pause(pause).await;
        }

        watcher.abort();
        self.shutdown().await?;
        Ok(ran)
    }

    async fn pause(&self, total: Duration) {
        // a zero pause must still let the shutdown watcher run
        tokio::task::yield_now().await;
        let mut waited = Duration::ZERO;
        while waited < total && self.stop.is_enabled() {
            let step = PAUSE_TICK.min(total - waited);
            tokio::time::sleep(step).await;
            waited += step;
        }
    }

    /// Stops background tasks and flushes every buffer
    pub async fn shutdown(&mut self) -> Result<FlushReport, HarvestError> {
        self.stop.disable();
        for task in self.tasks.drain(..) {
            let name = task.name();
            task.stop().await;
            debug!("Stopped background task '{}'", name);
        }
        self.started = false;

        let report = self.writer.flush_all().await?;
        let still_buffered = self.writer.buffered_total();
        if still_buffered > 0 {
            warn!(
                "{} records still buffered at shutdown (circuit {:?})",
                still_buffered,
                self.breaker.state()
            );
        }
        info!(
            "Harvester stopped after {} cycles; final flush wrote {} records",
            self.cycles, report.written
        );
        Ok(report)
    }
}
