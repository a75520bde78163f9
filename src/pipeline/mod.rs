mod progress;
mod session;

pub use progress::{
    is_canceled, CancelToken, Canceled, LoadProgress, LoadStage, NoProgress, ProgressSink,
};
pub use session::{find_session_documents, ModuleDocument, NoSession, SessionSetup};

use crate::debuginfo_store::{Acquirer, AcquiredModules, FileLocator};
use crate::filter::{approximate_top_modules, ModuleFilter};
use crate::options::ProfileOptions;
use crate::processor::ChunkedSampleProcessor;
use crate::profile::aggregator::METRIC_ID_BASE;
use crate::profile::{ProfileAggregator, ProfileData, ProfileDataReport};
use crate::symbolizer::{ModuleRegistry, ModuleResolver, ResolverFactory, StackMemo, StackResolver};
use crate::trace::{ProfileProcess, RawProfile, RawTrace};
use anyhow::{ensure, Context};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use ulid::Ulid;

/// Tracks the stage of one load and times each stage. Progress from the
/// stages passes through it on the way to the caller's sink.
struct StageTracker {
    session_id: Ulid,
    sink: Arc<dyn ProgressSink>,
    current: Mutex<(LoadStage, Instant)>,
    timings: Mutex<Vec<(LoadStage, Duration)>>,
}

impl StageTracker {
    fn new(session_id: Ulid, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            session_id,
            sink,
            current: Mutex::new((LoadStage::Idle, Instant::now())),
            timings: Mutex::new(vec![]),
        }
    }

    fn stage(&self) -> LoadStage {
        lock(&self.current).0
    }

    // Returns false when `stage` is already the current one.
    fn transition(&self, stage: LoadStage) -> bool {
        let mut current = lock(&self.current);
        let (previous, started) = *current;
        if previous == stage {
            return false;
        }
        if previous != LoadStage::Idle && !previous.is_terminal() {
            let elapsed = started.elapsed();
            log::info!("[{}] {} took {:?}", self.session_id, previous, elapsed);
            lock(&self.timings).push((previous, elapsed));
        }
        *current = (stage, Instant::now());
        log::debug!("[{}] Entering {}", self.session_id, stage);
        true
    }

    fn enter(&self, stage: LoadStage) {
        if self.transition(stage) {
            self.sink.on_progress(LoadProgress::new(stage, 0, 0));
        }
    }

    /// Finished stages, plus the running one up to now.
    fn timings(&self) -> Vec<(LoadStage, Duration)> {
        let mut timings = lock(&self.timings).clone();
        let (stage, started) = *lock(&self.current);
        if stage != LoadStage::Idle && !stage.is_terminal() {
            timings.push((stage, started.elapsed()));
        }
        timings
    }
}

impl ProgressSink for StageTracker {
    fn on_progress(&self, progress: LoadProgress) {
        self.transition(progress.stage);
        self.sink.on_progress(progress);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Sample processing and aggregation, run on a blocking thread inside a
/// rayon pool sized to the core limit.
struct ProcessingJob {
    raw: Arc<RawProfile>,
    acquired: AcquiredModules,
    options: ProfileOptions,
    process_ids: Vec<u32>,
    main_process: ProfileProcess,
    report: ProfileDataReport,
    tracker: Arc<StageTracker>,
    cancel: CancelToken,
}

impl ProcessingJob {
    fn run(self) -> anyhow::Result<(ProfileData, Vec<Arc<ModuleResolver>>)> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.cpu_core_limit)
            .thread_name(|i| format!("evresolver-worker-{}", i))
            .build()
            .context("Failed to build worker pool")?;
        pool.install(move || self.process())
    }

    fn process(self) -> anyhow::Result<(ProfileData, Vec<Arc<ModuleResolver>>)> {
        let raw = self.raw.as_ref();
        let registry = ModuleRegistry::new();
        let memo = StackMemo::unbounded();
        let factory = ResolverFactory::new(raw, &self.acquired);
        let stacks = StackResolver::new(raw, &registry, &factory, &memo);
        let aggregator = ProfileAggregator::new();
        let processor = ChunkedSampleProcessor::new(
            raw,
            &stacks,
            &aggregator,
            self.tracker.as_ref(),
            &self.cancel,
        );

        let (samples, stats) = processor.process(
            &self.process_ids,
            self.options.include_kernel_events,
            self.options.cpu_core_limit,
        )?;
        log::info!(
            "[{}] Resolved {} samples: {} memo hits, {} fast path hits, {} unknown frames, {} module resolvers",
            self.tracker.session_id,
            stats.samples,
            stats.memo_hits,
            stats.fast_path_hits,
            stats.unknown_frames,
            registry.constructions()
        );
        self.cancel.check()?;

        self.tracker.enter(LoadStage::ComputeAggregate);
        aggregator.compute_aggregate(&samples);
        self.cancel.check()?;

        if raw.has_counter_events() {
            self.tracker.enter(LoadStage::PerformanceCounterProcessing);
            for counter in raw.performance_counters() {
                aggregator.register_performance_counter(counter.clone());
            }
            let mut metric_id = METRIC_ID_BASE;
            for config in self.options.performance_metrics.iter().filter(|m| m.is_enabled) {
                if aggregator.register_performance_metric(metric_id, config) {
                    metric_id += 1;
                }
            }
            processor.process_counters(&self.process_ids)?;
            self.cancel.check()?;
        }

        let threads = self
            .process_ids
            .iter()
            .flat_map(|&pid| raw.threads(pid).cloned())
            .collect();
        // Kernel-only images show up in stacks when kernel samples are kept.
        let modules = raw.images().to_vec();
        let profile = aggregator.finalize(
            Some(self.main_process),
            threads,
            modules,
            samples,
            self.report,
        )?;
        Ok((profile, registry.resolvers()))
    }
}

/// ProfileLoader turns a decoded trace into a `ProfileData` for a set of processes.
pub struct ProfileLoader<L, S> {
    options: ProfileOptions,
    locator: Arc<L>,
    session: S,
}

impl<L: FileLocator + 'static, S: SessionSetup> ProfileLoader<L, S> {
    pub fn new(options: ProfileOptions, locator: Arc<L>, session: S) -> Self {
        Self {
            options,
            locator,
            session,
        }
    }

    pub fn options(&self) -> &ProfileOptions {
        &self.options
    }

    /// Reads a trace dump and loads it. Returns `None` when the load was
    /// canceled or failed; the failure is logged.
    pub async fn load_trace_file(
        &self,
        path: &Path,
        process_ids: &[u32],
        progress: Arc<dyn ProgressSink>,
        cancel: CancelToken,
    ) -> Option<Arc<ProfileData>> {
        let tracker = Arc::new(StageTracker::new(Ulid::new(), progress));
        let result = self.read_and_run(path, process_ids, &tracker, &cancel).await;
        self.finish(result, &tracker)
    }

    /// Loads an already decoded trace. Returns `None` when the load was
    /// canceled or failed; the failure is logged.
    pub async fn load_trace(
        &self,
        raw: Arc<RawProfile>,
        process_ids: &[u32],
        progress: Arc<dyn ProgressSink>,
        cancel: CancelToken,
    ) -> Option<Arc<ProfileData>> {
        let tracker = Arc::new(StageTracker::new(Ulid::new(), progress));
        let result = self.run(raw, process_ids, &tracker, &cancel).await;
        self.finish(result, &tracker)
    }

    fn finish(
        &self,
        result: anyhow::Result<Arc<ProfileData>>,
        tracker: &StageTracker,
    ) -> Option<Arc<ProfileData>> {
        let stage = tracker.stage();
        match result {
            Ok(profile) => {
                tracker.enter(LoadStage::Completed);
                Some(profile)
            }
            Err(e) if is_canceled(&e) => {
                log::info!("[{}] Load canceled during {}", tracker.session_id, stage);
                tracker.enter(LoadStage::Canceled);
                None
            }
            Err(e) => {
                log::error!("[{}] Load failed during {}: {:?}", tracker.session_id, stage, e);
                tracker.enter(LoadStage::Failed);
                None
            }
        }
    }

    async fn read_and_run(
        &self,
        path: &Path,
        process_ids: &[u32],
        tracker: &Arc<StageTracker>,
        cancel: &CancelToken,
    ) -> anyhow::Result<Arc<ProfileData>> {
        tracker.enter(LoadStage::TraceReading);
        let file = path.to_path_buf();
        let trace = tokio::task::spawn_blocking(move || RawTrace::read_from(&file))
            .await
            .context("Trace reader panicked")??;
        log::info!(
            "[{}] Read {} samples from {}",
            tracker.session_id,
            trace.samples.len(),
            path.display()
        );
        cancel.check()?;
        self.run(Arc::new(RawProfile::new(trace)), process_ids, tracker, cancel)
            .await
    }

    async fn run(
        &self,
        raw: Arc<RawProfile>,
        process_ids: &[u32],
        tracker: &Arc<StageTracker>,
        cancel: &CancelToken,
    ) -> anyhow::Result<Arc<ProfileData>> {
        ensure!(!process_ids.is_empty(), "No process ids requested");
        let main_pid = process_ids[0];
        let main_process = raw
            .find_process(main_pid)
            .cloned()
            .with_context(|| format!("Process {} not found in trace", main_pid))?;
        log::info!(
            "[{}] Loading {} (pid {}) from {} samples",
            tracker.session_id,
            main_process.name,
            main_pid,
            raw.samples().len()
        );
        cancel.check()?;

        tracker.enter(LoadStage::BinaryLoading);
        let ranked = {
            let raw = Arc::clone(&raw);
            let budget = self.options.top_modules_time_budget;
            tokio::task::spawn_blocking(move || approximate_top_modules(&raw, main_pid, budget))
                .await
                .context("Top modules scan panicked")?
        };
        let filter = ModuleFilter::new(&self.options, &ranked, raw.samples().len());
        let acquirer = Acquirer::new(Arc::clone(&self.locator), &self.options);
        let acquired = acquirer
            .acquire(&raw, main_pid, &filter, tracker.as_ref(), cancel)
            .await?;
        let (rejected_binaries, rejected_symbols) = acquirer.rejected().counts();
        log::debug!(
            "[{}] {} binaries and {} symbol files rejected",
            tracker.session_id,
            rejected_binaries,
            rejected_symbols
        );
        cancel.check()?;

        tracker.enter(LoadStage::TraceProcessing);
        let mut report = ProfileDataReport::new(tracker.session_id, process_ids);
        report.trace_path = raw.info().trace_path.clone();
        report.record_modules(&raw, &acquired);

        let main_image_name = main_process.image_file_name.clone();
        let job = ProcessingJob {
            raw,
            acquired,
            options: self.options.clone(),
            process_ids: process_ids.to_vec(),
            main_process,
            report,
            tracker: Arc::clone(tracker),
            cancel: cancel.clone(),
        };
        let (mut profile, resolvers) = tokio::task::spawn_blocking(move || job.run())
            .await
            .context("Sample processing panicked")??;
        cancel.check()?;

        let (main, others) = find_session_documents(&main_image_name, &resolvers);
        for document in main.iter().chain(others.iter()) {
            if let Some(debug_info) = &document.debug_info {
                profile.register_module_debug_info(document.image.id, Arc::clone(debug_info));
            }
        }
        profile.report.stage_timings = tracker.timings();
        profile.report.finish();
        log::debug!("{}", profile.report.summary());

        let profile = Arc::new(profile);
        self.session
            .setup_session(main, others, &profile)
            .context("Session setup failed")?;
        Ok(profile)
    }
}
