use super::{
    CounterValueSet, FunctionEntry, FunctionId, FunctionProfile, PerformanceMetric, ProfileData,
    ProfileDataReport, ProfileSample, ThreadSampleRanges,
};
use crate::options::PerformanceMetricConfig;
use crate::trace::{ImageId, PerformanceCounter, ProfileImage, ProfileProcess, ProfileThread};
use anyhow::ensure;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

/// Ids handed to registered metrics start here, above any counter id.
pub const METRIC_ID_BASE: u32 = 1000;

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    total: Duration,
    in_scope: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// ProfileAggregator owns the mutable state of a profile while samples are processed.
#[derive(Debug, Default)]
pub struct ProfileAggregator {
    totals: Mutex<Totals>,
    functions: RwLock<HashMap<FunctionId, Arc<Mutex<FunctionProfile>>>>,
    module_weights: Mutex<HashMap<ImageId, Duration>>,
    module_counters: Mutex<HashMap<String, CounterValueSet>>,
    counters: Mutex<Vec<PerformanceCounter>>,
    metrics: Mutex<Vec<PerformanceMetric>>,
}

impl ProfileAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one chunk's weight. Called once per chunk, not per sample.
    pub fn add_weight(&self, total: Duration, in_scope: Duration) {
        let mut totals = lock(&self.totals);
        totals.total += total;
        totals.in_scope += in_scope;
    }

    pub fn total_weight(&self) -> Duration {
        lock(&self.totals).total
    }

    pub fn in_scope_weight(&self) -> Duration {
        lock(&self.totals).in_scope
    }

    fn function_record(&self, function: &Arc<FunctionEntry>) -> Arc<Mutex<FunctionProfile>> {
        {
            let functions = match self.functions.read() {
                Ok(functions) => functions,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(record) = functions.get(&function.id) {
                return Arc::clone(record);
            }
        }

        let mut functions = match self.functions.write() {
            Ok(functions) => functions,
            Err(poisoned) => poisoned.into_inner(),
        };
        let record = functions.entry(function.id).or_insert_with(|| {
            Arc::new(Mutex::new(FunctionProfile::new(Arc::clone(function))))
        });
        Arc::clone(record)
    }

    /// Adds `weight` to a function. Exclusive samples also count at `offset`.
    pub fn record_function_sample(
        &self,
        function: &Arc<FunctionEntry>,
        offset: u64,
        weight: Duration,
        exclusive: bool,
    ) {
        let record = self.function_record(function);
        let mut record = lock(&record);
        if exclusive {
            record.exclusive_weight += weight;
            *record.instruction_weight.entry(offset).or_default() += weight;
        } else {
            record.weight += weight;
        }
    }

    pub fn record_module_weight(&self, image: ImageId, weight: Duration) {
        *lock(&self.module_weights).entry(image).or_default() += weight;
    }

    pub fn record_module_counter(&self, module: &str, counter_id: u32, value: u64) {
        lock(&self.module_counters)
            .entry(module.to_string())
            .or_default()
            .add(counter_id, value);
    }

    pub fn record_performance_counter_sample(
        &self,
        function: &Arc<FunctionEntry>,
        offset: u64,
        counter_id: u32,
    ) {
        let record = self.function_record(function);
        let mut record = lock(&record);
        record.counters.add(counter_id, 1);
        record
            .instruction_counters
            .entry(offset)
            .or_default()
            .add(counter_id, 1);
    }

    pub fn register_performance_counter(&self, counter: PerformanceCounter) {
        let mut counters = lock(&self.counters);
        if !counters.iter().any(|c| c.id == counter.id) {
            counters.push(counter);
        }
    }

    /// Registers a metric over two registered counters. Returns false, and
    /// registers nothing, when either counter is missing.
    pub fn register_performance_metric(&self, id: u32, config: &PerformanceMetricConfig) -> bool {
        let counters = lock(&self.counters);
        let find = |name: &str| counters.iter().find(|c| c.name == name).map(|c| c.id);

        let (base_counter, relative_counter) =
            match (find(&config.base_counter), find(&config.relative_counter)) {
                (Some(base), Some(relative)) => (base, relative),
                _ => {
                    log::warn!(
                        "Metric {} needs counters {} and {}, skipping",
                        config.name,
                        config.base_counter,
                        config.relative_counter
                    );
                    return false;
                }
            };

        lock(&self.metrics).push(PerformanceMetric {
            id,
            config: config.clone(),
            base_counter,
            relative_counter,
        });
        true
    }

    /// compute_aggregate gives each sample's weight to the function and module on
    /// top of its stack, and once to every distinct function in the stack.
    pub fn compute_aggregate(&self, samples: &[ProfileSample]) {
        samples.par_iter().for_each(|sample| {
            let frames = &sample.stack.frames;

            if let Some(top) = frames.first() {
                if let Some(function) = &top.function {
                    self.record_function_sample(
                        function,
                        function.offset_of(top.rva),
                        sample.weight,
                        true,
                    );
                }
                if let Some(image) = &top.image {
                    self.record_module_weight(image.id, sample.weight);
                }
            }

            let mut seen: Vec<FunctionId> = Vec::with_capacity(frames.len());
            for frame in frames.iter() {
                let function = match &frame.function {
                    Some(function) => function,
                    None => continue,
                };
                if seen.contains(&function.id) {
                    continue;
                }
                seen.push(function.id);
                self.record_function_sample(function, 0, sample.weight, false);
            }
        });
    }

    /// finalize checks the sample order and hands out the read-only profile.
    pub fn finalize(
        self,
        process: Option<ProfileProcess>,
        threads: Vec<ProfileThread>,
        modules: Vec<Arc<ProfileImage>>,
        samples: Vec<ProfileSample>,
        report: ProfileDataReport,
    ) -> anyhow::Result<ProfileData> {
        ensure!(
            samples.windows(2).all(|w| w[0].time <= w[1].time),
            "Profile samples are not sorted by time"
        );

        let totals = *lock(&self.totals);
        let functions = self
            .functions
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .into_iter()
            .map(|(id, record)| {
                let record = lock(&record).clone();
                (id, record)
            })
            .collect();

        let mut report = report;
        report.sample_count = samples.len();

        Ok(ProfileData {
            process,
            threads,
            modules,
            thread_ranges: ThreadSampleRanges::build(&samples),
            samples,
            total_weight: totals.total,
            profile_weight: totals.in_scope,
            functions,
            module_weights: into_inner(self.module_weights),
            module_counters: into_inner(self.module_counters),
            counters: into_inner(self.counters),
            metrics: into_inner(self.metrics),
            module_debug_info: HashMap::new(),
            report,
        })
    }
}

fn into_inner<T>(m: Mutex<T>) -> T {
    m.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
}
