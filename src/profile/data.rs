use super::{FunctionEntry, FunctionId, ProfileDataReport, ProfileSample};
use crate::options::PerformanceMetricConfig;
use crate::symbols::DebugInfoProvider;
use crate::trace::{ImageId, PerformanceCounter, ProfileImage, ProfileProcess, ProfileThread};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

/// Event counts per performance counter id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterValueSet {
    values: BTreeMap<u32, u64>,
}

impl CounterValueSet {
    pub fn add(&mut self, counter_id: u32, value: u64) {
        *self.values.entry(counter_id).or_default() += value;
    }

    pub fn get(&self, counter_id: u32) -> u64 {
        self.values.get(&counter_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.values.iter().map(|(&id, &value)| (id, value))
    }
}

/// A metric registered from a `PerformanceMetricConfig`, bound to counter ids.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceMetric {
    pub id: u32,
    pub config: PerformanceMetricConfig,
    pub base_counter: u32,
    pub relative_counter: u32,
}

impl PerformanceMetric {
    /// Ratio of the relative counter to the base counter, as a percentage.
    pub fn compute(&self, values: &CounterValueSet) -> Option<f64> {
        let base = values.get(self.base_counter);
        if base == 0 {
            return None;
        }
        Some(values.get(self.relative_counter) as f64 * 100.0 / base as f64)
    }
}

#[derive(Debug, Clone)]
pub struct FunctionProfile {
    pub function: Arc<FunctionEntry>,
    /// Weight of samples with the function anywhere in the stack, counted once per sample.
    pub weight: Duration,
    /// Weight of samples with the function on top of the stack.
    pub exclusive_weight: Duration,
    /// Exclusive weight per offset within the function.
    pub instruction_weight: HashMap<u64, Duration>,
    pub counters: CounterValueSet,
    pub instruction_counters: HashMap<u64, CounterValueSet>,
}

impl FunctionProfile {
    pub fn new(function: Arc<FunctionEntry>) -> Self {
        Self {
            function,
            weight: Duration::ZERO,
            exclusive_weight: Duration::ZERO,
            instruction_weight: HashMap::new(),
            counters: CounterValueSet::default(),
            instruction_counters: HashMap::new(),
        }
    }
}

/// Contiguous sample index ranges per thread. The `None` key spans all threads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadSampleRanges {
    ranges: HashMap<Option<u32>, Vec<Range<usize>>>,
}

impl ThreadSampleRanges {
    pub fn build(samples: &[ProfileSample]) -> Self {
        let mut ranges: HashMap<Option<u32>, Vec<Range<usize>>> = HashMap::new();
        if samples.is_empty() {
            return Self { ranges };
        }
        ranges.insert(None, vec![0..samples.len()]);

        let mut start = 0;
        for i in 1..=samples.len() {
            let thread_id = samples[start].context.thread_id;
            if i == samples.len() || samples[i].context.thread_id != thread_id {
                ranges.entry(Some(thread_id)).or_default().push(start..i);
                start = i;
            }
        }
        Self { ranges }
    }

    pub fn all(&self) -> &[Range<usize>] {
        self.get(None)
    }

    pub fn thread(&self, thread_id: u32) -> &[Range<usize>] {
        self.get(Some(thread_id))
    }

    fn get(&self, key: Option<u32>) -> &[Range<usize>] {
        self.ranges.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// The result of a load. Read-only once handed out.
#[derive(Debug)]
pub struct ProfileData {
    pub process: Option<ProfileProcess>,
    pub threads: Vec<ProfileThread>,
    pub modules: Vec<Arc<ProfileImage>>,
    /// Sorted by time.
    pub samples: Vec<ProfileSample>,
    pub total_weight: Duration,
    pub profile_weight: Duration,
    pub functions: HashMap<FunctionId, FunctionProfile>,
    pub module_weights: HashMap<ImageId, Duration>,
    pub module_counters: HashMap<String, CounterValueSet>,
    pub counters: Vec<PerformanceCounter>,
    pub metrics: Vec<PerformanceMetric>,
    pub thread_ranges: ThreadSampleRanges,
    pub module_debug_info: HashMap<ImageId, Arc<dyn DebugInfoProvider>>,
    pub report: ProfileDataReport,
}

impl ProfileData {
    pub fn function(&self, id: FunctionId) -> Option<&FunctionProfile> {
        self.functions.get(&id)
    }

    pub fn find_function_by_name(&self, name: &str) -> Option<&FunctionProfile> {
        self.functions.values().find(|f| f.function.name == name)
    }

    /// Functions by descending exclusive weight, ties broken by id.
    pub fn top_functions(&self, count: usize) -> Vec<&FunctionProfile> {
        let mut functions: Vec<&FunctionProfile> = self.functions.values().collect();
        functions.sort_by(|a, b| {
            b.exclusive_weight
                .cmp(&a.exclusive_weight)
                .then(a.function.id.cmp(&b.function.id))
        });
        functions.truncate(count);
        functions
    }

    /// Modules by descending exclusive weight.
    pub fn top_modules(&self, count: usize) -> Vec<(Arc<ProfileImage>, Duration)> {
        let mut modules: Vec<(Arc<ProfileImage>, Duration)> = self
            .modules
            .iter()
            .filter_map(|image| {
                self.module_weights
                    .get(&image.id)
                    .map(|&weight| (Arc::clone(image), weight))
            })
            .collect();
        modules.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.id.cmp(&b.0.id)));
        modules.truncate(count);
        modules
    }

    pub fn register_module_debug_info(&mut self, image: ImageId, debug_info: Arc<dyn DebugInfoProvider>) {
        self.module_debug_info.insert(image, debug_info);
    }

    pub fn counter(&self, name: &str) -> Option<&PerformanceCounter> {
        self.counters.iter().find(|c| c.name == name)
    }
}
