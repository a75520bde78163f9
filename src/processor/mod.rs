use crate::pipeline::{CancelToken, LoadProgress, LoadStage, ProgressSink};
use crate::profile::{ProfileAggregator, ProfileSample};
use crate::symbolizer::{ModuleKey, StackResolver, WorkerContext, WorkerStats};
use crate::trace::RawProfile;
use rayon::prelude::*;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Samples a chunk processes between two progress reports.
pub const PROGRESS_INTERVAL: usize = 32768;

/// chunk_ranges splits `len` items into at most `chunks` contiguous ranges of
/// nearly equal size, in array order.
pub fn chunk_ranges(len: usize, chunks: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return vec![];
    }
    let size = (len + chunks.max(1) - 1) / chunks.max(1);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

struct SharedProgress<'a> {
    sink: &'a dyn ProgressSink,
    total: usize,
    done: AtomicUsize,
    reported: Mutex<usize>,
}

impl<'a> SharedProgress<'a> {
    fn advance(&self, count: usize, label: String) {
        let current = self.done.fetch_add(count, Ordering::Relaxed) + count;
        let mut reported = match self.reported.lock() {
            Ok(reported) => reported,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Reports from racing chunks may arrive out of order; drop the stale ones.
        if current > *reported {
            *reported = current;
            self.sink.on_progress(
                LoadProgress::new(LoadStage::TraceProcessing, self.total, current).with_label(label),
            );
        }
    }
}

/// ChunkedSampleProcessor resolves the samples of the requested processes in
/// parallel chunks and returns them sorted by time.
pub struct ChunkedSampleProcessor<'a> {
    raw: &'a RawProfile,
    stacks: &'a StackResolver<'a>,
    aggregator: &'a ProfileAggregator,
    progress: &'a dyn ProgressSink,
    cancel: &'a CancelToken,
}

impl<'a> ChunkedSampleProcessor<'a> {
    pub fn new(
        raw: &'a RawProfile,
        stacks: &'a StackResolver<'a>,
        aggregator: &'a ProfileAggregator,
        progress: &'a dyn ProgressSink,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            raw,
            stacks,
            aggregator,
            progress,
            cancel,
        }
    }

    /// process runs on the current rayon pool. Each chunk commits its weight
    /// to the aggregator once it has fully completed.
    pub fn process(
        &self,
        process_ids: &[u32],
        include_kernel: bool,
        chunk_count: usize,
    ) -> anyhow::Result<(Vec<ProfileSample>, WorkerStats)> {
        let samples = self.raw.samples();
        let ranges = chunk_ranges(samples.len(), chunk_count);
        let progress = SharedProgress {
            sink: self.progress,
            total: samples.len(),
            done: AtomicUsize::new(0),
            reported: Mutex::new(0),
        };
        log::debug!(
            "Processing {} samples in {} chunks",
            samples.len(),
            ranges.len()
        );

        let chunks = ranges
            .into_par_iter()
            .map(|range| self.process_chunk(range, process_ids, include_kernel, &progress))
            .collect::<anyhow::Result<Vec<_>>>()?;
        self.cancel.check()?;

        let mut stats = WorkerStats::default();
        let mut resolved = Vec::with_capacity(chunks.iter().map(|(s, _)| s.len()).sum());
        for (chunk, chunk_stats) in chunks {
            stats.merge(&chunk_stats);
            resolved.extend(chunk);
        }

        // Chunks are split in array order, which need not be time order.
        resolved.par_sort_by_key(|s| s.time);
        Ok((resolved, stats))
    }

    fn process_chunk(
        &self,
        range: Range<usize>,
        process_ids: &[u32],
        include_kernel: bool,
        progress: &SharedProgress<'_>,
    ) -> anyhow::Result<(Vec<ProfileSample>, WorkerStats)> {
        let start = Instant::now();
        let samples = &self.raw.samples()[range.clone()];
        let mut ctx = WorkerContext::new();
        let mut resolved = Vec::with_capacity(samples.len());
        let mut weight = Duration::ZERO;
        let mut pending = 0;

        for (offset, sample) in samples.iter().enumerate() {
            pending += 1;
            if pending == PROGRESS_INTERVAL {
                self.cancel.check()?;
                progress.advance(pending, rate_label(offset + 1, start));
                pending = 0;
            }

            if sample.is_kernel && !include_kernel {
                continue;
            }
            let context = self.raw.context(sample.context_id).unwrap_or_default();
            if !process_ids.contains(&context.process_id) {
                continue;
            }

            let stack = self.stacks.resolve_sample(sample, &mut ctx);
            weight += sample.weight;
            resolved.push(ProfileSample {
                index: range.start + offset,
                time: sample.time,
                weight: sample.weight,
                context,
                stack,
                is_kernel: sample.is_kernel,
            });
        }

        self.cancel.check()?;
        if pending > 0 {
            progress.advance(pending, rate_label(samples.len(), start));
        }
        self.aggregator.add_weight(weight, weight);

        log::debug!(
            "Chunk {:?}: {} samples kept, {} stacks resolved, {} memo hits in {:?}",
            range,
            resolved.len(),
            ctx.stats.samples - ctx.stats.memo_hits,
            ctx.stats.memo_hits,
            start.elapsed()
        );
        Ok((resolved, ctx.stats))
    }

    /// process_counters attributes performance counter events of the requested
    /// processes to modules, and to functions of modules with debug info.
    pub fn process_counters(&self, process_ids: &[u32]) -> anyhow::Result<()> {
        let events = self.raw.counter_events();
        let total = events.len();
        let done = AtomicUsize::new(0);

        events
            .par_chunks(PROGRESS_INTERVAL)
            .try_for_each(|events| -> anyhow::Result<()> {
                self.cancel.check()?;
                let mut ctx = WorkerContext::new();
                for event in events {
                    let context = match self.raw.context(event.context_id) {
                        Some(context) if process_ids.contains(&context.process_id) => context,
                        _ => continue,
                    };

                    let frame = self
                        .stacks
                        .resolve_ip(event.ip, context.process_id, &mut ctx);
                    let image = match &frame.image {
                        Some(image) => image,
                        None => continue,
                    };
                    self.aggregator
                        .record_module_counter(&image.module_name, event.counter_id, 1);

                    let key = ModuleKey {
                        image: image.id,
                        is_managed: frame.is_managed(),
                    };
                    let has_debug_info = self
                        .stacks
                        .registry()
                        .get(key)
                        .map_or(false, |resolver| resolver.has_debug_info());
                    if !has_debug_info {
                        continue;
                    }
                    if let Some(function) = &frame.function {
                        self.aggregator.record_performance_counter_sample(
                            function,
                            function.offset_of(frame.rva),
                            event.counter_id,
                        );
                    }
                }

                let current = done.fetch_add(events.len(), Ordering::Relaxed) + events.len();
                self.progress.on_progress(LoadProgress::new(
                    LoadStage::PerformanceCounterProcessing,
                    total,
                    current,
                ));
                Ok(())
            })
    }
}

fn rate_label(processed: usize, start: Instant) -> String {
    let secs = start.elapsed().as_secs_f64().max(0.001);
    format!("{:.0} samples/sec", processed as f64 / secs)
}
