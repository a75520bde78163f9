use crate::debuginfo_store::RejectionReason;
use crate::options::ProfileOptions;
use crate::trace::{file_stem, ImageId, ProfileImage, RawProfile};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Clock is checked once per this many samples.
const TIME_CHECK_INTERVAL: usize = 2048;

/// approximate_top_modules counts, per image, the stack frames of `target_pid`
/// samples that fall inside it. Samples with unknown stacks count their own IP.
/// The walk stops once `time_budget` is spent, so the counts are approximate.
/// The result is ranked by descending hit count, ties broken by image id.
pub fn approximate_top_modules(
    raw: &RawProfile,
    target_pid: u32,
    time_budget: Duration,
) -> Vec<(Arc<ProfileImage>, u64)> {
    let start = Instant::now();
    let mut hits: HashMap<ImageId, (Arc<ProfileImage>, u64)> = HashMap::new();
    let mut count = |image: &Arc<ProfileImage>| {
        hits.entry(image.id)
            .or_insert_with(|| (Arc::clone(image), 0))
            .1 += 1;
    };

    for (index, sample) in raw.samples().iter().enumerate() {
        if index % TIME_CHECK_INTERVAL == 0 && index > 0 && start.elapsed() > time_budget {
            log::info!(
                "Top modules scan stopped after {} of {} samples",
                index,
                raw.samples().len()
            );
            break;
        }

        match raw.context(sample.context_id) {
            Some(context) if context.process_id == target_pid => {}
            _ => continue,
        }

        let stack = sample.stack_id.and_then(|id| raw.stack(id));
        match stack {
            Some(stack) if !stack.is_unknown() => {
                for &ip in stack.frames.iter() {
                    if let Some(image) = raw.find_image_for_frame(ip, target_pid) {
                        count(image);
                    }
                }
            }
            _ => {
                if let Some(image) = raw.find_image_for_frame(sample.ip, target_pid) {
                    count(image);
                }
            }
        }
    }

    let mut ranked: Vec<(Arc<ProfileImage>, u64)> = hits.into_values().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.id.cmp(&b.0.id)));
    ranked
}

/// ModuleFilter decides which images get their binary and symbol files acquired.
#[derive(Debug)]
pub struct ModuleFilter {
    allow_list: Option<Vec<String>>,
    top_modules: HashMap<ImageId, u64>,
    symbol_cutoff: u64,
}

impl ModuleFilter {
    pub fn new(
        options: &ProfileOptions,
        top_modules: &[(Arc<ProfileImage>, u64)],
        total_samples: usize,
    ) -> Self {
        let allow_list = if options.has_binary_name_allow_list() {
            options.binary_name_allow_list.as_ref().map(|list| {
                list.iter()
                    .map(|name| file_stem(name).to_lowercase())
                    .collect()
            })
        } else {
            None
        };

        Self {
            allow_list,
            top_modules: top_modules
                .iter()
                .map(|(image, hits)| (image.id, *hits))
                .collect(),
            symbol_cutoff: options.module_sample_cutoff(total_samples),
        }
    }

    pub fn hits(&self, image: ImageId) -> u64 {
        self.top_modules.get(&image).copied().unwrap_or(0)
    }

    /// Whether the image's binary should be acquired.
    pub fn is_accepted(&self, image: &ProfileImage) -> Result<(), RejectionReason> {
        if let Some(allow_list) = &self.allow_list {
            let stem = image.stem().to_lowercase();
            if !allow_list.iter().any(|name| *name == stem) {
                return Err(RejectionReason::NotInAllowList);
            }
        }

        if !self.top_modules.contains_key(&image.id) {
            return Err(RejectionReason::NoSamples);
        }
        Ok(())
    }

    /// Stricter than `is_accepted`: the image must also carry more than the
    /// low-sample cutoff before its symbol file is requested.
    pub fn accepts_symbols(&self, image: &ProfileImage) -> Result<(), RejectionReason> {
        self.is_accepted(image)?;

        let hits = self.hits(image.id);
        if hits <= self.symbol_cutoff {
            return Err(RejectionReason::BelowSampleCutoff {
                hits,
                cutoff: self.symbol_cutoff,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::testing::TraceBuilder;

    fn sample_trace() -> (RawProfile, ImageId, ImageId, ImageId) {
        let mut b = TraceBuilder::new();
        b.add_process(10, "app.exe");
        b.add_process(20, "other.exe");
        let app = b.add_image(10, "app.exe", 0x1000, 0x1000);
        let lib = b.add_image(10, "Lib.DLL", 0x4000, 0x1000);
        let foreign = b.add_image(20, "other.exe", 0x1000, 0x1000);

        let stack = b.add_stack(10, 1, &[0x4010, 0x1010, 0x1020]);
        for t in 0..90 {
            b.add_sample(t, 1, 10, 1, 0x4010, Some(stack));
        }
        for t in 90..100 {
            b.add_sample(t, 1, 10, 1, 0x1010, None);
        }
        for t in 0..50 {
            b.add_sample(t, 1, 20, 2, 0x1010, None);
        }
        (b.build(), app, lib, foreign)
    }

    #[test]
    fn test_top_modules_ranking() {
        let (raw, app, lib, foreign) = sample_trace();
        let ranked = approximate_top_modules(&raw, 10, Duration::from_secs(10));

        let ids: Vec<(ImageId, u64)> = ranked.iter().map(|(i, h)| (i.id, *h)).collect();
        assert_eq!(ids, vec![(app, 190), (lib, 90)]);
        assert!(!ranked.iter().any(|(i, _)| i.id == foreign));
    }

    #[test]
    fn test_every_frame_in_an_image_counts() {
        let mut b = TraceBuilder::new();
        b.add_process(10, "app.exe");
        let app = b.add_image(10, "app.exe", 0x1000, 0x1000);
        let stack = b.add_stack(10, 1, &[0x1010, 0x1020, 0x1030]);
        b.add_sample(0, 1, 10, 1, 0x1010, Some(stack));
        let raw = b.build();

        let ranked = approximate_top_modules(&raw, 10, Duration::from_secs(10));
        assert_eq!(ranked.len(), 1);
        assert_eq!((ranked[0].0.id, ranked[0].1), (app, 3));
    }

    #[test]
    fn test_allow_list_matches_stem_case_insensitive() {
        let (raw, app, lib, _) = sample_trace();
        let ranked = approximate_top_modules(&raw, 10, Duration::from_secs(10));
        let options = ProfileOptions {
            binary_name_allow_list: Some(vec!["C:\\sys\\lib.dll".to_string()]),
            ..Default::default()
        };
        let filter = ModuleFilter::new(&options, &ranked, raw.samples().len());

        assert!(filter.is_accepted(raw.image(lib).unwrap()).is_ok());
        assert_eq!(
            filter.is_accepted(raw.image(app).unwrap()),
            Err(RejectionReason::NotInAllowList)
        );
    }

    #[test]
    fn test_unranked_image_is_rejected() {
        let (raw, _, _, foreign) = sample_trace();
        let ranked = approximate_top_modules(&raw, 10, Duration::from_secs(10));
        let filter = ModuleFilter::new(&ProfileOptions::default(), &ranked, raw.samples().len());

        assert_eq!(
            filter.is_accepted(raw.image(foreign).unwrap()),
            Err(RejectionReason::NoSamples)
        );
    }

    #[test]
    fn test_symbol_cutoff() {
        let (raw, app, lib, _) = sample_trace();
        let ranked = approximate_top_modules(&raw, 10, Duration::from_secs(10));
        // 150 samples in total, so more than 93 hits are needed.
        let options = ProfileOptions {
            low_sample_module_cutoff: 0.625,
            ..Default::default()
        };
        let filter = ModuleFilter::new(&options, &ranked, raw.samples().len());

        assert!(filter.accepts_symbols(raw.image(app).unwrap()).is_ok());
        assert!(filter.is_accepted(raw.image(lib).unwrap()).is_ok());
        assert_eq!(
            filter.accepts_symbols(raw.image(lib).unwrap()),
            Err(RejectionReason::BelowSampleCutoff { hits: 90, cutoff: 93 })
        );
    }
}
