use crate::debuginfo_store::{AcquiredModules, ModuleLoadState};
use crate::pipeline::LoadStage;
use crate::trace::{ImageId, RawProfile, SymbolFileDescriptor};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Duration;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReport {
    pub module_name: String,
    pub binary_state: ModuleLoadState,
    pub symbol_state: ModuleLoadState,
    pub symbol_descriptor: Option<SymbolFileDescriptor>,
}

/// What happened during one load: which files were found and how long each stage took.
#[derive(Debug, Clone)]
pub struct ProfileDataReport {
    pub session_id: Ulid,
    pub trace_path: Option<String>,
    pub process_ids: Vec<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stage_timings: Vec<(LoadStage, Duration)>,
    pub modules: BTreeMap<ImageId, ModuleReport>,
    pub sample_count: usize,
}

impl ProfileDataReport {
    pub fn new(session_id: Ulid, process_ids: &[u32]) -> Self {
        Self {
            session_id,
            trace_path: None,
            process_ids: process_ids.to_vec(),
            started_at: Utc::now(),
            finished_at: None,
            stage_timings: vec![],
            modules: BTreeMap::new(),
            sample_count: 0,
        }
    }

    pub fn record_stage(&mut self, stage: LoadStage, elapsed: Duration) {
        self.stage_timings.push((stage, elapsed));
    }

    pub fn record_modules(&mut self, raw: &RawProfile, acquired: &AcquiredModules) {
        for (&id, files) in acquired.iter() {
            let module_name = raw
                .image(id)
                .map(|image| image.module_name.clone())
                .unwrap_or_default();
            self.modules.insert(
                id,
                ModuleReport {
                    module_name,
                    binary_state: files.binary_state.clone(),
                    symbol_state: files.symbol_state.clone(),
                    symbol_descriptor: files.symbol_descriptor.clone(),
                },
            );
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn stage_time(&self, stage: LoadStage) -> Option<Duration> {
        self.stage_timings
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, elapsed)| *elapsed)
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "session {} started {}",
            self.session_id,
            self.started_at.to_rfc3339()
        );
        for (stage, elapsed) in self.stage_timings.iter() {
            let _ = writeln!(out, "  {}: {:?}", stage, elapsed);
        }
        let loaded = self
            .modules
            .values()
            .filter(|m| m.symbol_state.is_loaded())
            .count();
        let _ = writeln!(
            out,
            "  {} samples, symbols for {} of {} modules",
            self.sample_count,
            loaded,
            self.modules.len()
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_timings() {
        let mut report = ProfileDataReport::new(Ulid::new(), &[10]);
        report.record_stage(LoadStage::BinaryLoading, Duration::from_millis(5));
        report.record_stage(LoadStage::TraceProcessing, Duration::from_millis(7));
        report.finish();

        assert_eq!(
            report.stage_time(LoadStage::TraceProcessing),
            Some(Duration::from_millis(7))
        );
        assert_eq!(report.stage_time(LoadStage::SymbolLoading), None);
        assert!(report.finished_at.unwrap() >= report.started_at);
        assert!(report.summary().contains("trace processing"));
    }
}
