use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A derived metric, computed as the ratio of two recorded counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetricConfig {
    pub name: String,
    pub base_counter: String,
    pub relative_counter: String,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileOptions {
    pub include_kernel_events: bool,
    /// Only binaries whose name stem matches an entry are downloaded.
    pub binary_name_allow_list: Option<Vec<String>>,
    pub binary_search_paths: Vec<PathBuf>,
    pub skip_low_sample_modules: bool,
    /// Fraction of all samples a module needs before its symbols are fetched.
    pub low_sample_module_cutoff: f64,
    pub cpu_core_limit: usize,
    pub performance_metrics: Vec<PerformanceMetricConfig>,
    pub binary_fetch_limit: usize,
    pub symbol_fetch_limit: usize,
    pub fetch_timeout: Duration,
    pub top_modules_time_budget: Duration,
    pub debuginfod_urls: Vec<String>,
    pub symbol_cache_dir: Option<PathBuf>,
}

impl Default for ProfileOptions {
    fn default() -> Self {
        Self {
            include_kernel_events: false,
            binary_name_allow_list: None,
            binary_search_paths: vec![],
            skip_low_sample_modules: true,
            low_sample_module_cutoff: 0.002,
            cpu_core_limit: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            performance_metrics: vec![],
            binary_fetch_limit: 8,
            symbol_fetch_limit: 12,
            fetch_timeout: Duration::from_secs(10),
            top_modules_time_budget: Duration::from_secs(1),
            debuginfod_urls: vec![],
            symbol_cache_dir: None,
        }
    }
}

impl ProfileOptions {
    /// Reads bincode-encoded options from a file.
    pub fn read_from(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read options file {}", path.display()))?;
        let options: ProfileOptions = bincode::deserialize(&data)
            .with_context(|| format!("Failed to decode options file {}", path.display()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.low_sample_module_cutoff),
            "low_sample_module_cutoff must be in [0, 1], got {}",
            self.low_sample_module_cutoff
        );
        ensure!(self.cpu_core_limit >= 1, "cpu_core_limit must be at least 1");
        ensure!(
            self.binary_fetch_limit >= 1 && self.symbol_fetch_limit >= 1,
            "fetch limits must be at least 1"
        );
        Ok(())
    }

    pub fn has_binary_name_allow_list(&self) -> bool {
        self.binary_name_allow_list
            .as_ref()
            .map_or(false, |list| !list.is_empty())
    }

    /// Sample count a module must exceed before its symbol file is requested.
    pub fn module_sample_cutoff(&self, total_samples: usize) -> u64 {
        if !self.skip_low_sample_modules {
            return 0;
        }
        (self.low_sample_module_cutoff * total_samples as f64) as u64
    }
}
