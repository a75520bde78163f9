use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadStage {
    Idle,
    TraceReading,
    BinaryLoading,
    SymbolLoading,
    TraceProcessing,
    ComputeAggregate,
    PerformanceCounterProcessing,
    Completed,
    Canceled,
    Failed,
}

impl LoadStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }
}

impl std::fmt::Display for LoadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::TraceReading => "trace reading",
            Self::BinaryLoading => "binary loading",
            Self::SymbolLoading => "symbol loading",
            Self::TraceProcessing => "trace processing",
            Self::ComputeAggregate => "compute aggregate",
            Self::PerformanceCounterProcessing => "performance counter processing",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadProgress {
    pub stage: LoadStage,
    pub total: usize,
    /// Non-decreasing within a stage, but may stop short of `total`.
    pub current: usize,
    pub label: Option<String>,
}

impl LoadProgress {
    pub fn new(stage: LoadStage, total: usize, current: usize) -> Self {
        Self {
            stage,
            total,
            current,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Receives progress updates, possibly from several worker threads at once.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: LoadProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(LoadProgress) + Send + Sync,
{
    fn on_progress(&self, progress: LoadProgress) {
        self(progress)
    }
}

/// A sink that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _: LoadProgress) {}
}

/// Cooperative cancellation flag shared between the caller and a running load.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns a `Canceled` error once cancellation was requested.
    pub fn check(&self) -> anyhow::Result<()> {
        if self.is_canceled() {
            return Err(Canceled.into());
        }
        Ok(())
    }
}

/// Marker error for a load stopped by its `CancelToken`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

impl std::fmt::Display for Canceled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("profile load canceled")
    }
}

impl std::error::Error for Canceled {}

/// is_canceled reports whether an error chain was caused by cancellation.
pub fn is_canceled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Canceled>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use std::sync::Mutex;

    #[test]
    fn test_cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());

        other.cancel();
        assert!(token.is_canceled());
        let err = token.check().unwrap_err();
        assert!(is_canceled(&err));
    }

    #[test]
    fn test_canceled_survives_added_context() {
        let err = CancelToken::new();
        err.cancel();
        let err = err.check().context("while loading symbols").unwrap_err();
        assert!(is_canceled(&err));
        assert!(!is_canceled(&anyhow::anyhow!("disk full")));
    }

    #[test]
    fn test_closure_is_a_progress_sink() {
        let seen = Mutex::new(vec![]);
        let sink = |p: LoadProgress| seen.lock().unwrap().push(p.stage);
        sink.on_progress(LoadProgress::new(LoadStage::BinaryLoading, 2, 1));
        sink.on_progress(LoadProgress::new(LoadStage::SymbolLoading, 2, 2).with_label("app"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![LoadStage::BinaryLoading, LoadStage::SymbolLoading]
        );
    }
}
