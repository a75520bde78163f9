pub mod aggregator;
mod data;
mod report;

pub use aggregator::ProfileAggregator;
pub use data::{
    CounterValueSet, FunctionProfile, PerformanceMetric, ProfileData, ThreadSampleRanges,
};
pub use report::{ModuleReport, ProfileDataReport};

use crate::symbols::SourceLine;
use crate::trace::{ImageId, ProfileContext, ProfileImage};
use std::sync::Arc;
use std::time::Duration;

/// A function is identified by its image and its start offset in that image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId {
    pub image: ImageId,
    pub rva: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionEntry {
    pub id: FunctionId,
    pub name: String,
    pub size: u64,
    pub source: Option<SourceLine>,
    /// Made up for an address with no debug info; spans one offset.
    pub synthetic: bool,
}

impl FunctionEntry {
    pub fn synthetic(image: ImageId, rva: u64) -> Self {
        Self {
            id: FunctionId { image, rva },
            name: format!("{:X}", rva),
            size: 1,
            source: None,
            synthetic: true,
        }
    }

    pub fn contains(&self, rva: u64) -> bool {
        rva >= self.id.rva && rva - self.id.rva < self.size
    }

    /// Offset of `rva` from the function start.
    pub fn offset_of(&self, rva: u64) -> u64 {
        rva.saturating_sub(self.id.rva)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub function: Option<FunctionId>,
    pub image: Option<ImageId>,
    pub is_managed: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedFrame {
    pub function: Option<Arc<FunctionEntry>>,
    pub image: Option<Arc<ProfileImage>>,
    pub ip: u64,
    /// Offset within the image, or the absolute address for managed frames.
    pub rva: u64,
    pub index: usize,
    pub key: FrameKey,
    pub is_kernel: bool,
}

impl ResolvedFrame {
    /// A frame whose pointer maps to no known image.
    pub fn unknown(ip: u64, index: usize, is_kernel: bool) -> Self {
        Self {
            function: None,
            image: None,
            ip,
            rva: 0,
            index,
            key: FrameKey {
                function: None,
                image: None,
                is_managed: false,
            },
            is_kernel,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.image.is_none()
    }

    pub fn is_managed(&self) -> bool {
        self.key.is_managed
    }

    pub fn offset_in_function(&self) -> Option<u64> {
        self.function.as_ref().map(|f| f.offset_of(self.rva))
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedStack {
    pub context: ProfileContext,
    /// Innermost frame first.
    pub frames: Vec<ResolvedFrame>,
}

impl ResolvedStack {
    pub fn top_frame(&self) -> Option<&ResolvedFrame> {
        self.frames.first()
    }
}

/// A sample of a requested process, with its resolved stack.
#[derive(Debug, Clone)]
pub struct ProfileSample {
    /// Position of the raw sample in the trace.
    pub index: usize,
    pub time: Duration,
    pub weight: Duration,
    pub context: ProfileContext,
    pub stack: Arc<ResolvedStack>,
    pub is_kernel: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_function_spans_one_offset() {
        let f = FunctionEntry::synthetic(ImageId(3), 0x1a2b);
        assert_eq!(f.name, "1A2B");
        assert!(f.contains(0x1a2b));
        assert!(!f.contains(0x1a2c));
        assert_eq!(f.offset_of(0x1a2b), 0);
    }

    #[test]
    fn test_unknown_frame() {
        let frame = ResolvedFrame::unknown(0xdead, 2, false);
        assert!(frame.is_unknown());
        assert_eq!(frame.offset_in_function(), None);
        assert_eq!(frame.key.function, None);
    }
}
