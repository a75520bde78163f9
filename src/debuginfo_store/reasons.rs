use std::path::PathBuf;

/// Why a module's binary or symbol file was not acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    /// The module's name does not match any entry of the binary name allow-list.
    NotInAllowList,

    /// The module never showed up in the sampled stacks of the profiled process.
    NoSamples,

    /// The module carries too few samples for its symbols to be worth fetching.
    BelowSampleCutoff { hits: u64, cutoff: u64 },

    /// The same file was already looked up during this load and was not found.
    PreviouslyRejected,

    /// Neither the trace nor the binary identify a symbol file for the module.
    NoSymbolDescriptor,

    /// The locator does not know the file.
    NotFound,

    /// The locator did not answer within the fetch timeout.
    TimedOut,

    /// The lookup failed with an error.
    FetchFailed(String),
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInAllowList => write!(
                f,
                "Module is not in the binary name allow-list, therefore it is not downloaded."
            ),
            Self::NoSamples => write!(
                f,
                "Module has no samples in the profiled process, therefore it is not downloaded."
            ),
            Self::BelowSampleCutoff { hits, cutoff } => write!(
                f,
                "Module has {} samples, not above the cutoff of {}, therefore its symbols are not requested.",
                hits, cutoff
            ),
            Self::PreviouslyRejected => write!(
                f,
                "File was already rejected during this load, therefore it is not requested again."
            ),
            Self::NoSymbolDescriptor => write!(
                f,
                "No symbol file is known for this module."
            ),
            Self::NotFound => write!(f, "File was not found by any locator."),
            Self::TimedOut => write!(f, "File lookup timed out."),
            Self::FetchFailed(err) => write!(f, "File lookup failed: {}", err),
        }
    }
}

/// Outcome of one acquisition step for one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ModuleLoadState {
    #[default]
    NotRequested,
    Loaded(PathBuf),
    Rejected(RejectionReason),
}

impl ModuleLoadState {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Loaded(path) => Some(path),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }
}

impl std::fmt::Display for ModuleLoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRequested => write!(f, "not requested"),
            Self::Loaded(path) => write!(f, "loaded from {}", path.display()),
            Self::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}
