pub mod addr_to_line;
mod demangle;
pub mod elfutils;

pub use addr_to_line::{ManagedDebugInfo, ObjectDebugInfo};
pub use demangle::{Demangler, SymbolName};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    pub file: String,
    pub line: u32,
}

/// Function range found in a module's debug information.
/// `rva` is relative to the module's load address, except for managed
/// code where it is the absolute address of the method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDebugInfo {
    pub name: String,
    pub rva: u64,
    pub size: u64,
    pub source: Option<SourceLine>,
}

impl FunctionDebugInfo {
    pub fn end(&self) -> u64 {
        self.rva.saturating_add(self.size)
    }

    pub fn contains(&self, rva: u64) -> bool {
        rva >= self.rva && rva < self.end()
    }
}

/// Source of function ranges for one module.
pub trait DebugInfoProvider: Send + Sync + std::fmt::Debug {
    /// Returns the smallest known function range enclosing `rva`.
    fn find_function_by_rva(&self, rva: u64) -> Option<FunctionDebugInfo>;

    fn function_count(&self) -> usize;

    /// Short description for logs and reports, usually the file the info came from.
    fn description(&self) -> String;
}
