use super::symbol::SymbolTable;
use crate::symbols::{DebugInfoProvider, FunctionDebugInfo};
use crate::trace::ManagedMethod;

/// Function ranges of JIT-compiled methods, keyed by absolute address.
#[derive(Debug)]
pub struct ManagedDebugInfo {
    module_name: String,
    methods: SymbolTable,
}

impl ManagedDebugInfo {
    pub fn new<'a>(module_name: &str, methods: impl IntoIterator<Item = &'a ManagedMethod>) -> Self {
        let methods = SymbolTable::from_entries(
            methods
                .into_iter()
                .map(|m| (m.start, m.size.max(1), m.name.clone())),
        );
        Self {
            module_name: module_name.to_string(),
            methods,
        }
    }
}

impl DebugInfoProvider for ManagedDebugInfo {
    fn find_function_by_rva(&self, rva: u64) -> Option<FunctionDebugInfo> {
        self.methods.find(rva)
    }

    fn function_count(&self) -> usize {
        self.methods.len()
    }

    fn description(&self) -> String {
        format!("managed methods of {}", self.module_name)
    }
}
