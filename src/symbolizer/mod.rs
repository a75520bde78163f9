mod cache;
pub mod normalize;
pub mod registry;
pub mod stack;

pub use cache::StackMemo;
pub use normalize::NormalizedAddress;
pub use registry::{ModuleKey, ModuleRegistry, WorkerContext, WorkerStats};
pub use stack::{StackKey, StackResolver};

use crate::debuginfo_store::AcquiredModules;
use crate::profile::{FunctionEntry, FunctionId};
use crate::symbols::{DebugInfoProvider, Demangler, ManagedDebugInfo, ObjectDebugInfo};
use crate::trace::{ProfileImage, RawProfile};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverState {
    Ready,
    /// No debug info could be loaded; functions are synthetic.
    Failed(String),
}

/// Function table of one module, filled lazily as addresses are resolved.
#[derive(Debug)]
pub struct ModuleResolver {
    image: Arc<ProfileImage>,
    debug_info: Option<Arc<dyn DebugInfoProvider>>,
    // Keyed by function start and by every address already resolved.
    functions: RwLock<HashMap<u64, Arc<FunctionEntry>>>,
    state: ResolverState,
    is_managed: bool,
    binary_path: Option<PathBuf>,
}

impl ModuleResolver {
    pub fn new(
        image: Arc<ProfileImage>,
        debug_info: Arc<dyn DebugInfoProvider>,
        is_managed: bool,
        binary_path: Option<PathBuf>,
    ) -> Self {
        Self {
            image,
            debug_info: Some(debug_info),
            functions: RwLock::new(HashMap::new()),
            state: ResolverState::Ready,
            is_managed,
            binary_path,
        }
    }

    /// A resolver without debug info. Its functions are named by offset.
    pub fn failed(image: Arc<ProfileImage>, is_managed: bool, reason: impl Into<String>) -> Self {
        Self {
            image,
            debug_info: None,
            functions: RwLock::new(HashMap::new()),
            state: ResolverState::Failed(reason.into()),
            is_managed,
            binary_path: None,
        }
    }

    pub fn image(&self) -> &Arc<ProfileImage> {
        &self.image
    }

    pub fn debug_info(&self) -> Option<&Arc<dyn DebugInfoProvider>> {
        self.debug_info.as_ref()
    }

    pub fn has_debug_info(&self) -> bool {
        self.debug_info.is_some()
    }

    pub fn state(&self) -> &ResolverState {
        &self.state
    }

    pub fn is_managed(&self) -> bool {
        self.is_managed
    }

    pub fn binary_path(&self) -> Option<&Path> {
        self.binary_path.as_deref()
    }

    /// Number of distinct functions resolved so far.
    pub fn function_count(&self) -> usize {
        let functions = match self.functions.read() {
            Ok(functions) => functions,
            Err(poisoned) => poisoned.into_inner(),
        };
        functions
            .iter()
            .filter(|(&rva, f)| rva == f.id.rva)
            .count()
    }

    /// get_or_create_function returns the function containing `rva`: the
    /// smallest enclosing range from the debug info, or a synthetic entry
    /// covering just `rva`. All addresses within a function share one entry.
    pub fn get_or_create_function(&self, rva: u64) -> Arc<FunctionEntry> {
        {
            let functions = match self.functions.read() {
                Ok(functions) => functions,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(function) = functions.get(&rva) {
                return Arc::clone(function);
            }
        }

        // Debug info lookups can be slow, keep them out of the lock.
        let entry = match self.debug_info.as_ref().and_then(|d| d.find_function_by_rva(rva)) {
            Some(info) => FunctionEntry {
                id: FunctionId {
                    image: self.image.id,
                    rva: info.rva,
                },
                name: info.name,
                size: info.size.max(1),
                source: info.source,
                synthetic: false,
            },
            None => FunctionEntry::synthetic(self.image.id, rva),
        };

        let mut functions = match self.functions.write() {
            Ok(functions) => functions,
            Err(poisoned) => poisoned.into_inner(),
        };
        let function = Arc::clone(
            functions
                .entry(entry.id.rva)
                .or_insert_with(|| Arc::new(entry)),
        );
        functions
            .entry(rva)
            .or_insert_with(|| Arc::clone(&function));
        function
    }
}

/// ResolverFactory loads the debug info of a module from the files acquired for it.
pub struct ResolverFactory<'a> {
    raw: &'a RawProfile,
    acquired: &'a AcquiredModules,
    demangler: Demangler,
}

impl<'a> ResolverFactory<'a> {
    pub fn new(raw: &'a RawProfile, acquired: &'a AcquiredModules) -> Self {
        Self {
            raw,
            acquired,
            demangler: Demangler::new(false),
        }
    }

    pub fn create(&self, image: &Arc<ProfileImage>, is_managed: bool, process_id: u32) -> ModuleResolver {
        if is_managed {
            let methods = self.raw.managed_methods_for_image(image.id, process_id);
            let info = ManagedDebugInfo::new(&image.module_name, methods);
            return ModuleResolver::new(Arc::clone(image), Arc::new(info), true, None);
        }

        let files = match self.acquired.get(image.id) {
            Some(files) => files,
            None => return ModuleResolver::failed(Arc::clone(image), false, "not acquired"),
        };
        let binary = files.binary().map(Path::to_path_buf);

        // Separate symbol file first, then the binary's own symbol table.
        let candidates = files.symbols().into_iter().chain(files.binary());
        let mut last_error = None;
        for path in candidates {
            match ObjectDebugInfo::load(path, &self.demangler) {
                Ok(info) => {
                    log::debug!(
                        "Resolver for {} uses {} ({} functions)",
                        image.module_name,
                        path.display(),
                        info.function_count()
                    );
                    return ModuleResolver::new(Arc::clone(image), Arc::new(info), false, binary);
                }
                Err(e) => {
                    log::warn!("Failed to load debug info for {}: {:#}", image.module_name, e);
                    last_error = Some(format!("{:#}", e));
                }
            }
        }

        let mut resolver = ModuleResolver::failed(
            Arc::clone(image),
            false,
            last_error.unwrap_or_else(|| "no binary or symbol file".to_string()),
        );
        resolver.binary_path = binary;
        resolver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::addr_to_line::SymbolTable;
    use crate::symbols::FunctionDebugInfo;
    use crate::trace::ImageId;

    #[derive(Debug)]
    struct TableInfo(SymbolTable);

    impl DebugInfoProvider for TableInfo {
        fn find_function_by_rva(&self, rva: u64) -> Option<FunctionDebugInfo> {
            self.0.find(rva)
        }

        fn function_count(&self) -> usize {
            self.0.len()
        }

        fn description(&self) -> String {
            "table".to_string()
        }
    }

    fn image() -> Arc<ProfileImage> {
        Arc::new(ProfileImage {
            id: ImageId(4),
            module_name: "app.exe".to_string(),
            file_path: String::new(),
            base_address: 0x40_0000,
            size: 0x10000,
            checksum: 0,
            timestamp: 0,
            build_id: None,
        })
    }

    fn resolver() -> ModuleResolver {
        let table = SymbolTable::from_entries(vec![
            (0x1000, 0x200, "outer".to_string()),
            (0x1100, 0x20, "inner".to_string()),
        ]);
        ModuleResolver::new(image(), Arc::new(TableInfo(table)), false, None)
    }

    #[test]
    fn test_addresses_in_a_function_share_one_entry() {
        let r = resolver();
        let a = r.get_or_create_function(0x1010);
        let b = r.get_or_create_function(0x11f0);
        let inner = r.get_or_create_function(0x1104);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name, "outer");
        assert_eq!(inner.name, "inner");
        assert_eq!(inner.id.rva, 0x1100);
        assert_eq!(r.function_count(), 2);
        assert!(Arc::ptr_eq(&inner, &r.get_or_create_function(0x1100)));
    }

    #[test]
    fn test_synthetic_entry_without_debug_info() {
        let r = ModuleResolver::failed(image(), false, "no files");
        let f = r.get_or_create_function(0x2abc);

        assert!(f.synthetic);
        assert_eq!(f.name, "2ABC");
        assert_eq!(f.size, 1);
        assert_eq!(f.id.rva, 0x2abc);
        assert!(!r.has_debug_info());
        assert!(matches!(r.state(), ResolverState::Failed(_)));
    }

    #[test]
    fn test_gap_in_debug_info_is_synthetic() {
        let r = resolver();
        let f = r.get_or_create_function(0x5000);
        assert!(f.synthetic);
        assert_eq!(f.id.rva, 0x5000);
    }

    #[test]
    fn test_factory_without_files_gives_failed_resolver() {
        let raw = crate::trace::testing::TraceBuilder::new().build();
        let acquired = AcquiredModules::default();
        let factory = ResolverFactory::new(&raw, &acquired);

        let r = factory.create(&image(), false, 1);
        assert!(matches!(r.state(), ResolverState::Failed(_)));
        assert!(r.get_or_create_function(0x10).synthetic);
    }
}
