mod dwarf;
mod managed;
mod symbol;

pub(crate) use dwarf::DwarfLiner;
pub use managed::ManagedDebugInfo;
pub use symbol::SymbolTable;

use super::elfutils::DebugInfoQuality;
use super::{DebugInfoProvider, Demangler, FunctionDebugInfo};
use anyhow::{bail, Context};
use object::Object;
use std::path::{Path, PathBuf};

/// Function ranges and line tables read from a native binary or its separate debug file.
#[derive(Debug)]
pub struct ObjectDebugInfo {
    path: PathBuf,
    quality: DebugInfoQuality,
    base: u64,
    symbols: SymbolTable,
    liner: Option<DwarfLiner>,
}

impl ObjectDebugInfo {
    pub fn load(path: &Path, demangler: &Demangler) -> anyhow::Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read file {}", path.display()))?;
        let e = object::File::parse(&*data)
            .with_context(|| format!("Failed to parse object file {}", path.display()))?;

        let quality = DebugInfoQuality::inspect(&e);
        if !quality.is_usable() {
            bail!("{} carries no symbol information", path.display());
        }

        let symbols = SymbolTable::from_object(&e, demangler);
        let liner = if quality.has_dwarf {
            match DwarfLiner::try_new(&e) {
                Ok(liner) => Some(liner),
                Err(err) => {
                    log::warn!("Ignoring line tables of {}: {:#}", path.display(), err);
                    None
                }
            }
        } else {
            None
        };

        log::debug!(
            "Loaded {} symbols from {} ({})",
            symbols.len(),
            path.display(),
            quality
        );

        Ok(Self {
            path: path.to_path_buf(),
            quality,
            base: e.relative_address_base(),
            symbols,
            liner,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn quality(&self) -> DebugInfoQuality {
        self.quality
    }
}

impl DebugInfoProvider for ObjectDebugInfo {
    fn find_function_by_rva(&self, rva: u64) -> Option<FunctionDebugInfo> {
        let mut function = self.symbols.find(rva)?;
        if let Some(liner) = &self.liner {
            function.source = liner.source_line(self.base + function.rva);
        }
        Some(function)
    }

    fn function_count(&self) -> usize {
        self.symbols.len()
    }

    fn description(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_current_executable() {
        let path = std::env::current_exe().unwrap();
        let info = ObjectDebugInfo::load(&path, &Demangler::new(false)).unwrap();

        assert!(info.quality().is_usable());
        assert_eq!(info.description(), path.display().to_string());
    }

    #[test]
    fn test_load_rejects_non_object_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"not an object file").unwrap();

        assert!(ObjectDebugInfo::load(file.path(), &Demangler::new(false)).is_err());
    }
}
