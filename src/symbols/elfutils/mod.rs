mod dwarf;
mod dynsym;
mod symtab;

pub use dwarf::has_dwarf;
pub use dynsym::has_dynsym;
pub use symtab::has_symtab;

use object::File;

/// Which kinds of symbol information a module file carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugInfoQuality {
    pub has_dwarf: bool,
    pub has_symtab: bool,
    pub has_dynsym: bool,
}

impl DebugInfoQuality {
    pub fn inspect(e: &File<'_>) -> Self {
        Self {
            has_dwarf: has_dwarf(e),
            has_symtab: has_symtab(e),
            has_dynsym: has_dynsym(e),
        }
    }

    /// Whether the file can name functions at all.
    pub fn is_usable(&self) -> bool {
        self.has_dwarf || self.has_symtab || self.has_dynsym
    }
}

impl std::fmt::Display for DebugInfoQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dwarf={} symtab={} dynsym={}",
            self.has_dwarf, self.has_symtab, self.has_dynsym
        )
    }
}
