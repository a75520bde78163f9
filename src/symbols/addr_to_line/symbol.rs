use crate::symbols::{Demangler, FunctionDebugInfo};
use object::{Object, ObjectSymbol, SymbolKind};

#[derive(Clone, Debug, PartialEq, Eq)]
struct SymbolInfo {
    rva: u64,
    size: u64,
    name: String,
}

/// Function symbols of one module, sorted by relative address.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<SymbolInfo>,
    // Largest symbol size, bounds the backward scan in `find`.
    max_size: u64,
}

impl SymbolTable {
    /// Collects text symbols from the symbol table and the dynamic symbol table.
    /// Addresses are made relative to the object's load base.
    pub fn from_object(e: &object::File<'_>, demangler: &Demangler) -> Self {
        let base = e.relative_address_base();
        let mut entries = Vec::new();

        for symbol in e.symbols().chain(e.dynamic_symbols()) {
            if symbol.kind() != SymbolKind::Text || !symbol.is_definition() {
                continue;
            }
            let name = match symbol.name() {
                Ok(name) if !name.is_empty() && !name.starts_with('$') => name,
                _ => continue,
            };
            if symbol.address() < base {
                continue;
            }
            entries.push((
                symbol.address() - base,
                symbol.size(),
                demangler.demangle_name(name),
            ));
        }

        Self::from_entries(entries)
    }

    /// Builds a table from `(rva, size, name)` triples. Symbols with no size
    /// extend to the next symbol's start.
    pub fn from_entries(entries: impl IntoIterator<Item = (u64, u64, String)>) -> Self {
        let mut symbols: Vec<SymbolInfo> = entries
            .into_iter()
            .map(|(rva, size, name)| SymbolInfo { rva, size, name })
            .collect();

        // Stable, so the first source wins among duplicates.
        symbols.sort_by_key(|s| s.rva);
        symbols.dedup_by(|b, a| a.rva == b.rva && (a.size == b.size || b.size == 0));

        for i in 0..symbols.len() {
            if symbols[i].size != 0 {
                continue;
            }
            let start = symbols[i].rva;
            let next_start = symbols[i + 1..]
                .iter()
                .map(|s| s.rva)
                .find(|&rva| rva > start);
            symbols[i].size = match next_start {
                Some(next) => next - start,
                None => 1,
            };
        }

        let max_size = symbols.iter().map(|s| s.size).max().unwrap_or(0);
        Self { symbols, max_size }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Returns the smallest symbol range enclosing `rva`.
    pub fn find(&self, rva: u64) -> Option<FunctionDebugInfo> {
        let end = self.symbols.partition_point(|s| s.rva <= rva);
        let mut best: Option<&SymbolInfo> = None;

        for symbol in self.symbols[..end].iter().rev() {
            if rva - symbol.rva >= self.max_size {
                break;
            }
            if rva - symbol.rva >= symbol.size {
                continue;
            }
            match best {
                Some(b) if b.size <= symbol.size => {}
                _ => best = Some(symbol),
            }
        }

        best.map(|s| FunctionDebugInfo {
            name: s.name.clone(),
            rva: s.rva,
            size: s.size,
            source: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(u64, u64, &str)]) -> SymbolTable {
        SymbolTable::from_entries(
            entries
                .iter()
                .map(|&(rva, size, name)| (rva, size, name.to_string())),
        )
    }

    #[test]
    fn test_smallest_enclosing_range_wins() {
        let t = table(&[(0x1000, 0x100, "outer"), (0x1040, 0x10, "inner")]);

        assert_eq!(t.find(0x1044).unwrap().name, "inner");
        assert_eq!(t.find(0x1050).unwrap().name, "outer");
        assert_eq!(t.find(0x1000).unwrap().name, "outer");
        assert!(t.find(0x1100).is_none());
        assert!(t.find(0x0fff).is_none());
    }

    #[test]
    fn test_zero_size_extends_to_next_symbol() {
        let t = table(&[(0x10, 0, "a"), (0x30, 0, "b")]);

        let a = t.find(0x2f).unwrap();
        assert_eq!((a.name.as_str(), a.rva, a.size), ("a", 0x10, 0x20));
        let b = t.find(0x30).unwrap();
        assert_eq!(b.size, 1);
        assert!(t.find(0x31).is_none());
    }

    #[test]
    fn test_duplicates_keep_first() {
        let t = table(&[(0x10, 0x10, "symtab"), (0x10, 0x10, "dynsym"), (0x10, 0, "alias")]);

        assert_eq!(t.len(), 1);
        assert_eq!(t.find(0x18).unwrap().name, "symtab");
    }

    #[test]
    fn test_empty_table() {
        let t = SymbolTable::default();
        assert!(t.is_empty());
        assert!(t.find(0).is_none());
    }
}
