/// Raw and display name of a symbol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolName {
    pub name: String,
    pub system_name: String,
}

impl SymbolName {
    pub fn raw(system_name: &str) -> Self {
        Self {
            name: String::new(),
            system_name: system_name.to_string(),
        }
    }
}

/// Demangler turns Itanium C++ and Rust linker names back into source names.
/// Names it cannot parse are returned unchanged.
#[derive(Debug, Default)]
pub struct Demangler {
    // Ignore display names the producer already supplied.
    force: bool,
}

impl Demangler {
    pub fn new(force: bool) -> Self {
        Demangler { force }
    }

    pub fn demangle(&self, symbol: &SymbolName) -> SymbolName {
        let mut new_symbol = symbol.clone();

        if self.force && !symbol.name.is_empty() && !symbol.system_name.is_empty() {
            new_symbol.name = symbol.system_name.clone();
        }

        if !new_symbol.name.is_empty() && !symbol.system_name.eq(&new_symbol.name) {
            return new_symbol; // Already Demangled
        }

        new_symbol.name = Self::filter(&symbol.system_name);
        new_symbol
    }

    /// Display name for a raw linker symbol.
    pub fn demangle_name(&self, system_name: &str) -> String {
        self.demangle(&SymbolName::raw(system_name)).name
    }

    fn filter(system_name: &str) -> String {
        // Legacy Rust names also start with _ZN, so Rust goes first.
        if let Ok(name) = rustc_demangle::try_demangle(system_name) {
            return format!("{:#}", name);
        }
        if !system_name.starts_with("_Z") {
            return system_name.to_string();
        }
        match cpp_demangle::Symbol::new(system_name) {
            Ok(symbol) => symbol.to_string(),
            Err(_) => system_name.to_string(),
        }
    }
}
