use super::{BinaryDescriptor, RejectionReason};
use crate::trace::SymbolFileDescriptor;
use std::collections::HashMap;
use std::sync::Mutex;

/// Negative caches of files that could not be acquired. One instance lives for one load.
#[derive(Debug, Default)]
pub struct RejectionSets {
    binaries: Mutex<HashMap<BinaryDescriptor, RejectionReason>>,
    symbols: Mutex<HashMap<SymbolFileDescriptor, RejectionReason>>,
}

impl RejectionSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binary(&self, binary: &BinaryDescriptor) -> Option<RejectionReason> {
        let binaries = match self.binaries.lock() {
            Ok(binaries) => binaries,
            Err(poisoned) => poisoned.into_inner(),
        };
        binaries.get(binary).cloned()
    }

    pub fn reject_binary(&self, binary: BinaryDescriptor, reason: RejectionReason) {
        log::debug!("Rejected binary {}: {}", binary, reason);
        let mut binaries = match self.binaries.lock() {
            Ok(binaries) => binaries,
            Err(poisoned) => poisoned.into_inner(),
        };
        binaries.insert(binary, reason);
    }

    pub fn symbols(&self, symbols: &SymbolFileDescriptor) -> Option<RejectionReason> {
        let set = match self.symbols.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.get(symbols).cloned()
    }

    pub fn reject_symbols(&self, symbols: SymbolFileDescriptor, reason: RejectionReason) {
        log::debug!("Rejected symbol file {}: {}", symbols, reason);
        let mut set = match self.symbols.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.insert(symbols, reason);
    }

    /// Number of rejected binaries and rejected symbol files.
    pub fn counts(&self) -> (usize, usize) {
        let binaries = self.binaries.lock().map(|b| b.len()).unwrap_or(0);
        let symbols = self.symbols.lock().map(|s| s.len()).unwrap_or(0);
        (binaries, symbols)
    }
}
