use super::{BinaryDescriptor, FileLocator, Lookup};
use crate::trace::SymbolFileDescriptor;
use std::path::{Path, PathBuf};

/// LocalLocator looks for files in the trace's recorded paths and a list of search directories.
#[derive(Debug, Default, Clone)]
pub struct LocalLocator {
    search_paths: Vec<PathBuf>,
}

impl LocalLocator {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    fn binary_candidates(&self, binary: &BinaryDescriptor) -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(&binary.file_path)];
        let recorded_name = file_name(&binary.file_path);

        for dir in self.search_paths.iter() {
            candidates.push(dir.join(&binary.module_name));
            if recorded_name != binary.module_name {
                candidates.push(dir.join(recorded_name));
            }
        }
        candidates
    }

    fn symbol_candidates(&self, symbols: &SymbolFileDescriptor) -> Vec<PathBuf> {
        let name = file_name(&symbols.file_name);
        let mut candidates = vec![];

        if Path::new(&symbols.file_name).is_absolute() {
            candidates.push(PathBuf::from(&symbols.file_name));
        }

        for dir in self.search_paths.iter() {
            candidates.push(dir.join(name));
            candidates.push(dir.join(format!("{}.debug", name)));

            // GDB's /usr/lib/debug/.build-id/ab/cdef....debug layout.
            if let Some((prefix, rest)) = symbols.build_id.as_deref().and_then(build_id_parts) {
                candidates.push(
                    dir.join(".build-id")
                        .join(prefix)
                        .join(format!("{}.debug", rest)),
                );
            }
        }
        candidates
    }
}

// Only hex ids map onto the .build-id tree.
fn build_id_parts(id: &str) -> Option<(&str, &str)> {
    if id.len() <= 2 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(id.split_at(2))
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn first_existing(candidates: Vec<PathBuf>) -> Lookup<PathBuf> {
    match candidates.into_iter().find(|path| path.is_file()) {
        Some(path) => Lookup::Found(path),
        None => Lookup::NotFound,
    }
}

impl FileLocator for LocalLocator {
    async fn locate_binary(&self, binary: &BinaryDescriptor) -> Lookup<PathBuf> {
        let candidates = self.binary_candidates(binary);
        match tokio::task::spawn_blocking(move || first_existing(candidates)).await {
            Ok(lookup) => lookup,
            Err(e) => Lookup::Error(e.into()),
        }
    }

    async fn locate_symbols(&self, symbols: &SymbolFileDescriptor) -> Lookup<PathBuf> {
        let candidates = self.symbol_candidates(symbols);
        match tokio::task::spawn_blocking(move || first_existing(candidates)).await {
            Ok(lookup) => lookup,
            Err(e) => Lookup::Error(e.into()),
        }
    }
}
