use crate::trace::{ProfileImage, SymbolFileDescriptor};
use std::future::Future;
use std::path::PathBuf;

/// Result of one lookup step.
#[derive(Debug)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Error(anyhow::Error),
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Self::Found(value) => Lookup::Found(f(value)),
            Self::NotFound => Lookup::NotFound,
            Self::Error(e) => Lookup::Error(e),
        }
    }
}

impl<T> From<anyhow::Result<Option<T>>> for Lookup<T> {
    fn from(result: anyhow::Result<Option<T>>) -> Self {
        match result {
            Ok(Some(value)) => Self::Found(value),
            Ok(None) => Self::NotFound,
            Err(e) => Self::Error(e),
        }
    }
}

/// Identity of a binary as recorded in the trace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinaryDescriptor {
    pub module_name: String,
    pub file_path: String,
    pub build_id: Option<String>,
    pub timestamp: u32,
    pub size: u64,
}

impl From<&ProfileImage> for BinaryDescriptor {
    fn from(image: &ProfileImage) -> Self {
        Self {
            module_name: image.module_name.clone(),
            file_path: image.file_path.clone(),
            build_id: image.build_id.clone(),
            timestamp: image.timestamp,
            size: image.size,
        }
    }
}

impl std::fmt::Display for BinaryDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.build_id {
            Some(id) => write!(f, "{} ({})", self.module_name, id),
            None => write!(f, "{}", self.module_name),
        }
    }
}

/// Finds binaries and symbol files on disk or over the network.
pub trait FileLocator: Send + Sync {
    fn locate_binary(
        &self,
        binary: &BinaryDescriptor,
    ) -> impl Future<Output = Lookup<PathBuf>> + Send;

    fn locate_symbols(
        &self,
        symbols: &SymbolFileDescriptor,
    ) -> impl Future<Output = Lookup<PathBuf>> + Send;
}
