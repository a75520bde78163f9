use crate::profile::ProfileData;
use crate::symbolizer::ModuleResolver;
use crate::symbols::DebugInfoProvider;
use crate::trace::{file_stem, ImageId, ProfileImage};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// A module of the loaded profile, as handed to the session layer.
#[derive(Debug, Clone)]
pub struct ModuleDocument {
    pub image: Arc<ProfileImage>,
    pub binary_path: Option<PathBuf>,
    /// Released by the session once it no longer needs the module.
    pub debug_info: Option<Arc<dyn DebugInfoProvider>>,
}

impl ModuleDocument {
    pub fn module_name(&self) -> &str {
        &self.image.module_name
    }
}

/// Receives a completed profile. Never called for a canceled or failed load.
pub trait SessionSetup: Send + Sync {
    fn setup_session(
        &self,
        main: Option<ModuleDocument>,
        others: Vec<ModuleDocument>,
        profile: &Arc<ProfileData>,
    ) -> anyhow::Result<()>;
}

/// A session layer that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSession;

impl SessionSetup for NoSession {
    fn setup_session(&self, _: Option<ModuleDocument>, _: Vec<ModuleDocument>, _: &Arc<ProfileData>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// find_session_documents builds one document per resolved module and picks
/// the one named like the main process image as the main document.
pub fn find_session_documents(
    main_image_name: &str,
    resolvers: &[Arc<ModuleResolver>],
) -> (Option<ModuleDocument>, Vec<ModuleDocument>) {
    let mut documents: BTreeMap<ImageId, ModuleDocument> = BTreeMap::new();
    for resolver in resolvers.iter() {
        let document = documents
            .entry(resolver.image().id)
            .or_insert_with(|| ModuleDocument {
                image: Arc::clone(resolver.image()),
                binary_path: None,
                debug_info: None,
            });
        if document.binary_path.is_none() {
            document.binary_path = resolver.binary_path().map(|p| p.to_path_buf());
        }
        // Native debug info wins over the managed method table.
        if document.debug_info.is_none() || !resolver.is_managed() {
            if let Some(debug_info) = resolver.debug_info() {
                document.debug_info = Some(Arc::clone(debug_info));
            }
        }
    }

    let main_stem = file_stem(main_image_name).to_lowercase();
    let mut main = None;
    let mut others = Vec::with_capacity(documents.len());
    for document in documents.into_values() {
        if main.is_none() && document.image.stem().to_lowercase() == main_stem {
            main = Some(document);
        } else {
            others.push(document);
        }
    }
    if main.is_none() {
        log::warn!("No module matches main image {}", main_image_name);
    }
    (main, others)
}
