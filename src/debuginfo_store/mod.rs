mod debuginfod;
mod fetcher;
mod local;
mod locator;
mod metadata;
mod reasons;

pub use debuginfod::DebuginfodLocator;
pub use fetcher::ChainLocator;
pub use local::LocalLocator;
pub use locator::{BinaryDescriptor, FileLocator, Lookup};
pub use metadata::RejectionSets;
pub use reasons::{ModuleLoadState, RejectionReason};

use crate::filter::ModuleFilter;
use crate::options::ProfileOptions;
use crate::pipeline::{CancelToken, LoadProgress, LoadStage, ProgressSink};
use crate::trace::{ImageId, ProfileImage, RawProfile, SymbolFileDescriptor, KERNEL_PROCESS_ID};
use anyhow::Context;
use object::Object;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Files acquired for one module.
#[derive(Debug, Clone, Default)]
pub struct AcquiredFiles {
    pub binary_state: ModuleLoadState,
    pub symbol_state: ModuleLoadState,
    pub symbol_descriptor: Option<SymbolFileDescriptor>,
}

impl AcquiredFiles {
    pub fn binary(&self) -> Option<&Path> {
        self.binary_state.path().map(PathBuf::as_path)
    }

    pub fn symbols(&self) -> Option<&Path> {
        self.symbol_state.path().map(PathBuf::as_path)
    }
}

/// Acquisition outcome for every candidate image of a load.
#[derive(Debug, Clone, Default)]
pub struct AcquiredModules {
    files: HashMap<ImageId, AcquiredFiles>,
}

impl AcquiredModules {
    pub fn get(&self, image: ImageId) -> Option<&AcquiredFiles> {
        self.files.get(&image)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ImageId, &AcquiredFiles)> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn binaries_loaded(&self) -> usize {
        self.files
            .values()
            .filter(|f| f.binary_state.is_loaded())
            .count()
    }

    pub fn symbols_loaded(&self) -> usize {
        self.files
            .values()
            .filter(|f| f.symbol_state.is_loaded())
            .count()
    }

    fn entry(&mut self, image: ImageId) -> &mut AcquiredFiles {
        self.files.entry(image).or_default()
    }
}

/// Images of the main process followed by kernel images, each listed once.
pub fn candidate_images(raw: &RawProfile, main_pid: u32) -> Vec<Arc<ProfileImage>> {
    let mut seen = HashSet::new();
    raw.process_images(main_pid)
        .into_iter()
        .chain(raw.process_images(KERNEL_PROCESS_ID))
        .filter(|image| seen.insert(image.id))
        .collect()
}

/// derive_symbol_descriptor reads the symbol file identity a binary carries:
/// its PDB reference, or its build id and debug link.
pub fn derive_symbol_descriptor(binary: &Path) -> anyhow::Result<Option<SymbolFileDescriptor>> {
    let data = std::fs::read(binary)
        .with_context(|| format!("Failed to read binary {}", binary.display()))?;
    let e = object::File::parse(&*data)
        .with_context(|| format!("Failed to parse binary {}", binary.display()))?;

    if let Some(pdb) = e.pdb_info()? {
        return Ok(Some(SymbolFileDescriptor {
            file_name: String::from_utf8_lossy(pdb.path()).into_owned(),
            build_id: Some(hex(&pdb.guid())),
            age: pdb.age(),
        }));
    }

    let debuglink = e
        .gnu_debuglink()?
        .map(|(name, _crc)| String::from_utf8_lossy(name).into_owned());
    let build_id = e.build_id()?.map(hex);
    if debuglink.is_none() && build_id.is_none() {
        return Ok(None);
    }

    let file_name = match debuglink {
        Some(name) => name,
        None => binary
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    Ok(Some(SymbolFileDescriptor {
        file_name,
        build_id,
        age: 0,
    }))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn rejection_for(err: &anyhow::Error) -> RejectionReason {
    if err.is::<tokio::time::error::Elapsed>() {
        RejectionReason::TimedOut
    } else {
        RejectionReason::FetchFailed(format!("{:#}", err))
    }
}

/// Runs `fetch` in its own task that owns the permit. A fetch that outlives
/// its timeout keeps the permit until it finishes, so timed out downloads
/// still count against the limit.
async fn fetch_with_permit<F>(
    permits: Arc<Semaphore>,
    timeout: Duration,
    fetch: F,
) -> Lookup<PathBuf>
where
    F: Future<Output = Lookup<PathBuf>> + Send + 'static,
{
    let permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => return Lookup::Error(e.into()),
    };

    let task = tokio::spawn(async move {
        let lookup = fetch.await;
        drop(permit);
        lookup
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(lookup)) => lookup,
        Ok(Err(e)) => Lookup::Error(e.into()),
        Err(elapsed) => Lookup::Error(elapsed.into()),
    }
}

/// Acquirer locates the binary and then the symbol file of every accepted
/// image, with bounded concurrency and a per-load negative cache.
pub struct Acquirer<L> {
    locator: Arc<L>,
    binary_permits: Arc<Semaphore>,
    symbol_permits: Arc<Semaphore>,
    fetch_timeout: Duration,
    rejected: RejectionSets,
}

impl<L: FileLocator + 'static> Acquirer<L> {
    pub fn new(locator: Arc<L>, options: &ProfileOptions) -> Self {
        Self {
            locator,
            binary_permits: Arc::new(Semaphore::new(options.binary_fetch_limit.max(1))),
            symbol_permits: Arc::new(Semaphore::new(options.symbol_fetch_limit.max(1))),
            fetch_timeout: options.fetch_timeout,
            rejected: RejectionSets::new(),
        }
    }

    pub fn rejected(&self) -> &RejectionSets {
        &self.rejected
    }

    pub async fn acquire(
        &self,
        raw: &RawProfile,
        main_pid: u32,
        filter: &ModuleFilter,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> anyhow::Result<AcquiredModules> {
        let images = candidate_images(raw, main_pid);
        let mut modules = AcquiredModules::default();

        let start = Instant::now();
        self.acquire_binaries(&images, filter, &mut modules, progress, cancel)
            .await?;
        log::info!(
            "Binary loading: {} of {} images in {:?}",
            modules.binaries_loaded(),
            images.len(),
            start.elapsed()
        );

        let start = Instant::now();
        self.acquire_symbols(raw, main_pid, &images, filter, &mut modules, progress, cancel)
            .await?;
        log::info!(
            "Symbol loading: {} of {} images in {:?}",
            modules.symbols_loaded(),
            images.len(),
            start.elapsed()
        );

        Ok(modules)
    }

    async fn acquire_binaries(
        &self,
        images: &[Arc<ProfileImage>],
        filter: &ModuleFilter,
        modules: &mut AcquiredModules,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> anyhow::Result<()> {
        let mut requests: HashMap<BinaryDescriptor, Vec<ImageId>> = HashMap::new();

        for image in images.iter() {
            if let Err(reason) = filter.is_accepted(image) {
                log::debug!("Skipping binary {}: {}", image.module_name, reason);
                modules.entry(image.id).binary_state = ModuleLoadState::Rejected(reason);
                continue;
            }

            let descriptor = BinaryDescriptor::from(image.as_ref());
            if self.rejected.binary(&descriptor).is_some() {
                modules.entry(image.id).binary_state =
                    ModuleLoadState::Rejected(RejectionReason::PreviouslyRejected);
                continue;
            }
            requests.entry(descriptor).or_default().push(image.id);
        }

        let total = requests.len();
        progress.on_progress(LoadProgress::new(LoadStage::BinaryLoading, total, 0));

        let mut tasks = JoinSet::new();
        for (descriptor, ids) in requests {
            cancel.check()?;
            let locator = Arc::clone(&self.locator);
            let permits = Arc::clone(&self.binary_permits);
            let timeout = self.fetch_timeout;

            let wanted = descriptor.clone();
            let fetch = async move { locator.locate_binary(&wanted).await };

            tasks.spawn(async move {
                let lookup = fetch_with_permit(permits, timeout, fetch).await;
                (descriptor, ids, lookup)
            });
        }

        let mut completed = 0;
        while let Some(joined) = tasks.join_next().await {
            completed += 1;
            let (descriptor, ids, lookup) = match joined {
                Ok(result) => result,
                Err(e) => {
                    log::warn!("Binary fetch task failed: {}", e);
                    continue;
                }
            };

            let state = match lookup {
                Lookup::Found(path) => {
                    log::debug!("Found binary {} at {}", descriptor, path.display());
                    ModuleLoadState::Loaded(path)
                }
                Lookup::NotFound => {
                    self.rejected
                        .reject_binary(descriptor.clone(), RejectionReason::NotFound);
                    ModuleLoadState::Rejected(RejectionReason::NotFound)
                }
                Lookup::Error(e) => {
                    log::warn!("Failed to locate binary {}: {:#}", descriptor, e);
                    let reason = rejection_for(&e);
                    self.rejected.reject_binary(descriptor.clone(), reason.clone());
                    ModuleLoadState::Rejected(reason)
                }
            };

            for id in ids {
                modules.entry(id).binary_state = state.clone();
            }
            progress.on_progress(
                LoadProgress::new(LoadStage::BinaryLoading, total, completed)
                    .with_label(descriptor.module_name),
            );
            cancel.check()?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn acquire_symbols(
        &self,
        raw: &RawProfile,
        main_pid: u32,
        images: &[Arc<ProfileImage>],
        filter: &ModuleFilter,
        modules: &mut AcquiredModules,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> anyhow::Result<()> {
        let mut requests: HashMap<SymbolFileDescriptor, Vec<ImageId>> = HashMap::new();

        for image in images.iter() {
            if let Err(reason) = filter.accepts_symbols(image) {
                log::debug!("Skipping symbols of {}: {}", image.module_name, reason);
                modules.entry(image.id).symbol_state = ModuleLoadState::Rejected(reason);
                continue;
            }

            let binary = modules
                .get(image.id)
                .and_then(|files| files.binary())
                .map(Path::to_path_buf);
            let descriptor = match symbol_descriptor(raw, main_pid, image, binary).await {
                Some(descriptor) => descriptor,
                None => {
                    modules.entry(image.id).symbol_state =
                        ModuleLoadState::Rejected(RejectionReason::NoSymbolDescriptor);
                    continue;
                }
            };

            let files = modules.entry(image.id);
            files.symbol_descriptor = Some(descriptor.clone());
            if self.rejected.symbols(&descriptor).is_some() {
                files.symbol_state = ModuleLoadState::Rejected(RejectionReason::PreviouslyRejected);
                continue;
            }
            requests.entry(descriptor).or_default().push(image.id);
        }

        let total = requests.len();
        progress.on_progress(LoadProgress::new(LoadStage::SymbolLoading, total, 0));

        let mut tasks = JoinSet::new();
        for (descriptor, ids) in requests {
            cancel.check()?;
            let locator = Arc::clone(&self.locator);
            let permits = Arc::clone(&self.symbol_permits);
            let timeout = self.fetch_timeout;

            let wanted = descriptor.clone();
            let fetch = async move { locator.locate_symbols(&wanted).await };

            tasks.spawn(async move {
                let lookup = fetch_with_permit(permits, timeout, fetch).await;
                (descriptor, ids, lookup)
            });
        }

        let mut completed = 0;
        while let Some(joined) = tasks.join_next().await {
            completed += 1;
            let (descriptor, ids, lookup) = match joined {
                Ok(result) => result,
                Err(e) => {
                    log::warn!("Symbol fetch task failed: {}", e);
                    continue;
                }
            };

            let state = match lookup {
                Lookup::Found(path) => {
                    log::debug!("Found symbols {} at {}", descriptor, path.display());
                    ModuleLoadState::Loaded(path)
                }
                Lookup::NotFound => {
                    self.rejected
                        .reject_symbols(descriptor.clone(), RejectionReason::NotFound);
                    ModuleLoadState::Rejected(RejectionReason::NotFound)
                }
                Lookup::Error(e) => {
                    log::warn!("Failed to locate symbols {}: {:#}", descriptor, e);
                    let reason = rejection_for(&e);
                    self.rejected.reject_symbols(descriptor.clone(), reason.clone());
                    ModuleLoadState::Rejected(reason)
                }
            };

            for id in ids {
                modules.entry(id).symbol_state = state.clone();
            }
            progress.on_progress(
                LoadProgress::new(LoadStage::SymbolLoading, total, completed)
                    .with_label(descriptor.file_name),
            );
            cancel.check()?;
        }
        Ok(())
    }
}

/// The trace-embedded descriptor wins over what the downloaded binary says.
async fn symbol_descriptor(
    raw: &RawProfile,
    main_pid: u32,
    image: &ProfileImage,
    binary: Option<PathBuf>,
) -> Option<SymbolFileDescriptor> {
    if let Some(descriptor) = raw.debug_file_for_image(image.id, main_pid) {
        return Some(descriptor.clone());
    }

    if let Some(path) = binary {
        match tokio::task::spawn_blocking(move || derive_symbol_descriptor(&path)).await {
            Ok(Ok(Some(descriptor))) => return Some(descriptor),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => log::debug!(
                "Cannot read symbol file identity of {}: {:#}",
                image.module_name,
                e
            ),
            Err(e) => log::warn!("Symbol identity task failed: {}", e),
        }
    }

    image.build_id.as_ref().map(|id| SymbolFileDescriptor {
        file_name: image.module_name.clone(),
        build_id: Some(id.clone()),
        age: 0,
    })
}
