#[cfg(test)]
pub(crate) mod testing;

use anyhow::Context;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Process id the decoder assigns to kernel images.
pub const KERNEL_PROCESS_ID: u32 = 0;

/// Decoders truncate captured stacks at this many frames.
pub const MAX_STACK_DEPTH: usize = 256;

/// is_kernel_address reports whether an instruction pointer lies in the
/// kernel half of the address space for the given pointer size.
pub fn is_kernel_address(ip: u64, pointer_size: u8) -> bool {
    if pointer_size == 4 {
        return ip >= 0x8000_0000;
    }
    ip >= 0xFFFF_0000_0000_0000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileImage {
    pub id: ImageId,
    pub module_name: String,
    pub file_path: String,
    pub base_address: u64,
    pub size: u64,
    pub checksum: u32,
    pub timestamp: u32,
    pub build_id: Option<String>,
}

impl ProfileImage {
    pub fn end_address(&self) -> u64 {
        self.base_address.saturating_add(self.size)
    }

    pub fn contains(&self, ip: u64) -> bool {
        ip >= self.base_address && ip < self.end_address()
    }

    /// Module name without its extension, used for allow-list matching.
    pub fn stem(&self) -> &str {
        file_stem(&self.module_name)
    }
}

pub(crate) fn file_stem(name: &str) -> &str {
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(idx) => &name[..idx],
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileProcess {
    pub process_id: u32,
    pub name: String,
    pub image_file_name: String,
    pub is_wow64: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileThread {
    pub thread_id: u32,
    pub process_id: u32,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileContext {
    pub process_id: u32,
    pub thread_id: u32,
    pub cpu: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSample {
    pub time: Duration,
    pub weight: Duration,
    pub ip: u64,
    pub context_id: u32,
    pub stack_id: Option<u32>,
    pub is_kernel: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStack {
    pub context_id: u32,
    /// Innermost frame first.
    pub frames: Vec<u64>,
}

impl RawStack {
    pub fn is_unknown(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLoad {
    pub process_id: u32,
    pub image: ImageId,
}

/// JIT-compiled method reported by a managed runtime. Addresses are absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedMethod {
    pub process_id: u32,
    pub image: ImageId,
    pub name: String,
    pub start: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolFileDescriptor {
    pub file_name: String,
    pub build_id: Option<String>,
    pub age: u32,
}

impl std::fmt::Display for SymbolFileDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.build_id {
            Some(id) => write!(f, "{} ({}/{})", self.file_name, id, self.age),
            None => write!(f, "{}", self.file_name),
        }
    }
}

/// Symbol file identity recorded in the trace itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedSymbolFile {
    pub process_id: u32,
    pub image: ImageId,
    pub descriptor: SymbolFileDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceCounter {
    pub id: u32,
    pub name: String,
    pub frequency: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceCounterEvent {
    pub time: Duration,
    pub ip: u64,
    pub context_id: u32,
    pub counter_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceInfo {
    pub pointer_size: u8,
    pub trace_path: Option<String>,
}

impl Default for TraceInfo {
    fn default() -> Self {
        Self {
            pointer_size: 8,
            trace_path: None,
        }
    }
}

/// Decoded trace tables, as produced by the trace decoder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTrace {
    pub info: TraceInfo,
    pub processes: Vec<ProfileProcess>,
    pub threads: Vec<ProfileThread>,
    pub contexts: Vec<ProfileContext>,
    pub images: Vec<ProfileImage>,
    pub image_loads: Vec<ImageLoad>,
    pub samples: Vec<RawSample>,
    pub stacks: Vec<RawStack>,
    pub managed_methods: Vec<ManagedMethod>,
    pub symbol_files: Vec<EmbeddedSymbolFile>,
    pub performance_counters: Vec<PerformanceCounter>,
    pub counter_events: Vec<PerformanceCounterEvent>,
}

impl RawTrace {
    /// Reads a bincode trace dump, gunzipping it first when the file name ends in `.gz`.
    pub fn read_from(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open trace file {}", path.display()))?;
        let reader: Box<dyn Read> = match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Box::new(GzDecoder::new(file)),
            _ => Box::new(file),
        };

        let mut trace: RawTrace = bincode::deserialize_from(BufReader::new(reader))
            .with_context(|| format!("Failed to decode trace file {}", path.display()))?;
        trace.info.trace_path = Some(path.display().to_string());
        Ok(trace)
    }
}

#[derive(Debug, Clone, Copy)]
struct AddressRange {
    start: u64,
    end: u64,
    index: usize,
    // Largest `end` of this range and every range sorted before it.
    max_end: u64,
}

impl AddressRange {
    fn new(start: u64, end: u64, index: usize) -> Self {
        Self {
            start,
            end,
            index,
            max_end: end,
        }
    }
}

/// Innermost range enclosing `ip`. Ranges may nest, so the walk goes back
/// from the last range starting at or below `ip` until no earlier range can
/// still reach it.
fn find_range(ranges: &[AddressRange], ip: u64) -> Option<usize> {
    let pos = ranges.partition_point(|r| r.start <= ip);
    ranges[..pos]
        .iter()
        .rev()
        .take_while(|r| r.max_end > ip)
        .find(|r| ip < r.end)
        .map(|r| r.index)
}

fn sorted_ranges(mut ranges: Vec<AddressRange>) -> Vec<AddressRange> {
    ranges.sort_by_key(|r| (r.start, std::cmp::Reverse(r.end)));
    let mut max_end = 0;
    for range in ranges.iter_mut() {
        max_end = max_end.max(range.end);
        range.max_end = max_end;
    }
    ranges
}

/// Read-only view over a decoded trace with per-process address indexes.
#[derive(Debug)]
pub struct RawProfile {
    trace: RawTrace,
    images: Vec<Arc<ProfileImage>>,
    image_index: HashMap<ImageId, usize>,
    process_images: HashMap<u32, Vec<AddressRange>>,
    managed_methods: HashMap<u32, Vec<AddressRange>>,
    symbol_files: HashMap<(u32, ImageId), usize>,
}

impl RawProfile {
    pub fn new(trace: RawTrace) -> Self {
        let images: Vec<Arc<ProfileImage>> =
            trace.images.iter().cloned().map(Arc::new).collect();
        let image_index: HashMap<ImageId, usize> = images
            .iter()
            .enumerate()
            .map(|(idx, image)| (image.id, idx))
            .collect();

        let mut process_images: HashMap<u32, Vec<AddressRange>> = HashMap::new();
        for load in trace.image_loads.iter() {
            if let Some(&index) = image_index.get(&load.image) {
                let image = &images[index];
                process_images
                    .entry(load.process_id)
                    .or_default()
                    .push(AddressRange::new(image.base_address, image.end_address(), index));
            }
        }
        let process_images = process_images
            .into_iter()
            .map(|(pid, ranges)| (pid, sorted_ranges(ranges)))
            .collect();

        let mut managed_methods: HashMap<u32, Vec<AddressRange>> = HashMap::new();
        for (index, method) in trace.managed_methods.iter().enumerate() {
            managed_methods
                .entry(method.process_id)
                .or_default()
                .push(AddressRange::new(
                    method.start,
                    method.start.saturating_add(method.size),
                    index,
                ));
        }
        let managed_methods = managed_methods
            .into_iter()
            .map(|(pid, ranges)| (pid, sorted_ranges(ranges)))
            .collect();

        let symbol_files = trace
            .symbol_files
            .iter()
            .enumerate()
            .map(|(idx, f)| ((f.process_id, f.image), idx))
            .collect();

        Self {
            trace,
            images,
            image_index,
            process_images,
            managed_methods,
            symbol_files,
        }
    }

    pub fn info(&self) -> &TraceInfo {
        &self.trace.info
    }

    pub fn pointer_size(&self) -> u8 {
        self.trace.info.pointer_size
    }

    pub fn samples(&self) -> &[RawSample] {
        &self.trace.samples
    }

    pub fn stack(&self, stack_id: u32) -> Option<&RawStack> {
        self.trace.stacks.get(stack_id as usize)
    }

    pub fn context(&self, context_id: u32) -> Option<ProfileContext> {
        self.trace.contexts.get(context_id as usize).copied()
    }

    pub fn images(&self) -> &[Arc<ProfileImage>] {
        &self.images
    }

    pub fn image(&self, id: ImageId) -> Option<&Arc<ProfileImage>> {
        self.image_index.get(&id).map(|&idx| &self.images[idx])
    }

    pub fn find_process(&self, process_id: u32) -> Option<&ProfileProcess> {
        self.trace
            .processes
            .iter()
            .find(|p| p.process_id == process_id)
    }

    pub fn processes(&self) -> &[ProfileProcess] {
        &self.trace.processes
    }

    pub fn threads(&self, process_id: u32) -> impl Iterator<Item = &ProfileThread> {
        self.trace
            .threads
            .iter()
            .filter(move |t| t.process_id == process_id)
    }

    /// Images loaded into a process, in load-address order.
    pub fn process_images(&self, process_id: u32) -> Vec<Arc<ProfileImage>> {
        self.process_images
            .get(&process_id)
            .map(|ranges| {
                ranges
                    .iter()
                    .map(|r| Arc::clone(&self.images[r.index]))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find_image_for_ip(&self, ip: u64, process_id: u32) -> Option<&Arc<ProfileImage>> {
        let ranges = self.process_images.get(&process_id)?;
        find_range(ranges, ip).map(|idx| &self.images[idx])
    }

    /// Looks the pointer up in the kernel or the process image table,
    /// depending on which half of the address space it falls in.
    pub fn find_image_for_frame(&self, ip: u64, process_id: u32) -> Option<&Arc<ProfileImage>> {
        if is_kernel_address(ip, self.pointer_size()) {
            self.find_image_for_ip(ip, KERNEL_PROCESS_ID)
        } else {
            self.find_image_for_ip(ip, process_id)
        }
    }

    pub fn has_managed_methods(&self, process_id: u32) -> bool {
        self.managed_methods.contains_key(&process_id)
    }

    pub fn find_managed_method_for_ip(&self, ip: u64, process_id: u32) -> Option<&ManagedMethod> {
        let ranges = self.managed_methods.get(&process_id)?;
        find_range(ranges, ip).map(|idx| &self.trace.managed_methods[idx])
    }

    pub fn managed_methods_for_image(
        &self,
        image: ImageId,
        process_id: u32,
    ) -> Vec<&ManagedMethod> {
        self.trace
            .managed_methods
            .iter()
            .filter(|m| m.image == image && m.process_id == process_id)
            .collect()
    }

    /// Symbol file identity recorded in the trace for an image, if the decoder saw one.
    pub fn debug_file_for_image(
        &self,
        image: ImageId,
        process_id: u32,
    ) -> Option<&SymbolFileDescriptor> {
        self.symbol_files
            .get(&(process_id, image))
            .or_else(|| self.symbol_files.get(&(KERNEL_PROCESS_ID, image)))
            .map(|&idx| &self.trace.symbol_files[idx].descriptor)
    }

    pub fn performance_counters(&self) -> &[PerformanceCounter] {
        &self.trace.performance_counters
    }

    pub fn counter_events(&self) -> &[PerformanceCounterEvent] {
        &self.trace.counter_events
    }

    pub fn has_counter_events(&self) -> bool {
        !self.trace.counter_events.is_empty()
    }
}
