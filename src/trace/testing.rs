//! Synthetic trace construction shared by the unit tests.

use super::*;

#[derive(Default)]
pub(crate) struct TraceBuilder {
    trace: RawTrace,
    contexts: HashMap<(u32, u32), u32>,
}

impl TraceBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn pointer_size(&mut self, size: u8) -> &mut Self {
        self.trace.info.pointer_size = size;
        self
    }

    pub(crate) fn add_process(&mut self, process_id: u32, image_file_name: &str) -> &mut Self {
        self.trace.processes.push(ProfileProcess {
            process_id,
            name: file_stem(image_file_name).to_string(),
            image_file_name: image_file_name.to_string(),
            is_wow64: false,
        });
        self
    }

    pub(crate) fn add_image(&mut self, process_id: u32, name: &str, base: u64, size: u64) -> ImageId {
        let id = ImageId(self.trace.images.len() as u32 + 1);
        self.trace.images.push(ProfileImage {
            id,
            module_name: name.to_string(),
            file_path: format!("/bin/{}", name),
            base_address: base,
            size,
            checksum: 0,
            timestamp: 0,
            build_id: None,
        });
        self.trace.image_loads.push(ImageLoad {
            process_id,
            image: id,
        });
        id
    }

    pub(crate) fn set_build_id(&mut self, image: ImageId, build_id: &str) -> &mut Self {
        if let Some(img) = self.trace.images.iter_mut().find(|i| i.id == image) {
            img.build_id = Some(build_id.to_string());
        }
        self
    }

    pub(crate) fn add_symbol_file(&mut self, process_id: u32, image: ImageId, file_name: &str) -> &mut Self {
        self.trace.symbol_files.push(EmbeddedSymbolFile {
            process_id,
            image,
            descriptor: SymbolFileDescriptor {
                file_name: file_name.to_string(),
                build_id: None,
                age: 1,
            },
        });
        self
    }

    pub(crate) fn add_managed_method(
        &mut self,
        process_id: u32,
        image: ImageId,
        name: &str,
        start: u64,
        size: u64,
    ) -> &mut Self {
        self.trace.managed_methods.push(ManagedMethod {
            process_id,
            image,
            name: name.to_string(),
            start,
            size,
        });
        self
    }

    pub(crate) fn context(&mut self, process_id: u32, thread_id: u32) -> u32 {
        if let Some(&id) = self.contexts.get(&(process_id, thread_id)) {
            return id;
        }
        let id = self.trace.contexts.len() as u32;
        self.trace.contexts.push(ProfileContext {
            process_id,
            thread_id,
            cpu: 0,
        });
        if !self.trace.threads.iter().any(|t| t.thread_id == thread_id) {
            self.trace.threads.push(ProfileThread {
                thread_id,
                process_id,
                name: None,
            });
        }
        self.contexts.insert((process_id, thread_id), id);
        id
    }

    pub(crate) fn add_stack(&mut self, process_id: u32, thread_id: u32, frames: &[u64]) -> u32 {
        let context_id = self.context(process_id, thread_id);
        self.trace.stacks.push(RawStack {
            context_id,
            frames: frames.to_vec(),
        });
        self.trace.stacks.len() as u32 - 1
    }

    /// Adds a sample at `time_us` microseconds with `weight_us` of weight.
    pub(crate) fn add_sample(
        &mut self,
        time_us: u64,
        weight_us: u64,
        process_id: u32,
        thread_id: u32,
        ip: u64,
        stack_id: Option<u32>,
    ) -> &mut Self {
        let context_id = self.context(process_id, thread_id);
        self.trace.samples.push(RawSample {
            time: Duration::from_micros(time_us),
            weight: Duration::from_micros(weight_us),
            ip,
            context_id,
            stack_id,
            is_kernel: is_kernel_address(ip, self.trace.info.pointer_size),
        });
        self
    }

    pub(crate) fn add_counter(&mut self, id: u32, name: &str) -> &mut Self {
        self.trace.performance_counters.push(PerformanceCounter {
            id,
            name: name.to_string(),
            frequency: 1,
        });
        self
    }

    pub(crate) fn add_counter_event(
        &mut self,
        process_id: u32,
        thread_id: u32,
        ip: u64,
        counter_id: u32,
    ) -> &mut Self {
        let context_id = self.context(process_id, thread_id);
        self.trace.counter_events.push(PerformanceCounterEvent {
            time: Duration::ZERO,
            ip,
            context_id,
            counter_id,
        });
        self
    }

    pub(crate) fn trace(&self) -> RawTrace {
        self.trace.clone()
    }

    pub(crate) fn build(&self) -> RawProfile {
        RawProfile::new(self.trace.clone())
    }
}
