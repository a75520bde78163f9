use super::{ModuleRegistry, NormalizedAddress, ResolverFactory, StackMemo, WorkerContext};
use crate::profile::{FrameKey, ResolvedFrame, ResolvedStack};
use crate::trace::{is_kernel_address, RawProfile, RawSample, MAX_STACK_DEPTH};
use std::sync::Arc;

/// Identity of a stack in the memo. Samples without a captured stack get a
/// one-frame stack made from their instruction pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackKey {
    Captured(u32),
    Synthetic { context_id: u32, ip: u64 },
}

/// StackResolver turns raw frame pointers into resolved frames, sharing
/// modules through the registry and whole stacks through the memo.
pub struct StackResolver<'a> {
    raw: &'a RawProfile,
    registry: &'a ModuleRegistry,
    factory: &'a ResolverFactory<'a>,
    memo: &'a StackMemo,
}

impl<'a> StackResolver<'a> {
    pub fn new(
        raw: &'a RawProfile,
        registry: &'a ModuleRegistry,
        factory: &'a ResolverFactory<'a>,
        memo: &'a StackMemo,
    ) -> Self {
        Self {
            raw,
            registry,
            factory,
            memo,
        }
    }

    pub fn resolve_sample(&self, sample: &RawSample, ctx: &mut WorkerContext) -> Arc<ResolvedStack> {
        ctx.stats.samples += 1;
        let captured = sample
            .stack_id
            .and_then(|id| self.raw.stack(id).map(|stack| (id, stack)))
            .filter(|(_, stack)| !stack.is_unknown());

        match captured {
            Some((id, stack)) => self.resolve(StackKey::Captured(id), stack.context_id, &stack.frames, ctx),
            None => {
                let key = StackKey::Synthetic {
                    context_id: sample.context_id,
                    ip: sample.ip,
                };
                self.resolve(key, sample.context_id, &[sample.ip], ctx)
            }
        }
    }

    pub fn resolve(
        &self,
        key: StackKey,
        context_id: u32,
        frames: &[u64],
        ctx: &mut WorkerContext,
    ) -> Arc<ResolvedStack> {
        if let Some(stack) = self.memo.get(&key) {
            ctx.stats.memo_hits += 1;
            return stack;
        }

        let context = self.raw.context(context_id).unwrap_or_default();
        let frames = frames
            .iter()
            .take(MAX_STACK_DEPTH)
            .enumerate()
            .map(|(index, &ip)| self.resolve_frame(ip, index, context.process_id, ctx))
            .collect();

        let stack = Arc::new(ResolvedStack { context, frames });
        self.memo.get_or_publish(key, stack)
    }

    pub fn registry(&self) -> &ModuleRegistry {
        self.registry
    }

    /// Resolves a lone instruction pointer, such as a counter event's.
    pub fn resolve_ip(&self, ip: u64, process_id: u32, ctx: &mut WorkerContext) -> ResolvedFrame {
        self.resolve_frame(ip, 0, process_id, ctx)
    }

    fn resolve_frame(&self, ip: u64, index: usize, process_id: u32, ctx: &mut WorkerContext) -> ResolvedFrame {
        let is_kernel = is_kernel_address(ip, self.raw.pointer_size());

        let (image, is_managed) = match self.raw.find_image_for_frame(ip, process_id) {
            Some(image) => (image, false),
            None => {
                let managed = self
                    .raw
                    .find_managed_method_for_ip(ip, process_id)
                    .and_then(|method| self.raw.image(method.image));
                match managed {
                    Some(image) => (image, true),
                    None => {
                        ctx.stats.unknown_frames += 1;
                        return ResolvedFrame::unknown(ip, index, is_kernel);
                    }
                }
            }
        };

        let resolver = ctx.resolver(self.registry, image, is_managed, || {
            self.factory.create(image, is_managed, process_id)
        });
        let rva = NormalizedAddress::new(ip, image, is_managed).rva();
        let function = resolver.get_or_create_function(rva);

        ResolvedFrame {
            key: FrameKey {
                function: Some(function.id),
                image: Some(image.id),
                is_managed,
            },
            function: Some(function),
            image: Some(Arc::clone(image)),
            ip,
            rva,
            index,
            is_kernel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debuginfo_store::AcquiredModules;
    use crate::trace::testing::TraceBuilder;
    use crate::trace::ImageId;

    const PID: u32 = 10;

    struct Fixture {
        raw: RawProfile,
        acquired: AcquiredModules,
        registry: ModuleRegistry,
        memo: StackMemo,
    }

    impl Fixture {
        fn new(b: &TraceBuilder) -> Self {
            Self {
                raw: b.build(),
                acquired: AcquiredModules::default(),
                registry: ModuleRegistry::new(),
                memo: StackMemo::unbounded(),
            }
        }
    }

    fn builder() -> TraceBuilder {
        let mut b = TraceBuilder::new();
        b.add_process(PID, "app.exe");
        b.add_image(PID, "app.exe", 0x40_0000, 0x10_0000);
        b
    }

    #[test]
    fn test_same_stack_resolves_once() {
        let mut b = builder();
        let stack = b.add_stack(PID, 1, &[0x40_1000, 0x40_2000]);
        b.add_sample(0, 1, PID, 1, 0x40_1000, Some(stack));
        b.add_sample(1, 1, PID, 1, 0x40_1000, Some(stack));
        let f = Fixture::new(&b);
        let factory = ResolverFactory::new(&f.raw, &f.acquired);
        let resolver = StackResolver::new(&f.raw, &f.registry, &factory, &f.memo);

        let mut ctx = WorkerContext::new();
        let first = resolver.resolve_sample(&f.raw.samples()[0], &mut ctx);
        let second = resolver.resolve_sample(&f.raw.samples()[1], &mut ctx);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ctx.stats.memo_hits, 1);
        assert_eq!(ctx.stats.samples, 2);
        assert_eq!(f.registry.constructions(), 1);
        assert_eq!(first.context.process_id, PID);
        assert_eq!(first.context.thread_id, 1);
    }

    #[test]
    fn test_native_frames_are_image_relative() {
        let mut b = builder();
        let stack = b.add_stack(PID, 1, &[0x40_1234, 0x50_0000]);
        b.add_sample(0, 1, PID, 1, 0x40_1234, Some(stack));
        let f = Fixture::new(&b);
        let factory = ResolverFactory::new(&f.raw, &f.acquired);
        let resolver = StackResolver::new(&f.raw, &f.registry, &factory, &f.memo);

        let mut ctx = WorkerContext::new();
        let resolved = resolver.resolve_sample(&f.raw.samples()[0], &mut ctx);

        let top = resolved.top_frame().unwrap();
        assert_eq!(top.rva, 0x1234);
        assert_eq!(top.key.image, Some(ImageId(1)));
        assert_eq!(top.function.as_ref().unwrap().name, "1234");
        assert_eq!(top.offset_in_function(), Some(0));
        assert!(!top.is_managed());

        // Past the end of the image.
        let outer = &resolved.frames[1];
        assert!(outer.is_unknown());
        assert_eq!(outer.index, 1);
        assert_eq!(ctx.stats.unknown_frames, 1);
    }

    #[test]
    fn test_sample_without_stack_uses_its_ip() {
        let mut b = builder();
        b.add_sample(0, 1, PID, 1, 0x40_0010, None);
        b.add_sample(1, 1, PID, 2, 0x40_0010, None);
        let f = Fixture::new(&b);
        let factory = ResolverFactory::new(&f.raw, &f.acquired);
        let resolver = StackResolver::new(&f.raw, &f.registry, &factory, &f.memo);

        let mut ctx = WorkerContext::new();
        let a = resolver.resolve_sample(&f.raw.samples()[0], &mut ctx);
        let c = resolver.resolve_sample(&f.raw.samples()[1], &mut ctx);

        assert_eq!(a.frames.len(), 1);
        assert_eq!(a.frames[0].rva, 0x10);
        // Different threads, different synthetic stacks.
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.context.thread_id, 2);
    }

    #[test]
    fn test_managed_frames_use_method_table() {
        let mut b = builder();
        let runtime = b.add_image(PID, "System.Private.CoreLib.dll", 0x7000_0000, 0x1000);
        b.add_managed_method(PID, runtime, "List.Add", 0x9000_0000, 0x40);
        let stack = b.add_stack(PID, 1, &[0x9000_0010, 0x40_0100]);
        b.add_sample(0, 1, PID, 1, 0x9000_0010, Some(stack));
        let f = Fixture::new(&b);
        let factory = ResolverFactory::new(&f.raw, &f.acquired);
        let resolver = StackResolver::new(&f.raw, &f.registry, &factory, &f.memo);

        let mut ctx = WorkerContext::new();
        let resolved = resolver.resolve_sample(&f.raw.samples()[0], &mut ctx);

        let top = resolved.top_frame().unwrap();
        assert!(top.is_managed());
        assert_eq!(top.key.image, Some(runtime));
        assert_eq!(top.rva, 0x9000_0010);
        let function = top.function.as_ref().unwrap();
        assert_eq!(function.name, "List.Add");
        assert_eq!(function.id.rva, 0x9000_0000);
        assert_eq!(top.offset_in_function(), Some(0x10));
        assert!(!resolved.frames[1].is_managed());
    }

    #[test]
    fn test_kernel_frames_resolve_against_kernel_images() {
        let mut b = builder();
        b.add_image(0, "ntoskrnl.exe", 0xFFFF_F800_0000_0000, 0x10_0000);
        let stack = b.add_stack(PID, 1, &[0xFFFF_F800_0000_0400, 0x40_0100]);
        b.add_sample(0, 1, PID, 1, 0xFFFF_F800_0000_0400, Some(stack));
        let f = Fixture::new(&b);
        let factory = ResolverFactory::new(&f.raw, &f.acquired);
        let resolver = StackResolver::new(&f.raw, &f.registry, &factory, &f.memo);

        let mut ctx = WorkerContext::new();
        let resolved = resolver.resolve_sample(&f.raw.samples()[0], &mut ctx);

        let top = resolved.top_frame().unwrap();
        assert!(top.is_kernel);
        assert_eq!(top.rva, 0x400);
        assert_eq!(top.image.as_ref().unwrap().module_name, "ntoskrnl.exe");
        assert!(!resolved.frames[1].is_kernel);
        assert_eq!(f.registry.constructions(), 2);
    }
}
