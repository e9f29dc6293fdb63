//! Wires the subsystems together over one address space.
use crate::{
    arch::Isa,
    assembler::AssembledCode,
    code_heap::{CodeHeap, CodeKind},
    config::StubConfig,
    error::StubError,
    execution_control::{
        AotExecutionControl, ExecutionControlRegistry, InterpreterExecutionControl,
        JitExecutionControl, Strategy,
    },
    memory::{Address, AddressSpace, MemoryLayout},
    metrics::{MetricsSnapshot, StubMetrics},
    resolver::StubManager,
    sync::Arc,
    threading::ThreadManager,
    types::TypeRegistry,
    unwind::Unwinder,
    write_barrier::{HeapBounds, WriteBarrierManager},
};
use std::ops::Range;
use tracing::{debug, info};

pub struct Runtime {
    pub config: StubConfig,
    pub memory: Arc<AddressSpace>,
    pub metrics: Arc<StubMetrics>,
    pub heap: Arc<CodeHeap>,
    pub types: Arc<TypeRegistry>,
    pub threads: Arc<ThreadManager>,
    pub stubs: StubManager,
    pub barriers: WriteBarrierManager,
    pub unwinder: Unwinder,
    pub execution_control: ExecutionControlRegistry,
}

impl Runtime {
    pub fn new(config: StubConfig) -> Result<Self, StubError> {
        let config = config.sanitized();
        let memory = AddressSpace::new(MemoryLayout {
            data_bytes: config.data_heap_bytes,
            code_bytes: config.code_heap_bytes,
            write_xor_execute: config.write_xor_execute,
        });
        let metrics = Arc::new(StubMetrics::new());
        let heap = Arc::new(CodeHeap::new(memory.clone(), metrics.clone()));
        let types = Arc::new(TypeRegistry::new(memory.clone()));
        let threads = Arc::new(ThreadManager::new());

        let stubs = StubManager::new(config.clone(), heap.clone(), types.clone(), metrics.clone())?;
        let bounds = HeapBounds::allocate_for(&memory, memory.data_range())?;
        let barriers = WriteBarrierManager::new(
            &config,
            heap.clone(),
            threads.clone(),
            metrics.clone(),
            bounds,
        )?;
        let unwinder = Unwinder::new(heap.clone(), config.unwind_mode);

        let mut execution_control = ExecutionControlRegistry::new(heap.clone());
        execution_control.register(JitExecutionControl::new(heap.clone(), Isa::from(config.isa)));
        execution_control.register(InterpreterExecutionControl::new(heap.clone()));

        info!(
            isa = ?config.isa,
            cache_bits = config.cache_bits,
            write_xor_execute = config.write_xor_execute,
            processors = config.processor_count,
            "runtime initialized"
        );
        Ok(Self {
            config,
            memory,
            metrics,
            heap,
            types,
            threads,
            stubs,
            barriers,
            unwinder,
            execution_control,
        })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Map a precompiled image into the code heap and give it its own
    /// breakpoint control. Returns the image's executable range.
    pub fn load_precompiled_image(
        &mut self,
        code: &AssembledCode,
    ) -> Result<Range<Address>, StubError> {
        let image = self.heap.install(code, CodeKind::Managed(Strategy::Aot))?;
        let range = image.rx..image.rx + code.len_bytes();
        self.execution_control.register(AotExecutionControl::new(
            self.heap.clone(),
            Isa::from(self.config.isa),
            range.clone(),
        ));
        debug!(start = %range.start, end = %range.end, "loaded precompiled image");
        Ok(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::{regs::R0, IsaKind},
        assembler::Assembler,
        error::PatchError,
    };

    fn image(isa: IsaKind, value: u64) -> AssembledCode {
        let mut asm = Assembler::new(Isa::from(isa));
        asm.mov_imm(R0, value);
        asm.ret();
        asm.finish().unwrap()
    }

    #[test]
    fn test_breakpoints_route_to_the_owning_image() {
        let mut rt = Runtime::new(StubConfig {
            processor_count: 1,
            ..StubConfig::default()
        })
        .unwrap();
        let isa = rt.config.isa;
        let first = rt.load_precompiled_image(&image(isa, 1)).unwrap();
        let second = rt.load_precompiled_image(&image(isa, 2)).unwrap();

        for range in [&first, &second] {
            assert_eq!(
                rt.execution_control.strategy_for(range.start),
                Some(Strategy::Aot)
            );
            rt.execution_control.apply_patch(range.start).unwrap();
            assert!(rt.execution_control.is_patched(range.start));
        }
        assert_eq!(
            rt.execution_control.apply_patch(second.start),
            Err(PatchError::AlreadyApplied(second.start))
        );
        rt.execution_control.unapply_patch(first.start).unwrap();
        assert!(!rt.execution_control.is_patched(first.start));
        assert!(rt.execution_control.is_patched(second.start));
    }
}
