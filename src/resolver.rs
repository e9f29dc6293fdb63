//! Call-site management and the resolve worker.
//!
//! [`StubManager`] owns every dispatch-related stub and the shared
//! [`ResolveCache`]. Jitted code reaches it only through the resolver entry
//! point that lookup stubs and resolve-stub slow paths jump to; on the way in
//! the cell register may carry [`flags`] explaining why.
//!
//! Cell transitions performed by [`StubManager::resolve_worker`]:
//!
//! | Current cell | Request     | New cell                         |
//! |--------------|-------------|----------------------------------|
//! | Lookup       | any         | Dispatch(receiver type)          |
//! | Dispatch     | `BACKPATCH` | Resolve                          |
//! | any          | `DOWNGRADE` | Dispatch(receiver type), if [`StubManager::should_downgrade`] |
//! | otherwise    |             | unchanged                        |
//!
//! Every resolution also publishes a cache element. A cell is rewritten with
//! a single word store after the new stub is fully written, so a concurrent
//! caller sees either the old stub or the new one.
use crate::{
    arch::{
        regs::{ARGS, CELL, LR, RECEIVER, TOKEN},
        InstructionSet,
    },
    code_heap::{CodeHeap, CodeKind},
    config::StubConfig,
    error::DispatchError,
    execution_control::Strategy,
    machine::{Context, Exit, Machine},
    memory::{Address, AddressSpace, NATIVE_ENTRY_STRIDE},
    metrics::StubMetrics,
    resolve_cache::ResolveCache,
    stubs::{
        counters, flags, DispatchStub, LookupStub, ResolveStub, ResolveStubParams, StubGenerator,
    },
    sync::{Arc, Mutex},
    types::{DispatchToken, TypeSystem},
};
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::{debug, trace};

/// A prepared virtual call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// The indirection cell jitted code calls through.
    pub cell: Address,
    pub token: DispatchToken,
    /// Where the callee returns to; a managed code address.
    pub return_address: Address,
}

/// Which stub a cell currently points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteState {
    Lookup,
    Dispatch { expected_type: Address },
    Resolve,
    /// Not a stub this manager created for the site.
    Foreign(Address),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    /// The method body control was transferred to.
    pub target: Address,
    pub resolver_called: bool,
}

#[derive(Default)]
struct SiteStubs {
    resolve: Option<ResolveStub>,
    dispatch: HashMap<Address, DispatchStub>,
}

struct SiteRecord {
    token: DispatchToken,
    stubs: Mutex<SiteStubs>,
}

pub struct StubManager {
    config: StubConfig,
    memory: Arc<AddressSpace>,
    heap: Arc<CodeHeap>,
    generator: StubGenerator,
    cache: ResolveCache,
    types: Arc<dyn TypeSystem>,
    metrics: Arc<StubMetrics>,
    lookup_stubs: DashMap<DispatchToken, LookupStub>,
    sites: DashMap<Address, Arc<SiteRecord>>,
}

impl StubManager {
    pub fn new(
        config: StubConfig,
        heap: Arc<CodeHeap>,
        types: Arc<dyn TypeSystem>,
        metrics: Arc<StubMetrics>,
    ) -> Result<Self, DispatchError> {
        let memory = heap.memory().clone();
        let cache = ResolveCache::new(memory.clone(), config.cache_bits)?;
        let generator = StubGenerator::new(heap.clone(), config.isa.into(), metrics.clone());
        debug!(
            isa = generator.isa().name(),
            buckets = cache.bucket_count(),
            promote_after = config.promote_after,
            downgrade_streak = config.downgrade_streak,
            "stub manager ready"
        );
        Ok(Self {
            config,
            memory,
            heap,
            generator,
            cache,
            types,
            metrics,
            lookup_stubs: DashMap::new(),
            sites: DashMap::new(),
        })
    }

    pub fn config(&self) -> &StubConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResolveCache {
        &self.cache
    }

    pub fn generator(&self) -> &StubGenerator {
        &self.generator
    }

    pub fn metrics(&self) -> &Arc<StubMetrics> {
        &self.metrics
    }

    pub fn resolver_entry(&self) -> Address {
        self.memory.resolver_entry()
    }

    /// The shared lookup stub for `token`.
    pub fn lookup_stub(&self, token: DispatchToken) -> Result<LookupStub, DispatchError> {
        if let Some(stub) = self.lookup_stubs.get(&token) {
            return Ok(*stub);
        }
        let stub = self.generator.lookup(token, self.resolver_entry())?;
        // A racing thread may have won; its stub is just as good.
        Ok(*self.lookup_stubs.entry(token).or_insert(stub))
    }

    /// Allocate an indirection cell for `token`, initially pointing at its lookup stub.
    pub fn prepare_call_site(&self, token: DispatchToken) -> Result<CallSite, DispatchError> {
        let lookup = self.lookup_stub(token)?;
        let cell = self.memory.allocate_data(8, 8)?;
        self.memory.store_word(cell, lookup.entry.as_u64())?;

        let return_address = self.memory.reserve_native_entry()?;
        self.heap.code_map().register(
            return_address..return_address + NATIVE_ENTRY_STRIDE,
            CodeKind::Managed(Strategy::Jit),
        );

        self.sites.insert(
            cell,
            Arc::new(SiteRecord {
                token,
                stubs: Mutex::new(SiteStubs::default()),
            }),
        );
        debug!(%cell, %token, "prepared call site");
        Ok(CallSite {
            cell,
            token,
            return_address,
        })
    }

    fn record(&self, cell: Address) -> Result<Arc<SiteRecord>, DispatchError> {
        self.sites
            .get(&cell)
            .map(|r| r.value().clone())
            .ok_or(DispatchError::UnknownCallSite(cell))
    }

    fn ensure_resolve_stub(&self, record: &SiteRecord) -> Result<ResolveStub, DispatchError> {
        let mut stubs = record.stubs.lock();
        if let Some(stub) = stubs.resolve {
            return Ok(stub);
        }

        let block = self.memory.allocate_data(counters::SIZE, 8)?;
        self.memory.store_word(
            block.offset(counters::MISSES as i64),
            self.config.promote_after as u64,
        )?;
        self.memory.store_word(
            block.offset(counters::STREAK_REMAINING as i64),
            self.config.downgrade_streak as u64,
        )?;
        let stub = self.generator.resolve(&ResolveStubParams {
            token: record.token,
            hashed_token: self.cache.hash_token(record.token),
            cache_mask: self.cache.scaled_mask(),
            buckets: self.cache.buckets_base(),
            resolver: self.resolver_entry(),
            counters: block,
            downgrade_streak: self.config.downgrade_streak,
        })?;
        stubs.resolve = Some(stub);
        Ok(stub)
    }

    fn ensure_dispatch_stub(
        &self,
        record: &SiteRecord,
        receiver_type: Address,
        target: Address,
    ) -> Result<DispatchStub, DispatchError> {
        let resolve = self.ensure_resolve_stub(record)?;
        let mut stubs = record.stubs.lock();
        if let Some(stub) = stubs.dispatch.get(&receiver_type) {
            return Ok(*stub);
        }
        let stub = self
            .generator
            .dispatch(receiver_type, target, resolve.fail_entry)?;
        stubs.dispatch.insert(receiver_type, stub);
        Ok(stub)
    }

    /// The resolve stub serving `site`, created on first use.
    pub fn resolve_stub_for(&self, site: &CallSite) -> Result<ResolveStub, DispatchError> {
        let record = self.record(site.cell)?;
        self.ensure_resolve_stub(&record)
    }

    /// A dispatch stub for `site` expecting `receiver_type`.
    pub fn dispatch_stub_for(
        &self,
        site: &CallSite,
        receiver_type: Address,
    ) -> Result<DispatchStub, DispatchError> {
        let target = self.types.resolve(receiver_type, site.token).ok_or(
            DispatchError::MissingImplementation {
                receiver_type,
                token: site.token.0,
            },
        )?;
        let record = self.record(site.cell)?;
        self.ensure_dispatch_stub(&record, receiver_type, target)
    }

    /// Point `cell` at `entry`. The stub must already be fully written.
    pub fn install_stub(&self, cell: Address, entry: Address) -> Result<(), DispatchError> {
        self.memory.store_word(cell, entry.as_u64())?;
        trace!(%cell, %entry, "installed stub");
        Ok(())
    }

    pub fn site_state(&self, cell: Address) -> Result<SiteState, DispatchError> {
        let record = self.record(cell)?;
        let current = Address(self.memory.load_word(cell)?);
        Ok(self.classify(&record, current))
    }

    fn classify(&self, record: &SiteRecord, current: Address) -> SiteState {
        if self
            .lookup_stubs
            .get(&record.token)
            .is_some_and(|l| l.entry == current)
        {
            return SiteState::Lookup;
        }
        let stubs = record.stubs.lock();
        if stubs.resolve.is_some_and(|r| r.resolve_entry == current) {
            return SiteState::Resolve;
        }
        stubs
            .dispatch
            .values()
            .find(|d| d.entry == current)
            .map(|d| SiteState::Dispatch {
                expected_type: d.expected_type,
            })
            .unwrap_or(SiteState::Foreign(current))
    }

    /// Whether the resolve stub's hit streak has run out.
    pub fn should_downgrade(&self, stub: &ResolveStub) -> Result<bool, DispatchError> {
        let remaining = self
            .memory
            .load_word(stub.counters.offset(counters::STREAK_REMAINING as i64))?;
        Ok((remaining as i64) < 0)
    }

    fn rearm(&self, stub: &ResolveStub) -> Result<(), DispatchError> {
        let block = stub.counters;
        self.memory.store_word(
            block.offset(counters::MISSES as i64),
            self.config.promote_after as u64,
        )?;
        self.memory
            .store_word(block.offset(counters::STREAK_TYPE as i64), 0)?;
        self.memory.store_word(
            block.offset(counters::STREAK_REMAINING as i64),
            self.config.downgrade_streak as u64,
        )?;
        Ok(())
    }

    /// Resolve the call described by `ctx` (the register state on entry to the
    /// resolver), publish the result and patch the cell if warranted. Leaves
    /// `ctx` ready to enter the returned target.
    pub fn resolve_worker(&self, ctx: &mut Context) -> Result<Address, DispatchError> {
        self.metrics.record_resolver_call();

        let raw_cell = ctx.reg(CELL);
        let cell = Address(raw_cell & !flags::MASK);
        let request = raw_cell & flags::MASK;
        let token = DispatchToken(ctx.reg(TOKEN));
        let record = self.record(cell)?;
        debug_assert_eq!(record.token, token);

        let receiver = Address(ctx.reg(RECEIVER));
        let receiver_type =
            Address(
                self.memory
                    .load_word(receiver)
                    .map_err(|fault| DispatchError::Fault {
                        pc: self.resolver_entry(),
                        fault,
                    })?,
            );
        let target = self.types.resolve(receiver_type, token).ok_or(
            DispatchError::MissingImplementation {
                receiver_type,
                token: token.0,
            },
        )?;

        let (_, inserted) = self.cache.insert(receiver_type, token, target)?;
        if inserted {
            self.metrics.record_cache_insert();
        }

        self.patch_call_site(&record, cell, request, receiver_type, target)?;

        ctx.set_reg(CELL, cell.as_u64());
        ctx.pc = target;
        trace!(
            %cell,
            %token,
            receiver_type = %self.types.describe_type(receiver_type),
            %target,
            request,
            "resolved"
        );
        Ok(target)
    }

    fn patch_call_site(
        &self,
        record: &SiteRecord,
        cell: Address,
        request: u64,
        receiver_type: Address,
        target: Address,
    ) -> Result<(), DispatchError> {
        let current = Address(self.memory.load_word(cell)?);
        match self.classify(record, current) {
            SiteState::Lookup => {
                let stub = self.ensure_dispatch_stub(record, receiver_type, target)?;
                self.install_stub(cell, stub.entry)?;
                debug!(%cell, expected_type = %receiver_type, "lookup -> dispatch");
            }
            SiteState::Dispatch { expected_type } if request & flags::BACKPATCH != 0 => {
                let stub = self.ensure_resolve_stub(record)?;
                self.rearm(&stub)?;
                self.install_stub(cell, stub.resolve_entry)?;
                self.metrics.record_promotion();
                debug!(%cell, %expected_type, "dispatch -> resolve");
            }
            state if request & flags::DOWNGRADE != 0 => {
                let resolve = self.ensure_resolve_stub(record)?;
                if self.should_downgrade(&resolve)? {
                    let stub = self.ensure_dispatch_stub(record, receiver_type, target)?;
                    self.rearm(&resolve)?;
                    self.install_stub(cell, stub.entry)?;
                    self.metrics.record_downgrade();
                    debug!(%cell, ?state, expected_type = %receiver_type, "downgraded to dispatch");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Call through `site` the way jitted code would, with up to three arguments.
    pub fn invoke(
        &self,
        site: &CallSite,
        receiver: Address,
        args: &[u64],
    ) -> Result<Invocation, DispatchError> {
        debug_assert!(args.len() <= ARGS.len());
        let mut ctx = Context::new(Address::NULL);
        ctx.set_reg(RECEIVER, receiver.as_u64());
        for (reg, value) in ARGS.iter().zip(args) {
            ctx.set_reg(*reg, *value);
        }
        ctx.set_reg(LR, site.return_address.as_u64());
        ctx.set_reg(CELL, site.cell.as_u64());
        self.invoke_with(&mut ctx)
    }

    /// Call through the cell in `r4` with a caller-built register state.
    ///
    /// On a fault `ctx` holds the state at the faulting instruction.
    pub fn invoke_with(&self, ctx: &mut Context) -> Result<Invocation, DispatchError> {
        let cell = Address(ctx.reg(CELL));
        let entry = Address(self.memory.load_word(cell)?);
        let machine = Machine::new(&self.memory, self.generator.isa(), self.config.step_limit);

        match machine.call(ctx, entry)? {
            Exit::Native(address) if address == self.resolver_entry() => {
                let target = self.resolve_worker(ctx)?;
                Ok(Invocation {
                    target,
                    resolver_called: true,
                })
            }
            Exit::Native(target) => Ok(Invocation {
                target,
                resolver_called: false,
            }),
            Exit::Return | Exit::Breakpoint(_) => Err(DispatchError::UnexpectedExit(ctx.pc)),
        }
    }

    /// Drop every cached resolution; stubs fall back to the resolver until it
    /// repopulates the cache.
    pub fn flush_resolve_cache(&self) -> Result<(), DispatchError> {
        self.cache.clear()?;
        self.metrics.record_cache_clear();
        debug!("resolve cache flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::IsaKind,
        memory::MemoryLayout,
        types::TypeRegistry,
    };

    struct World {
        manager: StubManager,
        types: Arc<TypeRegistry>,
    }

    fn world(isa: IsaKind, promote_after: u32) -> World {
        let config = StubConfig {
            isa,
            promote_after,
            downgrade_streak: 4,
            cache_bits: 8,
            ..StubConfig::default()
        };
        let memory = AddressSpace::new(MemoryLayout::default());
        let metrics = Arc::new(StubMetrics::new());
        let heap = Arc::new(CodeHeap::new(memory.clone(), metrics.clone()));
        let types = Arc::new(TypeRegistry::new(memory));
        let manager = StubManager::new(config, heap, types.clone(), metrics).unwrap();
        World { manager, types }
    }

    #[test]
    fn test_unsanitized_cache_size_is_an_error() {
        for cache_bits in [0, 64] {
            let config = StubConfig {
                cache_bits,
                ..StubConfig::default()
            };
            let memory = AddressSpace::new(MemoryLayout::default());
            let metrics = Arc::new(StubMetrics::new());
            let heap = Arc::new(CodeHeap::new(memory.clone(), metrics.clone()));
            let types = Arc::new(TypeRegistry::new(memory));
            assert!(matches!(
                StubManager::new(config, heap, types, metrics),
                Err(DispatchError::InvalidCacheSize { bits }) if bits == cache_bits
            ));
        }
    }

    #[test]
    fn test_site_stubs_are_created_once() {
        let w = world(IsaKind::Narrow, 10);
        let token = w.types.new_token();
        let ty = w.types.define_type("A", None, 0).unwrap();
        w.types.implement(ty, token, "A.M").unwrap();
        let site = w.manager.prepare_call_site(token).unwrap();

        let resolve = w.manager.resolve_stub_for(&site).unwrap();
        assert_eq!(w.manager.resolve_stub_for(&site).unwrap(), resolve);
        let dispatch = w.manager.dispatch_stub_for(&site, ty).unwrap();
        assert_eq!(w.manager.dispatch_stub_for(&site, ty).unwrap(), dispatch);
        assert_eq!(dispatch.fail_target, resolve.fail_entry);

        let stray = CallSite {
            cell: Address(0x1000_0008),
            ..site
        };
        assert_eq!(
            w.manager.resolve_stub_for(&stray),
            Err(DispatchError::UnknownCallSite(stray.cell))
        );
    }

    #[test]
    fn test_lookup_stubs_are_shared_per_token() {
        let w = world(IsaKind::Narrow, 10);
        let token = w.types.new_token();
        let a = w.manager.prepare_call_site(token).unwrap();
        let b = w.manager.prepare_call_site(token).unwrap();
        assert_ne!(a.cell, b.cell);
        assert_eq!(
            w.manager.memory.load_word(a.cell).unwrap(),
            w.manager.memory.load_word(b.cell).unwrap()
        );
        assert_eq!(w.manager.site_state(a.cell).unwrap(), SiteState::Lookup);
        assert_eq!(w.manager.metrics().snapshot().stubs.lookup, 1);
    }

    #[test]
    fn test_first_call_installs_dispatch() {
        let w = world(IsaKind::Wide, 10);
        let token = w.types.new_token();
        let ty = w.types.define_type("A", None, 1).unwrap();
        let body = w.types.implement(ty, token, "A.M").unwrap();
        let object = w.types.allocate_object(ty).unwrap();
        let site = w.manager.prepare_call_site(token).unwrap();

        let first = w.manager.invoke(&site, object, &[1, 2, 3]).unwrap();
        assert_eq!(first.target, body);
        assert!(first.resolver_called);
        assert_eq!(
            w.manager.site_state(site.cell).unwrap(),
            SiteState::Dispatch { expected_type: ty }
        );

        let second = w.manager.invoke(&site, object, &[]).unwrap();
        assert_eq!(second.target, body);
        assert!(!second.resolver_called);
    }

    #[test]
    fn test_missing_implementation_is_reported() {
        let w = world(IsaKind::Narrow, 10);
        let token = w.types.new_token();
        let ty = w.types.define_type("Empty", None, 0).unwrap();
        let object = w.types.allocate_object(ty).unwrap();
        let site = w.manager.prepare_call_site(token).unwrap();
        assert!(matches!(
            w.manager.invoke(&site, object, &[]),
            Err(DispatchError::MissingImplementation { .. })
        ));
        assert_eq!(w.manager.site_state(site.cell).unwrap(), SiteState::Lookup);
    }

    #[test]
    fn test_flush_forces_resolver_again() {
        let w = world(IsaKind::Narrow, 0);
        let token = w.types.new_token();
        let a = w.types.define_type("A", None, 0).unwrap();
        let b = w.types.define_type("B", None, 0).unwrap();
        w.types.implement(a, token, "A.M").unwrap();
        w.types.implement(b, token, "B.M").unwrap();
        let oa = w.types.allocate_object(a).unwrap();
        let ob = w.types.allocate_object(b).unwrap();
        let site = w.manager.prepare_call_site(token).unwrap();

        w.manager.invoke(&site, oa, &[]).unwrap();
        w.manager.invoke(&site, ob, &[]).unwrap();
        assert_eq!(w.manager.site_state(site.cell).unwrap(), SiteState::Resolve);
        assert!(!w.manager.invoke(&site, ob, &[]).unwrap().resolver_called);

        w.manager.flush_resolve_cache().unwrap();
        assert!(w.manager.invoke(&site, ob, &[]).unwrap().resolver_called);
        assert!(!w.manager.invoke(&site, ob, &[]).unwrap().resolver_called);
    }
}
