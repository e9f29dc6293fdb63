use dotnet_stubs::{
    arch::{regs, IsaKind},
    config::StubConfig,
    error::{DispatchError, Fault},
    machine::Context,
    memory::Address,
    resolver::{CallSite, SiteState},
    runtime::Runtime,
    types::DispatchToken,
    unwind::{RegDisplay, UnwindMode, UnwindStep},
};

struct Harness {
    runtime: Runtime,
    token: DispatchToken,
    site: CallSite,
    /// (type handle, object, method body)
    receivers: Vec<(Address, Address, Address)>,
}

impl Harness {
    fn new(isa: IsaKind, type_count: usize, promote_after: u32, downgrade_streak: u32) -> Self {
        let runtime = Runtime::new(StubConfig {
            isa,
            promote_after,
            downgrade_streak,
            cache_bits: 8,
            unwind_mode: UnwindMode::Diagnostic,
            processor_count: 1,
            ..StubConfig::default()
        })
        .unwrap();
        let token = runtime.types.new_token();
        let receivers = (0..type_count)
            .map(|i| {
                let ty = runtime.types.define_type(&format!("T{i}"), None, 1).unwrap();
                let body = runtime
                    .types
                    .implement(ty, token, &format!("T{i}.M"))
                    .unwrap();
                (ty, runtime.types.allocate_object(ty).unwrap(), body)
            })
            .collect();
        let site = runtime.stubs.prepare_call_site(token).unwrap();
        Self {
            runtime,
            token,
            site,
            receivers,
        }
    }

    /// Call with receiver `i`, check the target and report whether the
    /// resolver was involved.
    fn call(&self, i: usize) -> bool {
        let (_, object, body) = self.receivers[i];
        let invocation = self.runtime.stubs.invoke(&self.site, object, &[7, 8, 9]).unwrap();
        assert_eq!(invocation.target, body, "receiver {i} reached the wrong method");
        invocation.resolver_called
    }

    fn state(&self) -> SiteState {
        self.runtime.stubs.site_state(self.site.cell).unwrap()
    }

    fn resolver_calls(&self) -> u64 {
        self.runtime.metrics().resolver_calls
    }
}

#[test]
fn test_end_to_end_lookup_dispatch_resolve() {
    for isa in [IsaKind::Narrow, IsaKind::Wide] {
        let h = Harness::new(isa, 2, 0, 64);
        let (type_a, _, _) = h.receivers[0];
        assert_eq!(h.state(), SiteState::Lookup);

        assert!(h.call(0));
        assert_eq!(h.state(), SiteState::Dispatch { expected_type: type_a });

        assert!(h.call(1));
        assert_eq!(h.state(), SiteState::Resolve);
        assert_eq!(h.runtime.stubs.cache().len(), 2);

        let before = h.resolver_calls();
        for i in 0..20 {
            assert!(!h.call(i % 2));
        }
        assert_eq!(h.resolver_calls(), before);
        assert_eq!(h.runtime.metrics().promotions, 1);
    }
}

#[test]
fn test_monomorphic_site_stays_dispatch() {
    let h = Harness::new(IsaKind::Narrow, 1, 4, 8);
    for _ in 0..100 {
        h.call(0);
    }
    assert_eq!(h.resolver_calls(), 1);
    assert_eq!(
        h.state(),
        SiteState::Dispatch {
            expected_type: h.receivers[0].0
        }
    );
}

#[test]
fn test_polymorphic_site_converges_to_resolve() {
    let h = Harness::new(IsaKind::Wide, 3, 2, 256);
    for i in 0..30 {
        h.call(i % 3);
    }
    assert_eq!(h.state(), SiteState::Resolve);

    let before = h.resolver_calls();
    for i in 0..60 {
        assert!(!h.call(i % 3));
    }
    assert_eq!(h.resolver_calls(), before);
    // One lookup, one dispatch, one resolve: nothing per call.
    let stubs = h.runtime.metrics().stubs;
    assert_eq!((stubs.lookup, stubs.dispatch, stubs.resolve), (1, 1, 1));
}

#[test]
fn test_resolve_site_downgrades_after_same_type_streak() {
    let h = Harness::new(IsaKind::Narrow, 2, 0, 3);
    h.call(0);
    h.call(1);
    assert_eq!(h.state(), SiteState::Resolve);

    // The streak starts on the first hit; three more are tolerated.
    for _ in 0..4 {
        assert!(!h.call(0));
    }
    assert!(h.call(0));
    assert_eq!(
        h.state(),
        SiteState::Dispatch {
            expected_type: h.receivers[0].0
        }
    );
    assert_eq!(h.runtime.metrics().downgrades, 1);

    let before = h.resolver_calls();
    for _ in 0..10 {
        assert!(!h.call(0));
    }
    assert_eq!(h.resolver_calls(), before);

    // The site can still be promoted again.
    h.call(1);
    assert_eq!(h.state(), SiteState::Resolve);
}

#[test]
fn test_dispatch_misses_below_threshold_use_cache() {
    let h = Harness::new(IsaKind::Narrow, 2, 5, 64);
    h.call(0);
    // First B miss goes to the resolver to populate the cache.
    assert!(h.call(1));
    for _ in 0..4 {
        assert!(!h.call(1));
    }
    assert!(matches!(h.state(), SiteState::Dispatch { .. }));
    // Counter exhausted: promotion.
    assert!(h.call(1));
    assert_eq!(h.state(), SiteState::Resolve);
}

#[test]
fn test_inherited_implementation() {
    let h = Harness::new(IsaKind::Wide, 1, 0, 64);
    let (base, _, base_body) = h.receivers[0];
    let derived = h.runtime.types.define_type("Derived", Some(base), 1).unwrap();
    let object = h.runtime.types.allocate_object(derived).unwrap();

    h.call(0);
    let invocation = h.runtime.stubs.invoke(&h.site, object, &[]).unwrap();
    assert_eq!(invocation.target, base_body);
    assert_eq!(h.state(), SiteState::Resolve);
}

#[test]
fn test_arguments_survive_every_stub_kind() {
    let h = Harness::new(IsaKind::Narrow, 2, 0, 64);
    let stack = h.runtime.memory.allocate_data(64, 16).unwrap();

    for i in [0, 0, 1, 0, 1] {
        let (_, object, body) = h.receivers[i];
        let mut ctx = Context::new(Address::NULL);
        ctx.set_reg(regs::RECEIVER, object.as_u64());
        ctx.set_reg(regs::R1, 11);
        ctx.set_reg(regs::R2, 22);
        ctx.set_reg(regs::R3, 33);
        for (n, reg) in regs::CALLEE_SAVED.iter().enumerate() {
            ctx.set_reg(*reg, 100 + n as u64);
        }
        ctx.set_reg(regs::SP, stack.as_u64());
        ctx.set_reg(regs::LR, h.site.return_address.as_u64());
        ctx.set_reg(regs::CELL, h.site.cell.as_u64());

        let invocation = h.runtime.stubs.invoke_with(&mut ctx).unwrap();
        assert_eq!(invocation.target, body);
        assert_eq!(ctx.pc, body);
        assert_eq!(ctx.reg(regs::RECEIVER), object.as_u64());
        assert_eq!(
            (ctx.reg(regs::R1), ctx.reg(regs::R2), ctx.reg(regs::R3)),
            (11, 22, 33)
        );
        for (n, reg) in regs::CALLEE_SAVED.iter().enumerate() {
            assert_eq!(ctx.reg(*reg), 100 + n as u64);
        }
        assert_eq!(ctx.sp(), stack);
        assert_eq!(ctx.lr(), h.site.return_address);
        assert_eq!(ctx.reg(regs::CELL), h.site.cell.as_u64());
    }
}

#[test]
fn test_null_receiver_faults_before_touching_state() {
    for isa in [IsaKind::Narrow, IsaKind::Wide] {
        let h = Harness::new(isa, 2, 0, 64);
        h.call(0);
        let dispatch_entry = h.runtime.memory.load_word(h.site.cell).unwrap();

        let mut ctx = Context::new(Address::NULL);
        ctx.set_reg(regs::RECEIVER, 0);
        ctx.set_reg(regs::R1, 5);
        ctx.set_reg(regs::LR, h.site.return_address.as_u64());
        ctx.set_reg(regs::CELL, h.site.cell.as_u64());
        let err = h.runtime.stubs.invoke_with(&mut ctx).unwrap_err();
        match err {
            DispatchError::Fault {
                pc,
                fault: Fault::NullReference { .. },
            } => assert_eq!(pc.as_u64(), dispatch_entry),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(ctx.pc.as_u64(), dispatch_entry);
        assert_eq!(ctx.reg(regs::R1), 5);

        // The faulting stub is frameless; its caller is the managed call site.
        let mut display = RegDisplay::from_context(&ctx);
        assert_eq!(
            h.runtime.unwinder.step(&mut display).unwrap(),
            UnwindStep::Caller
        );
        assert_eq!(display.pc, h.site.return_address);
        assert_eq!(
            h.runtime.unwinder.step(&mut display).unwrap(),
            UnwindStep::FirstFrameManaged
        );

        let frames = h.runtime.unwinder.walk(RegDisplay::from_context(&ctx)).unwrap();
        assert_eq!(frames.len(), 2);
    }
}

#[test]
fn test_null_receiver_in_resolve_stub() {
    let h = Harness::new(IsaKind::Wide, 2, 0, 64);
    h.call(0);
    h.call(1);
    assert_eq!(h.state(), SiteState::Resolve);
    let resolve_entry = h.runtime.stubs.resolve_stub_for(&h.site).unwrap().resolve_entry;

    let err = h
        .runtime
        .stubs
        .invoke(&h.site, Address::NULL, &[])
        .unwrap_err();
    assert_eq!(
        err,
        DispatchError::Fault {
            pc: resolve_entry,
            fault: Fault::NullReference {
                address: Address::NULL
            }
        }
    );
}

#[test]
fn test_sites_share_lookup_stub_and_cache() {
    let h = Harness::new(IsaKind::Narrow, 2, 0, 64);
    let other = h.runtime.stubs.prepare_call_site(h.token).unwrap();
    assert_eq!(
        h.runtime.memory.load_word(h.site.cell).unwrap(),
        h.runtime.memory.load_word(other.cell).unwrap()
    );

    h.call(0);
    h.call(1);
    // The second site finds both pairs already cached once promoted.
    let (_, a, _) = h.receivers[0];
    let (_, b, _) = h.receivers[1];
    h.runtime.stubs.invoke(&other, a, &[]).unwrap();
    h.runtime.stubs.invoke(&other, b, &[]).unwrap();
    assert_eq!(h.runtime.stubs.cache().len(), 2);
    let before = h.resolver_calls();
    h.runtime.stubs.invoke(&other, a, &[]).unwrap();
    h.runtime.stubs.invoke(&other, b, &[]).unwrap();
    assert_eq!(h.resolver_calls(), before);
}
