use dotnet_stubs::{
    arch::{IsaKind, UNIT_SIZE},
    config::StubConfig,
    runtime::Runtime,
    sync::{Arc, AtomicBool, Ordering},
    threading::MutatorState,
    write_barrier::{
        BarrierKind, GcGlobal, HeapGrowth, Processors, StompActions, WriteBarrierManager,
        CARD_MARKED,
    },
};
use std::{thread, time::Duration};

fn runtime(isa: IsaKind, processor_count: usize) -> Runtime {
    Runtime::new(StubConfig {
        isa,
        processor_count,
        ..StubConfig::default()
    })
    .unwrap()
}

/// Every global the active variant uses holds its current value; the rest
/// have no site at all.
fn assert_complete(barriers: &WriteBarrierManager) {
    let bounds = barriers.bounds();
    for kind in BarrierKind::ALL {
        let variant = barriers.active_variant(kind).unwrap();
        let descriptor = barriers.descriptor(variant).unwrap();
        for global in GcGlobal::ALL {
            let embedded = barriers.embedded_value(kind, global).unwrap();
            if variant.references(global) {
                assert!(descriptor.offset_of(global).is_some());
                assert_eq!(
                    embedded,
                    Some(bounds.value_of(global)),
                    "{variant:?} {global:?}"
                );
            } else {
                assert!(descriptor.offset_of(global).is_none());
                assert_eq!(embedded, None);
            }
        }
    }
}

#[test]
fn test_refresh_is_idempotent() {
    for isa in [IsaKind::Narrow, IsaKind::Wide] {
        let rt = runtime(isa, 2);
        let before: Vec<_> = BarrierKind::ALL
            .iter()
            .map(|k| rt.barriers.published_code(*k).unwrap())
            .collect();
        let refreshes = rt.metrics().barrier_refreshes;

        let outcome = rt.barriers.update(false).unwrap();
        assert_eq!(outcome.actions(), StompActions::PASS);
        assert!(!outcome.suspended());
        outcome.finish();
        let bounds = rt.barriers.bounds();
        let outcome = rt.barriers.stomp_resize(bounds, false).unwrap();
        assert_eq!(outcome.actions(), StompActions::PASS);
        outcome.finish();

        let after: Vec<_> = BarrierKind::ALL
            .iter()
            .map(|k| rt.barriers.published_code(*k).unwrap())
            .collect();
        assert_eq!(before, after);
        assert_eq!(rt.metrics().barrier_refreshes, refreshes);
    }
}

#[test]
fn test_every_swap_leaves_globals_complete() {
    for isa in [IsaKind::Narrow, IsaKind::Wide] {
        let rt = runtime(isa, 1);
        assert_complete(&rt.barriers);

        rt.barriers.on_processor_count_policy_changed(8).unwrap().finish();
        assert_eq!(
            rt.barriers
                .active_variant(BarrierKind::Write)
                .unwrap()
                .flavor
                .processors,
            Processors::Multi
        );
        assert_complete(&rt.barriers);

        rt.barriers.switch_to_write_watch().unwrap().finish();
        assert_complete(&rt.barriers);

        let mut bounds = rt.barriers.bounds();
        bounds.highest = bounds.highest + 0x10_0000;
        rt.barriers.on_heap_bounds_changed(bounds).unwrap().finish();
        assert_eq!(
            rt.barriers
                .active_variant(BarrierKind::Checked)
                .unwrap()
                .flavor
                .growth,
            HeapGrowth::PostGrow
        );
        assert_complete(&rt.barriers);

        rt.barriers.on_processor_count_policy_changed(1).unwrap().finish();
        rt.barriers.switch_to_non_write_watch().unwrap().finish();
        assert_complete(&rt.barriers);
    }
}

#[test]
fn test_value_refresh_only_touches_immediates() {
    let rt = runtime(IsaKind::Narrow, 1);
    // Switch to post-grow so both ephemeral bounds are embedded.
    let mut bounds = rt.barriers.bounds();
    bounds.highest = bounds.highest + 0x1000;
    rt.barriers.on_heap_bounds_changed(bounds).unwrap().finish();

    let before = rt.barriers.published_code(BarrierKind::Write).unwrap();
    let low = bounds.ephemeral_low + 0x4000;
    let high = bounds.ephemeral_high.offset(-0x4000);
    let actions = rt.barriers.stomp_ephemeral(low, high).unwrap();
    assert_eq!(actions, StompActions::ICACHE_FLUSH);
    let after = rt.barriers.published_code(BarrierKind::Write).unwrap();

    let variant = rt.barriers.active_variant(BarrierKind::Write).unwrap();
    let descriptor = rt.barriers.descriptor(variant).unwrap();
    let sites: Vec<u64> = [GcGlobal::EphemeralLow, GcGlobal::EphemeralHigh]
        .iter()
        .map(|g| descriptor.offset_of(*g).unwrap() / UNIT_SIZE)
        .collect();
    for (i, (b, a)) in before.iter().zip(&after).enumerate() {
        if b != a {
            let i = i as u64;
            assert!(
                sites.iter().any(|&s| (s..s + 4).contains(&i)),
                "unit {i} changed outside an immediate"
            );
        }
    }
    assert_ne!(before, after);
    assert_eq!(
        rt.barriers
            .embedded_value(BarrierKind::Write, GcGlobal::EphemeralHigh)
            .unwrap(),
        Some(high.as_u64())
    );
}

#[test]
fn test_card_marking_follows_swaps() {
    for isa in [IsaKind::Narrow, IsaKind::Wide] {
        let rt = runtime(isa, 1);
        let object = rt.memory.allocate_data(32, 8).unwrap();
        for processors in [1, 4, 1] {
            rt.barriers
                .on_processor_count_policy_changed(processors)
                .unwrap()
                .finish();
            let slot = rt.memory.allocate_data(2048, 8).unwrap();
            let card = rt.barriers.bounds().card_for(slot);
            for kind in [BarrierKind::Write, BarrierKind::Checked] {
                rt.memory.store_u8(card, 0).unwrap();
                rt.barriers.execute(kind, slot, object.as_u64()).unwrap();
                assert_eq!(rt.memory.load_word(slot).unwrap(), object.as_u64());
                assert_eq!(rt.memory.load_u8(card).unwrap(), CARD_MARKED);
            }
        }
    }
}

#[test]
fn test_swap_parks_registered_mutators() {
    let rt = Arc::new(runtime(IsaKind::Narrow, 1));
    let stop = Arc::new(AtomicBool::new(false));
    let registered = Arc::new(AtomicBool::new(false));
    let worker_id = Arc::new(dotnet_stubs::sync::AtomicU64::new(0));

    let worker = {
        let rt = rt.clone();
        let stop = stop.clone();
        let registered = registered.clone();
        let worker_id = worker_id.clone();
        thread::spawn(move || {
            let id = rt.threads.register_thread();
            worker_id.store(id, Ordering::Release);
            registered.store(true, Ordering::Release);
            while !stop.load(Ordering::Acquire) {
                rt.threads.safe_point(id);
                thread::sleep(Duration::from_micros(100));
            }
            rt.threads.unregister_thread(id);
        })
    };
    while !registered.load(Ordering::Acquire) {
        thread::yield_now();
    }

    let outcome = rt.barriers.on_processor_count_policy_changed(4).unwrap();
    assert!(outcome.suspended());
    assert!(outcome
        .actions()
        .contains(StompActions::ICACHE_FLUSH | StompActions::RESTART));
    assert_eq!(
        rt.threads.state_of(worker_id.load(Ordering::Acquire)),
        Some(MutatorState::AtSafePoint)
    );
    outcome.finish();
    assert!(!rt.threads.is_suspend_requested());

    // A value-only change does not suspend.
    let bounds = rt.barriers.bounds();
    let outcome = rt.barriers.stomp_resize(bounds, false).unwrap();
    assert!(!outcome.suspended());
    outcome.finish();

    stop.store(true, Ordering::Release);
    worker.join().unwrap();
    assert!(rt.metrics().suspensions >= 1);
}

#[test]
fn test_post_grow_update_parks_running_mutator() {
    let rt = Arc::new(runtime(IsaKind::Wide, 1));
    let stop = Arc::new(AtomicBool::new(false));
    let registered = Arc::new(AtomicBool::new(false));
    let worker_id = Arc::new(dotnet_stubs::sync::AtomicU64::new(0));

    let worker = {
        let rt = rt.clone();
        let stop = stop.clone();
        let registered = registered.clone();
        let worker_id = worker_id.clone();
        thread::spawn(move || {
            let id = rt.threads.register_thread();
            worker_id.store(id, Ordering::Release);
            registered.store(true, Ordering::Release);
            while !stop.load(Ordering::Acquire) {
                rt.threads.safe_point(id);
                thread::yield_now();
            }
            rt.threads.unregister_thread(id);
        })
    };
    while !registered.load(Ordering::Acquire) {
        thread::yield_now();
    }

    let suspensions = rt.metrics().suspensions;
    let outcome = rt.barriers.update(true).unwrap();
    assert!(outcome.suspended());
    assert!(outcome
        .actions()
        .contains(StompActions::ICACHE_FLUSH | StompActions::RESTART));
    assert_eq!(
        rt.threads.state_of(worker_id.load(Ordering::Acquire)),
        Some(MutatorState::AtSafePoint)
    );
    outcome.finish();
    assert_eq!(rt.metrics().suspensions, suspensions + 1);
    assert_eq!(
        rt.barriers
            .active_variant(BarrierKind::Write)
            .unwrap()
            .flavor
            .growth,
        HeapGrowth::PostGrow
    );
    assert_complete(&rt.barriers);

    // Already post-grow: nothing to swap, nothing to suspend.
    let again = rt.barriers.update(true).unwrap();
    assert!(!again.suspended());
    again.finish();

    stop.store(true, Ordering::Release);
    worker.join().unwrap();
}
