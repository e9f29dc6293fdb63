use dotnet_stubs::{
    arch::IsaKind,
    config::StubConfig,
    resolver::SiteState,
    runtime::Runtime,
    sync::{AtomicBool, AtomicUsize, Ordering},
    write_barrier::{BarrierKind, CARD_MARKED},
};
use std::{sync::Barrier, thread};

const CALLERS: usize = 4;
const CALLS_PER_THREAD: usize = 2_000;

fn runtime(isa: IsaKind) -> Runtime {
    Runtime::new(StubConfig {
        isa,
        promote_after: 3,
        downgrade_streak: 16,
        cache_bits: 6,
        processor_count: 4,
        ..StubConfig::default()
    })
    .unwrap()
}

#[test]
fn test_concurrent_calls_while_cell_is_rewritten() {
    for isa in [IsaKind::Narrow, IsaKind::Wide] {
        let rt = runtime(isa);
        let token = rt.types.new_token();
        let receivers: Vec<_> = (0..2)
            .map(|i| {
                let ty = rt.types.define_type(&format!("S{i}"), None, 0).unwrap();
                let body = rt.types.implement(ty, token, &format!("S{i}.M")).unwrap();
                (ty, rt.types.allocate_object(ty).unwrap(), body)
            })
            .collect();
        let site = rt.stubs.prepare_call_site(token).unwrap();
        let dispatch = rt.stubs.dispatch_stub_for(&site, receivers[0].0).unwrap();
        let resolve = rt.stubs.resolve_stub_for(&site).unwrap();

        let done = AtomicBool::new(false);
        let finished = AtomicUsize::new(0);
        let wrong = AtomicUsize::new(0);
        let torn = AtomicUsize::new(0);

        thread::scope(|s| {
            for t in 0..CALLERS {
                let (_, object, body) = receivers[t % 2];
                let (rt, site, finished, wrong, torn) = (&rt, &site, &finished, &wrong, &torn);
                s.spawn(move || {
                    for i in 0..CALLS_PER_THREAD {
                        let invocation = rt.stubs.invoke(site, object, &[i as u64]).unwrap();
                        if invocation.target != body {
                            wrong.fetch_add(1, Ordering::Relaxed);
                        }
                        if matches!(rt.stubs.site_state(site.cell).unwrap(), SiteState::Foreign(_)) {
                            torn.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    finished.fetch_add(1, Ordering::Release);
                });
            }

            let (rt, site, done, finished) = (&rt, &site, &done, &finished);
            s.spawn(move || {
                let mut flip = false;
                while finished.load(Ordering::Acquire) < CALLERS {
                    let entry = if flip {
                        dispatch.entry
                    } else {
                        resolve.resolve_entry
                    };
                    rt.stubs.install_stub(site.cell, entry).unwrap();
                    flip = !flip;
                    thread::yield_now();
                }
                done.store(true, Ordering::Release);
            });
        });

        assert!(done.load(Ordering::Acquire));
        assert_eq!(wrong.load(Ordering::Relaxed), 0);
        assert_eq!(torn.load(Ordering::Relaxed), 0);
        // The stub population stays bounded no matter how often the cell flips.
        let stubs = rt.metrics().stubs;
        assert!(stubs.dispatch <= 2, "{stubs:?}");
        assert_eq!(stubs.resolve, 1);
    }
}

#[test]
fn test_barriers_run_while_variants_swap() {
    let rt = runtime(IsaKind::Narrow);
    let object = rt.memory.allocate_data(32, 8).unwrap();
    let stop = AtomicBool::new(false);
    let failures = AtomicUsize::new(0);
    let registered = Barrier::new(4);

    thread::scope(|s| {
        for _ in 0..3 {
            // One card per worker.
            let slot = rt.memory.allocate_data(4096, 8).unwrap();
            let (rt, stop, failures, registered) = (&rt, &stop, &failures, &registered);
            s.spawn(move || {
                let id = rt.threads.register_thread();
                registered.wait();
                let card = rt.barriers.bounds().card_for(slot);
                while !stop.load(Ordering::Acquire) {
                    rt.memory.store_u8(card, 0).unwrap();
                    let ok = rt
                        .barriers
                        .execute(BarrierKind::Write, slot, object.as_u64())
                        .is_ok()
                        && rt.memory.load_u8(card).unwrap() == CARD_MARKED;
                    if !ok {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                    rt.threads.safe_point(id);
                }
                rt.threads.unregister_thread(id);
            });
        }

        registered.wait();
        for round in 0..20 {
            let processors = if round % 2 == 0 { 1 } else { 4 };
            rt.barriers
                .on_processor_count_policy_changed(processors)
                .unwrap()
                .finish();
            if round % 5 == 0 {
                rt.barriers.switch_to_write_watch().unwrap().finish();
            } else if round % 5 == 3 {
                rt.barriers.switch_to_non_write_watch().unwrap().finish();
            }
        }
        stop.store(true, Ordering::Release);
    });

    assert_eq!(failures.load(Ordering::Relaxed), 0);
    assert!(rt.metrics().barrier_swaps > 20);
}
