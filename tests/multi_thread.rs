//! S5: installing a breakpoint stops every thread of a multi-threaded
//! target, then resumes every thread but the one that will actually hit it.

mod common;

use dbgengine::{Engine, EngineConfig, ExceptionKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[inline(never)]
extern "C" fn hit_point() {
    std::hint::black_box(());
}

#[test]
fn installing_a_breakpoint_stops_all_threads_and_resumes_the_rest() {
    let address = hit_point as usize as u64;
    let (child, write_fd) = common::fork_waiting_child(|| {
        let busy = Arc::new(AtomicBool::new(true));
        let counters: Vec<_> = (0..3)
            .map(|_| Arc::new(AtomicU64::new(0)))
            .collect();

        let mut handles = Vec::new();
        for counter in counters.iter().cloned() {
            let busy = busy.clone();
            handles.push(std::thread::spawn(move || {
                while busy.load(Ordering::Relaxed) {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }

        let hitter_busy = busy.clone();
        let hitter = std::thread::spawn(move || {
            while hitter_busy.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            hit_point();
        });

        // Give every spinner time to actually be running before the parent
        // installs the breakpoint and starts its stop-all sweep.
        std::thread::sleep(std::time::Duration::from_millis(100));
        busy.store(false, Ordering::Relaxed);
        for h in handles {
            let _ = h.join();
        }
        let _ = hitter.join();
        std::process::exit(0);
    });

    let engine = Engine::attach(child.as_raw(), EngineConfig::default(), Default::default())
        .expect("attach should succeed and seize every existing task of the forked child");

    let hits = Arc::new(std::sync::Mutex::new(Vec::new()));
    let hits_clone = hits.clone();
    engine.set_exception_sink(move |record| {
        if record.kind == ExceptionKind::Breakpoint {
            hits_clone.lock().unwrap().push(record.tid);
        }
    });

    engine
        .set_hardware_breakpoint(address, 0)
        .expect("installing a hardware breakpoint must succeed while all threads are stopped");

    let maps = engine
        .memory_maps()
        .expect("memory maps should be readable once attached");
    assert!(!maps.is_empty(), "an attached process should expose at least one mapping");

    common::release_child(write_fd);

    let hitter_tid = common::wait_for(
        || hits.lock().unwrap().first().copied(),
        common::DEFAULT_TIMEOUT,
    )
    .expect("exactly one thread should eventually hit the installed breakpoint");

    engine
        .continue_execution(hitter_tid)
        .expect("the thread that hit the breakpoint must still be resumable");

    common::reap(child);
}
