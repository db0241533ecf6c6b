//! S6: a breakpoint with `target_count = 3` silently re-arms on its first
//! two hits and only delivers an exception record from the third hit on.

mod common;

use dbgengine::{Engine, EngineConfig, ExceptionKind};
use std::sync::{Arc, Mutex};

#[inline(never)]
extern "C" fn hit_point() {
    std::hint::black_box(());
}

#[test]
fn breakpoint_reports_only_from_its_target_hit_count_onward() {
    let address = hit_point as usize as u64;
    let (child, write_fd) = common::fork_waiting_child(|| {
        for _ in 0..5 {
            hit_point();
        }
    });

    let engine = Engine::attach(child.as_raw(), EngineConfig::default(), Default::default())
        .expect("attach should succeed on a freshly forked, not-yet-released child");

    let hits: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let hits_clone = hits.clone();
    engine.set_exception_sink(move |record| {
        if record.kind == ExceptionKind::Breakpoint {
            hits_clone.lock().unwrap().push(record.pc);
        }
    });

    engine
        .set_hardware_breakpoint(address, 3)
        .expect("installing a breakpoint with a target hit count should succeed");

    engine
        .continue_execution(child.as_raw())
        .expect("thread should be resumable right after attach");
    common::release_child(write_fd);

    // First two passes must be silently re-armed: no report within a short
    // window even though the child has already run past the address twice.
    std::thread::sleep(std::time::Duration::from_millis(150));
    assert!(
        hits.lock().unwrap().is_empty(),
        "no exception should be reported before the configured target hit count is reached"
    );

    let first_reported = common::wait_for(
        || hits.lock().unwrap().first().copied(),
        common::DEFAULT_TIMEOUT,
    )
    .expect("an exception should be delivered once the third pass occurs");
    assert_eq!(first_reported, address);

    engine
        .continue_execution(child.as_raw())
        .expect("continuing past the third (reported) hit should resume the child");

    let fourth_reported = common::wait_for(
        || {
            let hits = hits.lock().unwrap();
            if hits.len() >= 2 {
                Some(hits[1])
            } else {
                None
            }
        },
        common::DEFAULT_TIMEOUT,
    )
    .expect("the fourth pass should also be reported, since the target count was already reached");
    assert_eq!(fourth_reported, address);

    engine
        .continue_execution(child.as_raw())
        .expect("final continue should let the child run the fifth pass and exit");
    common::reap(child);
}
