//! S1: a hardware breakpoint fires exactly at the installed address, stays
//! armed across a continue, and fires again on a second pass.

mod common;

use dbgengine::{Engine, EngineConfig, ExceptionKind};
use std::sync::{Arc, Mutex};

#[inline(never)]
extern "C" fn hit_point() {
    std::hint::black_box(());
}

#[test]
fn hardware_breakpoint_fires_and_stays_armed() {
    let address = hit_point as usize as u64;
    let (child, write_fd) = common::fork_waiting_child(|| {
        hit_point();
        hit_point();
    });

    let engine = Engine::attach(child.as_raw(), EngineConfig::default(), Default::default())
        .expect("attach should succeed on a freshly forked, not-yet-released child");

    let hits: Arc<Mutex<Vec<(i32, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let hits_clone = hits.clone();
    engine.set_exception_sink(move |record| {
        if record.kind == ExceptionKind::Breakpoint {
            hits_clone.lock().unwrap().push((record.tid, record.pc));
        }
    });

    engine
        .set_hardware_breakpoint(address, 0)
        .expect("installing a hardware breakpoint on an attached, idle thread should succeed");

    engine
        .continue_execution(child.as_raw())
        .expect("thread should be resumable right after attach");
    common::release_child(write_fd);

    let first = common::wait_for(
        || hits.lock().unwrap().first().copied(),
        common::DEFAULT_TIMEOUT,
    )
    .expect("hardware breakpoint should fire on the first call to hit_point");
    assert_eq!(first.1, address, "exception pc must equal the installed address exactly");

    engine
        .continue_execution(child.as_raw())
        .expect("continuing off a hardware breakpoint address must step over it transparently");

    let second = common::wait_for(
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
    .expect("breakpoint must still be armed for the second call");
    assert_eq!(second.1, address);

    engine
        .continue_execution(child.as_raw())
        .expect("final continue should let the child run to exit");
    common::reap(child);
}
