//! S3: a write watchpoint fires when the target writes to the watched
//! address, reports the writer's pc, and stays armed for subsequent writes.

mod common;

use dbgengine::{Engine, EngineConfig, ExceptionKind, WatchpointKind};
use std::sync::{Arc, Mutex};

#[test]
fn write_watchpoint_fires_on_target_write() {
    static mut CELL: u32 = 0;
    let address = unsafe { std::ptr::addr_of!(CELL) as u64 };

    let (child, write_fd) = common::fork_waiting_child(move || {
        unsafe {
            std::ptr::write_volatile(std::ptr::addr_of_mut!(CELL), 0xDEADBEEFu32);
            std::ptr::write_volatile(std::ptr::addr_of_mut!(CELL), 0xCAFEF00Du32);
        }
    });

    let engine = Engine::attach(child.as_raw(), EngineConfig::default(), Default::default())
        .expect("attach should succeed on a freshly forked, not-yet-released child");

    let hits: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let hits_clone = hits.clone();
    engine.set_exception_sink(move |record| {
        if record.kind == ExceptionKind::Watchpoint {
            hits_clone
                .lock()
                .unwrap()
                .push((record.mem_addr.unwrap_or(0), record.pc));
        }
    });

    engine
        .set_watchpoint(address, 4, WatchpointKind::Write)
        .expect("installing a write watchpoint on an attached, idle thread should succeed");

    engine
        .continue_execution(child.as_raw())
        .expect("thread should be resumable right after attach");
    common::release_child(write_fd);

    let first = common::wait_for(
        || hits.lock().unwrap().first().copied(),
        common::DEFAULT_TIMEOUT,
    )
    .expect("watchpoint should fire on the first write");
    assert_eq!(first.0, address, "exception mem_addr must equal the watched address");
    assert_ne!(first.1, 0, "exception pc must capture the writer's instruction pointer");

    engine
        .continue_execution(child.as_raw())
        .expect("continuing past a watchpoint hit must re-arm it");

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
    .expect("watchpoint must still be armed for the second write");
    assert_eq!(second.0, address);

    engine
        .continue_execution(child.as_raw())
        .expect("final continue should let the child run to exit");
    common::reap(child);
}
