//! S4: a signal configured to be intercepted, not passed to the target, and
//! reported to the client is delivered exactly once to the exception sink
//! and never reaches the target's own handler.

mod common;

use dbgengine::{Engine, EngineConfig, ExceptionKind, SignalConfig};
use nix::sys::signal::{self, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

static HANDLER_RAN: AtomicBool = AtomicBool::new(false);

extern "C" fn record_handler_ran(_: i32) {
    HANDLER_RAN.store(true, Ordering::SeqCst);
}

#[test]
fn intercepted_signal_is_reported_and_withheld_from_target() {
    let (child, write_fd) = common::fork_waiting_child(|| {
        unsafe {
            let _ = signal::sigaction(
                Signal::SIGUSR1,
                &signal::SigAction::new(
                    signal::SigHandler::Handler(record_handler_ran),
                    signal::SaFlags::empty(),
                    signal::SigSet::empty(),
                ),
            );
        }
        std::thread::sleep(std::time::Duration::from_millis(300));
        std::process::exit(if HANDLER_RAN.load(Ordering::SeqCst) { 1 } else { 0 });
    });

    let engine = Engine::attach(child.as_raw(), EngineConfig::default(), Default::default())
        .expect("attach should succeed on a freshly forked, not-yet-released child");

    engine.set_signal_config(
        Signal::SIGUSR1 as i32,
        SignalConfig {
            should_intercept: true,
            should_pass_to_target: false,
            should_report_to_client: true,
        },
    );

    let reports: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let reports_clone = reports.clone();
    let last_tid = Arc::new(AtomicI32::new(-1));
    let last_tid_clone = last_tid.clone();
    engine.set_exception_sink(move |record| {
        if record.kind == ExceptionKind::Signal {
            last_tid_clone.store(record.tid, Ordering::SeqCst);
            reports_clone.lock().unwrap().push(record.tid);
        }
    });

    engine
        .continue_execution(child.as_raw())
        .expect("thread should be resumable right after attach");
    common::release_child(write_fd);

    signal::kill(child, Signal::SIGUSR1).expect("parent should be able to signal its own child");

    common::wait_for(
        || reports.lock().unwrap().first().copied(),
        common::DEFAULT_TIMEOUT,
    )
    .expect("SIGUSR1 should be reported to the exception sink exactly once");

    let tid = last_tid.load(Ordering::SeqCst);
    engine
        .continue_execution(tid)
        .expect("continuing past an intercepted-and-withheld signal should succeed");

    common::reap(child);
}
