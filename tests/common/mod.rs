//! Shared fork-based test harness (SPEC_FULL §E): every scenario needs a
//! live tracee, so each test forks a child that blocks on a pipe read until
//! the parent has finished installing whatever breakpoint/watchpoint the
//! scenario needs, then releases it and lets it run into the instrumented
//! code path.

use nix::sys::wait::waitpid;
use nix::unistd::{close, fork, pipe, read, write, ForkResult, Pid};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Forks a child that blocks on `read_fd` before running `body`, then exits.
/// Returns the child's pid and the write end of the rendezvous pipe.
///
/// # Safety
/// Forking inside a test binary is only sound because these are
/// single-threaded integration test processes (one binary per scenario,
/// SPEC_FULL §E) — no other thread exists yet to leave in an inconsistent
/// state across the fork.
pub fn fork_waiting_child(body: impl FnOnce()) -> (Pid, RawFd) {
    let (read_fd, write_fd) = pipe().expect("pipe");
    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            let _ = close(write_fd);
            let mut buf = [0u8; 1];
            let _ = read(read_fd, &mut buf);
            let _ = close(read_fd);
            body();
            std::process::exit(0);
        }
        ForkResult::Parent { child } => {
            let _ = close(read_fd);
            (child, write_fd)
        }
    }
}

/// Unblocks a child parked in `fork_waiting_child`.
pub fn release_child(write_fd: RawFd) {
    let _ = write(write_fd, &[1u8]);
    let _ = close(write_fd);
}

pub fn reap(pid: Pid) {
    let _ = waitpid(pid, None);
}

/// Polls `poll` until it returns `Some` or `timeout` elapses.
pub fn wait_for<T>(mut poll: impl FnMut() -> Option<T>, timeout: Duration) -> Option<T> {
    let start = Instant::now();
    loop {
        if let Some(v) = poll() {
            return Some(v);
        }
        if start.elapsed() > timeout {
            return None;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn gettid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
