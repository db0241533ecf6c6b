//! Thread herding: enumerate tasks, attach/detach, stop-all / resume-all,
//! cancel pending interrupts (§4.2).
//!
//! This is the engine's only non-trivial coordination primitive. Per
//! `DESIGN.md`, stop-all is expressed as a single function that returns
//! exactly the set of threads it newly stopped, so resume can never drift
//! out of sync with what was actually quiesced (§9).

use crate::error::{EngineError, EngineResult};
use crate::thread_state::ThreadState;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::time::Duration;

/// Snapshots `/proc/<pid>/task` for the current set of task ids.
pub fn enumerate_tasks(pid: i32) -> EngineResult<Vec<i32>> {
    let proc = procfs::process::Process::new(pid).map_err(|_| EngineError::NotAttached)?;
    let tasks = proc
        .tasks()
        .map_err(|_| EngineError::NotAttached)?
        .flatten()
        .map(|t| t.tid)
        .collect();
    Ok(tasks)
}

/// Seizes `tid` (PTRACE_SEIZE) and waits for the initial group-stop. Seize
/// (rather than PTRACE_ATTACH) avoids sending a spurious SIGSTOP to the
/// tracee and lets later `stop_all` sweeps use PTRACE_INTERRUPT cleanly.
pub fn attach_one(tid: i32) -> EngineResult<()> {
    let pid = Pid::from_raw(tid);
    ptrace::seize(pid, ptrace::Options::PTRACE_O_TRACESYSGOOD)?;
    ptrace::interrupt(pid)?;
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, _)) | Ok(WaitStatus::PtraceEvent(_, _, _)) => return Ok(()),
            Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                return Err(EngineError::ThreadGone(tid))
            }
            Ok(_) => continue,
            Err(nix::Error::ESRCH) => return Err(EngineError::ThreadGone(tid)),
            Err(e) => return Err(e.into()),
        }
    }
}

pub fn detach_one(tid: i32) -> EngineResult<()> {
    let pid = Pid::from_raw(tid);
    match ptrace::detach(pid, None) {
        Ok(()) | Err(nix::Error::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Attaches every task currently in `/proc/<pid>/task`, recording state for
/// each. Newly spawned threads discovered later are attached lazily by the
/// debug loop on their first stop (§4.2).
pub fn attach_all(pid: i32, threads: &mut HashMap<i32, ThreadState>) -> EngineResult<()> {
    for tid in enumerate_tasks(pid)? {
        match attach_one(tid) {
            Ok(()) => {
                let mut state = ThreadState::new(tid);
                state.is_attached = true;
                state.is_stopped = true;
                threads.insert(tid, state);
            }
            Err(EngineError::ThreadGone(_)) => continue, // raced with thread exit
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub fn detach_all(threads: &mut HashMap<i32, ThreadState>) -> EngineResult<()> {
    for (tid, state) in threads.iter_mut() {
        if state.is_attached {
            detach_one(*tid)?;
            state.is_attached = false;
        }
    }
    Ok(())
}

/// Sends a stop-interrupt to every attached-but-not-stopped thread and
/// harvests their stop events, returning the tids it newly stopped (so only
/// those get resumed afterward). Tolerates a thread exiting mid-sweep and a
/// thread stopping for a different reason than our interrupt — that event
/// is buffered on the thread's state and replayed by the dispatcher rather
/// than discarded (§4.2 no-loss invariant).
pub fn stop_all(
    threads: &mut HashMap<i32, ThreadState>,
    retry_budget: u32,
    retry_interval: Duration,
) -> EngineResult<Vec<i32>> {
    let targets: Vec<i32> = threads
        .iter()
        .filter(|(_, s)| s.is_attached && !s.is_stopped)
        .map(|(tid, _)| *tid)
        .collect();
    if targets.is_empty() {
        return Ok(Vec::new());
    }

    let mut remaining: HashSet<i32> = HashSet::new();
    for &tid in &targets {
        match ptrace::interrupt(Pid::from_raw(tid)) {
            Ok(()) => {
                remaining.insert(tid);
            }
            Err(nix::Error::ESRCH) => {
                if let Some(s) = threads.get_mut(&tid) {
                    s.is_attached = false;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut newly_stopped = Vec::new();
    let mut attempts = 0u32;
    while !remaining.is_empty() && attempts < retry_budget {
        attempts += 1;
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
            Ok(WaitStatus::StillAlive) => std::thread::sleep(retry_interval),
            Ok(status) => {
                let tid = status.pid().map(|p| p.as_raw()).unwrap_or(-1);
                match status {
                    WaitStatus::Exited(_, _) | WaitStatus::Signaled(_, _, _) => {
                        remaining.remove(&tid);
                        threads.remove(&tid);
                    }
                    WaitStatus::Stopped(_, _) | WaitStatus::PtraceEvent(_, _, _) => {
                        if remaining.remove(&tid) {
                            newly_stopped.push(tid);
                            if let Some(s) = threads.get_mut(&tid) {
                                s.is_stopped = true;
                            }
                        } else if let Some(s) = threads.get_mut(&tid) {
                            // Stopped for a reason other than our interrupt
                            // (breakpoint/signal raced in): buffer it.
                            s.buffered_event = Some(status);
                            s.is_stopped = true;
                        }
                    }
                    _ => {}
                }
            }
            Err(nix::Error::ECHILD) => break,
            Err(e) => return Err(e.into()),
        }
    }

    if !remaining.is_empty() {
        return Err(EngineError::StopAllFailed);
    }
    Ok(newly_stopped)
}

/// Resumes exactly the threads `stop_all` newly stopped; threads flagged
/// `stopped_by_user` are left stopped.
pub fn resume_all(newly_stopped: &[i32], threads: &mut HashMap<i32, ThreadState>) -> EngineResult<()> {
    for &tid in newly_stopped {
        let (stopped_by_user, pending_signal) = match threads.get(&tid) {
            Some(s) => (s.stopped_by_user, s.pending_signal),
            None => continue, // exited since being stopped
        };
        if stopped_by_user {
            continue;
        }
        let signal = if pending_signal != 0 {
            Signal::try_from(pending_signal).ok()
        } else {
            None
        };
        match ptrace::cont(Pid::from_raw(tid), signal) {
            Ok(()) | Err(nix::Error::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(s) = threads.get_mut(&tid) {
            s.is_stopped = false;
            s.pending_signal = 0;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_all_is_noop_when_nothing_attached() {
        let mut threads = HashMap::new();
        let newly = stop_all(&mut threads, 4, Duration::from_millis(1)).unwrap();
        assert!(newly.is_empty());
    }

    #[test]
    fn resume_all_skips_user_stopped_threads() {
        let mut threads = HashMap::new();
        let mut s = ThreadState::new(999999); // nonexistent pid: cont() -> ESRCH, tolerated
        s.is_attached = true;
        s.is_stopped = true;
        s.stopped_by_user = true;
        threads.insert(999999, s);
        resume_all(&[999999], &mut threads).unwrap();
        assert!(threads[&999999].is_stopped, "user-stopped thread must stay stopped");
    }
}
