//! Spawn-to-be-traced, with optional PTY allocation (§6 "Spawn contract").
//!
//! The trace-me dance follows the pattern used across the pack's simpler
//! ptrace debuggers (`clingfei-cs110l`/`1kohei1` `Inferior::new`:
//! `pre_exec` calling `PTRACE_TRACEME` before `exec`); the PTY plumbing
//! itself is out of scope (§1) beyond this interface, so only the minimal
//! master/slave wiring needed to hand the caller a usable master fd is done
//! here.

use crate::error::{EngineError, EngineResult};
use nix::pty::openpty;
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

pub struct SpawnedChild {
    pub pid: Pid,
    pub pty_master_fd: Option<RawFd>,
    /// Kept alive so the OS doesn't reap the handle out from under us; the
    /// debug loop only ever talks to the pid via ptrace/waitpid afterward.
    child: Child,
}

impl SpawnedChild {
    pub fn into_child(self) -> Child {
        self.child
    }
}

fn child_traceme() -> std::io::Result<()> {
    ptrace::traceme().map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

pub fn spawn(path: &str, argv: &[String], with_pty: bool) -> EngineResult<SpawnedChild> {
    let mut command = Command::new(path);
    command.args(argv);

    let mut slave_guard = None;
    let pty_master_fd = if with_pty {
        let pty = openpty(None, None).map_err(EngineError::Nix)?;
        let slave_fd = pty.slave.as_raw_fd();
        slave_guard = Some(pty.slave);
        unsafe {
            command.pre_exec(move || {
                nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                for target in [0, 1, 2] {
                    nix::unistd::dup2(slave_fd, target)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                }
                child_traceme()
            });
        }
        Some(pty.master.into_raw_fd())
    } else {
        unsafe {
            command.pre_exec(child_traceme);
        }
        None
    };

    let child = command.spawn().map_err(EngineError::SpawnFailed)?;
    let pid = Pid::from_raw(child.id() as i32);

    // The slave end's Rust-side owner is kept alive until here rather than
    // dropped inside the `with_pty` branch: it must still be open across
    // `fork()`. The forked child inherits its own table entry and has
    // already dup2'd it onto stdio by the time this drop runs.
    drop(slave_guard);

    // The child stops itself with SIGTRAP right after execve() because of
    // PTRACE_TRACEME; the caller (debug loop) harvests that stop via the
    // normal waitpid path, same as any other tracee event.
    Ok(SpawnedChild {
        pid,
        pty_master_fd,
        child,
    })
}
