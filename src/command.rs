//! The thread-safe command queue that is the only way any thread other than
//! the debug loop itself reaches into the target (§4.1, §5).
//!
//! Every command carries a oneshot reply channel; the caller blocks on the
//! reply. A dropped reply receiver (client gave up / timed out) is tolerated
//! — the debug loop still executes the command and simply finds nobody
//! listening when it sends the reply (§5 "Cancellation").

use crate::error::EngineResult;
use crate::watchpoint::WatchpointKind;
use crossbeam_channel::{Receiver, Sender};

pub struct SpawnOutcome {
    pub pid: i32,
    pub pty_master_fd: Option<std::os::unix::io::RawFd>,
}

pub enum Command {
    SetBreakpoint {
        address: u64,
        target_count: u64,
        is_software: bool,
        reply: Sender<EngineResult<u64>>,
    },
    RemoveBreakpoint {
        address: u64,
        reply: Sender<EngineResult<()>>,
    },
    SetWatchpoint {
        address: u64,
        size: u8,
        kind: WatchpointKind,
        reply: Sender<EngineResult<usize>>,
    },
    RemoveWatchpoint {
        address: u64,
        reply: Sender<EngineResult<()>>,
    },
    ContinueExecution {
        tid: i32,
        reply: Sender<EngineResult<()>>,
    },
    SingleStep {
        tid: i32,
        reply: Sender<EngineResult<()>>,
    },
    ReadRegister {
        tid: i32,
        name: String,
        reply: Sender<EngineResult<u64>>,
    },
    WriteRegister {
        tid: i32,
        name: String,
        value: u64,
        reply: Sender<EngineResult<()>>,
    },
    ReadMemory {
        address: u64,
        size: usize,
        reply: Sender<EngineResult<Vec<u8>>>,
    },
    Spawn {
        path: String,
        argv: Vec<String>,
        with_pty: bool,
        reply: Sender<EngineResult<SpawnOutcome>>,
    },
    /// Internal: attach to every task of `pid`. Must run on the debug loop
    /// thread itself since ptrace calls are bound to the calling thread.
    AttachAll {
        pid: i32,
        kill_on_exit: bool,
        reply: Sender<EngineResult<()>>,
    },
    ResumeAllUserStoppedThreads { reply: Sender<EngineResult<()>> },
    /// Internal: ask the loop to exit after finishing in-flight work.
    Shutdown,
}

/// Client-side handle: submit a command and block for its reply. Held by
/// `Engine` and cloned for every call site that needs to talk to the loop.
#[derive(Clone)]
pub struct CommandQueueHandle {
    sender: Sender<Command>,
}

impl CommandQueueHandle {
    pub fn new(sender: Sender<Command>) -> Self {
        CommandQueueHandle { sender }
    }

    /// Submits `make_command(reply_tx)` and blocks for the reply. Panics
    /// only if the debug loop thread has already terminated without
    /// draining the queue, which is an engine bug, not a caller error.
    pub fn call<T>(&self, make_command: impl FnOnce(Sender<EngineResult<T>>) -> Command) -> EngineResult<T> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let command = make_command(tx);
        self.sender
            .send(command)
            .expect("debug loop thread terminated while a command was in flight");
        rx.recv()
            .expect("debug loop dropped a reply channel without sending")
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

pub fn channel() -> (Sender<Command>, Receiver<Command>) {
    crossbeam_channel::unbounded()
}
