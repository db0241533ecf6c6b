use thiserror::Error;

/// The engine's closed error taxonomy.
///
/// Per-command errors surface to the client as command replies; they never
/// tear down the engine (see [`crate::engine::Engine`] propagation policy).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("breakpoint/watchpoint table has no free slot")]
    NoFreeSlot,

    #[error("address {0:#x} already has a breakpoint or watchpoint")]
    DuplicateAddress(u64),

    #[error("address {0:#x} has no breakpoint or watchpoint to remove")]
    NotFound(u64),

    #[error("thread {0} exited before the operation completed")]
    ThreadGone(i32),

    #[error("could not quiesce all threads within the retry budget")]
    StopAllFailed,

    #[error("address {0:#x} is not mapped in the target's address space")]
    InvalidAddress(u64),

    #[error("unknown register name {0:?} for current architecture")]
    UnknownRegister(String),

    #[error("operation requires an attached or spawned target")]
    NotAttached,

    #[error("spawn failed: {0}")]
    SpawnFailed(std::io::Error),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(&'static str),

    #[error("ptrace/waitpid failure: {0}")]
    Nix(#[from] nix::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
